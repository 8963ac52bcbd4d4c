//! Instruction set, operand patterns and program linking.
//!
//! A `Program` is the serialized form produced by a compiler front end: a
//! flat instruction list plus a label table. `Program::link` resolves every
//! label placeholder to a code address and checks operator arities, yielding
//! the immutable code shared by a `GlobalState`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Variable pattern for `LoadVar`/`StoreVar`/`Cut`/`Frame`. A tuple pattern
/// destructures a list-shaped dict of the same length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    Name(String),
    Tuple(Vec<Pattern>),
}

impl Pattern {
    /// True if `value` has the shape this pattern destructures.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Pattern::Name(_) => true,
            Pattern::Tuple(parts) => match value.list_values() {
                Some(items) if items.len() == parts.len() => {
                    parts.iter().zip(&items).all(|(p, v)| p.matches(v))
                }
                _ => false,
            },
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Name(n) => f.write_str(n),
            Pattern::Tuple(parts) => {
                write!(f, "(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Jump target: a code address, or a label until the program is linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Pc(usize),
    Label { label: String },
}

impl Target {
    /// The resolved address. Executing an unlinked target is a loader bug.
    pub fn pc(&self) -> usize {
        match self {
            Target::Pc(pc) => *pc,
            Target::Label { label } => panic!("unresolved label {} reached the VM", label),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pc(pc) => write!(f, "{}", pc),
            Target::Label { label } => write!(f, "@{}", label),
        }
    }
}

/// Source position attached to assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

/// Operator applied by `Nary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    // === Unary ===
    #[serde(rename = "~")]
    BitNot,
    #[serde(rename = "not")]
    Not,
    #[serde(rename = "abs")]
    Abs,
    #[serde(rename = "atLabel")]
    AtLabel,
    #[serde(rename = "countLabel")]
    CountLabel,
    #[serde(rename = "get_context")]
    GetContext,
    #[serde(rename = "contexts")]
    Contexts,
    #[serde(rename = "IsEmpty")]
    IsEmpty,
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "len")]
    Len,
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "keys")]
    Keys,

    // === Unary or binary ===
    /// Negation with one operand, subtraction/set difference with two.
    #[serde(rename = "-")]
    Minus,

    // === Binary ===
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "//")]
    FloorDiv,
    #[serde(rename = "%", alias = "mod")]
    Mod,
    #[serde(rename = "**")]
    Pow,
    #[serde(rename = "<<")]
    Shl,
    #[serde(rename = ">>")]
    Shr,
    #[serde(rename = "..")]
    Range,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "SetAdd")]
    SetAdd,
    #[serde(rename = "BagAdd")]
    BagAdd,

    // === Associative, any arity >= 1 ===
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "*")]
    Times,
    #[serde(rename = "&")]
    And,
    #[serde(rename = "|")]
    Or,
    #[serde(rename = "^")]
    Xor,

    // === Ternary ===
    #[serde(rename = "DictAdd")]
    DictAdd,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::BitNot => "~",
            Operator::Not => "not",
            Operator::Abs => "abs",
            Operator::AtLabel => "atLabel",
            Operator::CountLabel => "countLabel",
            Operator::GetContext => "get_context",
            Operator::Contexts => "contexts",
            Operator::IsEmpty => "IsEmpty",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Len => "len",
            Operator::Str => "str",
            Operator::Any => "any",
            Operator::All => "all",
            Operator::Keys => "keys",
            Operator::Minus => "-",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Div => "/",
            Operator::FloorDiv => "//",
            Operator::Mod => "%",
            Operator::Pow => "**",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Range => "..",
            Operator::In => "in",
            Operator::SetAdd => "SetAdd",
            Operator::BagAdd => "BagAdd",
            Operator::Plus => "+",
            Operator::Times => "*",
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::DictAdd => "DictAdd",
        }
    }

    /// Whether the operator is defined for `arity` operands.
    pub fn accepts(self, arity: usize) -> bool {
        match self {
            Operator::BitNot
            | Operator::Not
            | Operator::Abs
            | Operator::AtLabel
            | Operator::CountLabel
            | Operator::GetContext
            | Operator::Contexts
            | Operator::IsEmpty
            | Operator::Min
            | Operator::Max
            | Operator::Len
            | Operator::Str
            | Operator::Any
            | Operator::All
            | Operator::Keys => arity == 1,
            Operator::Minus => arity == 1 || arity == 2,
            Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge
            | Operator::Div
            | Operator::FloorDiv
            | Operator::Mod
            | Operator::Pow
            | Operator::Shl
            | Operator::Shr
            | Operator::Range
            | Operator::In
            | Operator::SetAdd
            | Operator::BagAdd => arity == 2,
            Operator::Plus | Operator::Times | Operator::And | Operator::Or | Operator::Xor => {
                arity >= 1
            }
            Operator::DictAdd => arity == 3,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// VM instruction.
///
/// Stack effects are listed top-last: `[a, b]` means `b` is on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Op {
    // === Stack ===
    /// Push a constant.
    Push { value: Value },
    Pop,
    Dup,
    /// Move the element `offset` positions from the top to the top (1 = top).
    Move { offset: usize },
    /// Pop a list-shaped dict of exactly `count` entries and push its values
    /// in key order.
    Split { count: usize },

    // === Local frame ===
    /// Push a local through `pattern`, or with no pattern pop an address and
    /// push the value it names in the frame.
    LoadVar {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Pattern>,
    },
    /// Pop a value and bind it through `pattern`, or with no pattern pop
    /// `[address, value]` and store at the address.
    StoreVar {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<Pattern>,
    },
    /// Delete a local. A missing name is a no-op.
    DelVar {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Increment an integer local in place.
    IncVar { name: String },

    // === Shared store ===
    /// Push a shared variable by name, or pop an address and push its value.
    Load {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Pop a value (and an address if unnamed) and store it.
    Store {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Delete a shared variable, or the entry at a popped address.
    Del {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Pop `[address, key]` and push the address extended by `key`.
    Address,

    // === Iteration and choice ===
    /// Remove the minimum element of the set or dict in local `set`. The
    /// element (dict value) is bound to `value`, the dict key to `key`.
    Cut {
        set: String,
        value: Pattern,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Pattern>,
    },
    /// Pop a set and push its element. Sets with more than one element are
    /// resolved by the driver.
    Choose,

    // === Control flow ===
    Jump { pc: Target },
    /// Pop a value; jump if it equals `cond`.
    JumpCond { cond: Value, pc: Target },
    /// Register the invariant whose body starts at the next instruction and
    /// skip the `end` instructions of the body.
    Invariant { end: Target },
    /// Method entry: open a frame and bind the argument through `args`.
    Frame { name: String, args: Pattern },
    /// Leave the current frame.
    Return,
    /// Pop `[callee, arg]`. Dicts are indexed, contexts projected, methods
    /// called.
    Apply,

    // === Threads ===
    /// Pop `[method, arg, this]` and start a new thread at `method`.
    Spawn {
        #[serde(default)]
        eternal: bool,
    },
    /// Save this thread at a shared address and block. Must be followed by
    /// `Continue`.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Resumption point after `Stop`.
    Continue,
    /// Pop `[value, context]` and make the context runnable with `value`
    /// pushed onto its stack.
    Go,
    /// Pop `[arg, method]` and register an interrupt handler.
    Trap,

    // === Atomicity ===
    /// Enter an atomic section. Lazy sections do not claim atomicity until the
    /// first shared access.
    AtomicInc {
        #[serde(default)]
        lazy: bool,
    },
    AtomicDec,
    ReadonlyInc,
    ReadonlyDec,
    /// Pop a bool, install it as the interrupt level, push the previous one.
    SetIntLevel,
    /// Pop an address and mark the variable as sequentially consistent.
    Sequential,

    // === Checks and output ===
    /// Pop a bool; fail if false.
    Assert {
        #[serde(default)]
        location: Location,
    },
    /// Pop `[cond, expr]`; fail reporting `expr` if `cond` is false.
    Assert2 {
        #[serde(default)]
        location: Location,
    },
    /// Pop a value and append it to the print log.
    Print,
    /// Pop a bool; record `index` as witnessed if true.
    Possibly { index: usize },

    // === Operators ===
    Nary { operator: Operator, arity: usize },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(f: &mut fmt::Formatter<'_>, op: &str, v: &Option<T>) -> fmt::Result {
            match v {
                Some(v) => write!(f, "{} {}", op, v),
                None => f.write_str(op),
            }
        }
        match self {
            Op::Push { value } => write!(f, "Push {}", value),
            Op::Pop => f.write_str("Pop"),
            Op::Dup => f.write_str("Dup"),
            Op::Move { offset } => write!(f, "Move {}", offset),
            Op::Split { count } => write!(f, "Split {}", count),
            Op::LoadVar { pattern } => opt(f, "LoadVar", pattern),
            Op::StoreVar { pattern } => opt(f, "StoreVar", pattern),
            Op::DelVar { name } => opt(f, "DelVar", name),
            Op::IncVar { name } => write!(f, "IncVar {}", name),
            Op::Load { name } => opt(f, "Load", name),
            Op::Store { name } => opt(f, "Store", name),
            Op::Del { name } => opt(f, "Del", name),
            Op::Address => f.write_str("Address"),
            Op::Cut { set, value, key: None } => write!(f, "Cut({}, {})", set, value),
            Op::Cut {
                set,
                value,
                key: Some(key),
            } => write!(f, "Cut({}, {}, {})", set, key, value),
            Op::Choose => f.write_str("Choose"),
            Op::Jump { pc } => write!(f, "Jump {}", pc),
            Op::JumpCond { cond, pc } => write!(f, "JumpCond {} {}", cond, pc),
            Op::Invariant { end } => write!(f, "Invariant {}", end),
            Op::Frame { name, args } => write!(f, "Frame {} {}", name, args),
            Op::Return => f.write_str("Return"),
            Op::Apply => f.write_str("Apply"),
            Op::Spawn { eternal: false } => f.write_str("Spawn"),
            Op::Spawn { eternal: true } => f.write_str("Spawn eternal"),
            Op::Stop { name } => opt(f, "Stop", name),
            Op::Continue => f.write_str("Continue"),
            Op::Go => f.write_str("Go"),
            Op::Trap => f.write_str("Trap"),
            Op::AtomicInc { lazy: true } => f.write_str("AtomicInc(lazy)"),
            Op::AtomicInc { lazy: false } => f.write_str("AtomicInc(eager)"),
            Op::AtomicDec => f.write_str("AtomicDec"),
            Op::ReadonlyInc => f.write_str("ReadonlyInc"),
            Op::ReadonlyDec => f.write_str("ReadonlyDec"),
            Op::SetIntLevel => f.write_str("SetIntLevel"),
            Op::Sequential => f.write_str("Sequential"),
            Op::Assert { .. } => f.write_str("Assert"),
            Op::Assert2 { .. } => f.write_str("Assert2"),
            Op::Print => f.write_str("Print"),
            Op::Possibly { index } => write!(f, "Possibly {}", index),
            Op::Nary { operator, arity } => write!(f, "{}-ary {}", arity, operator),
        }
    }
}

impl Op {
    /// One-line description of what the instruction does.
    pub fn explain(&self) -> String {
        match self {
            Op::Push { value } => format!("push constant {}", value),
            Op::Pop => "discard the top of the stack".into(),
            Op::Dup => "push a copy of the top of the stack".into(),
            Op::Move { offset } => format!("move stack element at offset {} to the top", offset),
            Op::Split { count } => format!("pop a tuple and push its {} elements", count),
            Op::LoadVar { pattern: None } => {
                "pop the address of a method variable and push the value of that variable".into()
            }
            Op::LoadVar { pattern: Some(p) } => format!("push the value of {}", p),
            Op::StoreVar { pattern: None } => {
                "pop a value and the address of a method variable and store the value at that address"
                    .into()
            }
            Op::StoreVar { pattern: Some(p) } => format!("pop a value and store it in {}", p),
            Op::DelVar { name: None } => "pop an address of a method variable and delete it".into(),
            Op::DelVar { name: Some(n) } => format!("delete method variable {}", n),
            Op::IncVar { name } => format!("increment the value of {}", name),
            Op::Load { name: None } => {
                "pop an address and push the value at the address".into()
            }
            Op::Load { name: Some(n) } => format!("push the value of shared variable {}", n),
            Op::Store { name: None } => {
                "pop a value and an address and store the value at the address".into()
            }
            Op::Store { name: Some(n) } => format!("pop a value and store it in shared variable {}", n),
            Op::Del { name: None } => "pop an address and delete the shared variable at the address".into(),
            Op::Del { name: Some(n) } => format!("delete shared variable {}", n),
            Op::Address => "combine the top two values on the stack into an address and push the result".into(),
            Op::Cut { set, .. } => format!("remove the smallest element from {} and assign it", set),
            Op::Choose => "replace the top of the stack with one of its elements".into(),
            Op::Jump { pc } => format!("set the program counter to {}", pc),
            Op::JumpCond { cond, pc } => format!("pop a value and jump to {} if it equals {}", pc, cond),
            Op::Invariant { end } => format!("register an invariant and skip {} instructions", end),
            Op::Frame { name, args } => format!(
                "start of method {} with arguments {}; initialize result to None",
                name, args
            ),
            Op::Return => "restore the caller and push the method result".into(),
            Op::Apply => "pop a value and a method or dictionary and apply one to the other".into(),
            Op::Spawn { .. } => "pop thread-local state, argument, and method and spawn a new thread".into(),
            Op::Stop { .. } => "save the context of this thread at an address and block".into(),
            Op::Continue => "no-op: resumption point of a stopped thread".into(),
            Op::Go => "pop a context and a value, push the value on the context's stack, and add it to the runnable set".into(),
            Op::Trap => "pop a method and an argument and set a trap".into(),
            Op::AtomicInc { .. } => "increment the atomic counter of this thread".into(),
            Op::AtomicDec => "decrement the atomic counter of this thread".into(),
            Op::ReadonlyInc => "increment the read-only counter of this thread".into(),
            Op::ReadonlyDec => "decrement the read-only counter of this thread".into(),
            Op::SetIntLevel => "pop the new interrupt level and push the old one".into(),
            Op::Sequential => "pop an address of a variable that has sequential consistency".into(),
            Op::Assert { .. } => "pop a value and fail if false".into(),
            Op::Assert2 { .. } => "pop a value and a condition and fail reporting the value if the condition is false".into(),
            Op::Print => "pop a value and add it to the print log".into(),
            Op::Possibly { index } => format!("pop a condition and record #{} as witnessed if true", index),
            Op::Nary { operator, arity } => {
                format!("pop {} value(s), apply '{}', and push the result", arity, operator)
            }
        }
    }
}

/// A program as emitted by a compiler front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Op>,
    #[serde(default)]
    pub labels: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("unknown label `{label}` at pc {pc}")]
    UnknownLabel { label: String, pc: usize },

    #[error("label `{label}` resolves to {value}, not a code address")]
    NotCodeAddress { label: String, value: Value },

    #[error("operator `{operator}` does not take {arity} operand(s) (pc {pc})")]
    BadArity {
        operator: Operator,
        arity: usize,
        pc: usize,
    },

    #[error("jump target {target} at pc {pc} is outside the code (length {len})")]
    TargetOutOfRange { target: usize, pc: usize, len: usize },
}

/// Failure to decode a program file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid program JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoadError {
    /// 1-based line and column of a decode error.
    pub fn position(&self) -> (usize, usize) {
        match self {
            LoadError::Json(e) => (e.line(), e.column()),
        }
    }
}

impl Program {
    pub fn new(code: Vec<Op>) -> Self {
        Program {
            code,
            labels: BTreeMap::new(),
        }
    }

    pub fn from_json(source: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Resolve labels and validate operators.
    pub fn link(&self) -> Result<Arc<[Op]>, LinkError> {
        let len = self.code.len();
        let mut linked = Vec::with_capacity(len);
        for (pc, op) in self.code.iter().enumerate() {
            let op = match op {
                Op::Push { value } => Op::Push {
                    value: self.substitute(value, pc)?,
                },
                Op::JumpCond { cond, pc: target } => Op::JumpCond {
                    cond: self.substitute(cond, pc)?,
                    pc: Target::Pc(self.target(target, pc, len)?),
                },
                Op::Jump { pc: target } => Op::Jump {
                    pc: Target::Pc(self.target(target, pc, len)?),
                },
                Op::Invariant { end } => Op::Invariant {
                    end: Target::Pc(self.resolve_target(end, pc)?),
                },
                Op::Nary { operator, arity } => {
                    if !operator.accepts(*arity) {
                        return Err(LinkError::BadArity {
                            operator: *operator,
                            arity: *arity,
                            pc,
                        });
                    }
                    op.clone()
                }
                _ => op.clone(),
            };
            linked.push(op);
        }
        Ok(linked.into())
    }

    fn resolve(&self, label: &str, pc: usize) -> Result<Value, LinkError> {
        match self.labels.get(label) {
            Some(Value::Pc(target)) => Ok(Value::Pc(*target)),
            Some(other) => Err(LinkError::NotCodeAddress {
                label: label.to_string(),
                value: other.clone(),
            }),
            None => Err(LinkError::UnknownLabel {
                label: label.to_string(),
                pc,
            }),
        }
    }

    fn substitute(&self, value: &Value, pc: usize) -> Result<Value, LinkError> {
        value.substitute(&mut |label: &str| self.resolve(label, pc))
    }

    fn resolve_target(&self, target: &Target, pc: usize) -> Result<usize, LinkError> {
        match target {
            Target::Pc(t) => Ok(*t),
            Target::Label { label } => match self.resolve(label, pc)? {
                Value::Pc(t) => Ok(t),
                _ => unreachable!("resolve returns code addresses"),
            },
        }
    }

    fn target(&self, target: &Target, pc: usize, len: usize) -> Result<usize, LinkError> {
        let t = self.resolve_target(target, pc)?;
        if t >= len {
            return Err(LinkError::TargetOutOfRange { target: t, pc, len });
        }
        Ok(t)
    }
}
