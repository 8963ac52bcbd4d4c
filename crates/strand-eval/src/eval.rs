//! Instruction semantics.
//!
//! `step` executes the instruction at a context's pc against the global
//! state. Errors in the modeled program (bad types, missing keys, failed
//! assertions, writes in read-only sections) are recorded as the context's
//! failure and execution of that context stops. Malformed bytecode (stack
//! underflow, a `Stop` not followed by `Continue`, a spawn target that is
//! not a `Frame`) is a panic.

use crate::bytecode::{Op, Pattern};
use crate::context::{Context, Trap};
use crate::nary;
use crate::state::GlobalState;
use crate::value::{AccessError, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Failure of the modeled program.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: Value },

    #[error("unexpected types in {op} operands: {operands}")]
    Operands { op: &'static str, operands: String },

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("{0}: update not allowed in a read-only section")]
    Readonly(&'static str),

    #[error("Assertion (file={file}, line={line}) failed{detail}")]
    AssertionFailed {
        file: String,
        line: u32,
        detail: String,
    },

    #[error("{what}: expected a boolean, got {value}")]
    NotBoolean { what: &'static str, value: Value },

    #[error("cannot assign {value} to {pattern}")]
    PatternMismatch { value: Value, pattern: Pattern },

    #[error("Split {count}: expected a tuple of {count} elements, got {value}")]
    SplitLength { count: usize, value: Value },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    #[error("{0}: result too large")]
    TooLarge(&'static str),

    #[error("bad shift amount {0}")]
    BadShift(i64),

    #[error("{op}: empty {value}")]
    Empty { op: &'static str, value: Value },

    #[error("{0}: not in atomic block")]
    NotAtomic(&'static str),

    #[error("uninitialized shared variable {0}")]
    Uninitialized(Value),

    #[error("context has no field {0}")]
    NoSuchField(Value),

    #[error("must be either a method or a dictionary: {0}")]
    NotCallable(Value),

    #[error("Choose: expected a singleton set, got {0}")]
    NotSingleton(Value),
}

pub type ExecResult<T> = Result<T, ExecError>;

fn type_mismatch(expected: &'static str, actual: Value) -> ExecError {
    ExecError::TypeMismatch { expected, actual }
}

/// What to do with the pc after an instruction.
enum Next {
    Advance,
    Jumped,
}

/// Execute one instruction of `ctx`.
///
/// The context must be runnable: not failed, terminated or stopped.
pub fn step(state: &mut GlobalState, ctx: &mut Context) {
    assert!(!ctx.is_failed(), "stepping failed thread {}", ctx.name);
    assert!(!ctx.is_terminated(), "stepping terminated thread {}", ctx.name);
    assert!(!ctx.stopped, "stepping stopped thread {}", ctx.name);

    let code = Arc::clone(&state.code);
    let pc = ctx.pc;
    let Some(op) = code.get(pc) else {
        panic!("pc {} outside code of length {}", pc, code.len());
    };
    trace!(thread = %ctx.name, pc, op = %op, "step");

    match exec(op, &code, state, ctx) {
        Ok(Next::Advance) => ctx.pc += 1,
        Ok(Next::Jumped) => {}
        Err(e) => {
            debug!(thread = %ctx.name, pc, error = %e, "thread failed");
            ctx.fail(format!("pc = {}: {}", pc, e));
        }
    }
}

/// Elements of the set about to be chosen from, if the context is at a
/// `Choose` with more than one option. The driver picks one and calls
/// `resolve_choice`.
pub fn pending_choice<'a>(state: &GlobalState, ctx: &'a Context) -> Option<&'a [Value]> {
    if !matches!(state.code.get(ctx.pc), Some(Op::Choose)) {
        return None;
    }
    match ctx.stack.last()?.as_set() {
        Some(s) if s.len() > 1 => Some(s),
        _ => None,
    }
}

/// Complete a pending `Choose` with `choice`.
pub fn resolve_choice(ctx: &mut Context, choice: Value) {
    let set = ctx.pop();
    assert!(
        set.as_set().is_some_and(|s| Value::set_contains(s, &choice)),
        "choice {} is not an element of {}",
        choice,
        set
    );
    ctx.push(choice);
    ctx.pc += 1;
}

fn exec(op: &Op, code: &[Op], state: &mut GlobalState, ctx: &mut Context) -> ExecResult<Next> {
    match op {
        // === Stack ===
        Op::Push { value } => {
            if let Value::Label(l) = value {
                panic!("unresolved label {} reached the VM", l);
            }
            ctx.push(value.clone());
        }
        Op::Pop => {
            ctx.pop();
        }
        Op::Dup => {
            let v = ctx.peek().clone();
            ctx.push(v);
        }
        Op::Move { offset } => {
            let len = ctx.stack.len();
            assert!(
                *offset >= 1 && *offset <= len,
                "Move {} on stack of depth {}",
                offset,
                len
            );
            let v = ctx.stack.remove(len - offset);
            ctx.push(v);
        }
        Op::Split { count } => {
            let v = ctx.pop();
            match v.list_values() {
                Some(items) if items.len() == *count => {
                    for item in items {
                        ctx.push(item);
                    }
                }
                _ => {
                    return Err(ExecError::SplitLength {
                        count: *count,
                        value: v,
                    })
                }
            }
        }

        // === Local frame ===
        Op::LoadVar { pattern: None } => {
            let path = address_of(ctx.pop())?;
            let v = ctx.iget(&path)?;
            ctx.push(v);
        }
        Op::LoadVar { pattern: Some(p) } => {
            let v = load_pattern(ctx, p)?;
            ctx.push(v);
        }
        Op::StoreVar { pattern: None } => {
            let v = ctx.pop();
            let path = address_of(ctx.pop())?;
            ctx.iset(&path, v)?;
        }
        Op::StoreVar { pattern: Some(p) } => {
            let v = ctx.pop();
            assign(ctx, p, v)?;
        }
        Op::DelVar { name: None } => {
            let path = address_of(ctx.pop())?;
            ctx.idelete(&path)?;
        }
        Op::DelVar { name: Some(n) } => ctx.delete(n)?,
        Op::IncVar { name } => {
            let n = match ctx.get(name)? {
                Value::Int(n) => n.checked_add(1).ok_or(ExecError::Overflow("IncVar"))?,
                other => return Err(type_mismatch("an integer", other)),
            };
            ctx.set(name, Value::Int(n))?;
        }

        // === Shared store ===
        Op::Load { name } => {
            let path = match name {
                Some(n) => Arc::new(vec![Value::atom(n)]),
                None => address_of(ctx.pop())?,
            };
            let v = state.get(&path)?;
            ctx.push(v);
        }
        Op::Store { name } => {
            if ctx.readonly > 0 {
                return Err(ExecError::Readonly("Store"));
            }
            let v = ctx.pop();
            let path = match name {
                Some(n) => Arc::new(vec![Value::atom(n)]),
                None => address_of(ctx.pop())?,
            };
            if path.is_empty() {
                return Err(AccessError::BadAddress.into());
            }
            state.set(&path, v)?;
        }
        Op::Del { name } => {
            if ctx.readonly > 0 {
                return Err(ExecError::Readonly("Del"));
            }
            let path = match name {
                Some(n) => Arc::new(vec![Value::atom(n)]),
                None => address_of(ctx.pop())?,
            };
            let Some(root) = path.first() else {
                return Err(AccessError::BadAddress.into());
            };
            if !state.has_var(root) {
                return Err(ExecError::Uninitialized(root.clone()));
            }
            state.delete(&path)?;
        }
        Op::Address => {
            let key = ctx.pop();
            let base = address_of(ctx.pop())?;
            let mut keys = base.as_ref().clone();
            keys.push(key);
            ctx.push(Value::address(keys));
        }

        // === Iteration and choice ===
        Op::Cut { set, value, key } => cut(ctx, set, value, key.as_ref())?,
        Op::Choose => {
            let v = ctx.pop();
            match v.as_set() {
                Some([only]) => {
                    let only = only.clone();
                    ctx.push(only);
                }
                _ => return Err(ExecError::NotSingleton(v)),
            }
        }

        // === Control flow ===
        Op::Jump { pc } => {
            let target = pc.pc();
            assert_ne!(target, ctx.pc, "Jump to itself");
            ctx.pc = target;
            return Ok(Next::Jumped);
        }
        Op::JumpCond { cond, pc } => {
            let v = ctx.pop();
            if v == *cond {
                let target = pc.pc();
                assert_ne!(target, ctx.pc, "JumpCond to itself");
                ctx.pc = target;
                return Ok(Next::Jumped);
            }
        }
        Op::Invariant { end } => {
            let end = end.pc();
            assert!(end > 0, "empty invariant body");
            state.invariants.insert(ctx.pc);
            ctx.pc += end + 1;
            return Ok(Next::Jumped);
        }
        Op::Frame { args, .. } => {
            if !args.matches(ctx.peek()) {
                return Err(ExecError::PatternMismatch {
                    value: ctx.peek().clone(),
                    pattern: args.clone(),
                });
            }
            let arg = ctx.enter_frame();
            bind(ctx, args, arg)?;
        }
        Op::Return => {
            let exit = ctx.leave_frame();
            trace!(thread = %ctx.name, ?exit, "return");
            return Ok(Next::Jumped);
        }
        Op::Apply => return apply(ctx),

        // === Threads ===
        Op::Spawn { eternal } => {
            if ctx.readonly > 0 {
                return Err(ExecError::Readonly("Spawn"));
            }
            let this = ctx.pop();
            let arg = ctx.pop();
            let entry = match ctx.pop() {
                Value::Pc(pc) => pc,
                other => return Err(type_mismatch("a method", other)),
            };
            let name = frame_name(code, entry);
            let child = Context::spawned(name, entry, arg, this, *eternal);
            debug!(parent = %ctx.name, child = %child.name, entry, "spawn");
            state.ctxbag.add(child.to_value());
        }
        Op::Stop { name } => {
            if ctx.readonly > 0 {
                return Err(ExecError::Readonly("Stop"));
            }
            let path = match name {
                Some(n) => Arc::new(vec![Value::atom(n)]),
                None => address_of(ctx.pop())?,
            };
            let Some(root) = path.first() else {
                return Err(AccessError::BadAddress.into());
            };
            if !state.has_var(root) {
                return Err(ExecError::Uninitialized(root.clone()));
            }
            let resume = ctx.pc + 1;
            assert!(
                matches!(code.get(resume), Some(Op::Continue)),
                "Stop at pc {} not followed by Continue",
                ctx.pc
            );
            let mut saved = ctx.clone();
            saved.stopped = true;
            saved.pc = resume;
            state.stop(&path, &saved)?;
            let address = Value::address(path.iter().cloned());
            debug!(thread = %ctx.name, %address, "stop");
            *ctx = saved;
            return Ok(Next::Jumped);
        }
        Op::Continue => {}
        Op::Go => {
            if ctx.readonly > 0 {
                return Err(ExecError::Readonly("Go"));
            }
            let target = ctx.pop();
            let value = ctx.pop();
            let Some(stopped) = target.as_context() else {
                return Err(type_mismatch("a context", target));
            };
            state.go(stopped, value);
        }
        Op::Trap => {
            let entry = match ctx.pop() {
                Value::Pc(pc) => pc,
                other => return Err(type_mismatch("a method", other)),
            };
            let arg = ctx.pop();
            assert!(
                matches!(code.get(entry), Some(Op::Frame { .. })),
                "trap handler {} is not a Frame",
                entry
            );
            ctx.trap = Some(Trap { pc: entry, arg });
        }

        // === Atomicity ===
        Op::AtomicInc { .. } => ctx.atomic += 1,
        Op::AtomicDec => {
            assert!(ctx.atomic > 0, "AtomicDec outside atomic section");
            ctx.atomic -= 1;
        }
        Op::ReadonlyInc => ctx.readonly += 1,
        Op::ReadonlyDec => {
            assert!(ctx.readonly > 0, "ReadonlyDec outside read-only section");
            ctx.readonly -= 1;
        }
        Op::SetIntLevel => {
            let level = match ctx.pop() {
                Value::Bool(b) => b,
                other => {
                    return Err(ExecError::NotBoolean {
                        what: "SetIntLevel",
                        value: other,
                    })
                }
            };
            ctx.push(Value::Bool(ctx.interrupt_level));
            ctx.interrupt_level = level;
        }
        Op::Sequential => {
            let v = ctx.pop();
            if v.as_address().is_none() {
                return Err(type_mismatch("an address", v));
            }
            state.sequential.insert(v);
        }

        // === Checks and output ===
        Op::Assert { location } => {
            if !ctx.pop().is_truthy() {
                return Err(ExecError::AssertionFailed {
                    file: location.file.clone(),
                    line: location.line,
                    detail: String::new(),
                });
            }
        }
        Op::Assert2 { location } => {
            let expr = ctx.pop();
            if !ctx.pop().is_truthy() {
                return Err(ExecError::AssertionFailed {
                    file: location.file.clone(),
                    line: location.line,
                    detail: format!(": {}", expr),
                });
            }
        }
        Op::Print => {
            let v = ctx.pop();
            debug!(thread = %ctx.name, value = %v, "print");
            state.prints.push(v);
        }
        Op::Possibly { index } => match ctx.pop() {
            Value::Bool(true) => {
                state.possibly.insert(*index);
            }
            Value::Bool(false) => {}
            other => {
                return Err(ExecError::NotBoolean {
                    what: "possibly",
                    value: other,
                })
            }
        },

        Op::Nary { operator, arity } => nary::apply(*operator, *arity, state, ctx)?,
    }
    Ok(Next::Advance)
}

fn address_of(v: Value) -> ExecResult<Arc<Vec<Value>>> {
    match v {
        Value::Address(keys) => Ok(keys),
        other => Err(type_mismatch("an address", other)),
    }
}

/// Name of the method whose `Frame` is at `entry`.
fn frame_name(code: &[Op], entry: usize) -> &str {
    match code.get(entry) {
        Some(Op::Frame { name, .. }) => name,
        other => panic!("method entry {} is not a Frame: {:?}", entry, other),
    }
}

fn load_pattern(ctx: &Context, p: &Pattern) -> ExecResult<Value> {
    match p {
        Pattern::Name(n) => Ok(ctx.get(n)?),
        Pattern::Tuple(parts) => {
            let items = parts
                .iter()
                .map(|part| load_pattern(ctx, part))
                .collect::<ExecResult<Vec<_>>>()?;
            Ok(Value::list(items))
        }
    }
}

/// Bind `value` through `pattern`, checking the whole shape first so a
/// mismatch leaves the frame untouched.
fn assign(ctx: &mut Context, pattern: &Pattern, value: Value) -> ExecResult<()> {
    if !pattern.matches(&value) {
        return Err(ExecError::PatternMismatch {
            value,
            pattern: pattern.clone(),
        });
    }
    bind(ctx, pattern, value)
}

fn bind(ctx: &mut Context, pattern: &Pattern, value: Value) -> ExecResult<()> {
    match pattern {
        Pattern::Name(n) => Ok(ctx.set(n, value)?),
        Pattern::Tuple(parts) => {
            let Some(items) = value.list_values() else {
                unreachable!("pattern {} matched non-list {}", pattern, value);
            };
            for (part, item) in parts.iter().zip(items) {
                bind(ctx, part, item)?;
            }
            Ok(())
        }
    }
}

fn cut(ctx: &mut Context, set: &str, value: &Pattern, key: Option<&Pattern>) -> ExecResult<()> {
    let agg = ctx.get(set)?;
    let (elem, elem_key, rest) = match &agg {
        Value::Set(s) => match s.split_first() {
            Some((first, tail)) => (first.clone(), None, Value::Set(Arc::new(tail.to_vec()))),
            None => return Err(ExecError::Empty { op: "Cut", value: agg }),
        },
        Value::Dict(d) => match d.split_first() {
            Some(((k, v), tail)) => (
                v.clone(),
                Some(k.clone()),
                Value::Dict(Arc::new(tail.to_vec())),
            ),
            None => return Err(ExecError::Empty { op: "Cut", value: agg }),
        },
        _ => return Err(type_mismatch("a set or dict", agg)),
    };
    if !value.matches(&elem) {
        return Err(ExecError::PatternMismatch {
            value: elem,
            pattern: value.clone(),
        });
    }
    let key_binding = match (key, elem_key) {
        (None, _) => None,
        (Some(kp), Some(k)) if kp.matches(&k) => Some((kp, k)),
        (Some(kp), Some(k)) => {
            return Err(ExecError::PatternMismatch {
                value: k,
                pattern: kp.clone(),
            })
        }
        (Some(_), None) => return Err(type_mismatch("a dict for a keyed Cut", agg)),
    };
    ctx.set(set, rest)?;
    bind(ctx, value, elem)?;
    if let Some((kp, k)) = key_binding {
        bind(ctx, kp, k)?;
    }
    Ok(())
}

/// `Apply`: index a dict, project a context field, or call a method.
fn apply(ctx: &mut Context) -> ExecResult<Next> {
    let e = ctx.pop();
    let callee = ctx.pop();
    match &callee {
        Value::Dict(d) => {
            let v = Value::dict_lookup(d, &e)
                .cloned()
                .ok_or_else(|| AccessError::NoEntry {
                    key: e.clone(),
                    container: callee.clone(),
                })?;
            ctx.push(v);
            Ok(Next::Advance)
        }
        Value::Context(c) => {
            let v = match e.as_atom() {
                Some("this") => c.this.clone(),
                Some("name") => Value::atom(&c.name),
                Some("entry") => Value::Pc(c.entry),
                Some("arg") => c.arg.clone(),
                Some("mode") => Value::atom(c.mode().as_str()),
                _ => return Err(ExecError::NoSuchField(e)),
            };
            ctx.push(v);
            Ok(Next::Advance)
        }
        Value::Pc(target) => {
            assert_ne!(*target, ctx.pc, "Apply calls itself");
            ctx.push(Value::Pc(ctx.pc + 1));
            ctx.push(Value::atom("normal"));
            ctx.push(e);
            ctx.pc = *target;
            Ok(Next::Jumped)
        }
        _ => Err(ExecError::NotCallable(callee)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Location, Operator, Target};
    use crate::context::{Mode, Phase};

    fn state_with(code: Vec<Op>) -> GlobalState {
        GlobalState::new(Arc::from(code))
    }

    fn push(v: Value) -> Op {
        Op::Push { value: v }
    }

    fn nary(operator: Operator, arity: usize) -> Op {
        Op::Nary { operator, arity }
    }

    fn name(n: &str) -> Pattern {
        Pattern::Name(n.into())
    }

    fn fresh() -> Context {
        Context::new("t", 0, Value::None, Value::None)
    }

    /// Step until the context fails, ends, stops or reaches `until`.
    fn run_to(state: &mut GlobalState, ctx: &mut Context, until: usize) {
        while ctx.pc != until && !ctx.is_failed() && !ctx.is_terminated() && !ctx.stopped {
            step(state, ctx);
        }
    }

    #[test]
    fn test_push_add_assert() {
        let mut state = state_with(vec![
            push(Value::Int(1)),
            push(Value::Int(2)),
            nary(Operator::Plus, 2),
            Op::Assert {
                location: Location::default(),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.stack, vec![Value::Int(3)]);
        step(&mut state, &mut ctx);
        assert!(!ctx.is_failed());
        assert_eq!(ctx.mode(), Mode::Normal);
        assert_eq!(ctx.pc, 4);
    }

    #[test]
    fn test_zero_sum_assert_fails() {
        let mut state = state_with(vec![
            push(Value::Int(0)),
            push(Value::Int(0)),
            nary(Operator::Plus, 2),
            push(Value::Int(0)),
            nary(Operator::Ne, 2),
            Op::Assert {
                location: Location {
                    file: "sum.hny".into(),
                    line: 2,
                },
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 6);
        assert!(ctx.is_failed());
        assert!(ctx
            .failure
            .as_deref()
            .unwrap()
            .contains("file=sum.hny, line=2"));
    }

    #[test]
    fn test_assert_false_reports_location() {
        let mut state = state_with(vec![
            push(Value::Bool(false)),
            Op::Assert {
                location: Location {
                    file: "t.hny".into(),
                    line: 4,
                },
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 2);
        assert_eq!(
            ctx.failure.as_deref(),
            Some("pc = 1: Assertion (file=t.hny, line=4) failed")
        );
        assert_eq!(ctx.mode(), Mode::Failed);
    }

    #[test]
    fn test_assert2_reports_expression() {
        let mut state = state_with(vec![
            push(Value::Bool(false)),
            push(Value::Int(42)),
            Op::Assert2 {
                location: Location::default(),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert!(ctx.failure.as_deref().unwrap().ends_with("failed: 42"));
    }

    #[test]
    fn test_store_then_load() {
        let mut state = state_with(vec![
            push(Value::Int(5)),
            Op::Store {
                name: Some("x".into()),
            },
            Op::Load {
                name: Some("x".into()),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(state.get(&[Value::atom("x")]), Ok(Value::Int(5)));
        assert_eq!(ctx.stack, vec![Value::Int(5)]);
    }

    #[test]
    fn test_readonly_store_fails_without_mutation() {
        let mut state = state_with(vec![
            Op::ReadonlyInc,
            push(Value::Int(5)),
            Op::Store {
                name: Some("x".into()),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert!(ctx.is_failed());
        assert_eq!(state.vars, Value::empty_dict());
    }

    #[test]
    fn test_indirect_store_and_address() {
        let mut state = state_with(vec![
            push(Value::address([Value::atom("a")])),
            push(Value::atom("b")),
            Op::Address,
            push(Value::Int(1)),
            Op::Store { name: None },
        ]);
        state.set(&[Value::atom("a")], Value::empty_dict()).unwrap();
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 5);
        assert!(!ctx.is_failed());
        assert_eq!(
            state.get(&[Value::atom("a"), Value::atom("b")]),
            Ok(Value::Int(1))
        );
    }

    #[test]
    fn test_store_to_empty_address_fails() {
        let mut state = state_with(vec![
            push(Value::address([])),
            push(Value::Int(1)),
            Op::Store { name: None },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.failure.as_deref(), Some("pc = 2: bad address"));
    }

    #[test]
    fn test_del_uninitialized_fails() {
        let mut state = state_with(vec![Op::Del {
            name: Some("nope".into()),
        }]);
        let mut ctx = fresh();
        step(&mut state, &mut ctx);
        assert!(ctx.failure.as_deref().unwrap().contains("uninitialized"));
    }

    #[test]
    fn test_tuple_pattern_store_and_mismatch() {
        let pair = Pattern::Tuple(vec![name("a"), name("b")]);
        let mut state = state_with(vec![
            push(Value::list([Value::Int(1), Value::Int(2)])),
            Op::StoreVar {
                pattern: Some(pair.clone()),
            },
            push(Value::Int(7)),
            Op::StoreVar {
                pattern: Some(pair.clone()),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.get("a"), Ok(Value::Int(1)));
        assert_eq!(ctx.get("b"), Ok(Value::Int(2)));
        step(&mut state, &mut ctx);
        assert_eq!(
            ctx.failure.as_deref(),
            Some("pc = 3: cannot assign 7 to (a, b)")
        );
    }

    #[test]
    fn test_incvar_and_delvar() {
        let mut state = state_with(vec![
            push(Value::Int(4)),
            Op::StoreVar {
                pattern: Some(name("i")),
            },
            Op::IncVar { name: "i".into() },
            Op::DelVar {
                name: Some("i".into()),
            },
            Op::DelVar {
                name: Some("i".into()),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.get("i"), Ok(Value::Int(5)));
        run_to(&mut state, &mut ctx, 5);
        assert!(!ctx.is_failed());
        assert!(ctx.get("i").is_err());
    }

    #[test]
    fn test_split_and_move() {
        let mut state = state_with(vec![
            push(Value::list([Value::Int(1), Value::Int(2), Value::Int(3)])),
            Op::Split { count: 3 },
            Op::Move { offset: 3 },
            push(Value::list([Value::Int(1)])),
            Op::Split { count: 2 },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.stack, vec![Value::Int(2), Value::Int(3), Value::Int(1)]);
        run_to(&mut state, &mut ctx, 5);
        assert!(ctx.failure.as_deref().unwrap().contains("Split 2"));
    }

    #[test]
    fn test_cut_takes_minimum() {
        let mut state = state_with(vec![Op::Cut {
            set: "s".into(),
            value: name("v"),
            key: None,
        }]);
        let mut ctx = fresh();
        ctx.set("s", Value::set_from_iter([Value::Int(9), Value::Int(3)]))
            .unwrap();
        step(&mut state, &mut ctx);
        assert_eq!(ctx.get("v"), Ok(Value::Int(3)));
        assert_eq!(ctx.get("s"), Ok(Value::set_from_iter([Value::Int(9)])));
    }

    #[test]
    fn test_cut_dict_binds_key_and_value() {
        let mut state = state_with(vec![Op::Cut {
            set: "d".into(),
            value: name("v"),
            key: Some(name("k")),
        }]);
        let mut ctx = fresh();
        ctx.set("d", Value::list([Value::atom("x"), Value::atom("y")]))
            .unwrap();
        step(&mut state, &mut ctx);
        assert_eq!(ctx.get("k"), Ok(Value::Int(0)));
        assert_eq!(ctx.get("v"), Ok(Value::atom("x")));
        assert_eq!(
            ctx.get("d"),
            Ok(Value::dict_from_iter([(Value::Int(1), Value::atom("y"))]))
        );
    }

    #[test]
    fn test_cut_empty_fails() {
        let mut state = state_with(vec![Op::Cut {
            set: "s".into(),
            value: name("v"),
            key: None,
        }]);
        let mut ctx = fresh();
        ctx.set("s", Value::empty_set()).unwrap();
        step(&mut state, &mut ctx);
        assert!(ctx.is_failed());
    }

    #[test]
    fn test_choose() {
        let mut state = state_with(vec![
            push(Value::set_from_iter([Value::Int(8)])),
            Op::Choose,
            push(Value::set_from_iter([Value::Int(1), Value::Int(2)])),
            Op::Choose,
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.stack, vec![Value::Int(8)]);
        assert_eq!(
            pending_choice(&state, &ctx),
            Some(&[Value::Int(1), Value::Int(2)][..])
        );
        resolve_choice(&mut ctx, Value::Int(2));
        assert_eq!(ctx.pc, 4);
        assert_eq!(ctx.stack, vec![Value::Int(8), Value::Int(2)]);
    }

    #[test]
    fn test_choose_empty_fails() {
        let mut state = state_with(vec![push(Value::empty_set()), Op::Choose]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 2);
        assert!(ctx.failure.as_deref().unwrap().contains("singleton"));
    }

    #[test]
    fn test_jumpcond() {
        let mut state = state_with(vec![
            push(Value::Bool(false)),
            Op::JumpCond {
                cond: Value::Bool(false),
                pc: Target::Pc(3),
            },
            push(Value::Int(1)),
            push(Value::Bool(true)),
            Op::JumpCond {
                cond: Value::Bool(false),
                pc: Target::Pc(0),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 5);
        assert_eq!(ctx.stack, Vec::<Value>::new());
    }

    #[test]
    fn test_call_and_return() {
        // 0: Push PC(4)  1: Push 10  2: Apply  3: (caller resumes)
        // 4: Frame double x  5: LoadVar x  6: Push 2  7: *  8: StoreVar result  9: Return
        let mut state = state_with(vec![
            push(Value::Pc(4)),
            push(Value::Int(10)),
            Op::Apply,
            Op::Pop,
            Op::Frame {
                name: "double".into(),
                args: name("x"),
            },
            Op::LoadVar {
                pattern: Some(name("x")),
            },
            push(Value::Int(2)),
            nary(Operator::Times, 2),
            Op::StoreVar {
                pattern: Some(name("result")),
            },
            Op::Return,
        ]);
        let mut ctx = fresh();
        ctx.set("local", Value::Int(1)).unwrap();
        run_to(&mut state, &mut ctx, 3);
        assert!(!ctx.is_failed());
        assert_eq!(ctx.stack, vec![Value::Int(20)]);
        assert_eq!(ctx.get("local"), Ok(Value::Int(1)));
        assert_eq!(ctx.fp, 0);
    }

    #[test]
    fn test_apply_dict_and_missing_key() {
        let d = Value::dict_from_iter([(Value::atom("a"), Value::Int(1))]);
        let mut state = state_with(vec![
            push(d.clone()),
            push(Value::atom("a")),
            Op::Apply,
            push(d),
            push(Value::atom("b")),
            Op::Apply,
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.stack, vec![Value::Int(1)]);
        run_to(&mut state, &mut ctx, 6);
        assert!(ctx.failure.as_deref().unwrap().contains("no entry \"b\""));
    }

    #[test]
    fn test_apply_context_projection() {
        let target = Context::spawned("worker", 7, Value::Int(3), Value::None, false);
        let mut state = state_with(vec![
            push(target.to_value()),
            push(Value::atom("mode")),
            Op::Apply,
            push(target.to_value()),
            push(Value::atom("entry")),
            Op::Apply,
            push(target.to_value()),
            push(Value::atom("bogus")),
            Op::Apply,
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 6);
        assert_eq!(ctx.stack, vec![Value::atom("normal"), Value::Pc(7)]);
        run_to(&mut state, &mut ctx, 9);
        assert!(ctx.failure.as_deref().unwrap().contains("no field"));
    }

    #[test]
    fn test_spawn_adds_runnable_thread() {
        let mut state = state_with(vec![
            push(Value::Pc(4)),
            push(Value::Int(5)),
            push(Value::None),
            Op::Spawn { eternal: false },
            Op::Frame {
                name: "worker".into(),
                args: name("x"),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 4);
        assert_eq!(state.ctxbag.len(), 1);
        let (child, _) = state.ctxbag.iter().next().unwrap();
        let mut child = child.as_context().unwrap().clone();
        assert_eq!(child.name, "worker");
        assert_eq!(child.pc, 4);
        step(&mut state, &mut child);
        assert_eq!(child.get("x"), Ok(Value::Int(5)));
    }

    #[test]
    fn test_spawn_in_readonly_fails() {
        let mut state = state_with(vec![
            Op::ReadonlyInc,
            push(Value::Pc(0)),
            push(Value::None),
            push(Value::None),
            Op::Spawn { eternal: false },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 5);
        assert!(ctx.is_failed());
        assert!(state.ctxbag.is_empty());
    }

    #[test]
    fn test_spawn_leaves_other_bags_alone() {
        let mut state = state_with(vec![
            push(Value::Pc(4)),
            push(Value::Int(5)),
            push(Value::None),
            Op::Spawn { eternal: false },
            Op::Frame {
                name: "worker".into(),
                args: name("x"),
            },
        ]);
        let runnable = Context::new("runnable", 4, Value::None, Value::None);
        state.ctxbag.add(runnable.to_value());
        state.ctxbag.add(runnable.to_value());
        let mut done = Context::new("done", 4, Value::None, Value::None);
        done.phase = Phase::Ended;
        state.termbag.add(done.to_value());
        state.set(&[Value::atom("q")], Value::None).unwrap();
        let mut asleep = Context::new("asleep", 4, Value::None, Value::None);
        asleep.stopped = true;
        state.stop(&[Value::atom("q")], &asleep).unwrap();

        let stopbag = state.stopbag.clone();
        let termbag = state.termbag.clone();
        let vars = state.vars.clone();

        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 4);
        assert!(!ctx.is_failed());
        assert_eq!(state.ctxbag.len(), 3);
        assert_eq!(state.ctxbag.count(&runnable.to_value()), 2);
        assert_eq!(state.stopbag, stopbag);
        assert_eq!(state.termbag, termbag);
        assert_eq!(state.vars, vars);
    }

    #[test]
    fn test_readonly_del_fails_without_mutation() {
        let mut state = state_with(vec![
            Op::ReadonlyInc,
            Op::Del {
                name: Some("x".into()),
            },
        ]);
        state.set(&[Value::atom("x")], Value::Int(1)).unwrap();
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 2);
        assert!(ctx.failure.as_deref().unwrap().contains("read-only"));
        assert_eq!(state.get(&[Value::atom("x")]), Ok(Value::Int(1)));
    }

    #[test]
    fn test_readonly_stop_fails_without_mutation() {
        let mut state = state_with(vec![
            Op::ReadonlyInc,
            Op::Stop {
                name: Some("q".into()),
            },
            Op::Continue,
        ]);
        state.set(&[Value::atom("q")], Value::None).unwrap();
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert!(ctx.is_failed());
        assert!(!ctx.stopped);
        assert_eq!(state.get(&[Value::atom("q")]), Ok(Value::None));
        assert!(state.stopbag.is_empty());
        assert!(state.ctxbag.is_empty());
    }

    #[test]
    fn test_readonly_go_fails_without_mutation() {
        let mut state = state_with(vec![
            Op::Stop {
                name: Some("q".into()),
            },
            Op::Continue,
            // waker
            Op::ReadonlyInc,
            Op::Load {
                name: Some("q".into()),
            },
            push(Value::Int(99)),
            Op::Move { offset: 2 },
            Op::Go,
        ]);
        state.set(&[Value::atom("q")], Value::None).unwrap();
        let mut sleeper = fresh();
        step(&mut state, &mut sleeper);
        assert!(sleeper.stopped);
        let stopbag = state.stopbag.clone();
        let vars = state.vars.clone();

        let mut waker = fresh();
        waker.pc = 2;
        run_to(&mut state, &mut waker, 7);
        assert!(waker.is_failed());
        assert_eq!(state.stopbag, stopbag);
        assert_eq!(state.vars, vars);
        assert!(state.ctxbag.is_empty());
    }

    #[test]
    fn test_huge_repeat_fails_the_thread() {
        let mut state = state_with(vec![
            push(Value::atom("ab")),
            push(Value::Int(i64::MAX)),
            nary(Operator::Times, 2),
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert!(ctx.is_failed());
        assert!(ctx.failure.as_deref().unwrap().contains("too large"));
    }

    #[test]
    #[should_panic(expected = "not a Frame")]
    fn test_spawn_non_frame_entry_panics() {
        let mut state = state_with(vec![
            push(Value::Pc(0)),
            push(Value::None),
            push(Value::None),
            Op::Spawn { eternal: false },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 4);
    }

    #[test]
    fn test_stop_and_go() {
        let mut state = state_with(vec![
            Op::Stop {
                name: Some("q".into()),
            },
            Op::Continue,
            // waker
            Op::Load {
                name: Some("q".into()),
            },
            push(Value::Int(99)),
            Op::Move { offset: 2 },
            Op::Go,
        ]);
        state.set(&[Value::atom("q")], Value::None).unwrap();

        let mut sleeper = fresh();
        step(&mut state, &mut sleeper);
        assert!(sleeper.stopped);
        assert_eq!(sleeper.pc, 1);
        assert_eq!(state.stopped_len(), 1);

        let mut waker = fresh();
        waker.pc = 2;
        run_to(&mut state, &mut waker, 6);
        assert!(!waker.is_failed());
        assert_eq!(state.stopped_len(), 0);
        let (resumed, _) = state.ctxbag.iter().next().unwrap();
        let mut resumed = resumed.as_context().unwrap().clone();
        assert!(!resumed.stopped);
        assert_eq!(resumed.stack, vec![Value::Int(99)]);
        step(&mut state, &mut resumed);
        assert_eq!(resumed.pc, 2);
    }

    #[test]
    fn test_stop_go_round_trip_preserves_context() {
        let mut state = state_with(vec![
            push(Value::Int(1)),
            Op::Stop {
                name: Some("q".into()),
            },
            Op::Continue,
            // waker
            Op::Load {
                name: Some("q".into()),
            },
            push(Value::Int(99)),
            Op::Move { offset: 2 },
            Op::Go,
        ]);
        state.set(&[Value::atom("q")], Value::None).unwrap();

        let mut sleeper = Context::new("sleeper", 0, Value::Int(7), Value::atom("obj"));
        run_to(&mut state, &mut sleeper, 3);
        assert!(sleeper.stopped);
        assert_eq!(sleeper.stack, vec![Value::Int(1)]);

        let mut waker = fresh();
        waker.pc = 3;
        run_to(&mut state, &mut waker, 7);
        assert!(!waker.is_failed());
        assert!(state.stopbag.is_empty());
        assert_eq!(state.ctxbag.len(), 1);

        let (resumed, _) = state.ctxbag.iter().next().unwrap();
        let resumed = resumed.as_context().unwrap().clone();
        assert_eq!(resumed.name, "sleeper");
        assert_eq!(resumed.entry, 0);
        assert_eq!(resumed.arg, Value::Int(7));
        assert_eq!(resumed.this, Value::atom("obj"));
        assert_eq!(resumed.pc, 2);
        assert_eq!(resumed.stack, vec![Value::Int(1), Value::Int(99)]);

        let mut expected = sleeper.clone();
        expected.stopped = false;
        expected.push(Value::Int(99));
        assert_eq!(resumed, expected);
    }

    #[test]
    fn test_stop_uninitialized_fails() {
        let mut state = state_with(vec![
            Op::Stop {
                name: Some("q".into()),
            },
            Op::Continue,
        ]);
        let mut ctx = fresh();
        step(&mut state, &mut ctx);
        assert!(ctx.is_failed());
        assert!(!ctx.stopped);
        assert_eq!(state.stopped_len(), 0);
    }

    #[test]
    #[should_panic(expected = "trap handler 0 is not a Frame")]
    fn test_trap_non_frame_handler_panics() {
        let mut state = state_with(vec![
            push(Value::Int(1)),
            push(Value::Pc(0)),
            Op::Trap,
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
    }

    #[test]
    fn test_trap_and_interrupt() {
        let mut state = state_with(vec![
            push(Value::Int(1)),
            push(Value::Pc(3)),
            Op::Trap,
            Op::Frame {
                name: "handler".into(),
                args: name("a"),
            },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 3);
        assert_eq!(ctx.trap, Some(Trap { pc: 3, arg: Value::Int(1) }));
        ctx.interrupt_invoke();
        step(&mut state, &mut ctx);
        assert_eq!(ctx.get("a"), Ok(Value::Int(1)));
        assert!(ctx.interrupt_level);
    }

    #[test]
    fn test_set_int_level_swaps() {
        let mut state = state_with(vec![push(Value::Bool(true)), Op::SetIntLevel]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 2);
        assert!(ctx.interrupt_level);
        assert_eq!(ctx.stack, vec![Value::Bool(false)]);
    }

    #[test]
    fn test_invariant_registers_and_skips_body() {
        let mut state = state_with(vec![
            Op::Invariant { end: Target::Pc(2) },
            push(Value::Bool(true)),
            Op::Return,
            push(Value::Int(1)),
        ]);
        let mut ctx = fresh();
        step(&mut state, &mut ctx);
        assert_eq!(ctx.pc, 3);
        assert!(state.invariants.contains(&0));
    }

    #[test]
    fn test_print_and_possibly() {
        let mut state = state_with(vec![
            push(Value::atom("hello")),
            Op::Print,
            push(Value::Bool(true)),
            Op::Possibly { index: 2 },
        ]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 4);
        assert_eq!(state.prints, vec![Value::atom("hello")]);
        assert!(state.possibly.contains(&2));
    }

    #[test]
    fn test_sequential_records_address() {
        let addr = Value::address([Value::atom("flag")]);
        let mut state = state_with(vec![push(addr.clone()), Op::Sequential]);
        let mut ctx = fresh();
        run_to(&mut state, &mut ctx, 2);
        assert!(state.sequential.contains(&addr));
    }

    #[test]
    #[should_panic(expected = "stepping failed thread")]
    fn test_step_failed_context_panics() {
        let mut state = state_with(vec![Op::Pop]);
        let mut ctx = fresh();
        ctx.fail("earlier");
        step(&mut state, &mut ctx);
    }
}
