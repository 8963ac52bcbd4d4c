//! TLA+ rendering of linked code.
//!
//! Each instruction becomes an action call such as `OpPush(self, HInt(1))`
//! against a fixed support module (`Harmony`). Instructions the support module
//! has no action for render as `Skip(self, "<instruction>")`.

use crate::bytecode::{Op, Operator, Pattern};
use crate::value::Value;
use std::fmt::Write;

/// Render a whole program as a TLA+ module with a `Step` dispatcher.
pub fn render_module(name: &str, code: &[Op]) -> String {
    let mut printer = TlaPrinter::new();
    printer.print_module(name, code);
    printer.output
}

/// Render one instruction as a TLA+ action application.
pub fn render_op(op: &Op) -> String {
    let mut printer = TlaPrinter::new();
    printer.print_op(op);
    printer.output
}

impl Op {
    /// This instruction as a TLA+ action application.
    pub fn to_tla(&self) -> String {
        render_op(self)
    }
}

/// Render a value as a TLA+ expression.
pub fn render_value(value: &Value) -> String {
    let mut printer = TlaPrinter::new();
    printer.print_value(value);
    printer.output
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Support-module function for an operator, if there is one.
fn operator_fun(op: Operator, arity: usize) -> Option<&'static str> {
    let f = match (op, arity) {
        (Operator::Minus, 1) => "FunMinus",
        (Operator::Not, 1) => "FunNot",
        (Operator::Abs, 1) => "FunAbs",
        (Operator::Len, 1) => "FunLen",
        (Operator::Min, 1) => "FunMin",
        (Operator::Max, 1) => "FunMax",
        (Operator::Str, 1) => "FunStr",
        (Operator::Any, 1) => "FunAny",
        (Operator::All, 1) => "FunAll",
        (Operator::Keys, 1) => "FunKeys",
        (Operator::IsEmpty, 1) => "FunIsEmpty",
        (Operator::GetContext, 1) => "FunGetContext",
        (Operator::CountLabel, 1) => "FunCountLabel",
        (Operator::AtLabel, 1) => "FunAtLabel",
        (Operator::Minus, 2) => "FunSubtract",
        (Operator::Eq, 2) => "FunEquals",
        (Operator::Ne, 2) => "FunNotEquals",
        (Operator::Lt, 2) => "FunLT",
        (Operator::Le, 2) => "FunLE",
        (Operator::Gt, 2) => "FunGT",
        (Operator::Ge, 2) => "FunGE",
        (Operator::Div, 2) | (Operator::FloorDiv, 2) => "FunDiv",
        (Operator::Mod, 2) => "FunMod",
        (Operator::Pow, 2) => "FunPower",
        (Operator::Shl, 2) => "FunShiftLeft",
        (Operator::Shr, 2) => "FunShiftRight",
        (Operator::Range, 2) => "FunRange",
        (Operator::In, 2) => "FunIn",
        (Operator::SetAdd, 2) => "FunSetAdd",
        (Operator::BagAdd, 2) => "FunBagAdd",
        (Operator::Plus, _) => "FunAdd",
        (Operator::Times, _) => "FunMult",
        (Operator::And, _) => "FunIntersect",
        (Operator::Or, _) => "FunUnion",
        (Operator::Xor, _) => "FunExclusion",
        (Operator::DictAdd, 3) => "FunDictAdd",
        _ => return None,
    };
    Some(f)
}

struct TlaPrinter {
    output: String,
}

impl TlaPrinter {
    fn new() -> Self {
        Self {
            output: String::new(),
        }
    }

    fn write(&mut self, s: &str) {
        self.output.push_str(s);
    }

    fn print_module(&mut self, name: &str, code: &[Op]) {
        let _ = writeln!(self.output, "---- MODULE {} ----", name);
        self.write("EXTENDS Harmony\n\n");
        self.write("Step(self) ==");
        if code.is_empty() {
            self.write(" FALSE\n");
        }
        for (pc, op) in code.iter().enumerate() {
            let lead = if pc == 0 { "CASE" } else { "  []" };
            let _ = write!(self.output, "\n    {} self.pc = {} -> ", lead, pc);
            self.print_op(op);
        }
        if !code.is_empty() {
            self.write("\n");
        }
        self.write("====\n");
    }

    fn print_names(&mut self, action: &str, name: &Option<String>) {
        match name {
            Some(n) => {
                let _ = write!(self.output, "{}(self, <<{}>>)", action, quote(n));
            }
            None => {
                let _ = write!(self.output, "{}Ind(self)", action);
            }
        }
    }

    fn print_op(&mut self, op: &Op) {
        match op {
            Op::Push { value } => {
                self.write("OpPush(self, ");
                self.print_value(value);
                self.write(")");
            }
            Op::Pop => self.write("OpPop(self)"),
            Op::Dup => self.write("OpDup(self)"),
            Op::Move { offset } => {
                let _ = write!(self.output, "OpMove(self, {})", offset);
            }
            Op::Split { count } => {
                let _ = write!(self.output, "OpSplit(self, {})", count);
            }
            Op::LoadVar { pattern: None } => self.write("OpLoadVarInd(self)"),
            Op::LoadVar { pattern: Some(p) } => {
                self.write("OpLoadVar(self, ");
                self.print_pattern(p);
                self.write(")");
            }
            Op::StoreVar { pattern: None } => self.write("OpStoreVarInd(self)"),
            Op::StoreVar { pattern: Some(p) } => {
                self.write("OpStoreVar(self, ");
                self.print_pattern(p);
                self.write(")");
            }
            Op::DelVar { name: None } => self.write("OpDelVarInd(self)"),
            Op::DelVar { name: Some(n) } => {
                let _ = write!(self.output, "OpDelVar(self, VName({}))", quote(n));
            }
            Op::IncVar { name } => {
                let _ = write!(self.output, "OpIncVar(self, VName({}))", quote(name));
            }
            Op::Load { name } => self.print_names("OpLoad", name),
            Op::Store { name } => self.print_names("OpStore", name),
            Op::Del { name } => self.print_names("OpDel", name),
            Op::Stop { name } => self.print_names("OpStop", name),
            Op::Address => self.write("OpBin(self, FunAddress)"),
            Op::Cut { set, value, key } => {
                match key {
                    None => {
                        let _ = write!(self.output, "OpCut(self, {}, ", quote(set));
                        self.print_pattern(value);
                    }
                    Some(k) => {
                        let _ = write!(self.output, "OpCut3(self, {}, ", quote(set));
                        self.print_pattern(value);
                        self.write(", ");
                        self.print_pattern(k);
                    }
                }
                self.write(")");
            }
            Op::Choose => self.write("OpChoose(self)"),
            Op::Jump { pc } => {
                let _ = write!(self.output, "OpJump(self, {})", pc);
            }
            Op::JumpCond { cond, pc } => {
                let _ = write!(self.output, "OpJumpCond(self, {}, ", pc);
                self.print_value(cond);
                self.write(")");
            }
            Op::Invariant { end } => {
                let _ = write!(self.output, "OpInvariant(self, {})", end);
            }
            Op::Frame { name, args } => {
                let _ = write!(self.output, "OpFrame(self, {}, ", quote(name));
                self.print_pattern(args);
                self.write(")");
            }
            Op::Return => self.write("OpReturn(self)"),
            Op::Apply => self.write("OpApply(self)"),
            Op::Spawn { eternal: false } => self.write("OpSpawn(self)"),
            Op::Continue => self.write("OpContinue(self)"),
            Op::Go => self.write("OpGo(self)"),
            Op::Trap => self.write("OpTrap(self)"),
            Op::AtomicInc { .. } => self.write("OpAtomicInc(self)"),
            Op::AtomicDec => self.write("OpAtomicDec(self)"),
            Op::ReadonlyInc => self.write("OpReadonlyInc(self)"),
            Op::ReadonlyDec => self.write("OpReadonlyDec(self)"),
            Op::SetIntLevel => self.write("OpSetIntLevel(self)"),
            Op::Sequential => self.write("OpSequential(self)"),
            Op::Assert { location } => {
                let msg = format!("Assertion (file={}, line={}) failed", location.file, location.line);
                let _ = write!(self.output, "OpAssert(self, {})", quote(&msg));
            }
            Op::Assert2 { location } => {
                let msg = format!("Assertion (file={}, line={}) failed", location.file, location.line);
                let _ = write!(self.output, "OpAssert2(self, {})", quote(&msg));
            }
            Op::Print => self.write("OpPrint(self)"),
            Op::Nary { operator, arity } => match (operator_fun(*operator, *arity), arity) {
                (Some(f), 1) => {
                    let _ = write!(self.output, "OpUna(self, {})", f);
                }
                (Some(f), 2) => {
                    let _ = write!(self.output, "OpBin(self, {})", f);
                }
                (Some(f), n) => {
                    let _ = write!(self.output, "OpNary(self, {}, {})", f, n);
                }
                (None, _) => self.print_skip(op),
            },
            Op::Spawn { eternal: true } | Op::Possibly { .. } => self.print_skip(op),
        }
    }

    fn print_skip(&mut self, op: &Op) {
        let _ = write!(self.output, "Skip(self, {})", quote(&op.to_string()));
    }

    fn print_pattern(&mut self, p: &Pattern) {
        match p {
            Pattern::Name(n) => {
                let _ = write!(self.output, "VName({})", quote(n));
            }
            Pattern::Tuple(parts) => {
                self.write("VList(<< ");
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.print_pattern(part);
                }
                self.write(" >>)");
            }
        }
    }

    fn print_seq(&mut self, open: &str, items: &[Value], close: &str) {
        self.write(open);
        for (i, v) in items.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.print_value(v);
        }
        self.write(close);
    }

    fn print_value(&mut self, v: &Value) {
        match v {
            Value::Bool(b) => self.write(if *b { "HBool(TRUE)" } else { "HBool(FALSE)" }),
            Value::Int(n) => {
                let _ = write!(self.output, "HInt({})", n);
            }
            Value::Float(x) => {
                let _ = write!(self.output, "HFloat({})", quote(&format!("{:?}", x)));
            }
            Value::Atom(s) => {
                let _ = write!(self.output, "HStr({})", quote(s));
            }
            // The absence marker is the empty address.
            Value::None => self.write("HAddress(<<>>)"),
            Value::Pc(pc) => {
                let _ = write!(self.output, "HPc({})", pc);
            }
            Value::Set(s) => self.print_seq("HSet({", s, "})"),
            Value::Address(a) => self.print_seq("HAddress(<<", a, ">>)"),
            Value::Dict(d) => {
                self.write("HDict({");
                for (i, (k, val)) in d.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.write("<<");
                    self.print_value(k);
                    self.write(", ");
                    self.print_value(val);
                    self.write(">>");
                }
                self.write("})");
            }
            Value::Label(l) => {
                let _ = write!(self.output, "HLabel({})", quote(l));
            }
            Value::Context(c) => {
                let _ = write!(self.output, "HContext({}, {})", quote(&c.name), c.entry);
            }
        }
    }
}
