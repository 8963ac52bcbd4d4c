//! Thread contexts.
//!
//! A `Context` is the whole execution state of one modeled thread: lineage
//! (name, entry, argument, `this`), program counter, operand stack, local
//! frame and the atomic/readonly/interrupt bookkeeping. Contexts are plain
//! values; the copy stored in a bag is a `Value::Context` snapshot and the
//! copy being stepped is an owned `Context`.

use crate::value::{AccessError, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Running,
    Ended,
}

/// Observable mode, as reported by projecting `mode` out of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Stopped,
    Terminated,
    Failed,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Stopped => "stopped",
            Mode::Terminated => "terminated",
            Mode::Failed => "failed",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending interrupt handler registered by `Trap`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Trap {
    pub pc: usize,
    pub arg: Value,
}

/// How a `Return` left the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameExit {
    /// Back in the caller, result pushed.
    Resumed,
    /// Interrupt handler finished; the interrupted code continues.
    InterruptDone,
    /// The thread is done.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    pub entry: usize,
    pub arg: Value,
    pub this: Value,
    /// Eternal threads may stay blocked forever without causing a deadlock.
    pub eternal: bool,

    pub pc: usize,
    /// Stack height at entry of the current frame.
    pub fp: usize,
    /// Local frame, always a dict.
    pub vars: Value,
    pub stack: Vec<Value>,
    pub atomic: u32,
    pub readonly: u32,
    pub interrupt_level: bool,
    pub trap: Option<Trap>,
    pub failure: Option<String>,
    pub phase: Phase,
    pub stopped: bool,
}

impl Context {
    /// A fresh context positioned at `entry` with an empty stack.
    pub fn new(name: &str, entry: usize, arg: Value, this: Value) -> Self {
        Context {
            name: name.to_string(),
            entry,
            arg,
            this,
            eternal: false,
            pc: entry,
            fp: 0,
            vars: Value::empty_dict(),
            stack: Vec::new(),
            atomic: 0,
            readonly: 0,
            interrupt_level: false,
            trap: None,
            failure: None,
            phase: Phase::Running,
            stopped: false,
        }
    }

    /// A thread created by `Spawn`: the stack holds the `process` call type
    /// and the argument, ready for the entry `Frame`.
    pub fn spawned(name: &str, entry: usize, arg: Value, this: Value, eternal: bool) -> Self {
        let mut ctx = Context::new(name, entry, arg.clone(), this);
        ctx.eternal = eternal;
        ctx.push(Value::atom("process"));
        ctx.push(arg);
        ctx
    }

    /// The initial thread, entering at pc 0 with an empty argument tuple.
    pub fn initial() -> Self {
        Context::spawned("__init__", 0, Value::empty_dict(), Value::None, false)
    }

    pub fn to_value(&self) -> Value {
        Value::context(self.clone())
    }

    // --- operand stack ---

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Pops the top operand. An empty stack means the bytecode is malformed.
    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => panic!("pop on empty stack (pc = {}, thread {})", self.pc, self.name),
        }
    }

    pub fn peek(&self) -> &Value {
        match self.stack.last() {
            Some(v) => v,
            None => panic!("peek on empty stack (pc = {}, thread {})", self.pc, self.name),
        }
    }

    // --- local frame ---

    pub fn get(&self, name: &str) -> Result<Value, AccessError> {
        self.vars.get_path(&[Value::atom(name)])
    }

    pub fn set(&mut self, name: &str, v: Value) -> Result<(), AccessError> {
        self.iset(&[Value::atom(name)], v)
    }

    pub fn delete(&mut self, name: &str) -> Result<(), AccessError> {
        self.idelete(&[Value::atom(name)])
    }

    pub fn iget(&self, path: &[Value]) -> Result<Value, AccessError> {
        self.vars.get_path(path)
    }

    pub fn iset(&mut self, path: &[Value], v: Value) -> Result<(), AccessError> {
        if path.is_empty() {
            return Err(AccessError::BadAddress);
        }
        self.vars = self.vars.set_path(path, v)?;
        Ok(())
    }

    pub fn idelete(&mut self, path: &[Value]) -> Result<(), AccessError> {
        self.vars = self.vars.delete_path(path)?;
        Ok(())
    }

    // --- status ---

    pub fn fail(&mut self, msg: impl Into<String>) {
        self.failure = Some(msg.into());
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn mode(&self) -> Mode {
        if self.is_failed() {
            Mode::Failed
        } else if self.is_terminated() {
            Mode::Terminated
        } else if self.stopped {
            Mode::Stopped
        } else {
            Mode::Normal
        }
    }

    // --- call framing ---

    /// Open a method frame. The argument stays on the stack below the saved
    /// frame and frame pointer; the new frame starts as `{result: None}`.
    /// Returns the argument.
    pub fn enter_frame(&mut self) -> Value {
        let arg = self.pop();
        self.push(arg.clone());
        let fresh = Value::dict_from_iter([(Value::atom("result"), Value::None)]);
        let saved = std::mem::replace(&mut self.vars, fresh);
        self.push(saved);
        self.push(Value::Int(self.fp as i64));
        self.fp = self.stack.len();
        arg
    }

    /// Close the current frame and dispatch on the call type below it.
    pub fn leave_frame(&mut self) -> FrameExit {
        if self.stack.is_empty() {
            self.phase = Phase::Ended;
            return FrameExit::Ended;
        }
        let result = self.get("result").unwrap_or(Value::None);
        let fp = match self.pop() {
            Value::Int(fp) if fp >= 0 => fp as usize,
            other => panic!("corrupt frame: saved frame pointer {}", other),
        };
        let vars = self.pop();
        assert!(
            vars.as_dict().is_some(),
            "corrupt frame: saved locals {}",
            vars
        );
        self.fp = fp;
        self.vars = vars;
        self.pop(); // argument

        if self.stack.is_empty() {
            // Top-level frame with no call type: leave the result for the
            // caller (invariant evaluation reads it).
            self.phase = Phase::Ended;
            self.push(result);
            return FrameExit::Ended;
        }

        let calltype = self.pop();
        match calltype.as_atom() {
            Some("normal") => {
                let pc = self.pop_return_pc();
                self.pc = pc;
                self.push(result);
                FrameExit::Resumed
            }
            Some("interrupt") => {
                assert!(self.interrupt_level, "interrupt return outside interrupt level");
                self.interrupt_level = false;
                let pc = self.pop_return_pc();
                self.pc = pc;
                FrameExit::InterruptDone
            }
            Some("process") => {
                self.phase = Phase::Ended;
                FrameExit::Ended
            }
            _ => panic!("corrupt frame: call type {}", calltype),
        }
    }

    fn pop_return_pc(&mut self) -> usize {
        match self.pop() {
            Value::Pc(pc) => {
                assert_ne!(pc, self.pc, "return to the Return instruction itself");
                pc
            }
            other => panic!("corrupt frame: return address {}", other),
        }
    }

    /// Divert into the registered trap handler as if it were called from the
    /// current pc. Interrupts are disabled until the handler returns.
    pub fn interrupt_invoke(&mut self) {
        let Some(trap) = self.trap.take() else {
            panic!("interrupt_invoke without a trap (thread {})", self.name);
        };
        assert!(!self.interrupt_level, "interrupt delivered at interrupt level");
        self.push(Value::Pc(self.pc));
        self.push(Value::atom("interrupt"));
        self.push(trap.arg);
        self.pc = trap.pc;
        self.interrupt_level = true;
    }
}
