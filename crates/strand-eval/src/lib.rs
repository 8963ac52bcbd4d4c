//! Value model, thread contexts and bytecode VM for Strand.
//!
//! This crate is the single-step semantics of the machine: it knows how one
//! instruction transforms a thread context and the global state. Scheduling
//! threads, resolving choices and checking invariants live in `strand-mc`.

pub mod bytecode;
pub mod context;
pub mod eval;
mod nary;
pub mod state;
pub mod tla;
pub mod value;

pub use bytecode::{LinkError, LoadError, Location, Op, Operator, Pattern, Program, Target};
pub use context::{Context, FrameExit, Mode, Phase, Trap};
pub use eval::{pending_choice, resolve_choice, step, ExecError, ExecResult};
pub use state::{Bag, GlobalState};
pub use value::{AccessError, Value};
