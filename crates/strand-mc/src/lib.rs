//! Execution driver for Strand programs.

pub mod runner;
pub mod state;

pub use runner::{check_invariant, RunConfig, RunError, RunOutcome, RunResult, Runner, Turn};
pub use state::{fingerprint, Fingerprint};
