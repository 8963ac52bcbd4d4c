//! Execution driver.
//!
//! The runner repeatedly takes a thread out of the runnable bag, runs it for
//! a turn, and files it back according to how the turn ended. A turn lasts
//! `max_turn` instructions, extended for as long as the thread is inside an
//! atomic section. Threads and nondeterministic choices are picked by minimum
//! value, or randomly from a seeded RNG.

use crate::state::{fingerprint, Fingerprint};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use strand_eval::{
    pending_choice, resolve_choice, step, Context, GlobalState, LinkError, Program, Value,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Instruction budget for evaluating one invariant.
const INVARIANT_STEP_LIMIT: usize = 100_000;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("program has no code")]
    EmptyProgram,
}

pub type RunResult<T> = Result<T, RunError>;

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of instructions to execute (0 = unlimited).
    pub max_steps: usize,
    /// Pick threads and choices randomly from this seed. Without a seed the
    /// smallest thread and the smallest choice are always taken.
    pub seed: Option<u64>,
    /// Evaluate registered invariants between turns.
    pub check_invariants: bool,
    /// Deliver pending traps at the start of a turn.
    pub interrupts: bool,
    /// Instructions per turn outside atomic sections (0 = run until the
    /// thread blocks or ends).
    pub max_turn: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            seed: None,
            check_invariants: true,
            interrupts: false,
            max_turn: 1,
        }
    }
}

/// One scheduled turn of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub thread: String,
    pub start_pc: usize,
    pub end_pc: usize,
    /// Fingerprint of the global state after the turn.
    pub fingerprint: Fingerprint,
}

/// Result of a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// No runnable threads remain and none is blocked.
    Terminated {
        steps: usize,
        threads: usize,
        trace: Vec<Turn>,
    },
    /// A thread failed.
    Failure {
        steps: usize,
        thread: Box<Context>,
        message: String,
        trace: Vec<Turn>,
    },
    /// An invariant evaluated to false, or failed to evaluate.
    InvariantViolation {
        steps: usize,
        pc: usize,
        message: Option<String>,
        trace: Vec<Turn>,
    },
    /// No runnable threads remain but some non-eternal thread is stopped.
    Deadlock {
        steps: usize,
        blocked: usize,
        trace: Vec<Turn>,
    },
    /// Stopped at `max_steps`.
    StepLimitReached { steps: usize, trace: Vec<Turn> },
}

impl RunOutcome {
    pub fn steps(&self) -> usize {
        match self {
            RunOutcome::Terminated { steps, .. }
            | RunOutcome::Failure { steps, .. }
            | RunOutcome::InvariantViolation { steps, .. }
            | RunOutcome::Deadlock { steps, .. }
            | RunOutcome::StepLimitReached { steps, .. } => *steps,
        }
    }

    pub fn trace(&self) -> &[Turn] {
        match self {
            RunOutcome::Terminated { trace, .. }
            | RunOutcome::Failure { trace, .. }
            | RunOutcome::InvariantViolation { trace, .. }
            | RunOutcome::Deadlock { trace, .. }
            | RunOutcome::StepLimitReached { trace, .. } => trace,
        }
    }

    /// True when the run finished without finding a problem.
    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Terminated { .. })
    }
}

pub struct Runner {
    state: GlobalState,
    config: RunConfig,
    rng: Option<StdRng>,
    steps: usize,
    trace: Vec<Turn>,
}

impl Runner {
    /// Link `program` and boot it with the initial thread at pc 0.
    pub fn new(program: &Program, config: RunConfig) -> RunResult<Self> {
        let code = program.link()?;
        if code.is_empty() {
            return Err(RunError::EmptyProgram);
        }
        Ok(Self::from_state(GlobalState::boot(code), config))
    }

    pub fn from_state(state: GlobalState, config: RunConfig) -> Self {
        let rng = config.seed.map(StdRng::seed_from_u64);
        Self {
            state,
            config,
            rng,
            steps: 0,
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn into_state(self) -> GlobalState {
        self.state
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Run until termination, failure, violation, deadlock or the step limit.
    pub fn run(&mut self) -> RunOutcome {
        info!(
            instructions = self.state.code.len(),
            seed = ?self.config.seed,
            max_steps = self.config.max_steps,
            "starting run"
        );

        loop {
            if self.config.max_steps > 0 && self.steps >= self.config.max_steps {
                warn!(steps = self.steps, "step limit reached");
                return RunOutcome::StepLimitReached {
                    steps: self.steps,
                    trace: std::mem::take(&mut self.trace),
                };
            }

            let Some(key) = self.pick_thread() else {
                return self.quiescent_outcome();
            };
            self.state.ctxbag.remove(&key);
            let ctx = match key {
                Value::Context(ctx) => Arc::try_unwrap(ctx).unwrap_or_else(|arc| (*arc).clone()),
                other => panic!("non-context {} in runnable bag", other),
            };
            let thread = ctx.name.clone();
            let start_pc = ctx.pc;

            let end_pc = match self.turn(ctx) {
                Ok(pc) => pc,
                Err(failed) => {
                    let message = failed.failure.clone().unwrap_or_default();
                    info!(thread = %failed.name, %message, "thread failed");
                    return RunOutcome::Failure {
                        steps: self.steps,
                        thread: Box::new(failed),
                        message,
                        trace: std::mem::take(&mut self.trace),
                    };
                }
            };

            let fp = fingerprint(&self.state);
            debug!(%thread, start_pc, end_pc, fingerprint = %fp, "turn");
            self.trace.push(Turn {
                thread,
                start_pc,
                end_pc,
                fingerprint: fp,
            });

            if self.config.check_invariants {
                if let Some(outcome) = self.check_invariants() {
                    return outcome;
                }
            }
        }
    }

    /// Run one turn. Returns the pc the thread stopped at, or the thread
    /// itself if it failed.
    fn turn(&mut self, mut ctx: Context) -> Result<usize, Context> {
        if self.config.interrupts && ctx.trap.is_some() && !ctx.interrupt_level && ctx.atomic == 0 {
            debug!(thread = %ctx.name, pc = ctx.pc, "delivering interrupt");
            ctx.interrupt_invoke();
        }

        let mut executed = 0;
        loop {
            if let Some(choices) = pending_choice(&self.state, &ctx) {
                let choice = self.pick_choice(choices);
                trace!(thread = %ctx.name, %choice, "choose");
                resolve_choice(&mut ctx, choice);
            } else {
                step(&mut self.state, &mut ctx);
            }
            self.steps += 1;
            executed += 1;

            if ctx.is_failed() {
                return Err(ctx);
            }
            let pc = ctx.pc;
            if ctx.is_terminated() {
                debug!(thread = %ctx.name, "thread terminated");
                self.state.termbag.add(Value::context(ctx));
                return Ok(pc);
            }
            if ctx.stopped {
                // Stop already filed it in the stopped bag.
                return Ok(pc);
            }
            let out_of_budget = self.config.max_steps > 0 && self.steps >= self.config.max_steps;
            let turn_over =
                ctx.atomic == 0 && self.config.max_turn > 0 && executed >= self.config.max_turn;
            if out_of_budget || turn_over {
                self.state.ctxbag.add(Value::context(ctx));
                return Ok(pc);
            }
        }
    }

    fn pick_thread(&mut self) -> Option<Value> {
        let bag = &self.state.ctxbag;
        if bag.is_empty() {
            return None;
        }
        let picked = match self.rng.as_mut() {
            Some(rng) => bag.nth(rng.gen_range(0..bag.distinct())),
            None => bag.first(),
        };
        picked.cloned()
    }

    fn pick_choice(&mut self, choices: &[Value]) -> Value {
        match self.rng.as_mut() {
            Some(rng) => choices[rng.gen_range(0..choices.len())].clone(),
            None => choices[0].clone(),
        }
    }

    fn check_invariants(&mut self) -> Option<RunOutcome> {
        for &pc in &self.state.invariants {
            let message = match check_invariant(&self.state, pc) {
                Ok(true) => continue,
                Ok(false) => None,
                Err(msg) => Some(msg),
            };
            info!(pc, ?message, "invariant violated");
            return Some(RunOutcome::InvariantViolation {
                steps: self.steps,
                pc,
                message,
                trace: std::mem::take(&mut self.trace),
            });
        }
        None
    }

    fn quiescent_outcome(&mut self) -> RunOutcome {
        let blocked: usize = self
            .state
            .stopped_contexts()
            .filter(|(c, _)| c.as_context().is_some_and(|c| !c.eternal))
            .map(|(_, n)| n)
            .sum();
        let trace = std::mem::take(&mut self.trace);
        if blocked > 0 {
            info!(blocked, steps = self.steps, "deadlock");
            RunOutcome::Deadlock {
                steps: self.steps,
                blocked,
                trace,
            }
        } else {
            let threads = self.state.termbag.len();
            info!(threads, steps = self.steps, "all threads terminated");
            RunOutcome::Terminated {
                steps: self.steps,
                threads,
                trace,
            }
        }
    }
}

/// Evaluate the invariant registered at `pc` against `state`.
///
/// The body runs in a fresh read-only, atomic context entered at `pc + 1`
/// with an empty argument tuple, on a scratch copy of the state. Returns the
/// boolean result, or the failure message if evaluation went wrong.
pub fn check_invariant(state: &GlobalState, pc: usize) -> Result<bool, String> {
    let mut scratch = state.clone();
    let mut ctx = Context::new("invariant", pc + 1, Value::None, Value::None);
    ctx.atomic = 1;
    ctx.readonly = 1;
    ctx.push(Value::empty_dict());

    for _ in 0..INVARIANT_STEP_LIMIT {
        step(&mut scratch, &mut ctx);
        if let Some(failure) = &ctx.failure {
            return Err(failure.clone());
        }
        if ctx.is_terminated() {
            return match ctx.stack.last() {
                Some(Value::Bool(b)) => Ok(*b),
                Some(other) => Err(format!("invariant evaluated to {}, not a boolean", other)),
                None => Err("invariant produced no result".to_string()),
            };
        }
    }
    Err(format!(
        "invariant at pc {} did not finish within {} instructions",
        pc, INVARIANT_STEP_LIMIT
    ))
}
