//! Command-line interface for the Strand bytecode VM.

use clap::{Parser, Subcommand, ValueEnum};
use miette::{Diagnostic, NamedSource, SourceSpan};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use strand_eval::{tla, LoadError, Program};
use strand_mc::{RunConfig, RunOutcome, Runner, Turn};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI error with source context for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("failed to read file: {message}")]
    IoError { message: String },

    #[error("load error: {message}")]
    #[diagnostic(code(strand::load_error))]
    LoadError {
        message: String,
        #[source_code]
        src: NamedSource<Arc<String>>,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("link error: {message}")]
    #[diagnostic(code(strand::link_error))]
    LinkError { message: String },

    #[error("run error: {message}")]
    RunError { message: String },
}

impl CliError {
    fn from_load_error(e: LoadError, source: Arc<String>, filename: &str) -> Self {
        let (line, column) = e.position();
        let offset = byte_offset(&source, line, column);
        CliError::LoadError {
            message: e.to_string(),
            src: NamedSource::new(filename, source),
            span: (offset, 0).into(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

/// Byte offset of a 1-based line and column, clamped to the source.
fn byte_offset(source: &str, line: usize, column: usize) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(source.len())
}

#[derive(Parser)]
#[command(
    name = "strand",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("STRAND_GIT_HASH"), ")")
)]
#[command(about = "Bytecode VM for concurrent Strand programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DumpFormat {
    Json,
    Tla,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program along one interleaving
    Run {
        /// Program file (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Pick threads and choices randomly from this seed
        #[arg(long)]
        seed: Option<u64>,

        /// Maximum number of instructions to execute (0 = unlimited)
        #[arg(long, default_value = "1000000")]
        max_steps: usize,

        /// Instructions per turn outside atomic sections (0 = unbounded)
        #[arg(long, default_value = "1")]
        max_turn: usize,

        /// Do not evaluate invariants
        #[arg(long)]
        no_invariants: bool,

        /// Deliver pending traps
        #[arg(long)]
        interrupts: bool,

        /// Print every turn of the run
        #[arg(long)]
        trace: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the linked program
    Dump {
        /// Program file (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: DumpFormat,

        /// Module name for TLA+ output (default: file stem)
        #[arg(long)]
        module: Option<String>,
    },

    /// List the program with a description of each instruction
    Explain {
        /// Program file (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() {
    // Install miette's fancy error handler
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let cli = Cli::parse();

    let filter = if matches!(&cli.command, Commands::Run { verbose: true, .. }) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Run {
            file,
            seed,
            max_steps,
            max_turn,
            no_invariants,
            interrupts,
            trace,
            verbose: _,
        } => {
            let config = RunConfig {
                max_steps,
                seed,
                check_invariants: !no_invariants,
                interrupts,
                max_turn,
            };
            cmd_run(&file, config, trace)
        }
        Commands::Dump {
            file,
            format,
            module,
        } => cmd_dump(&file, format, module),
        Commands::Explain { file } => cmd_explain(&file),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    }
}

fn load_program(file: &Path) -> CliResult<Program> {
    let filename = file.display().to_string();
    let source = Arc::new(fs::read_to_string(file).map_err(|e| CliError::IoError {
        message: e.to_string(),
    })?);
    Program::from_json(&source).map_err(|e| CliError::from_load_error(e, source.clone(), &filename))
}

fn print_trace(trace: &[Turn]) {
    println!("  Trace ({} turns):", trace.len());
    for (i, turn) in trace.iter().enumerate() {
        println!(
            "    {}: {} pc {} -> {} [{}]",
            i, turn.thread, turn.start_pc, turn.end_pc, turn.fingerprint
        );
    }
}

/// Returns the process exit code: 0 for a clean run, 1 for a problem found,
/// 2 when the run was cut short.
fn cmd_run(file: &Path, config: RunConfig, show_trace: bool) -> CliResult<i32> {
    let program = load_program(file)?;
    info!(instructions = program.code.len(), "loaded program");

    let mut runner = Runner::new(&program, config).map_err(|e| match e {
        strand_mc::RunError::Link(e) => CliError::LinkError {
            message: e.to_string(),
        },
        other => CliError::RunError {
            message: other.to_string(),
        },
    })?;

    let start = Instant::now();
    let outcome = runner.run();
    let elapsed = start.elapsed();

    let mut state = runner.into_state();
    for value in state.take_prints() {
        println!("{}", value);
    }

    println!();
    let code = match &outcome {
        RunOutcome::Terminated { threads, .. } => {
            println!("Result: OK");
            println!("  Threads terminated: {}", threads);
            0
        }
        RunOutcome::Failure {
            thread, message, ..
        } => {
            println!("Result: FAILURE");
            println!("  Thread: {} (entry {})", thread.name, thread.entry);
            println!("  {}", message);
            1
        }
        RunOutcome::InvariantViolation { pc, message, .. } => {
            println!("Result: INVARIANT VIOLATION");
            println!("  Invariant at pc {}", pc);
            if let Some(message) = message {
                println!("  {}", message);
            }
            1
        }
        RunOutcome::Deadlock { blocked, .. } => {
            println!("Result: DEADLOCK");
            println!("  Blocked threads: {}", blocked);
            1
        }
        RunOutcome::StepLimitReached { .. } => {
            println!("Result: STEP LIMIT REACHED");
            2
        }
    };
    println!("  Instructions: {}", outcome.steps());
    println!("  Time: {:.2}s", elapsed.as_secs_f64());
    println!("  Final state: {}", state.vars);

    if show_trace || !outcome.is_ok() {
        print_trace(outcome.trace());
    }
    Ok(code)
}

fn cmd_dump(file: &Path, format: DumpFormat, module: Option<String>) -> CliResult<i32> {
    let program = load_program(file)?;
    let code = program.link().map_err(|e| CliError::LinkError {
        message: e.to_string(),
    })?;

    match format {
        DumpFormat::Json => {
            let linked = Program::new(code.to_vec());
            println!("{}", linked.to_json());
        }
        DumpFormat::Tla => {
            let name = module.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "Main".into())
            });
            print!("{}", tla::render_module(&name, &code));
        }
    }
    Ok(0)
}

fn cmd_explain(file: &Path) -> CliResult<i32> {
    let program = load_program(file)?;
    let code = program.link().map_err(|e| CliError::LinkError {
        message: e.to_string(),
    })?;

    let width = code.iter().map(|op| op.to_string().len()).max().unwrap_or(0);
    for (pc, op) in code.iter().enumerate() {
        let listing = op.to_string();
        println!("{:>4}  {:<width$}  # {}", pc, listing, op.explain(), width = width);
    }
    Ok(0)
}
