//! Integration tests that load and run the JSON programs under `programs/`.

use std::fs;
use std::path::{Path, PathBuf};
use strand_eval::{tla, Program, Value};
use strand_mc::{RunConfig, RunOutcome, Runner};

fn programs_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("programs")
}

fn load(name: &str) -> Program {
    let source = fs::read_to_string(programs_dir().join(name)).unwrap();
    Program::from_json(&source).unwrap()
}

fn find_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.extension().map_or(false, |e| e == "json"))
        .collect();
    files.sort();
    files
}

#[test]
fn all_programs_load_and_link() {
    let files = find_json_files(&programs_dir());
    assert!(!files.is_empty(), "no programs found");
    for path in files {
        let source = fs::read_to_string(&path).unwrap();
        let program = Program::from_json(&source)
            .unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        let code = program
            .link()
            .unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        let module = tla::render_module("M", &code);
        assert!(module.starts_with("---- MODULE M ----"));
        for op in code.iter() {
            assert!(!op.explain().is_empty());
        }
    }
}

#[test]
fn counter_program_counts_both_increments() {
    let mut runner = Runner::new(&load("counter.json"), RunConfig::default()).unwrap();
    let outcome = runner.run();
    assert!(matches!(outcome, RunOutcome::Terminated { threads: 3, .. }), "{:?}", outcome);
    assert_eq!(
        runner.state().get(&[Value::atom("count")]).unwrap(),
        Value::Int(2)
    );
    assert_eq!(runner.state().prints.len(), 2);
}

#[test]
fn counter_program_is_safe_under_any_seed() {
    let program = load("counter.json");
    for seed in 0..16 {
        let config = RunConfig {
            seed: Some(seed),
            ..Default::default()
        };
        let mut runner = Runner::new(&program, config).unwrap();
        assert!(runner.run().is_ok());
        assert_eq!(
            runner.state().get(&[Value::atom("count")]).unwrap(),
            Value::Int(2),
            "seed {}",
            seed
        );
    }
}

#[test]
fn waiter_program_deadlocks() {
    let mut runner = Runner::new(&load("waiter.json"), RunConfig::default()).unwrap();
    assert!(matches!(runner.run(), RunOutcome::Deadlock { blocked: 1, .. }));
}

#[test]
fn bounded_program_outcome_follows_choice() {
    let program = load("bounded.json");

    let mut runner = Runner::new(&program, RunConfig::default()).unwrap();
    assert!(runner.run().is_ok());

    for seed in 0..16 {
        let config = RunConfig {
            seed: Some(seed),
            ..Default::default()
        };
        let mut runner = Runner::new(&program, config).unwrap();
        let outcome = runner.run();
        let x = runner.state().get(&[Value::atom("x")]).unwrap();
        match outcome {
            RunOutcome::Terminated { .. } => {
                assert!(x == Value::Int(1) || x == Value::Int(2), "seed {}", seed)
            }
            RunOutcome::InvariantViolation { pc, .. } => {
                assert_eq!(pc, 3);
                assert_eq!(x, Value::Int(5));
            }
            other => panic!("seed {}: unexpected {:?}", seed, other),
        }
    }
}
