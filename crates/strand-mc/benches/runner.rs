//! Criterion benchmarks for the runner.
//!
//! Run with: cargo bench -p strand-mc

use criterion::{criterion_group, criterion_main, Criterion};
use strand_eval::{Op, Operator, Pattern, Program, Value};
use strand_mc::{fingerprint, RunConfig, Runner};

/// `threads` workers, each adding one to a shared counter `rounds` times
/// inside an atomic section.
fn counter_program(threads: usize, rounds: i64) -> Program {
    let frame = |name: &str| Op::Frame {
        name: name.into(),
        args: Pattern::Tuple(vec![]),
    };
    let mut code = vec![
        frame("__init__"),
        Op::Push {
            value: Value::Int(0),
        },
        Op::Store {
            name: Some("count".into()),
        },
    ];
    let entry = code.len() + 4 * threads + 1;
    for _ in 0..threads {
        code.extend([
            Op::Push {
                value: Value::Pc(entry),
            },
            Op::Push {
                value: Value::empty_dict(),
            },
            Op::Push { value: Value::None },
            Op::Spawn { eternal: false },
        ]);
    }
    code.push(Op::Return);

    // worker: for i in 0..rounds: atomically count += 1
    code.extend([
        frame("worker"),
        Op::Push {
            value: Value::Int(0),
        },
        Op::StoreVar {
            pattern: Some(Pattern::Name("i".into())),
        },
    ]);
    let top = code.len();
    code.extend([
        Op::LoadVar {
            pattern: Some(Pattern::Name("i".into())),
        },
        Op::Push {
            value: Value::Int(rounds),
        },
        Op::Nary {
            operator: Operator::Lt,
            arity: 2,
        },
        Op::JumpCond {
            cond: Value::Bool(false),
            pc: strand_eval::Target::Pc(top + 12),
        },
        Op::AtomicInc { lazy: false },
        Op::Load {
            name: Some("count".into()),
        },
        Op::Push {
            value: Value::Int(1),
        },
        Op::Nary {
            operator: Operator::Plus,
            arity: 2,
        },
        Op::Store {
            name: Some("count".into()),
        },
        Op::AtomicDec,
        Op::IncVar { name: "i".into() },
        Op::Jump {
            pc: strand_eval::Target::Pc(top),
        },
        Op::Return,
    ]);
    Program::new(code)
}

fn bench_run(c: &mut Criterion, name: &str, program: &Program, config: RunConfig) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut runner = Runner::new(program, config.clone()).unwrap();
            assert!(runner.run().is_ok());
        })
    });
}

fn benchmarks(c: &mut Criterion) {
    let small = counter_program(2, 10);
    let large = counter_program(8, 50);

    bench_run(c, "counter_T2_R10", &small, RunConfig::default());
    bench_run(c, "counter_T8_R50", &large, RunConfig::default());
    bench_run(
        c,
        "counter_T8_R50_seeded",
        &large,
        RunConfig {
            seed: Some(42),
            ..Default::default()
        },
    );

    let mut runner = Runner::new(&large, RunConfig::default()).unwrap();
    runner.run();
    let state = runner.into_state();
    c.bench_function("fingerprint_final_state", |b| b.iter(|| fingerprint(&state)));
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
