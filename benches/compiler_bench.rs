use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use gridc::arch::GridDepth;
use gridc::microop::{MicroOp, Operand, Program};
use gridc::opcode::{AluOp, MemOp};
use gridc::pass::PassId;
use gridc::pipeline::{compile, run_pipeline, CompileOptions};
use gridc::runtime::{Dispatch, Lane, RuntimeConfig, SimPort};

// KPI-aligned benchmark scenarios.
// Every scenario compiles at the default depth.

fn load(dest: &str, top: &str, len: u64) -> MicroOp {
    MicroOp::load(MemOp::Ldr, dest, Operand::imm(0), Operand::sym(top), len)
}

/// Load, fold one add onto it, store the result back in place.
fn simple() -> Program {
    Program::default()
        .host_addr("a", 0x1000)
        .push(load("x", "a", 64))
        .push(MicroOp::exe(AluOp::Add, "y", &[Operand::sym("x"), Operand::imm(1)]))
        .push(MicroOp::store(
            MemOp::Str,
            Operand::sym("y"),
            Operand::imm(0),
            Operand::sym("a"),
            64,
        ))
}

/// Four identical windows in one row: merged into a quad.
fn quad() -> Program {
    let mut p = Program::default().host_addr("a", 0x1000);
    for c in 0..4u8 {
        p = p.push(load(&format!("x{}", c), "a", 256).at(2, c));
    }
    p.push(MicroOp::exe(AluOp::Add, "s", &[Operand::sym("x0"), Operand::sym("x3")]))
}

/// Long-distance operands that must be carried across many rows.
fn carried() -> Program {
    let mut p = Program::default().host_imm("k", 7);
    p = p.push(MicroOp::exe(AluOp::Add, "v0", &[Operand::sym("k"), Operand::imm(1)]));
    for i in 1..16 {
        p = p.push(MicroOp::exe(
            AluOp::Add,
            &format!("v{}", i),
            &[Operand::sym(format!("v{}", i - 1)), Operand::sym("v0")],
        ));
    }
    p
}

fn scenarios() -> [(&'static str, Program); 3] {
    [("simple", simple()), ("quad", quad()), ("carried", carried())]
}

/// A chain of `n` dependent adds, one row each.
fn generate_chain(n: usize) -> Program {
    let mut p = Program::default().push(MicroOp::exe(AluOp::Add, "v0", &[Operand::imm(1)]));
    for i in 1..n {
        p = p.push(MicroOp::exe(
            AluOp::Add,
            &format!("v{}", i),
            &[Operand::sym(format!("v{}", i - 1)), Operand::imm(1)],
        ));
    }
    p
}

// KPI: full compile latency (bind -> place -> route -> lmm -> emit).
fn bench_kpi_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    let opts = CompileOptions::default();

    for (name, program) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &program, |b, program| {
            b.iter(|| compile(black_box(program), &opts).expect("benchmark scenario must compile"));
        });
    }

    group.finish();
}

// KPI: latency up to each pass on a non-trivial program.
fn bench_kpi_phase_latency(c: &mut Criterion) {
    let opts = CompileOptions::default();
    let program = carried();

    for (label, pass) in [
        ("place", PassId::Place),
        ("route", PassId::Route),
        ("lmm", PassId::Broadcast),
        ("emit", PassId::Emit),
    ] {
        let mut group = c.benchmark_group(format!("kpi/phase_latency/{}", label));
        group.bench_function("carried", |b| {
            b.iter(|| {
                let state = run_pipeline(black_box(&program), &opts, pass)
                    .expect("benchmark scenario must compile");
                black_box(state.timings.len());
            });
        });
        group.finish();
    }
}

// KPI: compile scaling vs number of chained records.
fn bench_kpi_compile_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/compile_scaling");
    let opts = CompileOptions::default();

    for n in [1_usize, 8, 16, 32, 60] {
        let program = generate_chain(n);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}records", n)),
            &program,
            |b, program| {
                b.iter(|| compile(black_box(program), &opts).expect("chain must compile"));
            },
        );
    }

    group.finish();
}

// KPI: host-side dispatch cost against the simulated fabric.
fn bench_kpi_dispatch_latency(c: &mut Criterion) {
    let kernel = compile(&simple(), &CompileOptions::default()).expect("simple must compile");
    let mut group = c.benchmark_group("kpi/dispatch_latency");

    group.bench_function("first", |b| {
        b.iter_batched(
            || Lane::open(SimPort::new(GridDepth::D64), RuntimeConfig::default()).expect("open"),
            |lane| black_box(lane.dispatch(&Dispatch::new(&kernel.emitted)).expect("dispatch")),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("resident", |b| {
        let lane = Lane::open(SimPort::new(GridDepth::D64), RuntimeConfig::default()).expect("open");
        lane.dispatch(&Dispatch::new(&kernel.emitted)).expect("dispatch");
        b.iter(|| black_box(lane.dispatch(&Dispatch::new(&kernel.emitted)).expect("dispatch")));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_kpi_full_compile_latency,
    bench_kpi_phase_latency,
    bench_kpi_compile_scaling,
    bench_kpi_dispatch_latency,
);
criterion_main!(benches);
