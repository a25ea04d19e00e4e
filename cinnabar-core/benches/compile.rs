use cinnabar_core::{compile, CompileConfig, DataType, DimExpr, HostTensor, Program, ProgramBuilder};
use criterion::{criterion_group, criterion_main, Criterion};

/// `groups` independent softmax rows over `[S0, 64]`.
fn softmax_groups(groups: usize) -> Program {
    let dims = || vec![DimExpr::sym("S0"), DimExpr::Int(64)];
    let mut b = ProgramBuilder::new();
    for i in 0..groups {
        let x = b.input(&format!("x{i}"), DataType::F32, dims());
        let m = b.reduce_max(x, &[-1], true).unwrap();
        let m = b.broadcast_to(m, dims()).unwrap();
        let d = b.sub(x, m).unwrap();
        let e = b.unary("exp", d).unwrap();
        let s = b.reduce_sum(e, &[-1], true).unwrap();
        let s = b.broadcast_to(s, dims()).unwrap();
        let y = b.div(e, s).unwrap();
        b.output(y);
    }
    b.build().unwrap()
}

fn bench_compile_16_groups(c: &mut Criterion) {
    let program = softmax_groups(16);
    for workers in [1, 8] {
        let config = CompileConfig::default().with_worker_count(workers);
        c.bench_function(&format!("compile_16_groups_{workers}_workers"), |bencher| {
            bencher.iter(|| compile(&program, &config).unwrap());
        });
    }
}

fn bench_run_softmax_1024(c: &mut Criterion) {
    let program = softmax_groups(1);
    let mut compiled = compile(&program, &CompileConfig::default()).unwrap();
    let x = HostTensor::full(DataType::F32, vec![1024, 64], 1.0);
    c.bench_function("run_softmax_1024x64", |bencher| {
        bencher.iter(|| compiled.run(std::slice::from_ref(&x)).unwrap());
    });
}

criterion_group!(benches, bench_compile_16_groups, bench_run_softmax_1024);
criterion_main!(benches);
