use std::time::Instant;

use cinnabar_core::{
    BucketSpec, CompileConfig, Compiler, CondExpr, DataType, DimExpr, HostTensor, ProgramBuilder,
};

fn main() {
    let mut b = ProgramBuilder::new();
    let a = b.input("a", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(256)]);
    let w = b.input("w", DataType::F32, vec![DimExpr::Int(256), DimExpr::Int(128)]);
    let y = b.matmul(a, w).unwrap();
    let y = b.unary("relu", y).unwrap();
    b.output(y);
    let program = b.build().unwrap();

    let compiler = Compiler::new(CompileConfig::default().with_bucket_compile(true))
        .unwrap()
        .with_group_buckets(
            0,
            vec![
                BucketSpec::new(CondExpr::lt("S0", 1024), "small"),
                BucketSpec::new(CondExpr::ge("S0", 1024), "large"),
            ],
        );
    let mut compiled = compiler.compile(&program).unwrap();

    let w = HostTensor::full(DataType::F32, vec![256, 128], 0.01);
    for rows in [16, 512, 4096] {
        let a = HostTensor::full(DataType::F32, vec![rows, 256], 1.0);
        let start = Instant::now();
        let (out, records) = compiled.run_traced(&[a, w.clone()]).unwrap();
        let elapsed = start.elapsed();
        for record in &records {
            println!(
                "S0={rows}: {} ({}) in {elapsed:?}",
                record.kernel_name,
                record.variant.as_deref().unwrap_or("-")
            );
        }
        assert_eq!(out[0].shape(), &[rows, 128]);
    }
}
