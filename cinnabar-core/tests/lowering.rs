use std::collections::BTreeMap;

use cinnabar_core::{
    cluster_ops, emit_device_source, lower, BucketSpec, CompileConfig, CondExpr, DataType, DimExpr,
    Error, LoweredFunction, PolicyManager, Program, ProgramBuilder, ShapeAnalysis, Target,
};

fn matmul() -> Program {
    let mut b = ProgramBuilder::new();
    let a = b.input("a", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(64)]);
    let w = b.input("w", DataType::F32, vec![DimExpr::Int(64), DimExpr::Int(32)]);
    let y = b.matmul(a, w).unwrap();
    b.output(y);
    b.build().unwrap()
}

fn broadcast_add() -> Program {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0")]);
    let y = b.input("y", DataType::F32, vec![DimExpr::sym("S1")]);
    let z = b.add(x, y).unwrap();
    b.output(z);
    b.build().unwrap()
}

fn lower_only_group(
    program: &Program,
    config: &CompileConfig,
    specs: &[BucketSpec],
) -> cinnabar_core::Result<LoweredFunction> {
    let groups = cluster_ops(program, &PolicyManager::default())?;
    assert_eq!(groups.len(), 1);
    let analysis = ShapeAnalysis::from_program(program);
    lower(&groups[0], program, &analysis, config, specs)
}

fn matmul_specs() -> Vec<BucketSpec> {
    vec![
        BucketSpec::new(CondExpr::lt("S0", 1024), "A"),
        BucketSpec::new(CondExpr::ge("S0", 1024), "B"),
    ]
}

#[test]
fn explicit_buckets_keep_their_order() {
    let config = CompileConfig::default().with_bucket_compile(true);
    let function = lower_only_group(&matmul(), &config, &matmul_specs()).unwrap();

    assert_eq!(function.buckets.len(), 2);
    let variants: Vec<_> = function.buckets.iter().map(|b| b.variant.as_deref()).collect();
    assert_eq!(variants, [Some("A"), Some("B")]);
    assert_eq!(
        function.buckets[0].kernel_name,
        format!("{}__COND__FPA_S0LT1024_BPA___kernel", function.fn_name)
    );
    assert_eq!(
        function.buckets[1].kernel_name,
        format!("{}__COND__FPA_S0GE1024_BPA___kernel", function.fn_name)
    );
    assert!(function.host_source.contains("if ("));
    assert!(function.host_source.contains("} else if ("));

    let device = emit_device_source(&function).unwrap();
    for name in function.kernel_names() {
        assert!(device.contains(name), "{name} missing from device source");
    }
}

#[test]
fn disabled_bucketing_ignores_specs() {
    let function = lower_only_group(&matmul(), &CompileConfig::default(), &matmul_specs()).unwrap();
    assert_eq!(function.buckets.len(), 1);
    assert!(function.buckets[0].predicate.is_true());
    assert_eq!(
        function.buckets[0].kernel_name,
        format!("{}__COND_TRUE__kernel", function.fn_name)
    );
    assert!(!function.host_source.contains("if ("));
}

#[test]
fn broadcast_tree_buckets_are_exclusive() {
    let config = CompileConfig::default().with_bucket_compile(true);
    let function = lower_only_group(&broadcast_add(), &config, &[]).unwrap();
    assert_eq!(function.buckets.len(), 3);

    for s0 in 1..6 {
        for s1 in 1..6 {
            if s0 != s1 && s0 != 1 && s1 != 1 {
                continue;
            }
            let env = BTreeMap::from([("S0".to_string(), s0), ("S1".to_string(), s1)]);
            let holding = function
                .buckets
                .iter()
                .filter(|b| b.predicate.holds(&env).unwrap())
                .count();
            assert_eq!(holding, 1, "S0={s0} S1={s1}");
        }
    }
}

#[test]
fn predicates_over_unbound_symbols_fail() {
    let config = CompileConfig::default().with_bucket_compile(true);
    let specs = [BucketSpec::new(CondExpr::lt("S9", 4), "A")];
    let err = lower_only_group(&matmul(), &config, &specs).unwrap_err();
    assert!(matches!(err.root(), Error::Predicate { .. }), "{err}");
}

#[test]
fn gpu_launch_covers_the_output() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(128)]);
    let y = b.unary("relu", x).unwrap();
    b.output(y);
    let program = b.build().unwrap();

    let config = CompileConfig::default().with_target(Target::Cuda);
    let function = lower_only_group(&program, &config, &[]).unwrap();
    let launch = &function.buckets[0].launch;
    let env = BTreeMap::from([("S0".to_string(), 64)]);
    let grid = launch.evaluate_grid(&env).unwrap();
    let block = launch.block_u32();
    let threads: u64 = grid.iter().chain(&block).map(|x| *x as u64).product();
    assert!(threads >= 64 * 128);
    assert!(block[0] <= 256);
}
