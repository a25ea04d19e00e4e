use cinnabar_core::{
    compile, BucketSpec, CompileConfig, Compiler, CondExpr, DataType, DimExpr, Error, HostTensor,
    Program, ProgramBuilder, Target,
};

fn assert_close(actual: &[f32], expected: f32) {
    for (i, x) in actual.iter().enumerate() {
        let tol = 1e-3 * expected.abs().max(1.0);
        assert!((x - expected).abs() <= tol, "element {i}: {x} != {expected}");
    }
}

fn elementwise_chain() -> Program {
    let mut b = ProgramBuilder::new();
    let shape = b.shape_input("shape", vec![DimExpr::sym("S0"), DimExpr::Int(128)]);
    let x = b.full_with_tensor(shape, 1.0, DataType::F32).unwrap();
    let a = b.unary("tan", x).unwrap();
    let r = b.unary("relu", a).unwrap();
    let c = b.unary("tan", r).unwrap();
    let d = b.unary("relu", c).unwrap();
    b.output(d);
    b.build().unwrap()
}

fn softmax(dims: Vec<DimExpr>) -> Program {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, dims.clone());
    let m = b.reduce_max(x, &[-1], true).unwrap();
    let mb = b.broadcast_to(m, dims.clone()).unwrap();
    let d = b.sub(x, mb).unwrap();
    let e = b.unary("exp", d).unwrap();
    let s = b.reduce_sum(e, &[-1], true).unwrap();
    let sb = b.broadcast_to(s, dims).unwrap();
    let y = b.div(e, sb).unwrap();
    b.output(y);
    b.build().unwrap()
}

fn matmul() -> Program {
    let mut b = ProgramBuilder::new();
    let a = b.input("a", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(64)]);
    let w = b.input("w", DataType::F32, vec![DimExpr::Int(64), DimExpr::Int(32)]);
    let y = b.matmul(a, w).unwrap();
    b.output(y);
    b.build().unwrap()
}

macro_rules! test_for_target {
    ($target:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn config() -> CompileConfig {
                CompileConfig::default().with_target($target)
            }

            #[test]
            fn elementwise_chain_matches_reference() {
                let mut compiled = compile(&elementwise_chain(), &config()).unwrap();
                assert_eq!(compiled.instructions().len(), 1);

                let out = compiled.run(&[HostTensor::shape_tensor(&[64, 128])]).unwrap();
                assert_eq!(out[0].shape(), &[64, 128]);
                let expected = 1f32.tan().max(0.0).tan().max(0.0);
                assert_close(out[0].as_f32().unwrap(), expected);
            }

            #[test]
            fn softmax_of_ones_is_uniform() {
                let dims = vec![DimExpr::Int(2), DimExpr::Int(2), DimExpr::Int(4)];
                let mut compiled = compile(&softmax(dims), &config()).unwrap();
                assert_eq!(compiled.instructions().len(), 1);

                let x = HostTensor::full(DataType::F32, vec![2, 2, 4], 1.0);
                let out = compiled.run(&[x]).unwrap();
                assert_eq!(out[0].shape(), &[2, 2, 4]);
                assert_close(out[0].as_f32().unwrap(), 0.25);
            }

            #[test]
            fn symbolic_softmax_rows_sum_to_one() {
                let dims = vec![DimExpr::sym("S0"), DimExpr::Int(8)];
                let mut compiled = compile(&softmax(dims), &config()).unwrap();

                for rows in [1usize, 3] {
                    let data: Vec<f32> = (0..rows * 8).map(|i| (i % 8) as f32).collect();
                    let x = HostTensor::from_f32(vec![rows, 8], data).unwrap();
                    let out = compiled.run(&[x]).unwrap();
                    assert_eq!(out[0].shape(), &[rows, 8]);
                    for row in out[0].as_f32().unwrap().chunks(8) {
                        let sum: f32 = row.iter().sum();
                        assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
                        assert!(row.windows(2).all(|w| w[0] < w[1]));
                    }
                }
            }

            #[test]
            fn matmul_dispatches_by_predicate() {
                let specs = vec![
                    BucketSpec::new(CondExpr::lt("S0", 1024), "A"),
                    BucketSpec::new(CondExpr::ge("S0", 1024), "B"),
                ];
                let compiler = Compiler::new(config().with_bucket_compile(true))
                    .unwrap()
                    .with_group_buckets(0, specs);
                let mut compiled = compiler.compile(&matmul()).unwrap();
                let w = HostTensor::full(DataType::F32, vec![64, 32], 1.0);

                for (rows, variant) in [(512usize, "A"), (2048, "B")] {
                    let a = HostTensor::full(DataType::F32, vec![rows, 64], 0.5);
                    let (out, records) = compiled.run_traced(&[a, w.clone()]).unwrap();
                    assert_eq!(records.len(), 1);
                    assert_eq!(records[0].variant.as_deref(), Some(variant));
                    assert_eq!(out[0].shape(), &[rows, 32]);
                    assert_close(out[0].as_f32().unwrap(), 32.0);
                }
            }

            #[test]
            fn broadcast_buckets_specialize_unit_dims() {
                let mut b = ProgramBuilder::new();
                let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0")]);
                let y = b.input("y", DataType::F32, vec![DimExpr::sym("S1")]);
                let z = b.add(x, y).unwrap();
                b.output(z);
                let program = b.build().unwrap();
                let mut compiled = compile(&program, &config().with_bucket_compile(true)).unwrap();

                let x = HostTensor::from_f32(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
                let y = HostTensor::from_f32(vec![1], vec![10.0]).unwrap();
                let (out, records) = compiled.run_traced(&[x.clone(), y.clone()]).unwrap();
                assert_eq!(out[0].as_f32().unwrap(), &[11.0, 12.0, 13.0, 14.0]);
                let unit_rhs = records[0].kernel_name.clone();

                let (out, records) = compiled.run_traced(&[y, x]).unwrap();
                assert_eq!(out[0].as_f32().unwrap(), &[11.0, 12.0, 13.0, 14.0]);
                assert_ne!(records[0].kernel_name, unit_rhs);
            }

            #[test]
            fn multi_group_programs_pass_tensors_along() {
                let mut b = ProgramBuilder::new();
                let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
                let s = b.reduce_sum(x, &[1], false).unwrap();
                let r = b.reduce_sum(s, &[0], true).unwrap();
                b.output(s);
                b.output(r);
                let program = b.build().unwrap();
                let mut compiled = compile(&program, &config()).unwrap();
                assert_eq!(compiled.instructions().len(), 2);

                let x = HostTensor::full(DataType::F32, vec![3, 4], 2.0);
                let out = compiled.run(&[x]).unwrap();
                assert_eq!(out[0].as_f32().unwrap(), &[8.0, 8.0, 8.0]);
                assert_eq!(out[1].as_f32().unwrap(), &[24.0]);
            }
        }
    };
}

test_for_target!(Target::Cpu, cpu_tests);
#[cfg(feature = "cuda")]
test_for_target!(Target::Cuda, cuda_tests);

#[test]
fn arguments_are_validated() {
    let dims = vec![DimExpr::sym("S0"), DimExpr::Int(8)];
    let mut compiled = compile(&softmax(dims), &CompileConfig::default()).unwrap();
    let err = compiled.run(&[]).unwrap_err();
    assert!(matches!(err.root(), Error::Runtime { .. }));

    let wrong = HostTensor::full(DataType::F32, vec![2, 7], 1.0);
    let err = compiled.run(&[wrong]).unwrap_err();
    assert!(err.to_string().contains("dim 1"), "{err}");
}

#[test]
fn random_fills_are_seeded() {
    let mut b = ProgramBuilder::new();
    let u = b
        .uniform(vec![DimExpr::Int(16), DimExpr::Int(8)], -1.0, 1.0, 7, DataType::F32)
        .unwrap();
    let g = b
        .gaussian(vec![DimExpr::Int(16), DimExpr::Int(8)], 0.0, 1.0, 7, DataType::F32)
        .unwrap();
    b.output(u);
    b.output(g);
    let program = b.build().unwrap();

    let mut compiled = compile(&program, &CompileConfig::default()).unwrap();
    let first = compiled.run(&[]).unwrap();
    let second = compiled.run(&[]).unwrap();
    assert_eq!(first, second);
    assert!(first[0].as_f32().unwrap().iter().all(|x| (-1.0..1.0).contains(x)));
    assert!(first[1].as_f32().unwrap().iter().any(|x| *x != 0.0));
}

#[test]
fn describe_lists_every_kernel() {
    let compiled = compile(&elementwise_chain(), &CompileConfig::default()).unwrap();
    let text = compiled.describe();
    for name in compiled.kernel_names() {
        assert!(text.contains(&name));
    }
    assert!(text.contains("S0 = data(in0)[0]"), "{text}");
}

#[test]
fn launch_errors_name_the_instruction() {
    let specs = vec![BucketSpec::new(CondExpr::lt("S0", 1024), "small")];
    let compiler = Compiler::new(CompileConfig::default().with_bucket_compile(true))
        .unwrap()
        .with_group_buckets(0, specs);
    let mut compiled = compiler.compile(&matmul()).unwrap();

    let a = HostTensor::full(DataType::F32, vec![2048, 64], 0.5);
    let w = HostTensor::full(DataType::F32, vec![64, 32], 1.0);
    let err = compiled.run(&[a, w]).unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("instruction #0 (fn_0_matmul)"), "{text}");
    assert!(text.contains("no bucket"), "{text}");
    assert!(matches!(err.root(), Error::Runtime { .. }), "{err:?}");
}

#[test]
fn literal_symbolic_fill_has_no_shape_source() {
    let mut b = ProgramBuilder::new();
    let x = b.full(vec![DimExpr::sym("S0"), DimExpr::Int(128)], 1.0, DataType::F32).unwrap();
    let a = b.unary("tan", x).unwrap();
    let r = b.unary("relu", a).unwrap();
    b.output(r);
    let program = b.build().unwrap();

    let err = compile(&program, &CompileConfig::default()).unwrap_err();
    let Error::CompilationFailed { failures } = err.root() else {
        panic!("expected an aggregated failure, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error.root(), Error::Unsupported { .. }));
    assert!(failures[0].error.to_string().contains("symbol S0"), "{err}");
}
