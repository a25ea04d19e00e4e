use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use cinnabar_core::{
    compile, Backend, CancelToken, CompileConfig, Compiler, CpuBackend, DataType, DimExpr, Error,
    LoadedModule, LoweredFunction, Program, ProgramBuilder, SourceModule, Target, Type,
};

/// `count` independent `exp(relu(x_i))` chains, one group each.
fn independent_chains(count: usize) -> Program {
    let mut b = ProgramBuilder::new();
    for i in 0..count {
        let x = b.input(&format!("x{i}"), DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
        let r = b.unary("relu", x).unwrap();
        let e = b.unary("exp", r).unwrap();
        b.output(e);
    }
    b.build().unwrap()
}

/// Wraps the CPU backend, refusing re-entrance and recording the peak
/// number of concurrent codegen/compile calls.
#[derive(Debug, Default)]
struct ExclusiveBackend {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ExclusiveBackend {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Backend for ExclusiveBackend {
    fn name(&self) -> &str {
        "exclusive"
    }

    fn target(&self) -> Target {
        Target::Cpu
    }

    fn codegen(&self, function: &LoweredFunction) -> cinnabar_core::Result<SourceModule> {
        self.enter();
        let out = CpuBackend::new().codegen(function);
        self.leave();
        out
    }

    fn compile(
        &self,
        source: &SourceModule,
        function: &LoweredFunction,
    ) -> cinnabar_core::Result<LoadedModule> {
        self.enter();
        let out = CpuBackend::new().compile(source, function);
        self.leave();
        out
    }

    fn is_reentrant(&self) -> bool {
        false
    }
}

#[test]
fn empty_program_compiles_to_nothing() {
    let program = ProgramBuilder::new().build().unwrap();
    let mut compiled = compile(&program, &CompileConfig::default()).unwrap();
    assert!(compiled.instructions().is_empty());
    assert!(compiled.run(&[]).unwrap().is_empty());
}

#[test]
fn groups_keep_their_order() {
    let program = independent_chains(16);
    let config = CompileConfig::default().with_worker_count(8);
    let compiled = compile(&program, &config).unwrap();
    let indices: Vec<usize> = compiled
        .instructions()
        .iter()
        .map(|i| i.kernel().group_index)
        .collect();
    assert_eq!(indices, (0..16).collect::<Vec<_>>());
}

#[test]
fn parallel_compilation_is_deterministic() {
    let program = independent_chains(16);
    let parallel = CompileConfig::default().with_worker_count(8);
    let first = compile(&program, &parallel).unwrap().describe();
    let second = compile(&program, &parallel).unwrap().describe();
    let serial = compile(&program, &parallel.clone().with_worker_count(1)).unwrap().describe();
    assert_eq!(first, second);
    assert_eq!(first, serial);
}

#[test]
fn non_reentrant_backends_are_serialized() {
    let backend = Arc::new(ExclusiveBackend::default());
    let compiler = Compiler::new(CompileConfig::default().with_worker_count(8))
        .unwrap()
        .with_backend(backend.clone());
    let compiled = compiler.compile(&independent_chains(8)).unwrap();
    assert_eq!(compiled.instructions().len(), 8);
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn failures_are_reported_per_group() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::Int(8)]);
    let a = b.unary("exp", x).unwrap();
    let ty = Type::new(DataType::F32, vec![DimExpr::Int(8)]);
    let c = b.custom("my_custom_op", vec![a], vec![ty], Default::default()).unwrap()[0];
    let d = b.unary("relu", c).unwrap();
    b.output(d);
    let program = b.build().unwrap();

    let err = compile(&program, &CompileConfig::default()).unwrap_err();
    let Error::CompilationFailed { failures } = err.root() else {
        panic!("expected an aggregated failure, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].group_index, 1);
    assert!(failures[0].fn_name.contains("my_custom_op"));
    assert!(matches!(failures[0].error.root(), Error::CodegenFailure { group: 1, .. }));
}

#[test]
fn missing_device_compiler_fails_every_group() {
    let config = CompileConfig::default().with_target(Target::Hip);
    let err = compile(&independent_chains(3), &config).unwrap_err();
    let Error::CompilationFailed { failures } = err.root() else {
        panic!("expected an aggregated failure, got {err}");
    };
    assert_eq!(failures.len(), 3);
    assert!(failures
        .iter()
        .all(|f| matches!(f.error.root(), Error::CodegenFailure { .. })));
}

#[test]
fn cancelled_compilation_reports_cancellation() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let compiler = Compiler::new(CompileConfig::default())
        .unwrap()
        .with_cancel_token(cancel);
    let err = compiler.compile(&independent_chains(4)).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
}

#[test]
fn invalid_memory_class_is_rejected() {
    let config =
        CompileConfig::default().with_default_memory_class(cinnabar_core::MemoryClass::SSAShadow);
    assert!(Compiler::new(config).is_err());
}
