use std::sync::{Arc, Mutex};

use crate::{
    backend::Backend,
    config::CompileConfig,
    fusion::Group,
    ir::Program,
    lowering::{lower, BucketSpec, LoweredFunction},
    symbolic::ShapeAnalysis,
    Error, Result,
};

use super::{CancelToken, KernelInfo};

/// Everything one worker needs to compile one group.
///
/// The program and shape analysis are read-only snapshots shared by every
/// context of a compilation.
#[derive(Debug, Clone)]
pub struct CompilationContext {
    pub group: Group,
    pub program: Arc<Program>,
    pub analysis: Arc<ShapeAnalysis>,
    pub config: CompileConfig,
    pub specs: Vec<BucketSpec>,
    /// Filled once lowering succeeds.
    pub function: Option<LoweredFunction>,
}

impl CompilationContext {
    pub fn new(
        group: Group,
        program: Arc<Program>,
        analysis: Arc<ShapeAnalysis>,
        config: CompileConfig,
    ) -> Self {
        Self {
            group,
            program,
            analysis,
            config,
            specs: Vec::new(),
            function: None,
        }
    }

    pub fn with_specs(mut self, specs: Vec<BucketSpec>) -> Self {
        self.specs = specs;
        self
    }
}

fn codegen_failure(group: usize, err: Error) -> Error {
    match err.root() {
        Error::CodegenFailure { .. } | Error::Cancelled { .. } => err,
        _ => Error::CodegenFailure {
            group,
            message: err.to_string(),
        },
    }
}

/// One unit of work for the driver's worker pool.
#[derive(Debug)]
pub struct CompilationTask {
    pub context: CompilationContext,
    backend: Arc<dyn Backend>,
    cancel: CancelToken,
    /// Serializes codegen and device compilation for non-reentrant backends.
    lock: Option<Arc<Mutex<()>>>,
}

impl CompilationTask {
    pub fn new(
        context: CompilationContext,
        backend: Arc<dyn Backend>,
        cancel: CancelToken,
        lock: Option<Arc<Mutex<()>>>,
    ) -> Self {
        Self {
            context,
            backend,
            cancel,
            lock,
        }
    }

    /// Lower, generate, compile and load one group.
    #[tracing::instrument(
        skip_all,
        fields(group = self.context.group.index(), fn_name = self.context.group.fn_name())
    )]
    pub fn run(&mut self) -> Result<KernelInfo> {
        let group = self.context.group.index();
        let ctx = &self.context;
        self.cancel.check(group)?;
        let function = lower(&ctx.group, &ctx.program, &ctx.analysis, &ctx.config, &ctx.specs)?;
        self.cancel.check(group)?;

        let (source, module) = {
            let _guard = match &self.lock {
                Some(lock) => Some(lock.lock()?),
                None => None,
            };
            let source = self
                .backend
                .codegen(&function)
                .map_err(|e| codegen_failure(group, e))?;
            let module = self
                .backend
                .compile(&source, &function)
                .map_err(|e| codegen_failure(group, e))?;
            (source, module)
        };
        self.cancel.check(group)?;

        let info = KernelInfo::assemble(&function, &source, &module)?;
        tracing::debug!(
            buckets = info.buckets.len(),
            backend = self.backend.name(),
            "compiled group"
        );
        self.context.function = Some(function);
        Ok(info)
    }
}
