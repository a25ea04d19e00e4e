use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use rayon::prelude::*;

use crate::{
    backend::{default_backend, Backend},
    config::CompileConfig,
    error::GroupFailure,
    fusion::{cluster_ops_with_analysis, Group, PolicyManager},
    ir::Program,
    lowering::BucketSpec,
    runtime::{CompiledProgram, Instruction, Scope},
    symbolic::{substitute_dim_exprs_based_on_constraints, ShapeAnalysis},
    Error, Result,
};

use super::{CancelToken, CompilationContext, CompilationTask, KernelInfo};

/// The compilation driver.
///
/// ```
/// use cinnabar_core::{CompileConfig, Compiler, DataType, DimExpr, HostTensor, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
/// let y = b.unary("relu", x).unwrap();
/// b.output(y);
/// let program = b.build().unwrap();
///
/// let mut compiled = Compiler::new(CompileConfig::default()).unwrap().compile(&program).unwrap();
/// let input = HostTensor::from_f32(vec![2, 4], vec![-1.0; 8]).unwrap();
/// let out = compiled.run(&[input]).unwrap();
/// assert_eq!(out[0].as_f32().unwrap(), &[0.0; 8]);
/// ```
#[derive(Debug)]
pub struct Compiler {
    config: CompileConfig,
    backend: Arc<dyn Backend>,
    policy: PolicyManager,
    cancel: CancelToken,
    group_buckets: BTreeMap<usize, Vec<BucketSpec>>,
}

impl Compiler {
    /// A compiler using the built-in backend of `config.target`.
    pub fn new(config: CompileConfig) -> Result<Self> {
        config.validate()?;
        let backend = default_backend(config.target)?;
        Ok(Self {
            config,
            backend,
            policy: PolicyManager::default(),
            cancel: CancelToken::new(),
            group_buckets: BTreeMap::new(),
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_policy(mut self, policy: PolicyManager) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Explicit buckets for the group at `group_index`.
    pub fn with_group_buckets(mut self, group_index: usize, specs: Vec<BucketSpec>) -> Self {
        self.group_buckets.insert(group_index, specs);
        self
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Shape canonicalization and clustering: the single-threaded front half.
    pub fn prepare(&self, program: &Program) -> Result<(ShapeAnalysis, Vec<Group>)> {
        program.verify()?;
        let mut analysis = ShapeAnalysis::from_program(program);
        let mapping = substitute_dim_exprs_based_on_constraints(program, &mut analysis)?;
        if !mapping.is_empty() {
            tracing::debug!(substitutions = mapping.len(), "canonicalized shapes");
        }
        let groups = cluster_ops_with_analysis(program, &analysis, &self.policy)?;
        Ok((analysis, groups))
    }

    /// Compile every group on the worker pool, preserving group order.
    ///
    /// All groups are attempted; if any fails, every failure is reported
    /// together and no kernels are returned.
    pub fn compile_groups(
        &self,
        groups: Vec<Group>,
        program: Arc<Program>,
        analysis: Arc<ShapeAnalysis>,
    ) -> Result<Vec<KernelInfo>> {
        let lock = (!self.backend.is_reentrant()).then(|| Arc::new(Mutex::new(())));
        let tasks: Vec<CompilationTask> = groups
            .into_iter()
            .map(|group| {
                let specs = self.group_buckets.get(&group.index()).cloned().unwrap_or_default();
                let context = CompilationContext::new(
                    group,
                    program.clone(),
                    analysis.clone(),
                    self.config.clone(),
                )
                .with_specs(specs);
                CompilationTask::new(
                    context,
                    self.backend.clone(),
                    self.cancel.clone(),
                    lock.clone(),
                )
            })
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_count)
            .thread_name(|i| format!("cinnabar-worker-{i}"))
            .build()
            .map_err(Error::wrap)?;
        tracing::debug!(
            tasks = tasks.len(),
            workers = self.config.worker_count,
            "compiling groups"
        );
        let results: Vec<(usize, String, Result<KernelInfo>)> = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|mut task| {
                    let result = task.run();
                    let group = &task.context.group;
                    (group.index(), group.fn_name().to_string(), result)
                })
                .collect()
        });

        let mut infos = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (group_index, fn_name, result) in results {
            match result {
                Ok(info) => infos.push(info),
                Err(error) => failures.push(GroupFailure {
                    group_index,
                    fn_name,
                    error,
                }),
            }
        }
        if !failures.is_empty() {
            tracing::debug!(failed = failures.len(), "compilation failed");
            return Err(Error::CompilationFailed { failures });
        }
        Ok(infos)
    }

    /// Compile `program` into an executable instruction sequence.
    #[tracing::instrument(skip_all, fields(ops = program.len(), backend = %self.config.target))]
    pub fn compile(&self, program: &Program) -> Result<CompiledProgram> {
        let (analysis, groups) = self.prepare(program)?;
        let snapshot = Arc::new(program.clone());
        let analysis = Arc::new(analysis);
        let infos = self.compile_groups(groups, snapshot, analysis.clone())?;

        let mut scope = Scope::build(program, &analysis);
        scope.instantiate();
        let instructions = infos.into_iter().map(Instruction::new).collect();
        Ok(CompiledProgram::new(
            instructions,
            scope,
            program.arguments().to_vec(),
            program.outputs().to_vec(),
            self.config.target,
        ))
    }
}

/// Compile `program` with the built-in backend of `config.target`.
pub fn compile(program: &Program, config: &CompileConfig) -> Result<CompiledProgram> {
    Compiler::new(config.clone())?.compile(program)
}
