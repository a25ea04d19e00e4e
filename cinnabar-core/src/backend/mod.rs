//! Device backends: source emission, device compilation and kernel launch.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use crate::{
    config::Target,
    lowering::LoweredFunction,
    runtime::{HostTensor, TensorPools},
    Error, Result,
};

mod codegen;
mod cpu;
#[cfg(feature = "cuda")]
mod cuda;

pub use codegen::{emit_device_source, CodeEmitter};
pub use cpu::CpuBackend;
#[cfg(feature = "cuda")]
pub use cuda::{CudaBackend, CudaError};

/// Source of one lowered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModule {
    pub target: Target,
    pub fn_name: String,
    /// Device kernels, one per bucket.
    pub device: String,
    /// Host launcher.
    pub host: String,
}

/// Everything one kernel launch reads and writes.
pub struct LaunchArgs<'a> {
    pub inputs: &'a [&'a HostTensor],
    /// Preallocated outputs, in the function's output order.
    pub outputs: &'a mut [HostTensor],
    /// Scalar shape arguments, in the function's symbol order.
    pub scalars: &'a [i64],
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_bytes: u64,
    pub scratch_bytes: u64,
    pub pools: &'a TensorPools,
}

/// A loaded device function.
pub trait Kernel: Debug + Send + Sync {
    fn name(&self) -> &str;
    fn launch(&self, args: LaunchArgs<'_>) -> Result<()>;
}

/// The kernels of one compiled module, by name.
#[derive(Debug, Clone, Default)]
pub struct LoadedModule {
    kernels: BTreeMap<String, Arc<dyn Kernel>>,
}

impl LoadedModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(kernel.name().to_string(), kernel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Code generator plus device compiler for one target.
pub trait Backend: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn target(&self) -> Target;

    /// Emit the device and host source of `function`.
    fn codegen(&self, function: &LoweredFunction) -> Result<SourceModule>;

    /// Compile `source` and load every bucket kernel of `function`.
    fn compile(&self, source: &SourceModule, function: &LoweredFunction) -> Result<LoadedModule>;

    /// Whether `codegen` and `compile` may run concurrently. Non-reentrant
    /// backends are serialized by the driver.
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Emits source for a target whose device compiler is not available.
#[derive(Debug, Clone, Copy)]
pub struct SourceOnlyBackend {
    target: Target,
}

impl SourceOnlyBackend {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

impl Backend for SourceOnlyBackend {
    fn name(&self) -> &str {
        "source-only"
    }

    fn target(&self) -> Target {
        self.target
    }

    fn codegen(&self, function: &LoweredFunction) -> Result<SourceModule> {
        Ok(SourceModule {
            target: self.target,
            fn_name: function.fn_name.clone(),
            device: emit_device_source(function)?,
            host: function.host_source.clone(),
        })
    }

    fn compile(&self, _source: &SourceModule, function: &LoweredFunction) -> Result<LoadedModule> {
        Err(Error::CodegenFailure {
            group: function.group_index,
            message: format!("no device compiler is available for {}", self.target),
        })
    }
}

/// The built-in backend of `target`.
pub fn default_backend(target: Target) -> Result<Arc<dyn Backend>> {
    match target {
        Target::Cpu => Ok(Arc::new(CpuBackend::new())),
        #[cfg(feature = "cuda")]
        Target::Cuda => Ok(Arc::new(CudaBackend::new(0)?)),
        other => Ok(Arc::new(SourceOnlyBackend::new(other))),
    }
}
