use std::fmt::Display;

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    Cuda,
    Hip,
    Sycl,
    #[default]
    Cpu,
}

impl Target {
    /// Whether kernels for this target are launched on a thread-block grid.
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Per-block shared-memory ceiling, in bytes.
    pub fn shared_memory_limit(&self) -> u64 {
        match self {
            Self::Cuda => 48 * 1024,
            Self::Hip | Self::Sycl => 64 * 1024,
            Self::Cpu => 0,
        }
    }

    /// Max threads per block used by the default schedule.
    pub fn max_threads_per_block(&self) -> i64 {
        match self {
            Self::Cuda | Self::Hip => 256,
            Self::Sycl => 128,
            Self::Cpu => 1,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cuda => "cuda",
            Self::Hip => "hip",
            Self::Sycl => "sycl",
            Self::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Where intermediate tensors inside a kernel live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryClass {
    /// Off-chip, device-visible memory.
    Global,
    /// Per-thread-block memory bounded by [`Target::shared_memory_limit`].
    Shared,
    /// A name-only alias with no storage.
    SSAShadow,
}

impl Display for MemoryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Global => "global",
            Self::Shared => "shared",
            Self::SSAShadow => "ssa_shadow",
        };
        f.write_str(name)
    }
}

/// The single configuration record consumed by every compilation entry point.
///
/// ```
/// use cinnabar_core::{CompileConfig, MemoryClass, Target};
///
/// let config = CompileConfig::default()
///     .with_target(Target::Cpu)
///     .with_bucket_compile(true)
///     .with_worker_count(4)
///     .with_default_memory_class(MemoryClass::Shared);
/// assert_eq!(config.worker_count, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileConfig {
    /// Enable predicate-based specialization.
    pub bucket_compile: bool,
    /// Compilation parallelism, at least 1.
    pub worker_count: usize,
    pub target: Target,
    /// Default class for intermediates that need storage. Only `Global` and `Shared` are accepted.
    pub default_memory_class: MemoryClass,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            bucket_compile: false,
            worker_count: num_cpus::get().max(1),
            target: Target::default(),
            default_memory_class: MemoryClass::Global,
        }
    }
}

impl CompileConfig {
    pub fn with_bucket_compile(mut self, bucket_compile: bool) -> Self {
        self.bucket_compile = bucket_compile;
        self
    }

    /// Set the worker count. Zero is clamped to one.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_default_memory_class(mut self, class: MemoryClass) -> Self {
        self.default_memory_class = class;
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.worker_count == 0 {
            return Err(crate::Error::invariant("worker_count must be at least 1"));
        }
        if self.default_memory_class == MemoryClass::SSAShadow {
            return Err(crate::Error::unsupported(
                "ssa_shadow is not a valid default memory class",
            ));
        }
        Ok(())
    }
}
