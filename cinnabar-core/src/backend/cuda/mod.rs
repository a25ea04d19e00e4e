//! CUDA backend: NVRTC compilation of the emitted source and kernel launch
//! through the driver API.

use std::{
    collections::{hash_map::DefaultHasher, HashMap, VecDeque},
    fmt::Debug,
    fs,
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use cudarc::{
    driver::{
        CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
    },
    nvrtc::{CompileOptions, Ptx},
};

use crate::{
    config::Target,
    lowering::LoweredFunction,
    runtime::TensorData,
    Context, Error, Result,
};

use super::{emit_device_source, Backend, Kernel, LaunchArgs, LoadedModule, SourceModule};

mod error;

pub use error::CudaError;
use error::WrapErr;

const MAX_CACHED_MODULES: usize = 128;

#[derive(Clone)]
pub struct CudaBackend {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    modules: Arc<RwLock<HashMap<String, Arc<CudaModule>>>>,
    module_cache_order: Arc<Mutex<VecDeque<String>>>,
}

impl Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("ordinal", &self.context.ordinal())
            .finish()
    }
}

fn cuda_include_dir() -> Option<PathBuf> {
    let env_vars = ["CUDA_PATH", "CUDA_ROOT", "CUDA_TOOLKIT_ROOT_DIR", "CUDNN_LIB"]
        .into_iter()
        .map(std::env::var)
        .filter_map(std::result::Result::ok)
        .map(Into::<PathBuf>::into);
    let roots = ["/usr", "/usr/local/cuda", "/opt/cuda", "/usr/lib/cuda"]
        .into_iter()
        .map(Into::<PathBuf>::into);
    env_vars
        .chain(roots)
        .find(|path| path.join("include").join("cuda.h").is_file())
}

fn compile_ptx(fn_name: &str, source: &str) -> Result<Ptx> {
    let include_paths = cuda_include_dir()
        .map(|p| p.join("include").display().to_string())
        .into_iter()
        .collect();
    cudarc::nvrtc::compile_ptx_with_opts(
        source,
        CompileOptions {
            use_fast_math: Some(true),
            include_paths,
            ..Default::default()
        },
    )
    .map_err(|err| {
        CudaError::PtxCompileError {
            fn_name: fn_name.to_string(),
            err,
        }
        .into()
    })
}

/// Keep a copy of the PTX under the user cache dir for inspection.
fn write_ptx_cache(fn_name: &str, ptx: &Ptx) -> Result<()> {
    let Some(dir) = dirs::cache_dir() else {
        return Ok(());
    };
    let dir = dir.join("cinnabar").join("ptx");
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{fn_name}.ptx"));
    fs::write(&path, ptx.to_src()).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

impl CudaBackend {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).w()?;
        let stream = context.new_stream().w()?;
        Ok(Self {
            context,
            stream,
            modules: Arc::new(RwLock::new(HashMap::new())),
            module_cache_order: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    fn load_module(&self, fn_name: &str, source: &str) -> Result<Arc<CudaModule>> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let key = format!("{fn_name}_{:016x}", hasher.finish());
        if let Some(module) = self.modules.read()?.get(&key) {
            tracing::debug!(%key, "module cache hit");
            return Ok(module.clone());
        }

        let ptx = compile_ptx(fn_name, source)?;
        write_ptx_cache(fn_name, &ptx)?;
        let module = self.context.load_module(ptx).map_err(|cuda| CudaError::Load {
            cuda,
            fn_name: fn_name.to_string(),
        })?;

        let mut modules = self.modules.write()?;
        let mut order = self.module_cache_order.lock()?;
        modules.insert(key.clone(), module.clone());
        order.push_back(key);
        if order.len() > MAX_CACHED_MODULES {
            if let Some(old) = order.pop_front() {
                modules.remove(&old);
            }
        }
        Ok(module)
    }
}

impl Backend for CudaBackend {
    fn name(&self) -> &str {
        "cuda"
    }

    fn target(&self) -> Target {
        Target::Cuda
    }

    fn codegen(&self, function: &LoweredFunction) -> Result<SourceModule> {
        Ok(SourceModule {
            target: Target::Cuda,
            fn_name: function.fn_name.clone(),
            device: emit_device_source(function)?,
            host: function.host_source.clone(),
        })
    }

    fn compile(&self, source: &SourceModule, function: &LoweredFunction) -> Result<LoadedModule> {
        let module = self.load_module(&function.fn_name, &source.device)?;
        let mut loaded = LoadedModule::new();
        for name in function.kernel_names() {
            let func = module
                .load_function(name)
                .map_err(|_| CudaError::MissingKernel {
                    fn_name: function.fn_name.clone(),
                    kernel: name.to_string(),
                })?;
            loaded.insert(Arc::new(CudaKernel {
                name: name.to_string(),
                func,
                stream: self.stream.clone(),
            }));
        }
        Ok(loaded)
    }

    /// NVRTC invocations are serialized.
    fn is_reentrant(&self) -> bool {
        false
    }
}

struct CudaKernel {
    name: String,
    func: CudaFunction,
    stream: Arc<CudaStream>,
}

// SAFETY: launches go through the owning stream, which orders all work
// submitted to it.
unsafe impl Send for CudaKernel {}
unsafe impl Sync for CudaKernel {}

impl Debug for CudaKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaKernel").field("name", &self.name).finish()
    }
}

enum DeviceBuffer {
    F32(CudaSlice<f32>),
    I64(CudaSlice<i64>),
}

impl CudaKernel {
    fn upload(&self, data: &TensorData) -> Result<DeviceBuffer> {
        Ok(match data {
            TensorData::F32(v) => DeviceBuffer::F32(self.stream.memcpy_stod(v).w()?),
            TensorData::I64(v) => DeviceBuffer::I64(self.stream.memcpy_stod(v).w()?),
        })
    }

    fn alloc(&self, data: &TensorData) -> Result<DeviceBuffer> {
        Ok(match data {
            TensorData::F32(v) => {
                DeviceBuffer::F32(self.stream.alloc_zeros::<f32>(v.len().max(1)).w()?)
            }
            TensorData::I64(v) => {
                DeviceBuffer::I64(self.stream.alloc_zeros::<i64>(v.len().max(1)).w()?)
            }
        })
    }
}

impl Kernel for CudaKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, args: LaunchArgs<'_>) -> Result<()> {
        let inputs = args
            .inputs
            .iter()
            .map(|t| self.upload(t.data()))
            .collect::<Result<Vec<_>>>()?;
        let outputs = args
            .outputs
            .iter()
            .map(|t| self.alloc(t.data()))
            .collect::<Result<Vec<_>>>()?;
        let scratch_len = usize::try_from(args.scratch_bytes).map_err(Error::wrap)?.max(1);
        let scratch = self.stream.alloc_zeros::<u8>(scratch_len).w()?;
        let shared_mem_bytes = u32::try_from(args.shared_bytes).map_err(Error::wrap)?;

        let mut builder = self.stream.launch_builder(&self.func);
        for buffer in inputs.iter().chain(&outputs) {
            match buffer {
                DeviceBuffer::F32(s) => builder.arg(s),
                DeviceBuffer::I64(s) => builder.arg(s),
            };
        }
        builder.arg(&scratch);
        for scalar in args.scalars {
            builder.arg(scalar);
        }
        let cfg = LaunchConfig {
            grid_dim: (args.grid[0], args.grid[1], args.grid[2]),
            block_dim: (args.block[0], args.block[1], args.block[2]),
            shared_mem_bytes,
        };
        // SAFETY: the argument list matches the emitted kernel signature:
        // tensors, scratch, then one int64 per shape symbol.
        unsafe { builder.launch(cfg) }.w()?;

        for (out, buffer) in args.outputs.iter_mut().zip(&outputs) {
            match (out.data_mut(), buffer) {
                (TensorData::F32(dst), DeviceBuffer::F32(src)) => {
                    let host = self.stream.memcpy_dtov(src).w()?;
                    dst.copy_from_slice(&host[..dst.len()]);
                }
                (TensorData::I64(dst), DeviceBuffer::I64(src)) => {
                    let host = self.stream.memcpy_dtov(src).w()?;
                    dst.copy_from_slice(&host[..dst.len()]);
                }
                _ => {
                    return Err(Error::invariant(format!(
                        "{} output storage changed type",
                        self.name
                    )))
                }
            }
        }
        tracing::trace!(kernel = %self.name, grid = ?args.grid, block = ?args.block, "launched");
        Ok(())
    }
}
