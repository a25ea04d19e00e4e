use cudarc::nvrtc::CompileError;

/// cudarc related errors
#[derive(thiserror::Error, Debug)]
pub enum CudaError {
    #[error(transparent)]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("{cuda} when loading the module of {fn_name}")]
    Load {
        cuda: cudarc::driver::DriverError,
        fn_name: String,
    },

    #[error("module of {fn_name} has no kernel `{kernel}`")]
    MissingKernel { fn_name: String, kernel: String },

    #[error("error when compiling {fn_name} to ptx: {err}")]
    PtxCompileError { fn_name: String, err: CompileError },
}

impl From<CudaError> for crate::Error {
    fn from(val: CudaError) -> Self {
        crate::Error::Backend(Box::new(val)).bt()
    }
}

pub trait WrapErr<O> {
    fn w(self) -> std::result::Result<O, crate::Error>;
}

impl<O, E: Into<CudaError>> WrapErr<O> for std::result::Result<O, E> {
    fn w(self) -> std::result::Result<O, crate::Error> {
        self.map_err(|e| crate::Error::Backend(Box::new(e.into())).bt())
    }
}
