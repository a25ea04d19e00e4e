//! The parallel compilation driver.

mod cancel;
mod compiler;
mod context;
mod kernel_info;

pub use cancel::CancelToken;
pub use compiler::{compile, Compiler};
pub use context::{CompilationContext, CompilationTask};
pub use kernel_info::{BucketInfo, KernelInfo};
