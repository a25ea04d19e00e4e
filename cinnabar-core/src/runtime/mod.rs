//! Execution of compiled programs on host tensors.

mod instruction;
mod pool;
mod program;
mod scope;
mod tensor;

pub use instruction::{Instruction, LaunchRecord};
pub use pool::{BufferPool, PoolMetrics, PooledBuffer, SharedPool, TensorPools};
pub use program::CompiledProgram;
pub use scope::{Scope, TensorSlot};
pub use tensor::{HostTensor, TensorData};
pub(crate) use tensor::InputView;
