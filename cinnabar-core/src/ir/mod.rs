//! The program representation consumed by the fusion pipeline.

mod attribute;
mod builder;
mod dtype;
mod operation;
mod program;
mod value;

pub use attribute::Attribute;
pub use builder::{broadcast_shapes, ProgramBuilder};
pub use dtype::DataType;
pub use operation::{Block, OpKind, Operation, Region};
pub use program::Program;
pub use value::{OpId, Producer, Type, Value};
pub(crate) use value::ValueInfo;
