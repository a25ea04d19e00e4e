//! Group lowering: anchored loop nests, memory classes, shape buckets and
//! the host-side launcher.

mod bucket;
mod cond;
mod host;
mod lower;
mod map_expr;
mod memory;
mod schedule;

pub use bucket::{kernel_name, make_exclusive, plan_buckets, BucketPlan, BucketSpec};
pub use cond::{provably_disjoint, CondExpr, CondOp};
pub(crate) use cond::dim_to_c;
pub use host::emit_host_launcher;
pub use lower::{lower, LoweredBucket, LoweredFunction, TensorDecl};
pub use map_expr::{AnchoredMapStmt, IndexMap, IndexTerm, MapStmt, OpStmt, StmtOp};
pub use memory::{
    assign_offsets, global_scratch_bytes, insert_barriers, shared_memory_bytes, TempStorage,
};
pub use schedule::{GridExtent, LaunchDims, LoopDesc, LoopTag, ScheduleDescriptor};
