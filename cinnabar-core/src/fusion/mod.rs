//! Operator fusion: classify operations, rewrite the pattern graph to a
//! fixed point and emit one [`Group`] per surviving node.

mod group;
pub mod passes;
mod pattern;
mod pattern_graph;
mod policy;

pub use group::{cluster_ops, cluster_ops_into_one_group, cluster_ops_with_analysis, Group};
pub use pattern::StmtPattern;
pub use pattern_graph::{NodeId, PatternGraph, PatternNode};
pub use policy::{FusionPolicy, PolicyManager, RelativeShapePolicy};
