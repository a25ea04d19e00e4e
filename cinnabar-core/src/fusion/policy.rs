use std::fmt::Debug;

use crate::{
    ir::{OpId, Program},
    symbolic::{DimExpr, ShapeAnalysis},
};

use super::{PatternGraph, PatternNode};

/// A pluggable decision on whether two adjacent pattern nodes may fuse.
///
/// Implementations must be pure: the same graph and nodes always give the
/// same answer within one clustering run.
pub trait FusionPolicy: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn can_fuse(&self, graph: &PatternGraph<'_>, upstream: &PatternNode, downstream: &PatternNode)
        -> bool;
}

/// Combines policies; a fusion is allowed only when every policy allows it.
#[derive(Debug)]
pub struct PolicyManager {
    policies: Vec<Box<dyn FusionPolicy>>,
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new().with_policy(RelativeShapePolicy)
    }
}

impl PolicyManager {
    /// A manager with no policies, which allows every fusion.
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: impl FusionPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn policies(&self) -> impl Iterator<Item = &dyn FusionPolicy> + '_ {
        self.policies.iter().map(|p| p.as_ref())
    }

    pub fn can_fuse(
        &self,
        graph: &PatternGraph<'_>,
        upstream: &PatternNode,
        downstream: &PatternNode,
    ) -> bool {
        for policy in &self.policies {
            if !policy.can_fuse(graph, upstream, downstream) {
                tracing::trace!(
                    policy = policy.name(),
                    upstream = %upstream.describe(graph.program()),
                    downstream = %downstream.describe(graph.program()),
                    "fusion refused"
                );
                return false;
            }
        }
        true
    }

    /// Whether two consumers of one producer may live in the same node.
    /// Both orders have to be accepted.
    pub fn can_fuse_siblings(
        &self,
        graph: &PatternGraph<'_>,
        a: &PatternNode,
        b: &PatternNode,
    ) -> bool {
        self.can_fuse(graph, a, b) && self.can_fuse(graph, b, a)
    }
}

/// Fuses reductions only when they agree on their domains.
///
/// * reduce into reduce: both reduce the same input shape over the same axes;
/// * reduce into trivial: the trivial node iterates as many elements as the
///   reduction's input.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelativeShapePolicy;

fn dims_of(program: &Program, analysis: &ShapeAnalysis, value: crate::ir::Value) -> Vec<DimExpr> {
    analysis
        .dims(value)
        .map(<[DimExpr]>::to_vec)
        .unwrap_or_else(|| program.value_type(value).shape.clone())
}

fn reduce_signature(
    program: &Program,
    analysis: &ShapeAnalysis,
    op: OpId,
) -> Option<(Vec<DimExpr>, Vec<i64>)> {
    let op = program.op(op);
    let input = *op.operands().first()?;
    let axes = op.attr("axis").and_then(|a| a.as_i64_vec()).unwrap_or_default();
    Some((dims_of(program, analysis, input), axes))
}

/// Element count of the largest-rank result produced by `node`.
fn iteration_count(
    program: &Program,
    analysis: &ShapeAnalysis,
    node: &PatternNode,
) -> Option<DimExpr> {
    node.ops()
        .iter()
        .flat_map(|op| program.op(*op).results().iter().copied())
        .map(|v| dims_of(program, analysis, v))
        .max_by_key(Vec::len)
        .map(|dims| DimExpr::product(&dims))
}

impl FusionPolicy for RelativeShapePolicy {
    fn name(&self) -> &str {
        "relative_shape"
    }

    fn can_fuse(
        &self,
        graph: &PatternGraph<'_>,
        upstream: &PatternNode,
        downstream: &PatternNode,
    ) -> bool {
        let (program, analysis) = (graph.program(), graph.analysis());
        if upstream.pattern().is_unsupported() || downstream.pattern().is_unsupported() {
            return false;
        }
        let Some(up_root) = upstream.root_reduce(program) else {
            return true;
        };
        let Some(up_sig) = reduce_signature(program, analysis, up_root) else {
            return false;
        };
        if let Some(down_root) = downstream.root_reduce(program) {
            return reduce_signature(program, analysis, down_root).as_ref() == Some(&up_sig);
        }
        let domain = DimExpr::product(&up_sig.0);
        iteration_count(program, analysis, downstream).is_some_and(|n| n == domain)
    }
}
