use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    fmt::Display,
};

use crate::{
    ir::{OpId, Program, Value},
    symbolic::ShapeAnalysis,
    Error, Result,
};

use super::{passes::run_passes, NodeId, PatternGraph, PatternNode, PolicyManager, StmtPattern};

/// A fusible set of operations compiled into one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    index: usize,
    fn_name: String,
    ops: Vec<OpId>,
    inputs: Vec<Value>,
    outputs: Vec<Value>,
    pattern: StmtPattern,
}

impl Group {
    /// Build a group over `ops` and derive its boundary values.
    pub fn new(program: &Program, index: usize, ops: Vec<OpId>, pattern: StmtPattern) -> Self {
        let mut ops = ops;
        ops.sort();
        ops.dedup();
        let members: HashSet<OpId> = ops.iter().copied().collect();

        let mut inputs = Vec::new();
        for op in &ops {
            for operand in program.captured_operands(*op) {
                let internal = program
                    .defining_op(operand)
                    .is_some_and(|def| members.contains(&def));
                if !internal && program.is_top_level(operand) && !inputs.contains(&operand) {
                    inputs.push(operand);
                }
            }
        }

        let mut outputs = Vec::new();
        for op in &ops {
            for result in program.op(*op).results() {
                let escapes = program.is_output(*result)
                    || program
                        .users(*result)
                        .iter()
                        .any(|user| !members.contains(user));
                if escapes {
                    outputs.push(*result);
                }
            }
        }

        let names = ops
            .iter()
            .map(|op| program.op(*op).name())
            .collect::<Vec<_>>()
            .join("_");
        Self {
            index,
            fn_name: format!("fn_{index}_{names}"),
            ops,
            inputs,
            outputs,
            pattern,
        }
    }

    /// Position in the topologically ordered group list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Deterministic device function name.
    pub fn fn_name(&self) -> &str {
        &self.fn_name
    }

    /// Operations in source-insertion order.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    /// Values read from outside, in first-use order.
    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    /// Values visible outside, in definition order.
    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    pub fn pattern(&self) -> &StmtPattern {
        &self.pattern
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.ops.binary_search(&op).is_ok()
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group #{} {} [{}]", self.index, self.fn_name, self.pattern)
    }
}

/// Order nodes so that producers come first, breaking ties by the smallest
/// owned operation index.
fn topological_nodes(graph: &PatternGraph<'_>) -> Result<Vec<NodeId>> {
    let key = |n: &PatternNode| n.ops().first().map(OpId::index).unwrap_or(usize::MAX);
    let mut indegree: HashMap<NodeId, usize> = HashMap::new();
    let mut ready = BinaryHeap::new();
    for node in graph.nodes() {
        indegree.insert(node.id(), node.upstream().len());
        if node.upstream().is_empty() {
            ready.push(Reverse((key(node), node.id())));
        }
    }
    let mut order = Vec::with_capacity(indegree.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        order.push(id);
        let Some(node) = graph.node(id) else {
            continue;
        };
        for down in node.downstream() {
            let Some(remaining) = indegree.get_mut(down) else {
                continue;
            };
            *remaining -= 1;
            if *remaining == 0 {
                if let Some(next) = graph.node(*down) {
                    ready.push(Reverse((key(next), next.id())));
                }
            }
        }
    }
    if order.len() != indegree.len() {
        return Err(Error::invariant("pattern graph is not acyclic"));
    }
    Ok(order)
}

fn groups_of(graph: &PatternGraph<'_>) -> Result<Vec<Group>> {
    let program = graph.program();
    Ok(topological_nodes(graph)?
        .into_iter()
        .filter_map(|id| graph.node(id))
        .enumerate()
        .map(|(index, node)| {
            Group::new(program, index, node.ops().to_vec(), node.pattern().clone())
        })
        .collect())
}

/// Partition `program`'s top-level operations into fusible groups, using the
/// program's declared shapes.
pub fn cluster_ops(program: &Program, policy: &PolicyManager) -> Result<Vec<Group>> {
    let analysis = ShapeAnalysis::from_program(program);
    cluster_ops_with_analysis(program, &analysis, policy)
}

/// Partition `program`'s top-level operations into topologically ordered,
/// disjoint groups covering every operation.
#[tracing::instrument(skip_all, fields(ops = program.len()))]
pub fn cluster_ops_with_analysis(
    program: &Program,
    analysis: &ShapeAnalysis,
    policy: &PolicyManager,
) -> Result<Vec<Group>> {
    let mut graph = PatternGraph::from_program(program, analysis)?;
    let fired = run_passes(&mut graph, policy)?;
    graph.verify()?;
    let groups = groups_of(&graph)?;
    tracing::debug!(fired, groups = groups.len(), "clustering done");
    Ok(groups)
}

/// Fuse exactly `ops` into one group, or report the first adjacent pair the
/// passes could not merge.
pub fn cluster_ops_into_one_group(
    program: &Program,
    analysis: &ShapeAnalysis,
    ops: &[OpId],
    policy: &PolicyManager,
) -> Result<Group> {
    let mut graph = PatternGraph::new(program, analysis, ops)?;
    run_passes(&mut graph, policy)?;
    if graph.len() <= 1 {
        let ops = graph.nodes().flat_map(|n| n.ops().iter().copied()).collect();
        let pattern = graph
            .nodes()
            .next()
            .map(|n| n.pattern().clone())
            .unwrap_or(StmtPattern::Trivial);
        return Ok(Group::new(program, 0, ops, pattern));
    }
    let order = topological_nodes(&graph)?;
    let (upstream, downstream) = order
        .iter()
        .filter_map(|id| graph.node(*id))
        .find_map(|n| {
            let down = n.downstream().first().and_then(|d| graph.node(*d))?;
            Some((n, down))
        })
        .or_else(|| {
            let mut nodes = order.iter().filter_map(|id| graph.node(*id));
            Some((nodes.next()?, nodes.next()?))
        })
        .ok_or_else(|| Error::invariant("unmergeable graph has fewer than two nodes"))?;
    Err(Error::PolicyRejected {
        upstream: upstream.describe(program),
        downstream: downstream.describe(program),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, ProgramBuilder};
    use crate::symbolic::DimExpr;

    #[test]
    fn boundary_values() {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![DimExpr::Int(8)]);
        let a = b.unary("exp", x).unwrap();
        let c = b.unary("tan", a).unwrap();
        let opaque = b
            .custom("print", vec![a], vec![], Default::default())
            .unwrap();
        assert!(opaque.is_empty());
        b.output(c);
        let program = b.build().unwrap();

        let ops: Vec<OpId> = program.ops().take(2).map(|op| op.id()).collect();
        let group = Group::new(&program, 0, ops, StmtPattern::Trivial);
        assert_eq!(group.inputs(), &[x]);
        assert_eq!(group.outputs(), &[a, c]);
        assert_eq!(group.fn_name(), "fn_0_exp_tan");
    }
}
