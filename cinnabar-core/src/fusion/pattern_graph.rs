use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    env, fs,
    path::Path,
    process::Command,
};

use petgraph::{
    algo::toposort,
    dot::{Config, Dot},
    graphmap::DiGraphMap,
    Graph as PetGraph,
};

use crate::{
    ir::{OpId, Program},
    symbolic::ShapeAnalysis,
    Context, Error, Result,
};

use super::StmtPattern;

/// Identity of a pattern node inside one [`PatternGraph`]. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct PatternNode {
    id: NodeId,
    pattern: StmtPattern,
    ops: Vec<OpId>,
    upstream: Vec<NodeId>,
    downstream: Vec<NodeId>,
}

impl PatternNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn pattern(&self) -> &StmtPattern {
        &self.pattern
    }

    /// Owned operations, sorted by insertion index.
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn upstream(&self) -> &[NodeId] {
        &self.upstream
    }

    pub fn downstream(&self) -> &[NodeId] {
        &self.downstream
    }

    /// The reduction that defines this node's reduce domain, if any.
    pub fn root_reduce(&self, program: &Program) -> Option<OpId> {
        match &self.pattern {
            StmtPattern::ReduceTree { root, .. } => Some(*root),
            StmtPattern::Reduce => self
                .ops
                .iter()
                .rev()
                .copied()
                .find(|op| StmtPattern::classify(program.op(*op)).is_reduce()),
            _ => None,
        }
    }

    /// Human-readable summary, e.g. `Reduce[reduce_sum, exp]`.
    pub fn describe(&self, program: &Program) -> String {
        let names = self
            .ops
            .iter()
            .map(|op| program.op(*op).name())
            .collect::<Vec<_>>()
            .join(", ");
        let kind = match &self.pattern {
            StmtPattern::Trivial => "Trivial",
            StmtPattern::Reduce => "Reduce",
            StmtPattern::ReduceTree { .. } => "ReduceTree",
            StmtPattern::Unsupported => "Unsupported",
        };
        format!("{kind}[{names}]")
    }
}

/// The clustering graph: a DAG of pattern nodes, each owning a disjoint set
/// of operations.
///
/// Nodes live in a flat arena keyed by [`NodeId`]; edges are ids. Every edge
/// mutation goes through the graph so that no edge refers to a retired node.
#[derive(Debug)]
pub struct PatternGraph<'p> {
    program: &'p Program,
    analysis: &'p ShapeAnalysis,
    nodes: Vec<Option<PatternNode>>,
    owner: HashMap<OpId, NodeId>,
}

impl<'p> PatternGraph<'p> {
    /// One node per operation of `ops`, with an edge for every producer to
    /// user dependence between them.
    pub fn new(program: &'p Program, analysis: &'p ShapeAnalysis, ops: &[OpId]) -> Result<Self> {
        let mut graph = Self {
            program,
            analysis,
            nodes: Vec::with_capacity(ops.len()),
            owner: HashMap::with_capacity(ops.len()),
        };
        let mut sorted = ops.to_vec();
        sorted.sort();
        sorted.dedup();
        for op in &sorted {
            if !program.body().ops.contains(op) {
                return Err(Error::invariant(format!(
                    "{op} is not a top-level operation"
                )));
            }
            let id = NodeId(graph.nodes.len());
            graph.nodes.push(Some(PatternNode {
                id,
                pattern: StmtPattern::classify(program.op(*op)),
                ops: vec![*op],
                upstream: Vec::new(),
                downstream: Vec::new(),
            }));
            graph.owner.insert(*op, id);
        }
        for op in &sorted {
            let user = graph.owner[op];
            for operand in program.captured_operands(*op) {
                let Some(def) = program.defining_op(operand) else {
                    continue;
                };
                let Some(producer) = graph.owner.get(&def).copied() else {
                    continue;
                };
                if producer != user {
                    graph.add_edge(producer, user);
                }
            }
        }
        Ok(graph)
    }

    pub fn from_program(program: &'p Program, analysis: &'p ShapeAnalysis) -> Result<Self> {
        let ops: Vec<OpId> = program.ops().map(|op| op.id()).collect();
        Self::new(program, analysis, &ops)
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn analysis(&self) -> &'p ShapeAnalysis {
        self.analysis
    }

    pub fn node(&self, id: NodeId) -> Option<&PatternNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut PatternNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invariant(format!("pattern node #{} is retired", id.0)))
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &PatternNode> + '_ {
        self.nodes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owner_of(&self, op: OpId) -> Option<NodeId> {
        self.owner.get(&op).copied()
    }

    /// Nodes without upstream.
    pub fn entrances(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.upstream.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Nodes without downstream.
    pub fn exits(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.downstream.is_empty())
            .map(|n| n.id)
            .collect()
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if let Some(Some(node)) = self.nodes.get_mut(from.0) {
            if !node.downstream.contains(&to) {
                node.downstream.push(to);
            }
        }
        if let Some(Some(node)) = self.nodes.get_mut(to.0) {
            if !node.upstream.contains(&from) {
                node.upstream.push(from);
            }
        }
    }

    /// First live node, in insertion order, that is not in `visited` and
    /// satisfies `matches`.
    pub fn find_matched_node(
        &self,
        visited: &HashSet<NodeId>,
        matches: impl Fn(&Self, &PatternNode) -> bool,
    ) -> Option<NodeId> {
        self.nodes()
            .filter(|n| !visited.contains(&n.id))
            .find(|n| matches(self, n))
            .map(|n| n.id)
    }

    pub(crate) fn set_pattern(&mut self, id: NodeId, pattern: StmtPattern) -> Result<()> {
        self.node_mut(id)?.pattern = pattern;
        Ok(())
    }

    /// Whether some path leaves `members` and re-enters it. Merging such a
    /// set would close a cycle.
    pub(crate) fn has_detour(&self, members: &[NodeId]) -> bool {
        let inside: HashSet<NodeId> = members.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = members
            .iter()
            .filter_map(|m| self.node(*m))
            .flat_map(|n| n.downstream.iter().copied())
            .filter(|d| !inside.contains(d))
            .collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.node(id) else {
                continue;
            };
            for next in &node.downstream {
                if inside.contains(next) {
                    return true;
                }
                queue.push_back(*next);
            }
        }
        false
    }

    /// Replace `members` by one node owning the union of their ops.
    ///
    /// The new node's pattern is derived with [`StmtPattern::merged`]; edges
    /// to and from outside nodes are rewired to it.
    pub(crate) fn merge(&mut self, members: &[NodeId]) -> Result<NodeId> {
        let mut parts = Vec::with_capacity(members.len());
        for id in members {
            let node = self
                .nodes
                .get_mut(id.0)
                .and_then(Option::take)
                .ok_or_else(|| Error::invariant(format!("pattern node #{} is retired", id.0)))?;
            parts.push(node);
        }
        let inside: HashSet<NodeId> = members.iter().copied().collect();
        let ops: Vec<OpId> = parts
            .iter()
            .flat_map(|n| n.ops.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut upstream = Vec::new();
        let mut downstream = Vec::new();
        for part in &parts {
            for up in &part.upstream {
                if !inside.contains(up) && !upstream.contains(up) {
                    upstream.push(*up);
                }
            }
            for down in &part.downstream {
                if !inside.contains(down) && !downstream.contains(down) {
                    downstream.push(*down);
                }
            }
        }
        let pattern = StmtPattern::merged(
            self.program,
            &ops,
            &parts.iter().map(|p| &p.pattern).collect::<Vec<_>>(),
        );

        let id = NodeId(self.nodes.len());
        for op in &ops {
            self.owner.insert(*op, id);
        }
        for up in &upstream {
            let node = self.node_mut(*up)?;
            node.downstream.retain(|d| !inside.contains(d));
            node.downstream.push(id);
        }
        for down in &downstream {
            let node = self.node_mut(*down)?;
            node.upstream.retain(|u| !inside.contains(u));
            node.upstream.push(id);
        }
        self.nodes.push(Some(PatternNode {
            id,
            pattern,
            ops,
            upstream,
            downstream,
        }));
        Ok(id)
    }

    /// Check ownership, adjacency symmetry and acyclicity.
    pub fn verify(&self) -> Result<()> {
        let mut seen_ops = HashSet::new();
        let mut dag = DiGraphMap::<NodeId, ()>::new();
        for node in self.nodes() {
            dag.add_node(node.id);
            for op in &node.ops {
                if !seen_ops.insert(*op) {
                    return Err(Error::invariant(format!("{op} is owned by two pattern nodes")));
                }
                if self.owner.get(op) != Some(&node.id) {
                    return Err(Error::invariant(format!("stale owner entry for {op}")));
                }
            }
            for down in &node.downstream {
                let back = self
                    .node(*down)
                    .is_some_and(|d| d.upstream.contains(&node.id));
                if !back {
                    return Err(Error::invariant(format!(
                        "edge #{} -> #{} has no matching upstream entry",
                        node.id.0, down.0
                    )));
                }
                dag.add_edge(node.id, *down, ());
            }
            for up in &node.upstream {
                if !self.node(*up).is_some_and(|u| u.downstream.contains(&node.id)) {
                    return Err(Error::invariant(format!(
                        "edge #{} -> #{} has no matching downstream entry",
                        up.0, node.id.0
                    )));
                }
            }
        }
        if seen_ops.len() != self.owner.len() {
            return Err(Error::invariant("an operation lost its pattern node"));
        }
        toposort(&dag, None).map_err(|cycle| {
            Error::invariant(format!("pattern graph cycle through #{}", cycle.node_id().0))
        })?;
        Ok(())
    }

    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        let mut index = HashMap::new();
        for node in self.nodes() {
            index.insert(node.id, g.add_node(node.describe(self.program)));
        }
        for node in self.nodes() {
            for down in &node.downstream {
                if let (Some(src), Some(dst)) = (index.get(&node.id), index.get(down)) {
                    g.add_edge(*src, *dst, ());
                }
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Write [`PatternGraph::to_dot`] to `path`.
    pub fn write_dot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_dot()).with_context(|| format!("writing {}", path.display()))
    }

    /// Render the graph to a PNG with Graphviz `dot`.
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let dot_path = env::temp_dir().join("pattern_graph.dot");
        self.write_dot(&dot_path)?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &filename.as_ref().display().to_string(),
            ])
            .status()?;
        if !status.success() {
            crate::bail!("graphviz exited with {status}");
        }
        Ok(())
    }
}
