//! Rewrite passes over a [`PatternGraph`].
//!
//! Each pass runs to a fixed point and reports how many times it fired.
//! Candidates are searched in node insertion order, so the first match in
//! that order always wins.

use std::collections::HashSet;

use crate::Result;

use super::{NodeId, PatternGraph, PatternNode, PolicyManager, StmtPattern};

fn pattern_of<'a>(graph: &'a PatternGraph<'_>, id: NodeId) -> Option<&'a StmtPattern> {
    graph.node(id).map(|n| n.pattern())
}

/// Sink trivial nodes into their consumers.
///
/// A trivial node is fused into each of its downstreams. Since every op is
/// owned by exactly one node, several downstreams are fused together with it
/// only when the policy accepts every pair of them as siblings and no path
/// between two of them leaves the merged set. Otherwise the trivial node
/// sinks into its first accepting downstream and the others keep reading its
/// results across the group boundary. Unsupported nodes never receive a sunk
/// trivial node.
pub fn sink_trivial(graph: &mut PatternGraph<'_>, policy: &PolicyManager) -> Result<usize> {
    let mut fired = 0;
    let mut visited = HashSet::new();
    loop {
        let candidate = graph.find_matched_node(&visited, |g, n| {
            n.pattern().is_trivial()
                && n.downstream()
                    .iter()
                    .any(|d| pattern_of(g, *d).is_some_and(|p| !p.is_unsupported()))
        });
        let Some(id) = candidate else {
            break;
        };
        let Some(members) = sink_targets(graph, policy, id) else {
            tracing::trace!(node = id.index(), "no downstream accepts the trivial node");
            visited.insert(id);
            continue;
        };
        let merged = graph.merge(&members)?;
        tracing::debug!(
            node = id.index(),
            into = ?&members[1..],
            merged = merged.index(),
            "sink trivial"
        );
        fired += 1;
    }
    Ok(fired)
}

/// The node set the trivial node `id` merges with: itself followed by either
/// all of its downstreams or the first one that can take it alone.
fn sink_targets(
    graph: &PatternGraph<'_>,
    policy: &PolicyManager,
    id: NodeId,
) -> Option<Vec<NodeId>> {
    let node = graph.node(id)?;
    let downs: Vec<&PatternNode> = node
        .downstream()
        .iter()
        .filter_map(|d| graph.node(*d))
        .collect();

    let accepts =
        |d: &PatternNode| !d.pattern().is_unsupported() && policy.can_fuse(graph, node, d);

    let all_fusible = downs.len() > 1
        && downs.iter().all(|d| accepts(d))
        && downs.iter().enumerate().all(|(i, a)| {
            downs[i + 1..]
                .iter()
                .all(|b| policy.can_fuse_siblings(graph, a, b))
        });
    if all_fusible {
        let members: Vec<NodeId> = std::iter::once(id)
            .chain(downs.iter().map(|d| d.id()))
            .collect();
        if !graph.has_detour(&members) {
            return Some(members);
        }
    }

    downs
        .iter()
        .filter(|d| accepts(d))
        .map(|d| vec![id, d.id()])
        .find(|members| !graph.has_detour(members))
}

/// Promote reductions that feed more than one node, or that feed another
/// reduction or a trivial epilogue, into single-member reduce trees.
pub fn lift_to_reduce_tree(graph: &mut PatternGraph<'_>) -> Result<usize> {
    let program = graph.program();
    let candidates: Vec<(NodeId, StmtPattern)> = graph
        .nodes()
        .filter(|n| n.pattern().is_reduce())
        .filter(|n| match n.downstream() {
            [] => false,
            [single] => pattern_of(graph, *single)
                .is_some_and(|p| p.is_reduce() || p.is_reduce_tree() || p.is_trivial()),
            _ => true,
        })
        .filter_map(|n| {
            let root = n.root_reduce(program)?;
            Some((
                n.id(),
                StmtPattern::ReduceTree {
                    root,
                    members: vec![root],
                },
            ))
        })
        .collect();
    for (id, pattern) in &candidates {
        tracing::debug!(node = id.index(), "lift to reduce tree");
        graph.set_pattern(*id, pattern.clone())?;
    }
    Ok(candidates.len())
}

/// Merge a reduce tree with its single reduce (or reduce tree) consumer when
/// the policy allows it.
pub fn grow_reduce_tree(graph: &mut PatternGraph<'_>, policy: &PolicyManager) -> Result<usize> {
    merge_single_downstream(graph, policy, "grow reduce tree", |p| {
        p.is_reduce() || p.is_reduce_tree()
    })
}

/// Fold a reduce tree into its single trivial consumer when the policy allows it.
pub fn reduce_trivial_fusion(
    graph: &mut PatternGraph<'_>,
    policy: &PolicyManager,
) -> Result<usize> {
    merge_single_downstream(graph, policy, "reduce trivial fusion", StmtPattern::is_trivial)
}

fn merge_single_downstream(
    graph: &mut PatternGraph<'_>,
    policy: &PolicyManager,
    pass: &'static str,
    accepts: impl Fn(&StmtPattern) -> bool,
) -> Result<usize> {
    let mut fired = 0;
    let mut visited = HashSet::new();
    loop {
        let candidate = graph.find_matched_node(&visited, |g, n| {
            n.pattern().is_reduce_tree()
                && matches!(n.downstream(), [d] if pattern_of(g, *d).is_some_and(&accepts))
        });
        let Some(id) = candidate else {
            break;
        };
        let (Some(up), Some(down)) = (
            graph.node(id),
            graph
                .node(id)
                .and_then(|n| n.downstream().first())
                .and_then(|d| graph.node(*d)),
        ) else {
            break;
        };
        if !policy.can_fuse(graph, up, down) {
            visited.insert(id);
            continue;
        }
        let members = [id, down.id()];
        let merged = graph.merge(&members)?;
        tracing::debug!(
            pass,
            upstream = id.index(),
            downstream = members[1].index(),
            merged = merged.index(),
            "merged"
        );
        fired += 1;
    }
    Ok(fired)
}

/// Run all passes in order until none fires. Returns the total number of
/// firings.
pub fn run_passes(graph: &mut PatternGraph<'_>, policy: &PolicyManager) -> Result<usize> {
    let mut total = 0;
    loop {
        let fired = sink_trivial(graph, policy)?
            + lift_to_reduce_tree(graph)?
            + grow_reduce_tree(graph, policy)?
            + reduce_trivial_fusion(graph, policy)?;
        if fired == 0 {
            break;
        }
        total += fired;
    }
    Ok(total)
}
