use std::fmt::Display;

use crate::ir::{OpId, OpKind, Operation, Program};

/// Structural classification of a pattern node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StmtPattern {
    /// Elementwise, broadcast or reshape-like ops.
    Trivial,
    /// Exactly one reduction, possibly with sunk trivial producers.
    Reduce,
    /// Several reductions fused together. `root` is the last reduction of
    /// the tree, `members` lists every reduction in it.
    ReduceTree { root: OpId, members: Vec<OpId> },
    /// Anything the fusion passes cannot look through.
    Unsupported,
}

impl StmtPattern {
    pub fn classify(op: &Operation) -> Self {
        match op.kind() {
            OpKind::Elementwise | OpKind::Broadcast | OpKind::Reshape => Self::Trivial,
            OpKind::Reduction => Self::Reduce,
            OpKind::Opaque => Self::Unsupported,
        }
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, Self::Trivial)
    }

    pub fn is_reduce(&self) -> bool {
        matches!(self, Self::Reduce)
    }

    pub fn is_reduce_tree(&self) -> bool {
        matches!(self, Self::ReduceTree { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }

    fn strength(&self) -> u8 {
        match self {
            Self::Trivial => 0,
            Self::Reduce => 1,
            Self::ReduceTree { .. } => 2,
            Self::Unsupported => 3,
        }
    }

    /// Pattern of a node owning `ops` (sorted by insertion index) formed from
    /// parts classified as `parts`.
    ///
    /// The strongest part wins; more than one reduction always yields a tree.
    pub(crate) fn merged(program: &Program, ops: &[OpId], parts: &[&StmtPattern]) -> Self {
        let strongest = parts
            .iter()
            .max_by_key(|p| p.strength())
            .map(|p| (*p).clone())
            .unwrap_or(Self::Trivial);
        if strongest.is_unsupported() {
            return strongest;
        }
        let reductions: Vec<OpId> = ops
            .iter()
            .copied()
            .filter(|op| program.op(*op).kind() == OpKind::Reduction)
            .collect();
        match (strongest, reductions.last().copied()) {
            (Self::ReduceTree { .. }, Some(root)) => Self::ReduceTree {
                root,
                members: reductions,
            },
            (Self::Reduce, Some(root)) if reductions.len() > 1 => Self::ReduceTree {
                root,
                members: reductions,
            },
            (other, _) => other,
        }
    }
}

impl Display for StmtPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trivial => f.write_str("Trivial"),
            Self::Reduce => f.write_str("Reduce"),
            Self::ReduceTree { root, members } => {
                write!(f, "ReduceTree(root={root}, members=[")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{m}")?;
                }
                f.write_str("])")
            }
            Self::Unsupported => f.write_str("Unsupported"),
        }
    }
}
