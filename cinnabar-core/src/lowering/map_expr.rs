use std::{collections::BTreeMap, fmt::Display};

use crate::{
    ir::{Attribute, OpId, Value},
    symbolic::DimExpr,
};

use super::ScheduleDescriptor;

/// How one tensor dim is addressed from a point of the anchor domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexTerm {
    /// The anchor iterator of this axis.
    Iter(usize),
    /// A unit dim read at index zero.
    Zero,
    /// A dim the anchor does not cover, walked by a reduction loop.
    ReduceIter(usize),
    /// The anchor axis, or zero when this tensor's extent turns out to be 1.
    Broadcast(usize),
}

impl Display for IndexTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iter(k) => write!(f, "i{k}"),
            Self::Zero => f.write_str("0"),
            Self::ReduceIter(k) => write!(f, "r{k}"),
            Self::Broadcast(k) => write!(f, "b{k}"),
        }
    }
}

/// Map from the anchor iteration domain to one tensor's index space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IndexMap {
    pub terms: Vec<IndexTerm>,
}

impl IndexMap {
    /// Right-align `tensor` against `anchor` (numpy broadcasting).
    pub fn derive(anchor: &[DimExpr], tensor: &[DimExpr]) -> Self {
        let offset = anchor.len() as isize - tensor.len() as isize;
        let terms = tensor
            .iter()
            .enumerate()
            .map(|(d, extent)| {
                let a = d as isize + offset;
                if a < 0 {
                    return IndexTerm::ReduceIter(d);
                }
                let a = a as usize;
                let anchor_extent = &anchor[a];
                if extent == anchor_extent {
                    IndexTerm::Iter(a)
                } else if *extent == DimExpr::Int(1) {
                    IndexTerm::Zero
                } else if matches!(anchor_extent, DimExpr::Broadcast(xs) if xs.contains(extent)) {
                    IndexTerm::Broadcast(a)
                } else {
                    IndexTerm::ReduceIter(d)
                }
            })
            .collect();
        Self { terms }
    }

    pub fn is_identity(&self) -> bool {
        self.terms
            .iter()
            .enumerate()
            .all(|(i, t)| *t == IndexTerm::Iter(i))
    }
}

impl Display for IndexMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str("]")
    }
}

/// Operations of the statement tree.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtOp {
    /// A program operation, executed with its own semantics.
    Op(OpId),
    /// Zero-initialize a reduction accumulator.
    Zeros { origin: OpId },
    /// Accumulate a reduction input into its accumulator.
    InplaceAdd { origin: OpId },
    /// Order all prior memory writes before later reads.
    MemoryBarrier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpStmt {
    pub op: StmtOp,
    /// Name of the program operation this statement came from.
    pub name: String,
    pub attrs: BTreeMap<String, Attribute>,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
}

impl OpStmt {
    pub fn barrier() -> Self {
        Self {
            op: StmtOp::MemoryBarrier,
            name: "memory_barrier".to_string(),
            attrs: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.op == StmtOp::MemoryBarrier
    }
}

impl Display for OpStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let join = |vs: &[Value]| {
            vs.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let tag = match &self.op {
            StmtOp::Op(_) => self.name.clone(),
            StmtOp::Zeros { .. } => format!("zeros<{}>", self.name),
            StmtOp::InplaceAdd { .. } => format!("inplace_add<{}>", self.name),
            StmtOp::MemoryBarrier => return f.write_str("memory_barrier()"),
        };
        write!(f, "{} = {tag}({})", join(&self.outputs), join(&self.inputs))?;
        if !self.attrs.is_empty() {
            let attrs = self
                .attrs
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " {{{attrs}}}")?;
        }
        Ok(())
    }
}

/// A loop nest (`Map`) or a leaf statement.
#[derive(Debug, Clone, PartialEq)]
pub enum MapStmt {
    Map {
        schedule: ScheduleDescriptor,
        children: Vec<MapStmt>,
    },
    Op(OpStmt),
}

impl MapStmt {
    /// Leaf statements in execution order.
    pub fn op_stmts(&self) -> Vec<&OpStmt> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a OpStmt>) {
        match self {
            Self::Op(stmt) => out.push(stmt),
            Self::Map { children, .. } => {
                for child in children {
                    child.collect(out);
                }
            }
        }
    }

    fn write_indented(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Self::Op(stmt) => writeln!(f, "{pad}{stmt}"),
            Self::Map { schedule, children } => {
                writeln!(f, "{pad}map [{schedule}] {{")?;
                for child in children {
                    child.write_indented(f, depth + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
        }
    }
}

impl Display for MapStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write_indented(f, 0)
    }
}

/// A statement tree together with its anchor and the index map of every
/// tensor it touches.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchoredMapStmt {
    pub body: MapStmt,
    pub anchor: Value,
    pub index_maps: BTreeMap<Value, IndexMap>,
}

impl AnchoredMapStmt {
    /// Index map of `tensor` relative to the anchor.
    pub fn index_of(&self, tensor: Value) -> Option<&IndexMap> {
        self.index_maps.get(&tensor)
    }
}

impl Display for AnchoredMapStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "anchor {}", self.anchor)?;
        for (value, map) in &self.index_maps {
            writeln!(f, "  {value} -> {map}")?;
        }
        write!(f, "{}", self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_maps_align_right() {
        let anchor = [DimExpr::Int(2), DimExpr::Int(2), DimExpr::Int(4)];
        let map = IndexMap::derive(&anchor, &[DimExpr::Int(2), DimExpr::Int(2), DimExpr::Int(1)]);
        assert_eq!(map.to_string(), "[i0, i1, 0]");
        assert!(IndexMap::derive(&anchor, &anchor).is_identity());
        let map = IndexMap::derive(&[DimExpr::Int(2)], &[DimExpr::Int(2), DimExpr::Int(4)]);
        assert_eq!(map.terms, vec![IndexTerm::ReduceIter(0), IndexTerm::ReduceIter(1)]);
    }

    #[test]
    fn broadcast_terms() {
        let (s0, s1) = (DimExpr::sym("S0"), DimExpr::sym("S1"));
        let anchor = [DimExpr::broadcast(vec![s0.clone(), s1.clone()])];
        let map = IndexMap::derive(&anchor, &[s1]);
        assert_eq!(map.terms, vec![IndexTerm::Broadcast(0)]);
    }
}
