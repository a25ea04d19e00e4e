use std::collections::BTreeMap;

use super::{Attribute, OpId, Value};

/// Structural flags the fusion passes look at. Everything else about an
/// operator is opaque to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Elementwise,
    Broadcast,
    Reshape,
    Reduction,
    Opaque,
}

impl OpKind {
    /// Kind of a built-in operator name; unknown names are `Opaque`.
    pub fn infer(op_name: &str) -> Self {
        match op_name {
            "add" | "sub" | "mul" | "div" | "maximum" | "minimum" | "pow" | "tan" | "relu"
            | "exp" | "log" | "sqrt" | "abs" | "neg" | "sigmoid" | "tanh" | "cast" | "scale"
            | "full" | "full_with_tensor" | "uniform" | "gaussian" => Self::Elementwise,
            "broadcast" | "expand" => Self::Broadcast,
            "reshape" | "squeeze" | "unsqueeze" => Self::Reshape,
            "reduce_sum" | "reduce_max" | "reduce_min" | "reduce_prod" => Self::Reduction,
            _ => Self::Opaque,
        }
    }
}

/// A block of operations. Operands of every operation are defined earlier
/// in the block, are block arguments, or dominate the enclosing operation.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub args: Vec<Value>,
    pub ops: Vec<OpId>,
}

#[derive(Debug, Clone, Default)]
pub struct Region {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub(crate) id: OpId,
    pub(crate) name: String,
    pub(crate) kind: OpKind,
    pub(crate) operands: Vec<Value>,
    pub(crate) results: Vec<Value>,
    pub(crate) attrs: BTreeMap<String, Attribute>,
    pub(crate) regions: Vec<Region>,
}

impl Operation {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn results(&self) -> &[Value] {
        &self.results
    }

    pub fn attrs(&self) -> &BTreeMap<String, Attribute> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&Attribute> {
        self.attrs.get(key)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn result(&self, index: usize) -> Option<Value> {
        self.results.get(index).copied()
    }
}
