use std::fmt::Display;

use crate::symbolic::DimExpr;

use super::DataType;

/// Handle to one SSA value of a [`super::Program`]. Compared by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) usize);

impl Value {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Handle to one operation of a [`super::Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    /// Insertion index of the operation in its program.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Element type and symbolic shape of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Type {
    pub dtype: DataType,
    pub shape: Vec<DimExpr>,
}

impl Type {
    pub fn new(dtype: DataType, shape: Vec<DimExpr>) -> Self {
        Self { dtype, shape }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> DimExpr {
        DimExpr::product(&self.shape)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Producer {
    BlockArgument { index: usize },
    OpResult { op: OpId, index: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct ValueInfo {
    pub(crate) ty: Type,
    pub(crate) name: String,
    pub(crate) producer: Producer,
}
