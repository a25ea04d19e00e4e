use std::fmt::Display;

use super::DataType;

/// Attribute values attached to operations, also the persistence format of
/// symbolic shapes (see [`crate::symbolic::codec`]).
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    DataType(DataType),
    Array(Vec<Attribute>),
}

impl Attribute {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload, widening `Int32`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric payload as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            Self::Int32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Attribute]> {
        match self {
            Self::Array(xs) => Some(xs),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<DataType> {
        match self {
            Self::DataType(d) => Some(*d),
            _ => None,
        }
    }

    pub fn i64_array(values: &[i64]) -> Self {
        Self::Array(values.iter().copied().map(Self::Int64).collect())
    }

    pub fn as_i64_vec(&self) -> Option<Vec<i64>> {
        self.as_array()?.iter().map(Attribute::as_i64).collect()
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}i32"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v:?}f32"),
            Self::Float64(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::DataType(d) => write!(f, "{d}"),
            Self::Array(xs) => {
                f.write_str("[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
        }
    }
}
