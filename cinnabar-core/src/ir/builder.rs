use std::collections::BTreeMap;

use crate::{
    symbolic::{codec::encode_dims, Constraint, DimExpr},
    Error, Result,
};

use super::{Attribute, DataType, OpKind, Program, Type, Value};

/// Right-aligned (numpy-style) broadcast of two symbolic shapes.
///
/// Unequal symbolic extents produce `Broadcast([a, b])`; unequal static
/// extents, neither of which is 1, are an error.
pub fn broadcast_shapes(a: &[DimExpr], b: &[DimExpr]) -> Result<Vec<DimExpr>> {
    let rank = a.len().max(b.len());
    let one = DimExpr::Int(1);
    (0..rank)
        .map(|i| {
            let da = (i + a.len()).checked_sub(rank).map(|j| &a[j]);
            let db = (i + b.len()).checked_sub(rank).map(|j| &b[j]);
            match (da, db) {
                (Some(x), None) | (None, Some(x)) => Ok(x.clone()),
                (Some(x), Some(y)) if x == y => Ok(x.clone()),
                (Some(x), Some(y)) if *x == one => Ok(y.clone()),
                (Some(x), Some(y)) if *y == one => Ok(x.clone()),
                (Some(DimExpr::Int(x)), Some(DimExpr::Int(y))) => Err(Error::invariant(format!(
                    "cannot broadcast extents {x} and {y}"
                ))),
                (Some(x), Some(y)) => Ok(DimExpr::broadcast(vec![x.clone(), y.clone()])),
                (None, None) => Err(Error::invariant("broadcast over an empty dim")),
            }
        })
        .collect()
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let axis = if axis < 0 { axis + rank_i } else { axis };
    if axis < 0 || axis >= rank_i {
        return Err(Error::invariant(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(axis as usize)
}

/// Appends operations to a [`Program`] and infers their result types.
///
/// ```
/// use cinnabar_core::{DataType, DimExpr, ProgramBuilder};
///
/// let mut b = ProgramBuilder::new();
/// let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(128)]);
/// let y = b.unary("relu", x).unwrap();
/// b.output(y);
/// let program = b.build().unwrap();
/// assert_eq!(program.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn value_type(&self, value: Value) -> &Type {
        self.program.value_type(value)
    }

    pub fn input(&mut self, name: &str, dtype: DataType, shape: Vec<DimExpr>) -> Value {
        self.program.add_argument(name, Type::new(dtype, shape))
    }

    /// A rank-1 `i64` tensor whose element values are the given dims.
    pub fn shape_input(&mut self, name: &str, data: Vec<DimExpr>) -> Value {
        let ty = Type::new(DataType::I64, vec![DimExpr::from(data.len())]);
        let value = self.program.add_argument(name, ty);
        self.program.set_data(value, data);
        value
    }

    fn push(
        &mut self,
        name: &str,
        operands: Vec<Value>,
        ty: Type,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<Value> {
        let id = self.program.append_op(name, operands, vec![ty], attrs)?;
        self.program
            .op(id)
            .result(0)
            .ok_or_else(|| Error::invariant(format!("`{name}` produced no result")))
    }

    pub fn full(&mut self, shape: Vec<DimExpr>, value: f64, dtype: DataType) -> Result<Value> {
        let attrs = BTreeMap::from([
            ("shape".to_string(), encode_dims(&shape)),
            ("value".to_string(), Attribute::Float64(value)),
            ("dtype".to_string(), Attribute::DataType(dtype)),
        ]);
        self.push("full", vec![], Type::new(dtype, shape), attrs)
    }

    /// `full` whose shape is read from the data of a shape tensor.
    pub fn full_with_tensor(&mut self, shape: Value, value: f64, dtype: DataType) -> Result<Value> {
        let dims = self
            .program
            .data(shape)
            .ok_or_else(|| {
                Error::unsupported(format!("shape tensor {shape} has no known data"))
            })?
            .to_vec();
        let attrs = BTreeMap::from([
            ("value".to_string(), Attribute::Float64(value)),
            ("dtype".to_string(), Attribute::DataType(dtype)),
        ]);
        self.push("full_with_tensor", vec![shape], Type::new(dtype, dims), attrs)
    }

    fn random(
        &mut self,
        name: &str,
        shape: Vec<DimExpr>,
        (a, b): (f64, f64),
        seed: u64,
        dtype: DataType,
    ) -> Result<Value> {
        let (ka, kb) = if name == "uniform" {
            ("min", "max")
        } else {
            ("mean", "std")
        };
        let attrs = BTreeMap::from([
            ("shape".to_string(), encode_dims(&shape)),
            (ka.to_string(), Attribute::Float64(a)),
            (kb.to_string(), Attribute::Float64(b)),
            ("seed".to_string(), Attribute::Int64(seed as i64)),
        ]);
        self.push(name, vec![], Type::new(dtype, shape), attrs)
    }

    pub fn uniform(
        &mut self,
        shape: Vec<DimExpr>,
        min: f64,
        max: f64,
        seed: u64,
        dtype: DataType,
    ) -> Result<Value> {
        self.random("uniform", shape, (min, max), seed, dtype)
    }

    pub fn gaussian(
        &mut self,
        shape: Vec<DimExpr>,
        mean: f64,
        std: f64,
        seed: u64,
        dtype: DataType,
    ) -> Result<Value> {
        self.random("gaussian", shape, (mean, std), seed, dtype)
    }

    /// Elementwise unary op such as `tan`, `relu`, `exp`.
    pub fn unary(&mut self, name: &str, x: Value) -> Result<Value> {
        if OpKind::infer(name) != OpKind::Elementwise {
            return Err(Error::unsupported(format!("`{name}` is not an elementwise op")));
        }
        let ty = self.value_type(x).clone();
        self.push(name, vec![x], ty, BTreeMap::new())
    }

    pub fn scale(&mut self, x: Value, scale: f64, bias: f64) -> Result<Value> {
        let ty = self.value_type(x).clone();
        let attrs = BTreeMap::from([
            ("scale".to_string(), Attribute::Float64(scale)),
            ("bias".to_string(), Attribute::Float64(bias)),
        ]);
        self.push("scale", vec![x], ty, attrs)
    }

    pub fn cast(&mut self, x: Value, dtype: DataType) -> Result<Value> {
        let ty = Type::new(dtype, self.value_type(x).shape.clone());
        let attrs = BTreeMap::from([("dtype".to_string(), Attribute::DataType(dtype))]);
        self.push("cast", vec![x], ty, attrs)
    }

    /// Elementwise binary op with implicit broadcasting.
    pub fn binary(&mut self, name: &str, a: Value, b: Value) -> Result<Value> {
        if OpKind::infer(name) != OpKind::Elementwise {
            return Err(Error::unsupported(format!("`{name}` is not an elementwise op")));
        }
        let ta = self.value_type(a);
        let tb = self.value_type(b);
        if ta.dtype != tb.dtype {
            return Err(Error::invariant(format!(
                "`{name}` mixes {} and {}",
                ta.dtype, tb.dtype
            )));
        }
        let ty = Type::new(ta.dtype, broadcast_shapes(&ta.shape, &tb.shape)?);
        self.push(name, vec![a, b], ty, BTreeMap::new())
    }

    pub fn add(&mut self, a: Value, b: Value) -> Result<Value> {
        self.binary("add", a, b)
    }

    pub fn sub(&mut self, a: Value, b: Value) -> Result<Value> {
        self.binary("sub", a, b)
    }

    pub fn mul(&mut self, a: Value, b: Value) -> Result<Value> {
        self.binary("mul", a, b)
    }

    pub fn div(&mut self, a: Value, b: Value) -> Result<Value> {
        self.binary("div", a, b)
    }

    /// Reduction over `axes` (negative axes count from the back).
    pub fn reduce(&mut self, name: &str, x: Value, axes: &[i64], keepdim: bool) -> Result<Value> {
        if OpKind::infer(name) != OpKind::Reduction {
            return Err(Error::unsupported(format!("`{name}` is not a reduction")));
        }
        let ty = self.value_type(x).clone();
        let mut normalized = axes
            .iter()
            .map(|a| normalize_axis(*a, ty.rank()))
            .collect::<Result<Vec<_>>>()?;
        normalized.sort_unstable();
        normalized.dedup();
        let shape = ty
            .shape
            .iter()
            .enumerate()
            .filter_map(|(i, d)| match (normalized.contains(&i), keepdim) {
                (false, _) => Some(d.clone()),
                (true, true) => Some(DimExpr::Int(1)),
                (true, false) => None,
            })
            .collect();
        let axis_attr: Vec<i64> = normalized.iter().map(|a| *a as i64).collect();
        let attrs = BTreeMap::from([
            ("axis".to_string(), Attribute::i64_array(&axis_attr)),
            ("keepdim".to_string(), Attribute::Bool(keepdim)),
        ]);
        self.push(name, vec![x], Type::new(ty.dtype, shape), attrs)
    }

    pub fn reduce_sum(&mut self, x: Value, axes: &[i64], keepdim: bool) -> Result<Value> {
        self.reduce("reduce_sum", x, axes, keepdim)
    }

    pub fn reduce_max(&mut self, x: Value, axes: &[i64], keepdim: bool) -> Result<Value> {
        self.reduce("reduce_max", x, axes, keepdim)
    }

    pub fn broadcast_to(&mut self, x: Value, shape: Vec<DimExpr>) -> Result<Value> {
        let ty = self.value_type(x).clone();
        if ty.rank() > shape.len() {
            return Err(Error::invariant(format!(
                "cannot broadcast rank {} to rank {}",
                ty.rank(),
                shape.len()
            )));
        }
        let offset = shape.len() - ty.rank();
        for (i, d) in ty.shape.iter().enumerate() {
            let target = &shape[i + offset];
            if let (DimExpr::Int(src), DimExpr::Int(dst)) = (d, target) {
                if src != dst && *src != 1 {
                    return Err(Error::invariant(format!(
                        "cannot broadcast extent {src} to {dst}"
                    )));
                }
            }
        }
        let attrs = BTreeMap::from([("shape".to_string(), encode_dims(&shape))]);
        self.push("broadcast", vec![x], Type::new(ty.dtype, shape), attrs)
    }

    pub fn reshape(&mut self, x: Value, shape: Vec<DimExpr>) -> Result<Value> {
        let ty = self.value_type(x).clone();
        let (from, to) = (ty.numel(), DimExpr::product(&shape));
        if let (Some(a), Some(b)) = (from.as_int(), to.as_int()) {
            if a != b {
                return Err(Error::invariant(format!(
                    "reshape changes element count from {a} to {b}"
                )));
            }
        }
        let attrs = BTreeMap::from([("shape".to_string(), encode_dims(&shape))]);
        self.push("reshape", vec![x], Type::new(ty.dtype, shape), attrs)
    }

    /// Batched matrix product `[.., M, K] x [.., K, N] -> [.., M, N]`.
    pub fn matmul(&mut self, a: Value, b: Value) -> Result<Value> {
        let ta = self.value_type(a).clone();
        let tb = self.value_type(b).clone();
        if ta.rank() < 2 || tb.rank() < 2 {
            return Err(Error::invariant("matmul operands need rank >= 2"));
        }
        let (m, ka) = (&ta.shape[ta.rank() - 2], &ta.shape[ta.rank() - 1]);
        let (kb, n) = (&tb.shape[tb.rank() - 2], &tb.shape[tb.rank() - 1]);
        if let (DimExpr::Int(x), DimExpr::Int(y)) = (ka, kb) {
            if x != y {
                return Err(Error::invariant(format!(
                    "matmul contraction mismatch: {x} vs {y}"
                )));
            }
        } else if ka != kb {
            self.program
                .add_constraint(Constraint::Equal(ka.clone(), kb.clone()));
        }
        let mut shape =
            broadcast_shapes(&ta.shape[..ta.rank() - 2], &tb.shape[..tb.rank() - 2])?;
        shape.push(m.clone());
        shape.push(n.clone());
        self.push("matmul", vec![a, b], Type::new(ta.dtype, shape), BTreeMap::new())
    }

    /// An operator the compiler knows nothing about. It is never fused.
    pub fn custom(
        &mut self,
        name: &str,
        operands: Vec<Value>,
        result_types: Vec<Type>,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<Vec<Value>> {
        let id = self
            .program
            .append_op_with_kind(name, OpKind::Opaque, operands, result_types, attrs)?;
        Ok(self.program.op(id).results().to_vec())
    }

    pub fn constrain_equal(&mut self, lhs: DimExpr, rhs: DimExpr) {
        self.program.add_constraint(Constraint::Equal(lhs, rhs));
    }

    pub fn output(&mut self, value: Value) {
        self.program.mark_output(value);
    }

    /// Verify and return the program.
    pub fn build(self) -> Result<Program> {
        self.program.verify()?;
        Ok(self.program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_symbolic_and_unit() {
        let s0 = DimExpr::sym("S0");
        let s1 = DimExpr::sym("S1");
        let out = broadcast_shapes(&[s0.clone(), DimExpr::Int(1)], &[DimExpr::Int(4)]).unwrap();
        assert_eq!(out, vec![s0.clone(), DimExpr::Int(4)]);
        let out = broadcast_shapes(&[s0.clone()], &[s1.clone()]).unwrap();
        assert_eq!(out, vec![DimExpr::broadcast(vec![s0, s1])]);
        assert!(broadcast_shapes(&[DimExpr::Int(3)], &[DimExpr::Int(4)]).is_err());
    }

    #[test]
    fn reduce_keepdim_shape() {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![2.into(), 2.into(), 4.into()]);
        let y = b.reduce_max(x, &[-1], true).unwrap();
        assert_eq!(b.value_type(y).shape, vec![DimExpr::Int(2), DimExpr::Int(2), DimExpr::Int(1)]);
        let z = b.reduce_sum(x, &[0, 2], false).unwrap();
        assert_eq!(b.value_type(z).shape, vec![DimExpr::Int(2)]);
    }
}
