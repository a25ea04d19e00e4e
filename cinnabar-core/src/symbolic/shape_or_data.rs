use std::{collections::BTreeMap, fmt::Display};

use crate::{
    ir::{Program, Value},
    Result,
};

use super::{canonicalize_with_constraints, substitute_dims, Constraint, DimExpr, SubstitutionMap};

/// The symbolic shape of a value, plus its element values when the value is
/// itself a shape tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeOrData {
    shape: Vec<DimExpr>,
    data: Option<Vec<DimExpr>>,
}

impl ShapeOrData {
    pub fn shape(shape: Vec<DimExpr>) -> Self {
        Self { shape, data: None }
    }

    pub fn with_data(shape: Vec<DimExpr>, data: Vec<DimExpr>) -> Self {
        Self {
            shape,
            data: Some(data),
        }
    }

    pub fn dims(&self) -> &[DimExpr] {
        &self.shape
    }

    pub fn data(&self) -> Option<&[DimExpr]> {
        self.data.as_deref()
    }

    /// Every expression held, shape first.
    pub fn dim_exprs(&self) -> impl Iterator<Item = &DimExpr> + '_ {
        self.shape.iter().chain(self.data.iter().flatten())
    }

    pub fn substitute(&self, mapping: &SubstitutionMap) -> Self {
        Self {
            shape: substitute_dims(&self.shape, mapping),
            data: self.data.as_ref().map(|d| substitute_dims(d, mapping)),
        }
    }
}

impl Display for ShapeOrData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shape{:?}", self.shape)?;
        if let Some(data) = &self.data {
            write!(f, " data{data:?}")?;
        }
        Ok(())
    }
}

/// Side table from values to their [`ShapeOrData`], together with the
/// constraints the shapes obey.
#[derive(Debug, Clone, Default)]
pub struct ShapeAnalysis {
    values: BTreeMap<Value, ShapeOrData>,
    constraints: Vec<Constraint>,
}

impl ShapeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table with the declared type (and known data) of every value.
    pub fn from_program(program: &Program) -> Self {
        let values = (0..program.num_values())
            .map(Value)
            .map(|v| (v, program.shape_or_data(v)))
            .collect();
        Self {
            values,
            constraints: program.constraints().to_vec(),
        }
    }

    pub fn get(&self, value: Value) -> Option<&ShapeOrData> {
        self.values.get(&value)
    }

    pub fn set(&mut self, value: Value, shape_or_data: ShapeOrData) {
        self.values.insert(value, shape_or_data);
    }

    pub fn remove(&mut self, value: Value) -> Option<ShapeOrData> {
        self.values.remove(&value)
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn all_dim_exprs(&self) -> impl Iterator<Item = &DimExpr> + '_ {
        self.values.values().flat_map(ShapeOrData::dim_exprs)
    }

    /// Symbolic shape of `value`, falling back to nothing when unknown.
    pub fn dims(&self, value: Value) -> Option<&[DimExpr]> {
        self.get(value).map(ShapeOrData::dims)
    }
}

/// Canonicalize the analysis under its equality constraints and rewrite every
/// recorded [`ShapeOrData`] of `program`'s values in place.
///
/// Returns the replacement mapping that was applied.
pub fn substitute_dim_exprs_based_on_constraints(
    program: &Program,
    analysis: &mut ShapeAnalysis,
) -> Result<SubstitutionMap> {
    let mapping = canonicalize_with_constraints(analysis.all_dim_exprs(), analysis.constraints())?;
    if mapping.is_empty() {
        return Ok(mapping);
    }
    for value in (0..program.num_values()).map(Value) {
        let Some(current) = analysis.get(value) else {
            tracing::debug!(%value, "no shape recorded, skipping substitution");
            continue;
        };
        let updated = current.substitute(&mapping);
        analysis.set(value, updated);
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, ProgramBuilder};

    #[test]
    fn identity_substitution_keeps_shapes() {
        let sod = ShapeOrData::with_data(vec![DimExpr::Int(2)], vec![DimExpr::sym("S0"), 4.into()]);
        assert_eq!(sod.substitute(&SubstitutionMap::new()), sod);
    }

    #[test]
    fn skips_values_without_shape() {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0")]);
        let y = b.input("y", DataType::F32, vec![DimExpr::sym("S1")]);
        b.constrain_equal(DimExpr::sym("S0"), DimExpr::sym("S1"));
        let program = b.build().unwrap();

        let mut analysis = ShapeAnalysis::from_program(&program);
        analysis.remove(x);
        let mapping = substitute_dim_exprs_based_on_constraints(&program, &mut analysis).unwrap();
        assert_eq!(mapping.len(), 1);
        assert!(analysis.get(x).is_none());
        assert_eq!(analysis.dims(y), Some(&[DimExpr::sym("S0")][..]));
    }
}
