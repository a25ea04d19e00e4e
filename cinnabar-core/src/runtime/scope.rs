use std::{collections::BTreeMap, fmt::Display};

use crate::{
    ir::{DataType, Program, Value},
    symbolic::{DimExpr, ShapeAnalysis},
    Error, Result,
};

use super::HostTensor;

/// One named tensor of a [`Scope`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSlot {
    pub name: String,
    pub dtype: DataType,
    pub dims: Vec<DimExpr>,
    pub tensor: Option<HostTensor>,
}

impl TensorSlot {
    /// Concrete shape, if every extent is a constant.
    pub fn static_shape(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|d| d.as_int().and_then(|x| usize::try_from(x).ok()))
            .collect()
    }
}

/// The tensors a compiled program reads and writes, one per distinct
/// top-level value.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    slots: BTreeMap<Value, TensorSlot>,
}

impl Scope {
    /// A slot for every block argument and top-level op result of `program`,
    /// shaped by the canonicalized analysis.
    pub fn build(program: &Program, analysis: &ShapeAnalysis) -> Self {
        let slots = (0..program.num_values())
            .map(Value)
            .filter(|v| program.is_top_level(*v))
            .map(|v| {
                let ty = program.value_type(v);
                let dims = analysis
                    .dims(v)
                    .map(<[DimExpr]>::to_vec)
                    .unwrap_or_else(|| ty.shape.clone());
                let slot = TensorSlot {
                    name: program.value_name(v).to_string(),
                    dtype: ty.dtype,
                    dims,
                    tensor: None,
                };
                (v, slot)
            })
            .collect();
        Self { slots }
    }

    /// Allocate storage for every statically-shaped slot that has none.
    ///
    /// Returns the number of tensors allocated.
    pub fn instantiate(&mut self) -> usize {
        let mut allocated = 0;
        for slot in self.slots.values_mut() {
            if slot.tensor.is_some() {
                continue;
            }
            if let Some(shape) = slot.static_shape() {
                slot.tensor = Some(HostTensor::zeros(slot.dtype, shape));
                allocated += 1;
            }
        }
        tracing::debug!(allocated, slots = self.slots.len(), "instantiated scope");
        allocated
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, value: Value) -> Option<&TensorSlot> {
        self.slots.get(&value)
    }

    pub fn slots(&self) -> impl Iterator<Item = (Value, &TensorSlot)> + '_ {
        self.slots.iter().map(|(v, s)| (*v, s))
    }

    pub fn tensor(&self, value: Value) -> Result<&HostTensor> {
        let slot = self.slot_ref(value)?;
        slot.tensor
            .as_ref()
            .ok_or_else(|| Error::runtime(format!("tensor `{}` has not been computed", slot.name)))
    }

    /// Remove the tensor of `value`, leaving its slot empty.
    pub fn take(&mut self, value: Value) -> Result<Option<HostTensor>> {
        Ok(self.slot_mut(value)?.tensor.take())
    }

    pub fn set(&mut self, value: Value, tensor: HostTensor) -> Result<()> {
        let slot = self.slot_mut(value)?;
        if slot.dtype != tensor.dtype() {
            return Err(Error::runtime(format!(
                "tensor `{}` is {}, got {}",
                slot.name,
                slot.dtype,
                tensor.dtype()
            )));
        }
        slot.tensor = Some(tensor);
        Ok(())
    }

    fn slot_ref(&self, value: Value) -> Result<&TensorSlot> {
        self.slots
            .get(&value)
            .ok_or_else(|| Error::runtime(format!("{value} is not in scope")))
    }

    fn slot_mut(&mut self, value: Value) -> Result<&mut TensorSlot> {
        self.slots
            .get_mut(&value)
            .ok_or_else(|| Error::runtime(format!("{value} is not in scope")))
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (value, slot) in &self.slots {
            write!(f, "{value} {}: {}[", slot.name, slot.dtype)?;
            for (i, d) in slot.dims.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{d}")?;
            }
            let state = if slot.tensor.is_some() { "allocated" } else { "empty" };
            writeln!(f, "] {state}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ProgramBuilder;

    #[test]
    fn static_slots_are_allocated() {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
        let c = b.full(vec![DimExpr::Int(4)], 1.0, DataType::F32).unwrap();
        let y = b.add(x, c).unwrap();
        b.output(y);
        let program = b.build().unwrap();
        let analysis = ShapeAnalysis::from_program(&program);

        let mut scope = Scope::build(&program, &analysis);
        assert_eq!(scope.len(), 3);
        assert_eq!(scope.instantiate(), 1);
        assert!(scope.tensor(c).is_ok());
        assert!(scope.tensor(x).is_err());
        assert!(scope.tensor(y).is_err());
        assert_eq!(scope.slot(x).unwrap().name, "x");
    }
}
