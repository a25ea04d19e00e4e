use std::fmt::Display;

use crate::{ir::DataType, symbolic::BindingSource, Error, Result};

/// Host storage of a tensor. Floating-point tensors are held as `f32`,
/// everything else as `i64`.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(dtype: DataType, len: usize) -> Self {
        if dtype.is_float() {
            Self::F32(vec![0.0; len])
        } else {
            Self::I64(vec![0; len])
        }
    }
}

/// A dense, row-major tensor in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DataType,
    shape: Vec<usize>,
    data: TensorData,
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl HostTensor {
    /// Build a tensor from raw storage, checking it against `dtype` and `shape`.
    pub fn new(dtype: DataType, shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let storage_ok = matches!(
            (&data, dtype.is_float()),
            (TensorData::F32(_), true) | (TensorData::I64(_), false)
        );
        if !storage_ok {
            return Err(Error::runtime(format!("{dtype} tensor with mismatched storage")));
        }
        if data.len() != numel(&shape) {
            return Err(Error::runtime(format!(
                "{} elements do not fill shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(DataType::F32, shape, TensorData::F32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        Self::new(DataType::I64, shape, TensorData::I64(data))
    }

    /// A rank-1 `i64` tensor holding `dims`, the run-time form of a shape tensor.
    pub fn shape_tensor(dims: &[i64]) -> Self {
        Self {
            dtype: DataType::I64,
            shape: vec![dims.len()],
            data: TensorData::I64(dims.to_vec()),
        }
    }

    pub fn zeros(dtype: DataType, shape: Vec<usize>) -> Self {
        let data = TensorData::zeros(dtype, numel(&shape));
        Self { dtype, shape, data }
    }

    pub fn full(dtype: DataType, shape: Vec<usize>, value: f64) -> Self {
        let len = numel(&shape);
        let data = if dtype.is_float() {
            TensorData::F32(vec![value as f32; len])
        } else {
            TensorData::I64(vec![value as i64; len])
        };
        Self { dtype, shape, data }
    }

    #[cfg(feature = "half")]
    pub fn from_f16(shape: Vec<usize>, data: &[half::f16]) -> Result<Self> {
        let data = data.iter().map(|x| x.to_f32()).collect();
        Self::new(DataType::F16, shape, TensorData::F32(data))
    }

    #[cfg(feature = "bfloat")]
    pub fn from_bf16(shape: Vec<usize>, data: &[half::bf16]) -> Result<Self> {
        let data = data.iter().map(|x| x.to_f32()).collect();
        Self::new(DataType::BF16, shape, TensorData::F32(data))
    }

    #[cfg(feature = "half")]
    pub fn to_f16_vec(&self) -> Result<Vec<half::f16>> {
        Ok(self.as_f32()?.iter().map(|x| half::f16::from_f32(*x)).collect())
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            TensorData::I64(_) => Err(Error::runtime(format!("{} tensor is not f32", self.dtype))),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            TensorData::F32(_) => Err(Error::runtime(format!("{} tensor is not i64", self.dtype))),
        }
    }

    /// Element `i` widened to `f64`.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match &self.data {
            TensorData::F32(v) => v.get(i).map(|x| *x as f64),
            TensorData::I64(v) => v.get(i).map(|x| *x as f64),
        }
    }

    /// Convert to another element type.
    pub fn cast(&self, dtype: DataType) -> Self {
        let data = match (&self.data, dtype.is_float()) {
            (TensorData::F32(v), true) => TensorData::F32(v.clone()),
            (TensorData::I64(v), false) => TensorData::I64(v.clone()),
            (TensorData::F32(v), false) => TensorData::I64(v.iter().map(|x| *x as i64).collect()),
            (TensorData::I64(v), true) => TensorData::F32(v.iter().map(|x| *x as f32).collect()),
        };
        Self {
            dtype,
            shape: self.shape.clone(),
            data,
        }
    }

    /// Same storage under a new shape of equal element count.
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self> {
        if numel(&shape) != self.numel() {
            return Err(Error::runtime(format!(
                "cannot view {:?} as {shape:?}",
                self.shape
            )));
        }
        self.shape = shape;
        Ok(self)
    }
}

impl Display for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// Binding source over the inputs of one launch.
pub(crate) struct InputView<'a>(pub &'a [&'a HostTensor]);

impl BindingSource for InputView<'_> {
    fn shape_extent(&self, input: usize, dim: usize) -> Option<i64> {
        let extent = *self.0.get(input)?.shape().get(dim)?;
        i64::try_from(extent).ok()
    }

    fn data_element(&self, input: usize, index: usize) -> Option<i64> {
        match self.0.get(input)?.data() {
            TensorData::I64(v) => v.get(index).copied(),
            TensorData::F32(v) => v.get(index).map(|x| *x as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_must_match() {
        assert!(HostTensor::new(DataType::F32, vec![2], TensorData::I64(vec![1, 2])).is_err());
        assert!(HostTensor::from_f32(vec![2, 2], vec![1.0; 3]).is_err());
        let t = HostTensor::full(DataType::I32, vec![3], 2.0);
        assert_eq!(t.as_i64().unwrap(), &[2, 2, 2]);
        assert_eq!(t.cast(DataType::F32).as_f32().unwrap(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn input_view_reads_shape_and_data() {
        let x = HostTensor::zeros(DataType::F32, vec![4, 7]);
        let s = HostTensor::shape_tensor(&[64, 128]);
        let inputs = [&x, &s];
        let view = InputView(&inputs);
        assert_eq!(view.shape_extent(0, 1), Some(7));
        assert_eq!(view.data_element(1, 0), Some(64));
        assert_eq!(view.data_element(1, 2), None);
    }
}
