use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use crate::{Error, Result};

use super::{DimExpr, ShapeOrData};

/// Where the run-time value of a symbol can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolBinding {
    /// The `dim_idx`-th element of the data of input `input_tensor_idx`.
    Data {
        symbol: Arc<str>,
        input_tensor_idx: usize,
        dim_idx: usize,
    },
    /// The `dim_idx`-th extent of the shape of input `input_tensor_idx`.
    Shape {
        symbol: Arc<str>,
        input_tensor_idx: usize,
        dim_idx: usize,
    },
}

impl SymbolBinding {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Data { symbol, .. } | Self::Shape { symbol, .. } => symbol,
        }
    }

    pub fn input_tensor_idx(&self) -> usize {
        match self {
            Self::Data {
                input_tensor_idx, ..
            }
            | Self::Shape {
                input_tensor_idx, ..
            } => *input_tensor_idx,
        }
    }

    /// Read the bound value, `None` if the source has no such element.
    pub fn read(&self, source: &impl BindingSource) -> Option<i64> {
        match self {
            Self::Data {
                input_tensor_idx,
                dim_idx,
                ..
            } => source.data_element(*input_tensor_idx, *dim_idx),
            Self::Shape {
                input_tensor_idx,
                dim_idx,
                ..
            } => source.shape_extent(*input_tensor_idx, *dim_idx),
        }
    }
}

impl Display for SymbolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data {
                symbol,
                input_tensor_idx,
                dim_idx,
            } => write!(f, "{symbol} = data(in{input_tensor_idx})[{dim_idx}]"),
            Self::Shape {
                symbol,
                input_tensor_idx,
                dim_idx,
            } => write!(f, "{symbol} = shape(in{input_tensor_idx})[{dim_idx}]"),
        }
    }
}

/// Run-time view over a kernel's input tensors.
pub trait BindingSource {
    fn shape_extent(&self, input: usize, dim: usize) -> Option<i64>;
    fn data_element(&self, input: usize, index: usize) -> Option<i64>;
}

/// One binding per bare symbol occurring in the inputs' shapes or data.
///
/// Shape bindings come first for each input; composite expressions such as
/// `S0 * 2` produce no binding.
pub fn collect_bindings(inputs: &[ShapeOrData]) -> Vec<SymbolBinding> {
    let mut bindings = Vec::new();
    for (input_tensor_idx, input) in inputs.iter().enumerate() {
        for (dim_idx, dim) in input.dims().iter().enumerate() {
            if let DimExpr::Sym(symbol) = dim {
                bindings.push(SymbolBinding::Shape {
                    symbol: symbol.clone(),
                    input_tensor_idx,
                    dim_idx,
                });
            }
        }
        for (dim_idx, dim) in input.data().unwrap_or_default().iter().enumerate() {
            if let DimExpr::Sym(symbol) = dim {
                bindings.push(SymbolBinding::Data {
                    symbol: symbol.clone(),
                    input_tensor_idx,
                    dim_idx,
                });
            }
        }
    }
    bindings
}

/// Group bindings by symbol.
pub fn symbol_getter(bindings: &[SymbolBinding]) -> BTreeMap<Arc<str>, Vec<SymbolBinding>> {
    let mut getter: BTreeMap<Arc<str>, Vec<SymbolBinding>> = BTreeMap::new();
    for binding in bindings {
        getter
            .entry(Arc::from(binding.symbol()))
            .or_default()
            .push(binding.clone());
    }
    getter
}

/// Read `symbol` through every binding of it. `None` when it is unbound,
/// unreadable, or two bindings disagree.
pub fn resolve_symbol(
    symbol: &str,
    bindings: &[SymbolBinding],
    source: &impl BindingSource,
) -> Option<i64> {
    let mut resolved = None;
    for binding in bindings.iter().filter(|b| b.symbol() == symbol) {
        let value = binding.read(source)?;
        match resolved {
            Some(prev) if prev != value => return None,
            _ => resolved = Some(value),
        }
    }
    resolved
}

/// Resolve every bound symbol.
pub fn resolve_all(
    bindings: &[SymbolBinding],
    source: &impl BindingSource,
) -> Result<BTreeMap<String, i64>> {
    let mut env = BTreeMap::new();
    for (symbol, group) in symbol_getter(bindings) {
        let value = resolve_symbol(&symbol, &group, source).ok_or_else(|| {
            let sites = group
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            Error::runtime(format!("symbol {symbol} is unreadable or inconsistent: {sites}"))
        })?;
        env.insert(symbol.to_string(), value);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        shapes: Vec<Vec<i64>>,
        data: Vec<Vec<i64>>,
    }

    impl BindingSource for Fixed {
        fn shape_extent(&self, input: usize, dim: usize) -> Option<i64> {
            self.shapes.get(input)?.get(dim).copied()
        }

        fn data_element(&self, input: usize, index: usize) -> Option<i64> {
            self.data.get(input)?.get(index).copied()
        }
    }

    #[test]
    fn data_and_shape_bindings() {
        let s0 = DimExpr::sym("S0");
        let inputs = [
            ShapeOrData::with_data(vec![2.into()], vec![s0.clone(), 128.into()]),
            ShapeOrData::shape(vec![s0.clone(), DimExpr::sym("S1")]),
        ];
        let bindings = collect_bindings(&inputs);
        assert_eq!(bindings.len(), 3);
        let getter = symbol_getter(&bindings);
        assert_eq!(getter["S0"].len(), 2);

        let source = Fixed {
            shapes: vec![vec![2], vec![64, 3]],
            data: vec![vec![64, 128], vec![]],
        };
        let env = resolve_all(&bindings, &source).unwrap();
        assert_eq!(env["S0"], 64);
        assert_eq!(env["S1"], 3);
    }

    #[test]
    fn disagreement_is_none() {
        let inputs = [
            ShapeOrData::shape(vec![DimExpr::sym("S0")]),
            ShapeOrData::shape(vec![DimExpr::sym("S0")]),
        ];
        let bindings = collect_bindings(&inputs);
        let source = Fixed {
            shapes: vec![vec![4], vec![5]],
            data: vec![],
        };
        assert_eq!(resolve_symbol("S0", &bindings, &source), None);
        assert!(resolve_all(&bindings, &source).is_err());
    }
}
