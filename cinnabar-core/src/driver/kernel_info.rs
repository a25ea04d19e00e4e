use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use crate::{
    backend::{Kernel, LoadedModule, SourceModule},
    config::Target,
    ir::{DataType, Value},
    lowering::{CondExpr, LaunchDims, LoweredFunction},
    symbolic::{DimExpr, SymbolBinding},
    Error, Result,
};

/// One loaded bucket of a compiled group.
#[derive(Debug, Clone)]
pub struct BucketInfo {
    pub predicate: CondExpr,
    pub variant: Option<String>,
    pub kernel_name: String,
    pub launch: LaunchDims,
    pub shared_bytes: DimExpr,
    pub scratch_bytes: DimExpr,
    /// Shape of each output under this bucket, in output order.
    pub output_dims: Vec<Vec<DimExpr>>,
    pub kernel: Arc<dyn Kernel>,
}

/// The runtime-callable record of one compiled group.
#[derive(Debug, Clone)]
pub struct KernelInfo {
    pub fn_name: String,
    pub group_index: usize,
    pub target: Target,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
    pub output_dtypes: Vec<DataType>,
    /// Scalar shape arguments in launch order.
    pub symbols: Vec<String>,
    pub bindings: Vec<SymbolBinding>,
    pub int_args_map: BTreeMap<usize, SymbolBinding>,
    pub buckets: Vec<BucketInfo>,
    pub device_source: String,
    pub host_source: String,
}

impl KernelInfo {
    /// Look up every bucket kernel of `function` in `module`.
    pub fn assemble(
        function: &LoweredFunction,
        source: &SourceModule,
        module: &LoadedModule,
    ) -> Result<Self> {
        let buckets = function
            .buckets
            .iter()
            .map(|bucket| {
                let kernel = module.get(&bucket.kernel_name).ok_or_else(|| Error::CodegenFailure {
                    group: function.group_index,
                    message: format!(
                        "kernel `{}` is missing from the loaded module",
                        bucket.kernel_name
                    ),
                })?;
                let output_dims = function
                    .outputs
                    .iter()
                    .map(|decl| {
                        bucket.shapes.get(&decl.value).cloned().unwrap_or_else(|| decl.dims.clone())
                    })
                    .collect();
                Ok(BucketInfo {
                    predicate: bucket.predicate.clone(),
                    variant: bucket.variant.clone(),
                    kernel_name: bucket.kernel_name.clone(),
                    launch: bucket.launch.clone(),
                    shared_bytes: bucket.shared_bytes.clone(),
                    scratch_bytes: bucket.scratch_bytes.clone(),
                    output_dims,
                    kernel,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fn_name: function.fn_name.clone(),
            group_index: function.group_index,
            target: function.target,
            input_names: function.inputs.iter().map(|d| d.name.clone()).collect(),
            output_names: function.outputs.iter().map(|d| d.name.clone()).collect(),
            inputs: function.inputs.iter().map(|d| d.value).collect(),
            outputs: function.outputs.iter().map(|d| d.value).collect(),
            output_dtypes: function.outputs.iter().map(|d| d.dtype).collect(),
            symbols: function.symbols.clone(),
            bindings: function.bindings.clone(),
            int_args_map: function.int_args_map.clone(),
            buckets,
            device_source: source.device.clone(),
            host_source: source.host.clone(),
        })
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.buckets.iter().map(|b| b.kernel_name.as_str())
    }
}

impl Display for KernelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} (group #{}, {}): ({}) -> ({})",
            self.fn_name,
            self.group_index,
            self.target,
            self.input_names.join(", "),
            self.output_names.join(", ")
        )?;
        for (pos, binding) in &self.int_args_map {
            writeln!(f, "  arg {pos}: {binding}")?;
        }
        for bucket in &self.buckets {
            let [gx, gy, gz] = &bucket.launch.grid;
            let [bx, by, bz] = bucket.launch.block;
            write!(
                f,
                "  {} if {} grid ({gx}, {gy}, {gz}) block ({bx}, {by}, {bz}) shared {} scratch {}",
                bucket.kernel_name, bucket.predicate, bucket.shared_bytes, bucket.scratch_bytes
            )?;
            if let Some(variant) = &bucket.variant {
                write!(f, " => {variant}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "{}", self.device_source)?;
        write!(f, "{}", self.host_source)
    }
}
