use std::{collections::BTreeMap, fmt::Display};

use crate::{
    backend::LaunchArgs,
    config::Target,
    driver::{BucketInfo, KernelInfo},
    symbolic::{resolve_all, DimExpr},
    Error, Result,
};

use super::{HostTensor, InputView, Scope, TensorPools};

/// What one [`Instruction::run`] launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub fn_name: String,
    pub kernel_name: String,
    pub variant: Option<String>,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_bytes: u64,
}

/// One compiled group, ready to run against a [`Scope`].
#[derive(Debug, Clone)]
pub struct Instruction {
    kernel: KernelInfo,
}

fn eval_usize(expr: &DimExpr, env: &BTreeMap<String, i64>) -> Result<usize> {
    expr.evaluate(&|s| env.get(s).copied())
        .and_then(|x| usize::try_from(x).ok())
        .ok_or_else(|| Error::runtime(format!("`{expr}` does not evaluate to an extent")))
}

impl Instruction {
    pub fn new(kernel: KernelInfo) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &KernelInfo {
        &self.kernel
    }

    pub fn fn_name(&self) -> &str {
        &self.kernel.fn_name
    }

    fn select(&self, env: &BTreeMap<String, i64>) -> Result<&BucketInfo> {
        for bucket in &self.kernel.buckets {
            if bucket.predicate.holds(env)? {
                return Ok(bucket);
            }
        }
        let bound = env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::runtime(format!(
            "no bucket of {} matches {{{bound}}}",
            self.kernel.fn_name
        )))
    }

    /// Resolve the group's symbols from its inputs, pick the first bucket
    /// whose predicate holds, and launch it.
    #[tracing::instrument(skip_all, fields(fn_name = %self.kernel.fn_name))]
    pub fn run(
        &self,
        scope: &mut Scope,
        pools: &TensorPools,
        target: Target,
    ) -> Result<LaunchRecord> {
        let kernel = &self.kernel;

        // Outputs leave the scope for the duration of the launch.
        let mut outputs = Vec::with_capacity(kernel.outputs.len());
        for value in &kernel.outputs {
            outputs.push(scope.take(*value)?);
        }

        let result = self.launch(scope, &mut outputs, pools, target);
        for (value, tensor) in kernel.outputs.iter().zip(outputs) {
            if let Some(tensor) = tensor {
                scope.set(*value, tensor)?;
            }
        }
        result
    }

    fn launch(
        &self,
        scope: &Scope,
        outputs: &mut [Option<HostTensor>],
        pools: &TensorPools,
        target: Target,
    ) -> Result<LaunchRecord> {
        let kernel = &self.kernel;
        let inputs = kernel
            .inputs
            .iter()
            .map(|v| scope.tensor(*v))
            .collect::<Result<Vec<_>>>()?;
        let env = resolve_all(&kernel.bindings, &InputView(&inputs))?;
        let bucket = self.select(&env)?;

        let grid = bucket.launch.evaluate_grid(&env)?;
        let block = bucket.launch.block_u32();
        let shared_bytes = eval_usize(&bucket.shared_bytes, &env)? as u64;
        let scratch_bytes = eval_usize(&bucket.scratch_bytes, &env)? as u64;
        if target.is_gpu() && shared_bytes > target.shared_memory_limit() {
            return Err(Error::runtime(format!(
                "{} needs {shared_bytes} bytes of shared memory, {target} allows {}",
                bucket.kernel_name,
                target.shared_memory_limit()
            )));
        }

        let mut launch_outputs = Vec::with_capacity(outputs.len());
        for ((slot, dims), dtype) in outputs
            .iter_mut()
            .zip(&bucket.output_dims)
            .zip(&kernel.output_dtypes)
        {
            let shape = dims
                .iter()
                .map(|d| eval_usize(d, &env))
                .collect::<Result<Vec<_>>>()?;
            let tensor = match slot.take() {
                Some(t) if t.shape() == shape.as_slice() && t.dtype() == *dtype => t,
                _ => HostTensor::zeros(*dtype, shape),
            };
            launch_outputs.push(tensor);
        }

        let scalars = kernel
            .symbols
            .iter()
            .map(|s| {
                env.get(s)
                    .copied()
                    .ok_or_else(|| Error::runtime(format!("symbol {s} is unresolved")))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::trace!(kernel = %bucket.kernel_name, ?grid, ?block, shared_bytes, "launch");
        let launched = bucket.kernel.launch(LaunchArgs {
            inputs: &inputs,
            outputs: &mut launch_outputs,
            scalars: &scalars,
            grid,
            block,
            shared_bytes,
            scratch_bytes,
            pools,
        });
        for (slot, tensor) in outputs.iter_mut().zip(launch_outputs) {
            *slot = Some(tensor);
        }
        launched?;

        Ok(LaunchRecord {
            fn_name: kernel.fn_name.clone(),
            kernel_name: bucket.kernel_name.clone(),
            variant: bucket.variant.clone(),
            grid,
            block,
            shared_bytes,
        })
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kernel)
    }
}
