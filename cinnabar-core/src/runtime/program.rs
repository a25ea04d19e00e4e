use crate::{config::Target, ir::Value, Context, Error, Result};

use super::{HostTensor, Instruction, LaunchRecord, Scope, TensorPools};

/// An executable program: compiled groups in order over a shared scope.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    instructions: Vec<Instruction>,
    scope: Scope,
    arguments: Vec<Value>,
    outputs: Vec<Value>,
    pools: TensorPools,
    target: Target,
}

impl CompiledProgram {
    pub fn new(
        instructions: Vec<Instruction>,
        scope: Scope,
        arguments: Vec<Value>,
        outputs: Vec<Value>,
        target: Target,
    ) -> Self {
        Self {
            instructions,
            scope,
            arguments,
            outputs,
            pools: TensorPools::new(),
            target,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn pools(&self) -> &TensorPools {
        &self.pools
    }

    /// Kernel names of every instruction, in execution order.
    pub fn kernel_names(&self) -> Vec<String> {
        self.instructions
            .iter()
            .flat_map(|i| i.kernel().kernel_names().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// A deterministic textual dump of every instruction.
    pub fn describe(&self) -> String {
        self.instructions
            .iter()
            .enumerate()
            .map(|(i, instruction)| format!("#{i} {instruction}\n"))
            .collect()
    }

    fn bind_arguments(&mut self, args: &[HostTensor]) -> Result<()> {
        if args.len() != self.arguments.len() {
            return Err(Error::runtime(format!(
                "expected {} arguments, got {}",
                self.arguments.len(),
                args.len()
            )));
        }
        for (value, tensor) in self.arguments.iter().zip(args) {
            let slot = self
                .scope
                .slot(*value)
                .ok_or_else(|| Error::runtime(format!("argument {value} is not in scope")))?;
            if slot.dims.len() != tensor.shape().len() {
                return Err(Error::runtime(format!(
                    "argument `{}` has rank {}, got shape {:?}",
                    slot.name,
                    slot.dims.len(),
                    tensor.shape()
                )));
            }
            for (i, (dim, extent)) in slot.dims.iter().zip(tensor.shape()).enumerate() {
                if let Some(expected) = dim.as_int() {
                    if usize::try_from(expected).ok() != Some(*extent) {
                        return Err(Error::runtime(format!(
                            "argument `{}` dim {i} must be {expected}, got {extent}",
                            slot.name
                        )));
                    }
                }
            }
            self.scope.set(*value, tensor.clone())?;
        }
        Ok(())
    }

    fn collect_outputs(&self) -> Result<Vec<HostTensor>> {
        self.outputs
            .iter()
            .map(|v| self.scope.tensor(*v).cloned())
            .collect()
    }

    /// Execute every instruction in order and return the program outputs.
    pub fn run(&mut self, args: &[HostTensor]) -> Result<Vec<HostTensor>> {
        self.run_traced(args).map(|(outputs, _)| outputs)
    }

    /// [`CompiledProgram::run`], also reporting what each instruction launched.
    pub fn run_traced(
        &mut self,
        args: &[HostTensor],
    ) -> Result<(Vec<HostTensor>, Vec<LaunchRecord>)> {
        self.bind_arguments(args)?;
        let mut records = Vec::with_capacity(self.instructions.len());
        for (i, instruction) in self.instructions.iter().enumerate() {
            let record = instruction
                .run(&mut self.scope, &self.pools, self.target)
                .with_context(|| format!("instruction #{i} ({})", instruction.fn_name()))?;
            records.push(record);
        }
        Ok((self.collect_outputs()?, records))
    }
}
