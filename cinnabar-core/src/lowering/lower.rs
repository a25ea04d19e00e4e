use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use crate::{
    config::{CompileConfig, MemoryClass, Target},
    fusion::Group,
    ir::{Attribute, DataType, OpKind, Operation, Program, Value},
    symbolic::{collect_bindings, symbol_getter, DimExpr, ShapeAnalysis, ShapeOrData, SymbolBinding},
    Error, Result,
};

use super::{
    assign_offsets, bucket::specialize, global_scratch_bytes, host::emit_host_launcher,
    insert_barriers, kernel_name, plan_buckets, shared_memory_bytes, AnchoredMapStmt, BucketPlan,
    BucketSpec, CondExpr, GridExtent, IndexMap, LaunchDims, MapStmt, OpStmt, ScheduleDescriptor,
    StmtOp, TempStorage,
};

/// A kernel argument tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDecl {
    pub name: String,
    pub value: Value,
    pub dtype: DataType,
    pub dims: Vec<DimExpr>,
}

impl Display for TensorDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{} {}: {}[{dims}]", self.value, self.name, self.dtype)
    }
}

/// One predicate-guarded specialization of a lowered group.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredBucket {
    pub predicate: CondExpr,
    pub variant: Option<String>,
    pub kernel_name: String,
    pub body: AnchoredMapStmt,
    pub temps: Vec<TempStorage>,
    pub launch: LaunchDims,
    /// Dynamic shared memory per block, from the shared-memory pre-pass.
    pub shared_bytes: DimExpr,
    /// Global scratch needed by the launch.
    pub scratch_bytes: DimExpr,
    /// Shape of every tensor of the group under this bucket.
    pub shapes: BTreeMap<Value, Vec<DimExpr>>,
}

impl LoweredBucket {
    pub fn memory_class(&self, value: Value) -> Option<MemoryClass> {
        self.temps.iter().find(|t| t.value == value).map(|t| t.class)
    }
}

/// A group lowered to schedule-tagged loop nests plus its argument signature.
///
/// The kernel arguments are, in order, the input tensors, the output tensors
/// and one `int64` per entry of `symbols`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredFunction {
    pub fn_name: String,
    pub group_index: usize,
    pub target: Target,
    pub inputs: Vec<TensorDecl>,
    pub outputs: Vec<TensorDecl>,
    /// Element type of every tensor the group touches.
    pub dtypes: BTreeMap<Value, DataType>,
    /// Scalar shape arguments, sorted by name.
    pub symbols: Vec<String>,
    pub bindings: Vec<SymbolBinding>,
    /// Scalar argument position to the input it is read from.
    pub int_args_map: BTreeMap<usize, SymbolBinding>,
    pub buckets: Vec<LoweredBucket>,
    /// C source of the host-side launcher.
    pub host_source: String,
}

impl LoweredFunction {
    pub fn num_args(&self) -> usize {
        self.inputs.len() + self.outputs.len() + self.symbols.len()
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.buckets.iter().map(|b| b.kernel_name.as_str())
    }
}

impl Display for LoweredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "function {} (group #{}, {})", self.fn_name, self.group_index, self.target)?;
        for input in &self.inputs {
            writeln!(f, "  in  {input}")?;
        }
        for output in &self.outputs {
            writeln!(f, "  out {output}")?;
        }
        for (pos, binding) in &self.int_args_map {
            writeln!(f, "  arg {pos}: {binding}")?;
        }
        for bucket in &self.buckets {
            writeln!(f, "bucket {} if {}", bucket.kernel_name, bucket.predicate)?;
            for temp in &bucket.temps {
                writeln!(f, "  temp {temp}")?;
            }
            write!(f, "{}", bucket.body)?;
        }
        Ok(())
    }
}

/// Reduced axes of a reduction op.
fn reduce_axes(op: &Operation) -> Result<Vec<usize>> {
    let axes = op
        .attr("axis")
        .and_then(Attribute::as_i64_vec)
        .ok_or_else(|| {
            Error::invariant(format!("{} `{}` has no axis attribute", op.id(), op.name()))
        })?;
    Ok(axes.into_iter().map(|a| a.max(0) as usize).collect())
}

/// Everything the bucket lowering of one group reads.
struct GroupView<'a> {
    group: &'a Group,
    program: &'a Program,
    config: &'a CompileConfig,
    shapes: BTreeMap<Value, Vec<DimExpr>>,
    dtypes: BTreeMap<Value, DataType>,
}

impl GroupView<'_> {
    fn dims<'s>(
        &self,
        shapes: &'s BTreeMap<Value, Vec<DimExpr>>,
        value: Value,
    ) -> Result<&'s [DimExpr]> {
        shapes
            .get(&value)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                Error::invariant(format!("{value} is not a tensor of {}", self.group.fn_name()))
            })
    }

    /// Highest-rank output, the earliest one on ties.
    fn anchor(&self, shapes: &BTreeMap<Value, Vec<DimExpr>>) -> Result<Value> {
        let rank = |v: &Value| shapes.get(v).map_or(0, Vec::len);
        let best = self.group.outputs().iter().fold(None, |best: Option<Value>, v| match best {
            Some(b) if rank(&b) >= rank(v) => Some(b),
            _ => Some(*v),
        });
        best.or_else(|| {
            self.group
                .ops()
                .iter()
                .rev()
                .find_map(|op| self.program.op(*op).results().last().copied())
        })
        .or_else(|| self.group.inputs().first().copied())
        .ok_or_else(|| {
            Error::unsupported(format!("{} has no tensor to anchor", self.group.fn_name()))
        })
    }

    fn stmt(&self, op: &Operation, kind: StmtOp, inputs: Vec<Value>) -> OpStmt {
        OpStmt {
            op: kind,
            name: op.name().to_string(),
            attrs: op.attrs().clone(),
            inputs,
            outputs: op.results().to_vec(),
        }
    }

    fn body(&self, shapes: &BTreeMap<Value, Vec<DimExpr>>, domain: &[DimExpr]) -> Result<MapStmt> {
        let mut children = Vec::with_capacity(self.group.ops().len());
        for id in self.group.ops() {
            let op = self.program.op(*id);
            if op.kind() != OpKind::Reduction {
                children.push(MapStmt::Op(self.stmt(op, StmtOp::Op(*id), op.operands().to_vec())));
                continue;
            }
            let input = op
                .operands()
                .first()
                .copied()
                .ok_or_else(|| Error::invariant(format!("reduction {id} has no operand")))?;
            let result = op
                .result(0)
                .ok_or_else(|| Error::invariant(format!("reduction {id} has no result")))?;
            let in_dims = self.dims(shapes, input)?;
            let loops: Vec<(usize, DimExpr)> = reduce_axes(op)?
                .into_iter()
                .filter_map(|axis| in_dims.get(axis).map(|d| (axis, d.clone())))
                .collect();
            let schedule = ScheduleDescriptor::reduction(&loops);
            if op.name() == "reduce_sum" {
                children.push(MapStmt::Op(self.stmt(op, StmtOp::Zeros { origin: *id }, vec![])));
                let accumulate =
                    self.stmt(op, StmtOp::InplaceAdd { origin: *id }, vec![input, result]);
                children.push(MapStmt::Map {
                    schedule,
                    children: vec![MapStmt::Op(accumulate)],
                });
            } else {
                children.push(MapStmt::Map {
                    schedule,
                    children: vec![MapStmt::Op(self.stmt(op, StmtOp::Op(*id), vec![input]))],
                });
            }
        }
        Ok(MapStmt::Map {
            schedule: ScheduleDescriptor::spatial(self.config.target, domain),
            children,
        })
    }

    /// Storage of every internal tensor. Trivial results are register
    /// aliases; everything else takes the configured default class.
    fn temps(&self, shapes: &BTreeMap<Value, Vec<DimExpr>>) -> Result<Vec<TempStorage>> {
        let mut temps = Vec::new();
        for id in self.group.ops() {
            let op = self.program.op(*id);
            for result in op.results() {
                if self.group.outputs().contains(result) {
                    continue;
                }
                let class = match op.kind() {
                    OpKind::Reduction | OpKind::Opaque => self.config.default_memory_class,
                    _ => MemoryClass::SSAShadow,
                };
                let elem = self.program.value_type(*result).dtype.storage_bytes() as i64;
                temps.push(TempStorage {
                    name: format!("{}_tmp", self.program.value_name(*result)),
                    value: *result,
                    byte_offset: DimExpr::Int(0),
                    bytes: DimExpr::product(self.dims(shapes, *result)?) * elem,
                    class,
                });
            }
        }

        let target = self.config.target;
        let limit = target.shared_memory_limit();
        let shared = shared_memory_bytes(&temps);
        let overflow = match shared.as_int() {
            Some(bytes) => bytes.max(0) as u64 > limit,
            None => !target.is_gpu(),
        };
        if overflow && temps.iter().any(|t| t.class == MemoryClass::Shared) {
            tracing::warn!(
                backend = %target,
                bytes = %shared,
                limit,
                "shared temporaries exceed the per-block ceiling, demoting to global"
            );
            for temp in temps.iter_mut().filter(|t| t.class == MemoryClass::Shared) {
                temp.class = MemoryClass::Global;
            }
        }
        assign_offsets(&mut temps);
        Ok(temps)
    }

    fn bucket(&self, fn_name: &str, plan: BucketPlan) -> Result<LoweredBucket> {
        let shapes = specialize(&self.shapes, &plan);
        let anchor = self.anchor(&shapes)?;
        let domain = self.dims(&shapes, anchor)?.to_vec();

        let temps = self.temps(&shapes)?;
        let classes: BTreeMap<Value, MemoryClass> =
            temps.iter().map(|t| (t.value, t.class)).collect();
        let body = insert_barriers(self.body(&shapes, &domain)?, &classes);

        let (schedule, barriers) = match &body {
            MapStmt::Map { schedule, .. } => (
                schedule.clone(),
                body.op_stmts().iter().any(|s| s.is_barrier()),
            ),
            MapStmt::Op(_) => (ScheduleDescriptor::default(), false),
        };
        let mut launch = schedule.launch_dims(self.config.target);
        if barriers && self.config.target.is_gpu() {
            // Phases only synchronize within one block.
            launch.grid = [GridExtent::fixed(1), GridExtent::fixed(1), GridExtent::fixed(1)];
        }

        let index_maps = shapes
            .iter()
            .map(|(value, dims)| (*value, IndexMap::derive(&domain, dims)))
            .collect();
        Ok(LoweredBucket {
            kernel_name: kernel_name(fn_name, &plan.predicate),
            predicate: plan.predicate,
            variant: plan.variant,
            body: AnchoredMapStmt {
                body,
                anchor,
                index_maps,
            },
            launch,
            shared_bytes: shared_memory_bytes(&temps),
            scratch_bytes: global_scratch_bytes(&temps),
            temps,
            shapes,
        })
    }
}

/// Lower one group for `config.target`.
///
/// Shapes are read from `analysis`, falling back to the declared types.
/// `specs` requests explicit buckets and is only honored in bucket mode.
#[tracing::instrument(skip_all, fields(group = group.index(), fn_name = group.fn_name()))]
pub fn lower(
    group: &Group,
    program: &Program,
    analysis: &ShapeAnalysis,
    config: &CompileConfig,
    specs: &[BucketSpec],
) -> Result<LoweredFunction> {
    config.validate()?;
    let dims_of = |v: Value| {
        analysis
            .dims(v)
            .map(<[DimExpr]>::to_vec)
            .unwrap_or_else(|| program.value_type(v).shape.clone())
    };

    let mut tensors = group.inputs().to_vec();
    for op in group.ops() {
        tensors.extend(program.op(*op).results().iter().copied());
    }
    let shapes: BTreeMap<Value, Vec<DimExpr>> = tensors.iter().map(|v| (*v, dims_of(*v))).collect();
    let dtypes: BTreeMap<Value, DataType> = tensors
        .iter()
        .map(|v| (*v, program.value_type(*v).dtype))
        .collect();
    let decl = |v: &Value| TensorDecl {
        name: program.value_name(*v).to_string(),
        value: *v,
        dtype: program.value_type(*v).dtype,
        dims: dims_of(*v),
    };
    let inputs: Vec<TensorDecl> = group.inputs().iter().map(decl).collect();
    let outputs: Vec<TensorDecl> = group.outputs().iter().map(decl).collect();

    let input_shapes: Vec<ShapeOrData> = group
        .inputs()
        .iter()
        .map(|v| analysis.get(*v).cloned().unwrap_or_else(|| program.shape_or_data(*v)))
        .collect();
    let bindings = collect_bindings(&input_shapes);
    let bound: BTreeSet<String> = bindings.iter().map(|b| b.symbol().to_string()).collect();
    let symbols: BTreeSet<String> = shapes
        .values()
        .flatten()
        .flat_map(|d| d.symbols())
        .map(|s| s.to_string())
        .collect();
    if let Some(missing) = symbols.iter().find(|s| !bound.contains(*s)) {
        return Err(Error::unsupported(format!(
            "symbol {missing} of {} is not bound by any group input",
            group.fn_name()
        )));
    }
    let symbols: Vec<String> = symbols.into_iter().collect();

    let getter = symbol_getter(&bindings);
    let base = inputs.len() + outputs.len();
    let int_args_map = symbols
        .iter()
        .enumerate()
        .filter_map(|(k, s)| {
            let binding = getter.get(s.as_str())?.first()?;
            Some((base + k, binding.clone()))
        })
        .collect();

    let view = GroupView {
        group,
        program,
        config,
        shapes,
        dtypes,
    };
    let all_shapes: Vec<Vec<DimExpr>> = view.shapes.values().cloned().collect();
    let buckets = plan_buckets(config, &all_shapes, specs, &bound)?
        .into_iter()
        .map(|plan| view.bucket(group.fn_name(), plan))
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(buckets = buckets.len(), symbols = symbols.len(), "lowered group");

    let mut function = LoweredFunction {
        fn_name: group.fn_name().to_string(),
        group_index: group.index(),
        target: config.target,
        inputs,
        outputs,
        dtypes: view.dtypes,
        symbols,
        bindings,
        int_args_map,
        buckets,
        host_source: String::new(),
    };
    function.host_source = emit_host_launcher(&function)?;
    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fusion::cluster_ops, fusion::PolicyManager, ir::ProgramBuilder};

    fn softmax() -> Program {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![2.into(), 2.into(), 4.into()]);
        let m = b.reduce_max(x, &[-1], true).unwrap();
        let mb = b.broadcast_to(m, vec![2.into(), 2.into(), 4.into()]).unwrap();
        let d = b.sub(x, mb).unwrap();
        let e = b.unary("exp", d).unwrap();
        let s = b.reduce_sum(e, &[-1], true).unwrap();
        let sb = b.broadcast_to(s, vec![2.into(), 2.into(), 4.into()]).unwrap();
        let y = b.div(e, sb).unwrap();
        b.output(y);
        b.build().unwrap()
    }

    #[test]
    fn softmax_lowers_to_one_bucket() {
        let program = softmax();
        let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
        assert_eq!(groups.len(), 1);
        let analysis = ShapeAnalysis::from_program(&program);
        let config = CompileConfig::default().with_target(Target::Cuda);
        let function = lower(&groups[0], &program, &analysis, &config, &[]).unwrap();
        assert_eq!(function.buckets.len(), 1);
        let bucket = &function.buckets[0];
        assert!(bucket.kernel_name.ends_with("__COND_TRUE__kernel"));
        assert_eq!(bucket.body.anchor, program.outputs()[0]);

        let names: Vec<_> = bucket.body.body.op_stmts().iter().map(|s| s.to_string()).collect();
        assert!(names.iter().any(|n| n.contains("zeros<reduce_sum>")));
        assert!(names.iter().any(|n| n.contains("inplace_add<reduce_sum>")));
        // max and sum accumulators live in global scratch.
        assert_eq!(bucket.temps.iter().filter(|t| t.class == MemoryClass::Global).count(), 2);
        assert_eq!(bucket.scratch_bytes, DimExpr::Int(32));
        assert!(bucket.body.body.op_stmts().iter().any(|s| s.is_barrier()));
        assert_eq!(bucket.launch.grid[0], GridExtent::fixed(1));
    }

    #[test]
    fn shared_temps_are_demoted_on_cpu() {
        let program = softmax();
        let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
        let analysis = ShapeAnalysis::from_program(&program);
        let config = CompileConfig::default().with_default_memory_class(MemoryClass::Shared);
        let function = lower(&groups[0], &program, &analysis, &config, &[]).unwrap();
        let bucket = &function.buckets[0];
        assert!(bucket.temps.iter().all(|t| t.class != MemoryClass::Shared));
        assert_eq!(bucket.shared_bytes, DimExpr::Int(0));

        let config = config.with_target(Target::Cuda);
        let function = lower(&groups[0], &program, &analysis, &config, &[]).unwrap();
        assert_eq!(function.buckets[0].shared_bytes, DimExpr::Int(32));
    }

    #[test]
    fn scalar_arguments_follow_tensors() {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), 128.into()]);
        let y = b.unary("relu", x).unwrap();
        b.output(y);
        let program = b.build().unwrap();
        let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
        let analysis = ShapeAnalysis::from_program(&program);
        let function =
            lower(&groups[0], &program, &analysis, &CompileConfig::default(), &[]).unwrap();
        assert_eq!(function.symbols, vec!["S0".to_string()]);
        assert_eq!(function.num_args(), 3);
        assert_eq!(function.int_args_map[&2].to_string(), "S0 = shape(in0)[0]");
    }

    #[test]
    fn unbound_symbols_are_rejected() {
        let mut b = ProgramBuilder::new();
        let x = b.full(vec![DimExpr::sym("S0")], 1.0, DataType::F32).unwrap();
        b.output(x);
        let program = b.build().unwrap();
        let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
        let analysis = ShapeAnalysis::from_program(&program);
        let err =
            lower(&groups[0], &program, &analysis, &CompileConfig::default(), &[]).unwrap_err();
        assert!(matches!(err.root(), Error::Unsupported { .. }));
    }
}
