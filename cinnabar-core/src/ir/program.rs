use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
};

use petgraph::{algo::toposort, graphmap::DiGraphMap};

use crate::{
    symbolic::{Constraint, DimExpr, ShapeOrData},
    Error, Result,
};

use super::{Attribute, Block, OpId, OpKind, Operation, Producer, Region, Type, Value, ValueInfo};

/// A single block of SSA operations plus the side information the compiler
/// needs: declared outputs, shape constraints and known shape-tensor contents.
#[derive(Debug, Clone, Default)]
pub struct Program {
    values: Vec<ValueInfo>,
    ops: Vec<Operation>,
    body: Block,
    outputs: Vec<Value>,
    constraints: Vec<Constraint>,
    data: BTreeMap<Value, Vec<DimExpr>>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of top-level operations.
    pub fn len(&self) -> usize {
        self.body.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.ops.is_empty()
    }

    pub fn body(&self) -> &Block {
        &self.body
    }

    /// Add a block argument.
    pub fn add_argument(&mut self, name: &str, ty: Type) -> Value {
        let value = Value(self.values.len());
        self.values.push(ValueInfo {
            ty,
            name: name.to_string(),
            producer: Producer::BlockArgument {
                index: self.body.args.len(),
            },
        });
        self.body.args.push(value);
        value
    }

    /// Record the symbolic element values of a shape tensor.
    pub fn set_data(&mut self, value: Value, data: Vec<DimExpr>) {
        self.data.insert(value, data);
    }

    pub fn data(&self, value: Value) -> Option<&[DimExpr]> {
        self.data.get(&value).map(Vec::as_slice)
    }

    fn new_op(
        &mut self,
        name: &str,
        kind: OpKind,
        operands: Vec<Value>,
        result_types: Vec<Type>,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<OpId> {
        for operand in &operands {
            if operand.0 >= self.values.len() {
                return Err(Error::invariant(format!(
                    "operand {operand} of `{name}` does not exist"
                )));
            }
        }
        let id = OpId(self.ops.len());
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                let value = Value(self.values.len());
                self.values.push(ValueInfo {
                    ty,
                    name: format!("var_{}", value.0),
                    producer: Producer::OpResult { op: id, index },
                });
                value
            })
            .collect();
        self.ops.push(Operation {
            id,
            name: name.to_string(),
            kind,
            operands,
            results,
            attrs,
            regions: Vec::new(),
        });
        Ok(id)
    }

    /// Append an operation to the top-level block, its kind inferred from its name.
    pub fn append_op(
        &mut self,
        name: &str,
        operands: Vec<Value>,
        result_types: Vec<Type>,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<OpId> {
        self.append_op_with_kind(name, OpKind::infer(name), operands, result_types, attrs)
    }

    pub fn append_op_with_kind(
        &mut self,
        name: &str,
        kind: OpKind,
        operands: Vec<Value>,
        result_types: Vec<Type>,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<OpId> {
        let id = self.new_op(name, kind, operands, result_types, attrs)?;
        self.body.ops.push(id);
        Ok(id)
    }

    /// Append an operation to the first block of region `region` of `parent`,
    /// creating the region and block on demand.
    pub fn append_nested_op(
        &mut self,
        parent: OpId,
        region: usize,
        name: &str,
        operands: Vec<Value>,
        result_types: Vec<Type>,
        attrs: BTreeMap<String, Attribute>,
    ) -> Result<OpId> {
        if parent.0 >= self.ops.len() {
            return Err(Error::invariant(format!("parent {parent} does not exist")));
        }
        let id = self.new_op(name, OpKind::infer(name), operands, result_types, attrs)?;
        let parent = &mut self.ops[parent.0];
        // Ops with regions are never fusible.
        parent.kind = OpKind::Opaque;
        while parent.regions.len() <= region {
            parent.regions.push(Region::default());
        }
        let regions = &mut parent.regions[region];
        if regions.blocks.is_empty() {
            regions.blocks.push(Block::default());
        }
        regions.blocks[0].ops.push(id);
        Ok(id)
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.0]
    }

    /// Top-level operations in insertion order.
    pub fn ops(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.body.ops.iter().map(|id| &self.ops[id.0])
    }

    pub fn arguments(&self) -> &[Value] {
        &self.body.args
    }

    pub fn value_type(&self, value: Value) -> &Type {
        &self.values[value.0].ty
    }

    pub fn value_name(&self, value: Value) -> &str {
        &self.values[value.0].name
    }

    pub fn producer(&self, value: Value) -> Producer {
        self.values[value.0].producer
    }

    /// Operation defining `value`, `None` for block arguments.
    pub fn defining_op(&self, value: Value) -> Option<OpId> {
        match self.producer(value) {
            Producer::OpResult { op, .. } => Some(op),
            Producer::BlockArgument { .. } => None,
        }
    }

    /// Whether `value` is a top-level block argument or a result of a
    /// top-level operation.
    pub fn is_top_level(&self, value: Value) -> bool {
        match self.producer(value) {
            Producer::BlockArgument { .. } => self.body.args.contains(&value),
            Producer::OpResult { op, .. } => self.body.ops.contains(&op),
        }
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Operands of `id` together with the operands of every operation nested
    /// in its regions, without duplicates.
    pub fn captured_operands(&self, id: OpId) -> Vec<Value> {
        let mut out = Vec::new();
        self.collect_operands(id, &mut out);
        out
    }

    fn collect_operands(&self, id: OpId, out: &mut Vec<Value>) {
        let op = &self.ops[id.0];
        for operand in &op.operands {
            if !out.contains(operand) {
                out.push(*operand);
            }
        }
        for region in &op.regions {
            for block in &region.blocks {
                for nested in &block.ops {
                    self.collect_operands(*nested, out);
                }
            }
        }
    }

    /// Top-level operations consuming `value` directly or from a nested
    /// region, in insertion order, without duplicates.
    pub fn users(&self, value: Value) -> Vec<OpId> {
        self.body
            .ops
            .iter()
            .copied()
            .filter(|id| self.captured_operands(*id).contains(&value))
            .collect()
    }

    pub fn mark_output(&mut self, value: Value) {
        if !self.outputs.contains(&value) {
            self.outputs.push(value);
        }
    }

    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    pub fn is_output(&self, value: Value) -> bool {
        self.outputs.contains(&value)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Shape (and known data) of a value as declared by the program.
    pub fn shape_or_data(&self, value: Value) -> ShapeOrData {
        let shape = self.value_type(value).shape.clone();
        match self.data.get(&value) {
            Some(data) => ShapeOrData::with_data(shape, data.clone()),
            None => ShapeOrData::shape(shape),
        }
    }

    /// Producer-to-user graph over top-level operations.
    pub fn dependency_graph(&self) -> DiGraphMap<OpId, ()> {
        let mut graph = DiGraphMap::new();
        for op in self.ops() {
            graph.add_node(op.id);
            for operand in self.captured_operands(op.id) {
                match self.defining_op(operand) {
                    Some(def) if self.body.ops.contains(&def) => {
                        graph.add_edge(def, op.id, ());
                    }
                    _ => {}
                }
            }
        }
        graph
    }

    /// Check SSA dominance, dangling values and the acyclicity of the
    /// top-level dependency graph.
    pub fn verify(&self) -> Result<()> {
        let mut defined: HashSet<Value> = self.body.args.iter().copied().collect();
        self.verify_block(&self.body, &mut defined)?;
        for output in &self.outputs {
            if !defined.contains(output) {
                return Err(Error::invariant(format!(
                    "program output {output} is not defined in the top-level block"
                )));
            }
        }
        toposort(&self.dependency_graph(), None).map_err(|cycle| {
            Error::invariant(format!("dependency cycle through {}", cycle.node_id()))
        })?;
        Ok(())
    }

    fn verify_block(&self, block: &Block, defined: &mut HashSet<Value>) -> Result<()> {
        for id in &block.ops {
            let op = self
                .ops
                .get(id.0)
                .ok_or_else(|| Error::invariant(format!("dangling operation {id}")))?;
            for operand in &op.operands {
                if operand.0 >= self.values.len() {
                    return Err(Error::invariant(format!(
                        "dangling value {operand} used by {} `{}`",
                        op.id, op.name
                    )));
                }
                if !defined.contains(operand) {
                    return Err(Error::invariant(format!(
                        "operand {operand} of {} `{}` is not dominated by its definition",
                        op.id, op.name
                    )));
                }
            }
            for region in &op.regions {
                for nested in &region.blocks {
                    let mut scope = defined.clone();
                    scope.extend(nested.args.iter().copied());
                    self.verify_block(nested, &mut scope)?;
                }
            }
            defined.extend(op.results.iter().copied());
        }
        Ok(())
    }
}

impl Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for arg in &self.body.args {
            writeln!(f, "arg {} {arg} : {}", self.value_name(*arg), self.value_type(*arg))?;
        }
        for op in self.ops() {
            let results = op
                .results
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let operands = op
                .operands
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "{results} = {}({operands})", op.name)?;
            if !op.attrs.is_empty() {
                let attrs = op
                    .attrs
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, " {{{attrs}}}")?;
            }
            let types = op
                .results
                .iter()
                .map(|v| self.value_type(*v).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, " : {types}")?;
        }
        let outputs = self
            .outputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "yield({outputs})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DataType;

    #[test]
    fn nested_ops_need_a_live_parent() {
        let ty = Type::new(DataType::F32, vec![DimExpr::Int(4)]);
        let mut program = Program::new();
        let x = program.add_argument("x", ty.clone());
        let err = program
            .append_nested_op(OpId(3), 0, "exp", vec![x], vec![ty.clone()], BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvariantViolation { .. }), "{err}");

        let parent = program.append_op("scan", vec![x], vec![ty.clone()], BTreeMap::new()).unwrap();
        program
            .append_nested_op(parent, 1, "exp", vec![x], vec![ty], BTreeMap::new())
            .unwrap();
        let regions = program.op(parent).regions();
        assert_eq!(regions.len(), 2);
        assert!(regions[0].blocks.is_empty());
        assert_eq!(regions[1].blocks[0].ops.len(), 1);
        assert_eq!(program.len(), 1);
    }
}
