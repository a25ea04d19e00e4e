use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use crate::{config::MemoryClass, ir::Value, symbolic::DimExpr};

use super::{MapStmt, OpStmt};

/// Storage of one kernel-internal tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempStorage {
    pub name: String,
    pub value: Value,
    /// Offset inside the per-class scratch area.
    pub byte_offset: DimExpr,
    pub bytes: DimExpr,
    pub class: MemoryClass,
}

impl Display for TempStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {} bytes @ {} in {}",
            self.name, self.value, self.bytes, self.byte_offset, self.class
        )
    }
}

/// Lay out temporaries back to back within each memory class, in order.
/// `SSAShadow` temporaries take no space.
pub fn assign_offsets(temps: &mut [TempStorage]) {
    let mut next: BTreeMap<MemoryClass, DimExpr> = BTreeMap::new();
    for temp in temps.iter_mut() {
        if temp.class == MemoryClass::SSAShadow {
            temp.byte_offset = DimExpr::Int(0);
            temp.bytes = DimExpr::Int(0);
            continue;
        }
        let offset = next.entry(temp.class).or_insert(DimExpr::Int(0));
        temp.byte_offset = offset.clone();
        *offset = &*offset + &temp.bytes;
    }
}

/// Total shared memory a kernel needs: the sum of its `Shared` temporaries.
pub fn shared_memory_bytes(temps: &[TempStorage]) -> DimExpr {
    temps
        .iter()
        .filter(|t| t.class == MemoryClass::Shared)
        .fold(DimExpr::Int(0), |acc, t| acc + &t.bytes)
}

/// Total global scratch a kernel needs.
pub fn global_scratch_bytes(temps: &[TempStorage]) -> DimExpr {
    temps
        .iter()
        .filter(|t| t.class == MemoryClass::Global)
        .fold(DimExpr::Int(0), |acc, t| acc + &t.bytes)
}

/// Insert a `MemoryBarrier` before every statement whose written memory
/// class differs from the previous write's (`Shared` against `Global`), and
/// before every statement reading stored memory written since the last
/// barrier. Tensors absent from `classes` are kernel arguments and live in
/// `Global`.
pub fn insert_barriers(body: MapStmt, classes: &BTreeMap<Value, MemoryClass>) -> MapStmt {
    let mut state = BarrierState::default();
    rewrite(body, classes, &mut state)
}

#[derive(Default)]
struct BarrierState {
    last: Option<MemoryClass>,
    dirty: BTreeSet<Value>,
}

fn class_of(value: &Value, classes: &BTreeMap<Value, MemoryClass>) -> MemoryClass {
    classes.get(value).copied().unwrap_or(MemoryClass::Global)
}

/// Values read and written by a statement or a whole loop nest.
fn footprint(stmt: &MapStmt) -> (Vec<Value>, Vec<Value>) {
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    for op in stmt.op_stmts() {
        reads.extend(op.inputs.iter().copied());
        writes.extend(op.outputs.iter().copied());
    }
    (reads, writes)
}

fn rewrite(
    stmt: MapStmt,
    classes: &BTreeMap<Value, MemoryClass>,
    state: &mut BarrierState,
) -> MapStmt {
    let MapStmt::Map { schedule, children } = stmt else {
        return stmt;
    };
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        let (reads, writes) = footprint(&child);
        let written = writes
            .iter()
            .map(|v| class_of(v, classes))
            .find(|c| *c != MemoryClass::SSAShadow);
        let transition = matches!((state.last, written), (Some(a), Some(b)) if a != b);
        let hazard = reads.iter().any(|v| state.dirty.contains(v));
        if transition || hazard {
            out.push(MapStmt::Op(OpStmt::barrier()));
            state.dirty.clear();
        }
        if let Some(class) = written {
            state.last = Some(class);
        }
        match child {
            MapStmt::Op(op) => {
                state.dirty.extend(
                    op.outputs
                        .iter()
                        .filter(|v| class_of(v, classes) != MemoryClass::SSAShadow),
                );
                out.push(MapStmt::Op(op));
            }
            nested => out.push(rewrite(nested, classes, state)),
        }
    }
    MapStmt::Map {
        schedule,
        children: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::OpId, lowering::{ScheduleDescriptor, StmtOp}};

    fn stmt(inputs: &[usize], out: usize) -> MapStmt {
        MapStmt::Op(OpStmt {
            op: StmtOp::Op(OpId(out)),
            name: "exp".into(),
            attrs: BTreeMap::new(),
            inputs: inputs.iter().copied().map(Value).collect(),
            outputs: vec![Value(out)],
        })
    }

    fn names(body: &MapStmt) -> Vec<&str> {
        body.op_stmts().iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn barriers_at_transitions() {
        let classes = BTreeMap::from([
            (Value(0), MemoryClass::Shared),
            (Value(1), MemoryClass::SSAShadow),
            (Value(2), MemoryClass::Global),
        ]);
        let body = MapStmt::Map {
            schedule: ScheduleDescriptor::default(),
            children: vec![stmt(&[], 0), stmt(&[], 1), stmt(&[], 2), stmt(&[], 3)],
        };
        let body = insert_barriers(body, &classes);
        assert_eq!(names(&body), ["exp", "exp", "memory_barrier", "exp", "exp"]);
    }

    #[test]
    fn barrier_before_reading_stored_writes() {
        let classes = BTreeMap::from([
            (Value(1), MemoryClass::SSAShadow),
            (Value(2), MemoryClass::Global),
        ]);
        let body = MapStmt::Map {
            schedule: ScheduleDescriptor::default(),
            children: vec![stmt(&[0], 1), stmt(&[1], 2), stmt(&[2], 3)],
        };
        let body = insert_barriers(body, &classes);
        assert_eq!(names(&body), ["exp", "exp", "memory_barrier", "exp"]);
    }

    #[test]
    fn offsets_per_class() {
        let temp = |v: usize, bytes: i64, class| TempStorage {
            name: format!("t{v}"),
            value: Value(v),
            byte_offset: DimExpr::Int(0),
            bytes: DimExpr::Int(bytes),
            class,
        };
        let mut temps = vec![
            temp(0, 16, MemoryClass::Shared),
            temp(1, 32, MemoryClass::Global),
            temp(2, 8, MemoryClass::Shared),
            temp(3, 64, MemoryClass::SSAShadow),
        ];
        assign_offsets(&mut temps);
        assert_eq!(temps[2].byte_offset, DimExpr::Int(16));
        assert_eq!(temps[1].byte_offset, DimExpr::Int(0));
        assert_eq!(temps[3].bytes, DimExpr::Int(0));
        assert_eq!(shared_memory_bytes(&temps), DimExpr::Int(24));
    }
}
