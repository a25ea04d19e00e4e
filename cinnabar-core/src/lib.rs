//! Cinnabar is an operator-fusion compiler for tensor programs over symbolic shapes.
//!
//! A [`Program`] of fine-grained tensor operations goes through four layers:
//!
//! - **Symbolic shapes.** Every dimension is a [`DimExpr`]. Equality constraints are
//!   canonicalized so that equal dimensions share one representative.
//! - **Fusion.** Operations are clustered into [`Group`]s by rewriting a pattern graph
//!   (sinking trivial ops, growing reduce trees, fusing epilogues), guarded by a
//!   [`PolicyManager`].
//! - **Lowering.** Each group becomes a [`LoweredFunction`]: an anchored loop nest with
//!   memory classes, barriers and shape-specialized buckets selected by predicates.
//! - **Driver.** Groups are lowered, generated and compiled on a worker pool. The
//!   result is a [`CompiledProgram`], an ordered list of [`Instruction`]s.
//!
//! ## A quick guide
//! - Build a program with [`ProgramBuilder`], using [`DimExpr::sym`] for dynamic dimensions.
//! - Pick a [`CompileConfig`]. The CPU target runs kernels with a reference interpreter;
//!   the `cuda` feature compiles them with NVRTC.
//! - Call [`compile`] (or use a [`Compiler`] for custom backends, policies and buckets).
//! - Run the result with [`CompiledProgram::run`] on [`HostTensor`]s.
//!
//! ## What can you do with it?
//! ```
//! use cinnabar_core::{compile, CompileConfig, DataType, DimExpr, HostTensor, ProgramBuilder};
//!
//! let mut b = ProgramBuilder::new();
//! let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
//! let m = b.reduce_max(x, &[1], true).unwrap();
//! let m = b.broadcast_to(m, vec![DimExpr::sym("S0"), DimExpr::Int(4)]).unwrap();
//! let d = b.sub(x, m).unwrap();
//! let e = b.unary("exp", d).unwrap();
//! b.output(e);
//! let program = b.build().unwrap();
//!
//! let mut compiled = compile(&program, &CompileConfig::default()).unwrap();
//! assert_eq!(compiled.instructions().len(), 1);
//!
//! let x = HostTensor::from_f32(vec![2, 4], vec![1.0; 8]).unwrap();
//! let out = compiled.run(&[x]).unwrap();
//! assert_eq!(out[0].as_f32().unwrap(), &[1.0; 8]);
//! ```

mod backend;
mod config;
mod driver;
mod error;
mod fusion;
mod ir;
mod lowering;
mod runtime;
mod symbolic;

#[cfg(feature = "cuda")]
pub use backend::{CudaBackend, CudaError};
pub use backend::{
    default_backend, emit_device_source, Backend, CodeEmitter, CpuBackend, Kernel, LaunchArgs,
    LoadedModule, SourceModule, SourceOnlyBackend,
};
pub use config::{CompileConfig, MemoryClass, Target};
pub use driver::{
    compile, BucketInfo, CancelToken, CompilationContext, CompilationTask, Compiler, KernelInfo,
};
pub use error::{Context, Error, GroupFailure, Result};
pub use fusion::{
    cluster_ops, cluster_ops_into_one_group, cluster_ops_with_analysis, FusionPolicy, Group,
    NodeId, PatternGraph, PatternNode, PolicyManager, RelativeShapePolicy, StmtPattern,
};
pub use ir::{
    broadcast_shapes, Attribute, Block, DataType, OpId, OpKind, Operation, Producer, Program,
    ProgramBuilder, Region, Type, Value,
};
pub use lowering::{
    assign_offsets, emit_host_launcher, global_scratch_bytes, insert_barriers, kernel_name, lower,
    make_exclusive, plan_buckets, provably_disjoint, shared_memory_bytes, AnchoredMapStmt,
    BucketPlan, BucketSpec, CondExpr, CondOp, GridExtent, IndexMap, IndexTerm, LaunchDims,
    LoopDesc, LoopTag, LoweredBucket, LoweredFunction, MapStmt, OpStmt, ScheduleDescriptor,
    StmtOp, TempStorage, TensorDecl,
};
pub use runtime::{
    BufferPool, CompiledProgram, HostTensor, Instruction, LaunchRecord, PoolMetrics,
    PooledBuffer, Scope, SharedPool, TensorData, TensorPools, TensorSlot,
};
pub use symbolic::{
    canonicalize_with_constraints, codec, collect_bindings, resolve_all, resolve_symbol,
    substitute, substitute_dim_exprs_based_on_constraints, substitute_dims, symbol_getter,
    BindingSource, Constraint, DimExpr, DimExprInterner, Operands, ShapeAnalysis, ShapeOrData,
    SubstitutionMap, SymbolBinding, SymbolGenerator, UnaryKind, UnionFind, VariadicKind,
};
pub use fusion::passes;
