//! Symbolic shape engine: dimension expressions, their canonical form,
//! constraint-driven substitution and persistence.

mod binding;
pub mod codec;
mod constraints;
mod dim_expr;
mod shape_or_data;
mod simplify;
mod substitute;
mod union_find;

pub use binding::{
    collect_bindings, resolve_all, resolve_symbol, symbol_getter, BindingSource, SymbolBinding,
};
pub use constraints::{canonicalize_with_constraints, Constraint};
pub use dim_expr::{DimExpr, DimExprInterner, Operands, SymbolGenerator, UnaryKind, VariadicKind};
pub use shape_or_data::{substitute_dim_exprs_based_on_constraints, ShapeAnalysis, ShapeOrData};
pub use substitute::{substitute, substitute_dims, SubstitutionMap};
pub use union_find::UnionFind;
