use std::fmt::Display;

use crate::{Error, Result};

use super::{DimExpr, SubstitutionMap, UnionFind};

/// A predicate over dims recorded by shape inference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constraint {
    Equal(DimExpr, DimExpr),
    Broadcastable(DimExpr, DimExpr),
    GreaterThanOne(DimExpr),
}

impl Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equal(a, b) => write!(f, "{a} == {b}"),
            Self::Broadcastable(a, b) => write!(f, "broadcastable({a}, {b})"),
            Self::GreaterThanOne(a) => write!(f, "{a} > 1"),
        }
    }
}

/// Resolve dim equalities as an equivalence relation.
///
/// Every expression in `exprs` and on either side of an `Equal` constraint
/// joins a union-find; each class is represented by its priority-minimum
/// member (see the [`Ord`] impl of [`DimExpr`]) and the returned mapping
/// sends every other member to it. Constraint kinds other than `Equal` are
/// rejected with [`Error::Unsupported`].
pub fn canonicalize_with_constraints<'a>(
    exprs: impl IntoIterator<Item = &'a DimExpr>,
    constraints: &[Constraint],
) -> Result<SubstitutionMap> {
    let mut union_find = UnionFind::new();
    for expr in exprs {
        union_find.insert(expr.canonicalize());
    }
    for constraint in constraints {
        match constraint {
            Constraint::Equal(lhs, rhs) => {
                union_find.union(lhs.canonicalize(), rhs.canonicalize());
            }
            other => {
                return Err(Error::unsupported(format!("constraint `{other}`")));
            }
        }
    }

    let mut mapping = SubstitutionMap::new();
    for cluster in union_find.clusters() {
        let Some(representative) = cluster.iter().min().cloned() else {
            continue;
        };
        for member in cluster {
            if member != representative {
                tracing::debug!(
                    from = %member,
                    to = %representative,
                    "dim expr replaced by class representative"
                );
                mapping.insert(member, representative.clone());
            }
        }
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_constant_representative() {
        let s0 = DimExpr::sym("S0");
        let s1 = DimExpr::sym("S1");
        let mapping = canonicalize_with_constraints(
            [&s0, &s1],
            &[
                Constraint::Equal(s0.clone(), s1.clone()),
                Constraint::Equal(s1.clone(), DimExpr::Int(8)),
            ],
        )
        .unwrap();
        assert_eq!(
            mapping,
            SubstitutionMap::from([(s0, DimExpr::Int(8)), (s1, DimExpr::Int(8))])
        );
    }

    #[test]
    fn shorter_symbol_wins() {
        let long = DimExpr::sym("S10");
        let short = DimExpr::sym("S9");
        let mapping =
            canonicalize_with_constraints([], &[Constraint::Equal(long.clone(), short.clone())])
                .unwrap();
        assert_eq!(mapping.get(&long), Some(&short));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn self_equality_is_noop() {
        let s0 = DimExpr::sym("S0");
        let mapping =
            canonicalize_with_constraints([&s0], &[Constraint::Equal(s0.clone(), s0.clone())])
                .unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn other_kinds_are_unsupported() {
        let s0 = DimExpr::sym("S0");
        let err = canonicalize_with_constraints([], &[Constraint::GreaterThanOne(s0)]).unwrap_err();
        assert!(matches!(err.root(), Error::Unsupported { .. }));
    }
}
