//! Shape buckets: predicate-guarded specializations of one group.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use crate::{
    config::CompileConfig,
    symbolic::{substitute_dims, DimExpr, SubstitutionMap},
    Error, Result,
};

use super::{provably_disjoint, CondExpr};

/// Nested broadcast dims specialized per bucket, at most.
const MAX_BROADCAST_DEPTH: usize = 4;

/// A caller-requested bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketSpec {
    pub predicate: CondExpr,
    pub variant: String,
}

impl BucketSpec {
    pub fn new(predicate: CondExpr, variant: impl Into<String>) -> Self {
        Self {
            predicate,
            variant: variant.into(),
        }
    }
}

/// One bucket to lower: its final predicate and the dim replacements that
/// hold whenever the predicate does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPlan {
    pub predicate: CondExpr,
    pub variant: Option<String>,
    pub substitution: SubstitutionMap,
}

impl BucketPlan {
    /// The single unconditional bucket.
    pub fn unconditional() -> Self {
        Self {
            predicate: CondExpr::True,
            variant: None,
            substitution: SubstitutionMap::new(),
        }
    }
}

impl Display for BucketPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "if {}", self.predicate)?;
        if let Some(variant) = &self.variant {
            write!(f, " => {variant}")?;
        }
        for (from, to) in &self.substitution {
            write!(f, " [{from} -> {to}]")?;
        }
        Ok(())
    }
}

/// Device kernel name of one bucket of `fn_name`.
pub fn kernel_name(fn_name: &str, predicate: &CondExpr) -> String {
    format!("{fn_name}__COND_{}__kernel", predicate.encode())
}

/// Conjoin every predicate with the negation of each earlier one it may
/// overlap with, so that at most one predicate holds for any input.
pub fn make_exclusive(specs: &[BucketSpec]) -> Vec<BucketSpec> {
    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let guards = specs[..i]
                .iter()
                .filter(|earlier| !provably_disjoint(&spec.predicate, &earlier.predicate))
                .map(|earlier| earlier.predicate.negate());
            let predicate = CondExpr::all(std::iter::once(spec.predicate.clone()).chain(guards));
            BucketSpec::new(predicate, spec.variant.clone())
        })
        .collect()
}

fn first_broadcast(shapes: &[Vec<DimExpr>]) -> Option<(DimExpr, Vec<DimExpr>)> {
    let mut found = None;
    for dim in shapes.iter().flatten() {
        dim.walk(&mut |node| {
            if found.is_none() {
                if let DimExpr::Broadcast(xs) = node {
                    found = Some((node.clone(), xs.to_vec()));
                }
            }
        });
        if found.is_some() {
            break;
        }
    }
    found
}

/// Unit-extent replacement for `dim` when it is a bare symbol.
fn bind_unit(map: &mut SubstitutionMap, dim: &DimExpr) {
    if dim.as_sym().is_some() {
        map.insert(dim.clone(), DimExpr::Int(1));
    }
}

fn compose(outer: &SubstitutionMap, inner: &SubstitutionMap) -> SubstitutionMap {
    let mut out: SubstitutionMap = outer
        .iter()
        .map(|(k, v)| (k.clone(), crate::symbolic::substitute(v, inner)))
        .collect();
    for (k, v) in inner {
        out.entry(k.clone()).or_insert_with(|| v.clone());
    }
    out
}

fn broadcast_tree(
    shapes: &[Vec<DimExpr>],
    predicate: CondExpr,
    substitution: SubstitutionMap,
    depth: usize,
    out: &mut Vec<BucketPlan>,
) {
    let found = (depth < MAX_BROADCAST_DEPTH)
        .then(|| first_broadcast(shapes))
        .flatten();
    let Some((node, operands)) = found else {
        out.push(BucketPlan {
            predicate,
            variant: None,
            substitution,
        });
        return;
    };
    let a = operands[0].clone();
    let b = DimExpr::broadcast(operands[1..].to_vec());

    let same = CondExpr::eq(&a, &b);
    let a_unit = CondExpr::and(CondExpr::ne(&a, &b), CondExpr::eq(&a, 1));
    let b_unit = CondExpr::all([
        CondExpr::ne(&a, &b),
        CondExpr::ne(&a, 1),
        CondExpr::eq(&b, 1),
    ]);

    let mut same_map = SubstitutionMap::new();
    same_map.insert(node.clone(), a.clone());
    let mut a_unit_map = SubstitutionMap::new();
    a_unit_map.insert(node.clone(), b.clone());
    bind_unit(&mut a_unit_map, &a);
    let mut b_unit_map = SubstitutionMap::new();
    b_unit_map.insert(node, a.clone());
    bind_unit(&mut b_unit_map, &b);

    for (branch, local) in [(same, same_map), (a_unit, a_unit_map), (b_unit, b_unit_map)] {
        let specialized: Vec<Vec<DimExpr>> =
            shapes.iter().map(|s| substitute_dims(s, &local)).collect();
        broadcast_tree(
            &specialized,
            CondExpr::all([predicate.clone(), branch]),
            compose(&substitution, &local),
            depth + 1,
            out,
        );
    }
}

/// Buckets of one group.
///
/// Without `bucket_compile` there is exactly one unconditional bucket.
/// Otherwise explicit `specs` are made mutually exclusive, and without specs
/// the symbolic broadcasts among `shapes` are specialized by a decision tree.
/// Every symbol a predicate reads must be in `bound`.
pub fn plan_buckets(
    config: &CompileConfig,
    shapes: &[Vec<DimExpr>],
    specs: &[BucketSpec],
    bound: &BTreeSet<String>,
) -> Result<Vec<BucketPlan>> {
    if !config.bucket_compile {
        if !specs.is_empty() {
            tracing::debug!(specs = specs.len(), "bucket compilation disabled, ignoring specs");
        }
        return Ok(vec![BucketPlan::unconditional()]);
    }

    let plans = if specs.is_empty() {
        let mut plans = Vec::new();
        broadcast_tree(shapes, CondExpr::True, SubstitutionMap::new(), 0, &mut plans);
        plans
    } else {
        make_exclusive(specs)
            .into_iter()
            .map(|spec| BucketPlan {
                predicate: spec.predicate,
                variant: Some(spec.variant),
                substitution: SubstitutionMap::new(),
            })
            .collect()
    };

    for plan in &plans {
        if let Some(unbound) = plan.predicate.symbols().into_iter().find(|s| !bound.contains(s)) {
            return Err(Error::Predicate {
                predicate: plan.predicate.to_string(),
                reason: format!("symbol {unbound} is not bound by any group input"),
            });
        }
    }
    tracing::debug!(buckets = plans.len(), "planned buckets");
    Ok(plans)
}

/// Shapes of every tensor specialized to one bucket.
pub(crate) fn specialize<K: Ord + Clone>(
    shapes: &BTreeMap<K, Vec<DimExpr>>,
    plan: &BucketPlan,
) -> BTreeMap<K, Vec<DimExpr>> {
    shapes
        .iter()
        .map(|(k, dims)| (k.clone(), substitute_dims(dims, &plan.substitution)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn disjoint_specs_stay_unchanged() {
        let specs = [
            BucketSpec::new(CondExpr::lt("S0", 1024), "A"),
            BucketSpec::new(CondExpr::ge("S0", 1024), "B"),
        ];
        let out = make_exclusive(&specs);
        assert_eq!(out, specs);
    }

    #[test]
    fn overlapping_specs_are_guarded() {
        let specs = [
            BucketSpec::new(CondExpr::lt("S0", 1024), "A"),
            BucketSpec::new(CondExpr::lt("S0", 4096), "B"),
        ];
        let out = make_exclusive(&specs);
        assert_eq!(
            out[1].predicate,
            CondExpr::and(CondExpr::lt("S0", 4096), CondExpr::ge("S0", 1024))
        );
    }

    #[test]
    fn broadcast_tree_has_three_branches() {
        let config = CompileConfig::default().with_bucket_compile(true);
        let (s0, s1) = (DimExpr::sym("S0"), DimExpr::sym("S1"));
        let shapes = vec![vec![DimExpr::broadcast(vec![s0.clone(), s1.clone()]), 4.into()]];
        let plans = plan_buckets(&config, &shapes, &[], &bound(&["S0", "S1"])).unwrap();
        assert_eq!(plans.len(), 3);
        let specialized: Vec<_> = plans
            .iter()
            .map(|p| substitute_dims(&shapes[0], &p.substitution)[0].clone())
            .collect();
        assert_eq!(specialized, vec![s0.clone(), s1, s0]);
        let env = BTreeMap::from([("S0".to_string(), 1), ("S1".to_string(), 7)]);
        let holding: Vec<_> = plans.iter().filter(|p| p.predicate.holds(&env).unwrap()).collect();
        assert_eq!(holding.len(), 1);
    }

    #[test]
    fn no_broadcast_means_one_true_bucket() {
        let config = CompileConfig::default().with_bucket_compile(true);
        let plans =
            plan_buckets(&config, &[vec![DimExpr::sym("S0")]], &[], &bound(&["S0"])).unwrap();
        assert_eq!(plans, vec![BucketPlan::unconditional()]);
        assert_eq!(kernel_name("fn_0_exp", &plans[0].predicate), "fn_0_exp__COND_TRUE__kernel");
    }

    #[test]
    fn unbound_predicate_symbol_fails() {
        let config = CompileConfig::default().with_bucket_compile(true);
        let specs = [BucketSpec::new(CondExpr::lt("S7", 4), "A")];
        let err = plan_buckets(&config, &[], &specs, &bound(&["S0"])).unwrap_err();
        assert!(matches!(err, Error::Predicate { .. }));
    }
}
