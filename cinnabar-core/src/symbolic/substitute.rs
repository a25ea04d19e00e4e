use std::collections::BTreeMap;

use super::DimExpr;

/// A `{DimExpr -> DimExpr}` replacement table.
pub type SubstitutionMap = BTreeMap<DimExpr, DimExpr>;

/// Apply `mapping` to `expr` bottom-up, re-canonicalizing every rebuilt node.
///
/// A node matching a key is replaced before its children are visited;
/// rebuilt nodes are looked up again after canonicalization.
pub fn substitute(expr: &DimExpr, mapping: &SubstitutionMap) -> DimExpr {
    if mapping.is_empty() {
        return expr.clone();
    }
    substitute_node(expr, mapping)
}

fn substitute_all(xs: &[DimExpr], mapping: &SubstitutionMap) -> Vec<DimExpr> {
    xs.iter().map(|x| substitute_node(x, mapping)).collect()
}

fn substitute_node(expr: &DimExpr, mapping: &SubstitutionMap) -> DimExpr {
    if let Some(replacement) = mapping.get(expr) {
        return replacement.clone();
    }
    let rebuilt = match expr {
        DimExpr::Int(_) | DimExpr::Sym(_) => return expr.clone(),
        DimExpr::Negative(x) => -substitute_node(x, mapping),
        DimExpr::Reciprocal(x) => substitute_node(x, mapping).reciprocal(),
        DimExpr::Add(xs) => DimExpr::add(substitute_all(xs, mapping)),
        DimExpr::Mul(xs) => DimExpr::mul(substitute_all(xs, mapping)),
        DimExpr::Max(xs) => DimExpr::max(substitute_all(xs, mapping)),
        DimExpr::Min(xs) => DimExpr::min(substitute_all(xs, mapping)),
        DimExpr::Broadcast(xs) => DimExpr::broadcast(substitute_all(xs, mapping)),
    };
    match mapping.get(&rebuilt) {
        Some(replacement) => replacement.clone(),
        None => rebuilt,
    }
}

/// Apply `mapping` to every dim of a list.
pub fn substitute_dims(dims: &[DimExpr], mapping: &SubstitutionMap) -> Vec<DimExpr> {
    dims.iter().map(|d| substitute(d, mapping)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_nested_symbols() {
        let s0 = DimExpr::sym("S0");
        let s1 = DimExpr::sym("S1");
        let mapping = SubstitutionMap::from([(s0.clone(), DimExpr::Int(8))]);
        let e = s0.clone() * 2 + s1.clone();
        assert_eq!(substitute(&e, &mapping), s1 + 16);
    }

    #[test]
    fn identity_mapping_is_noop() {
        let s0 = DimExpr::sym("S0");
        let mapping = SubstitutionMap::from([(s0.clone(), s0.clone())]);
        let e = DimExpr::max(vec![s0.clone(), DimExpr::Int(4)]);
        assert_eq!(substitute(&e, &mapping), e);
    }

    #[test]
    fn whole_node_match_wins() {
        let s0 = DimExpr::sym("S0");
        let s1 = DimExpr::sym("S1");
        let key = DimExpr::broadcast(vec![s0.clone(), s1.clone()]);
        let mapping = SubstitutionMap::from([(key.clone(), s0.clone())]);
        assert_eq!(substitute(&(key * 4), &mapping), s0 * 4);
    }
}
