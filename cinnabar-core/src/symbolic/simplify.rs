//! Canonicalization of [`DimExpr`] trees.
//!
//! Rules applied bottom-up:
//! - nested same-kind variadic nodes are flattened,
//! - constants are folded into a single `Int` operand,
//! - like terms of an `Add` are collected (`2*S0 + S0 -> 3*S0`),
//! - `x` and `1/x` cancel inside a `Mul`,
//! - `Max`/`Min`/`Broadcast` operands are deduplicated,
//! - operands are sorted by the [`DimExpr`] priority order,
//! - singleton variadic nodes collapse to their operand.
//!
//! Folding never wraps or clamps: a constant whose fold would overflow `i64`
//! stays behind as a separate operand.

use std::{collections::BTreeMap, sync::Arc};

use super::dim_expr::DimExpr;

const MAX_SIMPLIFY_ROUNDS: usize = 16;

pub(crate) fn simplify(expr: &DimExpr) -> DimExpr {
    let mut current = simplify_once(expr);
    for _ in 0..MAX_SIMPLIFY_ROUNDS {
        let next = simplify_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn simplify_once(expr: &DimExpr) -> DimExpr {
    match expr {
        DimExpr::Int(_) | DimExpr::Sym(_) => expr.clone(),
        DimExpr::Negative(x) => negate(simplify_once(x)),
        DimExpr::Reciprocal(x) => invert(simplify_once(x)),
        DimExpr::Add(xs) => fold_add(xs.iter().map(simplify_once).collect()),
        DimExpr::Mul(xs) => fold_mul(xs.iter().map(simplify_once).collect()),
        DimExpr::Max(xs) => fold_extremum(xs.iter().map(simplify_once).collect(), true),
        DimExpr::Min(xs) => fold_extremum(xs.iter().map(simplify_once).collect(), false),
        DimExpr::Broadcast(xs) => fold_broadcast(xs.iter().map(simplify_once).collect()),
    }
}

fn variadic_of(ctor: fn(Arc<[DimExpr]>) -> DimExpr, mut operands: Vec<DimExpr>) -> DimExpr {
    if operands.len() == 1 {
        return operands.remove(0);
    }
    ctor(operands.into())
}

fn negate(x: DimExpr) -> DimExpr {
    match x {
        DimExpr::Int(c) => match c.checked_neg() {
            Some(v) => DimExpr::Int(v),
            None => DimExpr::Negative(Arc::new(DimExpr::Int(c))),
        },
        DimExpr::Negative(inner) => (*inner).clone(),
        DimExpr::Add(xs) => fold_add(xs.iter().cloned().map(negate).collect()),
        DimExpr::Mul(xs) => match xs.first().and_then(DimExpr::as_int).and_then(i64::checked_neg)
        {
            Some(c) => {
                let mut operands = xs.to_vec();
                operands[0] = DimExpr::Int(c);
                fold_mul(operands)
            }
            None => DimExpr::Negative(Arc::new(DimExpr::Mul(xs))),
        },
        other => DimExpr::Negative(Arc::new(other)),
    }
}

fn invert(x: DimExpr) -> DimExpr {
    match x {
        DimExpr::Int(1) | DimExpr::Int(-1) => x,
        DimExpr::Int(c) if c < 0 => match c.checked_neg() {
            Some(v) => negate(invert(DimExpr::Int(v))),
            None => DimExpr::Reciprocal(Arc::new(x)),
        },
        DimExpr::Reciprocal(inner) => (*inner).clone(),
        DimExpr::Negative(inner) => negate(invert((*inner).clone())),
        DimExpr::Mul(xs) => fold_mul(xs.iter().cloned().map(invert).collect()),
        other => DimExpr::Reciprocal(Arc::new(other)),
    }
}

fn gcd(a: i64, b: i64) -> u64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Split an `Add` term into `(coefficient, rest)`; `rest == None` means a constant.
fn split_term(term: &DimExpr) -> (i64, Option<DimExpr>) {
    match term {
        DimExpr::Int(c) => (*c, None),
        DimExpr::Negative(inner) => {
            let (k, rest) = split_term(inner);
            match k.checked_neg() {
                Some(k) => (k, rest),
                None => (1, Some(term.clone())),
            }
        }
        DimExpr::Mul(xs) => match xs.first() {
            Some(DimExpr::Int(c)) => {
                let rest = xs[1..].to_vec();
                (*c, Some(variadic_of(DimExpr::Mul, rest)))
            }
            _ => (1, Some(term.clone())),
        },
        other => (1, Some(other.clone())),
    }
}

fn fold_add(operands: Vec<DimExpr>) -> DimExpr {
    let mut flat = Vec::with_capacity(operands.len());
    for x in operands {
        match x {
            DimExpr::Add(xs) => flat.extend(xs.iter().cloned()),
            other => flat.push(other),
        }
    }

    let mut constant = 0i64;
    let mut coefficients: BTreeMap<DimExpr, i64> = BTreeMap::new();
    let mut unfolded = Vec::new();
    for term in &flat {
        match split_term(term) {
            (c, None) => match constant.checked_add(c) {
                Some(sum) => constant = sum,
                None => unfolded.push(DimExpr::Int(c)),
            },
            (c, Some(rest)) => {
                let entry = coefficients.entry(rest).or_insert(0);
                match entry.checked_add(c) {
                    Some(sum) => *entry = sum,
                    None => unfolded.push(term.clone()),
                }
            }
        }
    }

    let mut terms = unfolded;
    for (rest, coefficient) in coefficients {
        match coefficient {
            0 => {}
            1 => terms.push(rest),
            -1 => terms.push(negate(rest)),
            c => terms.push(fold_mul(vec![DimExpr::Int(c), rest])),
        }
    }
    if constant != 0 {
        terms.push(DimExpr::Int(constant));
    }
    if terms.is_empty() {
        return DimExpr::Int(0);
    }
    // A rebuilt term may itself be an Add after negation; flatten once more.
    if terms.iter().any(|t| matches!(t, DimExpr::Add(_))) {
        return fold_add(terms);
    }
    terms.sort();
    variadic_of(DimExpr::Add, terms)
}

fn fold_mul(operands: Vec<DimExpr>) -> DimExpr {
    let mut flat = Vec::with_capacity(operands.len());
    let mut negative = false;
    let mut pending = operands;
    while let Some(x) = pending.pop() {
        match x {
            DimExpr::Mul(xs) => pending.extend(xs.iter().cloned()),
            DimExpr::Negative(inner) => {
                negative = !negative;
                pending.push((*inner).clone());
            }
            other => flat.push(other),
        }
    }

    let mut numerator = 1i64;
    let mut denominator = 1i64;
    let mut others: Vec<DimExpr> = Vec::new();
    for x in flat {
        match x {
            DimExpr::Int(0) => return DimExpr::Int(0),
            DimExpr::Int(c) => match numerator.checked_mul(c) {
                Some(product) => numerator = product,
                None => others.push(DimExpr::Int(c)),
            },
            DimExpr::Reciprocal(inner) => {
                let folded = inner
                    .as_int()
                    .filter(|d| *d != 0)
                    .and_then(|d| Some((d < 0, denominator.checked_mul(d.checked_abs()?)?)));
                match folded {
                    Some((flip, product)) => {
                        negative ^= flip;
                        denominator = product;
                    }
                    None => others.push(DimExpr::Reciprocal(inner)),
                }
            }
            other => others.push(other),
        }
    }
    if negative {
        match numerator.checked_neg() {
            Some(v) => numerator = v,
            None => others.push(DimExpr::Int(-1)),
        }
    }
    if let Ok(g) = i64::try_from(gcd(numerator, denominator)) {
        if g > 1 {
            numerator /= g;
            denominator /= g;
        }
    }

    // Cancel x against 1/x.
    let mut cancelled = vec![false; others.len()];
    for i in 0..others.len() {
        if cancelled[i] {
            continue;
        }
        if let DimExpr::Reciprocal(inner) = &others[i] {
            let partner = (0..others.len())
                .find(|&j| !cancelled[j] && j != i && others[j] == **inner);
            if let Some(j) = partner {
                cancelled[i] = true;
                cancelled[j] = true;
            }
        }
    }
    let mut factors: Vec<DimExpr> = others
        .into_iter()
        .zip(cancelled)
        .filter_map(|(x, gone)| (!gone).then_some(x))
        .collect();
    if denominator != 1 {
        factors.push(DimExpr::Reciprocal(Arc::new(DimExpr::Int(denominator))));
    }

    let sign_only = numerator == 1 || numerator == -1;
    if factors.is_empty() {
        return DimExpr::Int(numerator);
    }
    if !sign_only {
        factors.push(DimExpr::Int(numerator));
    }
    factors.sort();
    let product = variadic_of(DimExpr::Mul, factors);
    if numerator == -1 {
        negate(product)
    } else {
        product
    }
}

fn fold_extremum(operands: Vec<DimExpr>, is_max: bool) -> DimExpr {
    let mut flat = Vec::with_capacity(operands.len());
    let mut pending = operands;
    while let Some(x) = pending.pop() {
        match x {
            DimExpr::Max(xs) if is_max => pending.extend(xs.iter().cloned()),
            DimExpr::Min(xs) if !is_max => pending.extend(xs.iter().cloned()),
            other => flat.push(other),
        }
    }

    let mut constant: Option<i64> = None;
    let mut others = Vec::new();
    for x in flat {
        match x {
            DimExpr::Int(c) => {
                constant = Some(match constant {
                    Some(prev) if is_max => prev.max(c),
                    Some(prev) => prev.min(c),
                    None => c,
                })
            }
            other => others.push(other),
        }
    }
    if let Some(c) = constant {
        others.push(DimExpr::Int(c));
    }
    others.sort();
    others.dedup();
    if is_max {
        variadic_of(DimExpr::Max, others)
    } else {
        variadic_of(DimExpr::Min, others)
    }
}

fn fold_broadcast(operands: Vec<DimExpr>) -> DimExpr {
    let mut flat = Vec::with_capacity(operands.len());
    let mut pending = operands;
    while let Some(x) = pending.pop() {
        match x {
            DimExpr::Broadcast(xs) => pending.extend(xs.iter().cloned()),
            other => flat.push(other),
        }
    }
    flat.sort();
    flat.dedup();
    if flat.len() > 1 {
        flat.retain(|x| *x != DimExpr::Int(1));
    }
    variadic_of(DimExpr::Broadcast, flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::dim_expr::VariadicKind;

    fn s(name: &str) -> DimExpr {
        DimExpr::sym(name)
    }

    #[test]
    fn flattens_and_folds() {
        let raw = DimExpr::raw_variadic(
            VariadicKind::Add,
            vec![
                DimExpr::Int(2),
                DimExpr::raw_variadic(VariadicKind::Add, vec![s("S1"), DimExpr::Int(3)]),
                s("S0"),
            ],
        );
        let canonical = simplify(&raw);
        assert_eq!(canonical.to_string(), "(5 + S0 + S1)");
    }

    #[test]
    fn singleton_collapses() {
        let raw = DimExpr::raw_variadic(VariadicKind::Mul, vec![s("S0")]);
        assert_eq!(simplify(&raw), s("S0"));
    }

    #[test]
    fn reciprocal_cancels() {
        let e = DimExpr::mul(vec![s("S0"), s("S1"), s("S0").reciprocal()]);
        assert_eq!(e, s("S1"));
        let e = DimExpr::mul(vec![DimExpr::Int(6), DimExpr::Int(2).reciprocal()]);
        assert_eq!(e, DimExpr::Int(3));
    }

    #[test]
    fn negation_cancels_in_add() {
        let e = s("S0") + s("S1") - s("S0");
        assert_eq!(e, s("S1"));
        assert_eq!(s("S0") - s("S0"), DimExpr::Int(0));
    }

    #[test]
    fn max_min_fold_constants() {
        let e = DimExpr::max(vec![DimExpr::Int(3), s("S0"), DimExpr::Int(7)]);
        assert_eq!(e.to_string(), "max(7, S0)");
        let e = DimExpr::min(vec![DimExpr::Int(3), DimExpr::Int(7)]);
        assert_eq!(e, DimExpr::Int(3));
    }

    #[test]
    fn broadcast_drops_unit_extents() {
        let e = DimExpr::broadcast(vec![DimExpr::Int(1), s("S0"), s("S0")]);
        assert_eq!(e, s("S0"));
    }

    #[test]
    fn mul_by_zero() {
        assert_eq!(s("S0") * 0, DimExpr::Int(0));
    }

    #[test]
    fn negative_constant_factor() {
        let e = -(s("S0") * 2);
        assert_eq!(e.to_string(), "(-2 * S0)");
        let e = -(s("S0") * s("S1"));
        assert_eq!(e.to_string(), "-(S0 * S1)");
        assert_eq!(-(-s("S0")), s("S0"));
    }

    #[test]
    fn overflowing_constants_stay_unfolded() {
        let e = DimExpr::add(vec![DimExpr::Int(i64::MAX), DimExpr::Int(1)]);
        assert_ne!(e, DimExpr::Int(i64::MAX));
        assert_eq!(e.evaluate(&|_: &str| None), None);

        let e = DimExpr::mul(vec![DimExpr::Int(i64::MAX), DimExpr::Int(2), s("S0")]);
        assert_ne!(e, DimExpr::mul(vec![DimExpr::Int(i64::MAX), s("S0")]));
        assert_eq!(e.evaluate(&|name: &str| (name == "S0").then_some(1)), None);

        // Folds that fit are still taken.
        let e = DimExpr::add(vec![DimExpr::Int(i64::MAX), DimExpr::Int(-1), DimExpr::Int(1)]);
        assert_eq!(e, DimExpr::Int(i64::MAX));
    }
}
