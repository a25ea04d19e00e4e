//! Bucket predicates.
//!
//! A [`CondExpr`] is an arithmetic/boolean expression over [`DimExpr`]
//! leaves that evaluates to an integer at launch time; nonzero means true.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use crate::{symbolic::DimExpr, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CondOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl CondOp {
    /// Token used in kernel names.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::And => "AND",
            Self::Or => "OR",
        }
    }

    /// C operator used by the host launcher.
    pub fn c_op(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CondExpr {
    True,
    Dim(DimExpr),
    Binary(CondOp, Box<CondExpr>, Box<CondExpr>),
}

macro_rules! cond_ctor {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(lhs: impl Into<CondExpr>, rhs: impl Into<CondExpr>) -> Self {
                Self::binary(CondOp::$op, lhs, rhs)
            }
        )*
    };
}

impl CondExpr {
    pub fn binary(op: CondOp, lhs: impl Into<CondExpr>, rhs: impl Into<CondExpr>) -> Self {
        Self::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    cond_ctor! {
        eq => Eq, ne => Ne, lt => Lt, le => Le, gt => Gt, ge => Ge,
        and => And, or => Or,
        add => Add, sub => Sub, mul => Mul, div => Div, modulo => Mod,
    }

    /// Conjunction of all `terms`; `True` when empty.
    pub fn all(terms: impl IntoIterator<Item = CondExpr>) -> Self {
        terms
            .into_iter()
            .filter(|t| *t != Self::True)
            .reduce(|a, b| Self::and(a, b))
            .unwrap_or(Self::True)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }

    /// Logical negation, pushed down to the comparisons.
    pub fn negate(&self) -> Self {
        match self {
            Self::True => Self::Dim(DimExpr::Int(0)),
            Self::Dim(d) => Self::eq(d.clone(), DimExpr::Int(0)),
            Self::Binary(op, lhs, rhs) => {
                let (l, r) = ((**lhs).clone(), (**rhs).clone());
                match op {
                    CondOp::Eq => Self::ne(l, r),
                    CondOp::Ne => Self::eq(l, r),
                    CondOp::Lt => Self::ge(l, r),
                    CondOp::Ge => Self::lt(l, r),
                    CondOp::Le => Self::gt(l, r),
                    CondOp::Gt => Self::le(l, r),
                    CondOp::And => Self::or(lhs.negate(), rhs.negate()),
                    CondOp::Or => Self::and(lhs.negate(), rhs.negate()),
                    _ => Self::eq(self.clone(), DimExpr::Int(0)),
                }
            }
        }
    }

    /// Every symbol name referenced.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::True => {}
            Self::Dim(d) => out.extend(d.symbols().iter().map(|s| s.to_string())),
            Self::Binary(_, l, r) => {
                l.collect_symbols(out);
                r.collect_symbols(out);
            }
        }
    }

    pub fn evaluate(&self, env: &BTreeMap<String, i64>) -> Result<i64> {
        let lookup = |name: &str| env.get(name).copied();
        match self {
            Self::True => Ok(1),
            Self::Dim(d) => d.evaluate(&lookup).ok_or_else(|| Error::Predicate {
                predicate: self.to_string(),
                reason: format!("`{d}` is not evaluable with the bound symbols"),
            }),
            Self::Binary(op, l, r) => {
                let (a, b) = (l.evaluate(env)?, r.evaluate(env)?);
                let fail = |reason: &str| Error::Predicate {
                    predicate: self.to_string(),
                    reason: reason.to_string(),
                };
                Ok(match op {
                    CondOp::Add => a.checked_add(b).ok_or_else(|| fail("overflow"))?,
                    CondOp::Sub => a.checked_sub(b).ok_or_else(|| fail("overflow"))?,
                    CondOp::Mul => a.checked_mul(b).ok_or_else(|| fail("overflow"))?,
                    CondOp::Div => a.checked_div(b).ok_or_else(|| fail("division by zero"))?,
                    CondOp::Mod => a.checked_rem(b).ok_or_else(|| fail("division by zero"))?,
                    CondOp::Eq => (a == b) as i64,
                    CondOp::Ne => (a != b) as i64,
                    CondOp::Lt => (a < b) as i64,
                    CondOp::Le => (a <= b) as i64,
                    CondOp::Gt => (a > b) as i64,
                    CondOp::Ge => (a >= b) as i64,
                    CondOp::And => (a != 0 && b != 0) as i64,
                    CondOp::Or => (a != 0 || b != 0) as i64,
                })
            }
        }
    }

    pub fn holds(&self, env: &BTreeMap<String, i64>) -> Result<bool> {
        Ok(self.evaluate(env)? != 0)
    }

    /// Identifier-safe prefix encoding: `_FPA_<lhs><OP><rhs>_BPA_`.
    pub fn encode(&self) -> String {
        match self {
            Self::True => "TRUE".to_string(),
            Self::Dim(d) => encode_dim(d),
            Self::Binary(op, l, r) => {
                format!("_FPA_{}{}{}_BPA_", l.encode(), op.token(), r.encode())
            }
        }
    }

    /// Render as a C expression over `int64_t` symbol variables.
    pub fn to_c(&self) -> String {
        match self {
            Self::True => "true".to_string(),
            Self::Dim(d) => dim_to_c(d),
            Self::Binary(op, l, r) => format!("({} {} {})", l.to_c(), op.c_op(), r.to_c()),
        }
    }
}

fn encode_joined(tag: &str, xs: &[DimExpr]) -> String {
    let inner = xs.iter().map(encode_dim).collect::<Vec<_>>().join(tag);
    format!("_FPA_{inner}_BPA_")
}

fn encode_dim(d: &DimExpr) -> String {
    match d {
        DimExpr::Int(v) if *v < 0 => format!("NEG{}", v.unsigned_abs()),
        DimExpr::Int(v) => v.to_string(),
        DimExpr::Sym(name) => name.to_string(),
        DimExpr::Negative(x) => format!("NEG{}", encode_dim(x)),
        DimExpr::Reciprocal(x) => format!("RCP{}", encode_dim(x)),
        DimExpr::Add(xs) => encode_joined("ADD", xs),
        DimExpr::Mul(xs) => encode_joined("MUL", xs),
        DimExpr::Max(xs) => encode_joined("MAX", xs),
        DimExpr::Min(xs) => encode_joined("MIN", xs),
        DimExpr::Broadcast(xs) => encode_joined("BCAST", xs),
    }
}

/// C rendering of a dim expression; `Broadcast` becomes `max`, which agrees
/// with it whenever the broadcast is valid.
pub(crate) fn dim_to_c(d: &DimExpr) -> String {
    let join = |xs: &[DimExpr], op: &str| {
        let parts = xs.iter().map(dim_to_c).collect::<Vec<_>>();
        format!("({})", parts.join(op))
    };
    let fold = |xs: &[DimExpr], f: &str| {
        let mut it = xs.iter().map(dim_to_c);
        let first = it.next().unwrap_or_else(|| "0".to_string());
        it.fold(first, |acc, x| format!("{f}({acc}, {x})"))
    };
    match d {
        DimExpr::Int(v) => format!("{v}ll"),
        DimExpr::Sym(name) => name.to_string(),
        DimExpr::Negative(x) => format!("(-{})", dim_to_c(x)),
        DimExpr::Reciprocal(x) => format!("(1ll / {})", dim_to_c(x)),
        DimExpr::Add(xs) => join(xs, " + "),
        DimExpr::Mul(xs) => join(xs, " * "),
        DimExpr::Max(xs) | DimExpr::Broadcast(xs) => fold(xs, "max"),
        DimExpr::Min(xs) => fold(xs, "min"),
    }
}

impl Display for CondExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => f.write_str("true"),
            Self::Dim(d) => write!(f, "{d}"),
            Self::Binary(op, l, r) => write!(f, "({l} {} {r})", op.c_op()),
        }
    }
}

impl From<DimExpr> for CondExpr {
    fn from(value: DimExpr) -> Self {
        Self::Dim(value)
    }
}

impl From<&DimExpr> for CondExpr {
    fn from(value: &DimExpr) -> Self {
        Self::Dim(value.clone())
    }
}

impl From<i64> for CondExpr {
    fn from(value: i64) -> Self {
        Self::Dim(DimExpr::Int(value))
    }
}

impl From<i32> for CondExpr {
    fn from(value: i32) -> Self {
        Self::Dim(DimExpr::Int(value as i64))
    }
}

impl From<&str> for CondExpr {
    fn from(value: &str) -> Self {
        Self::Dim(DimExpr::sym(value))
    }
}

/// Closed integer interval per symbol plus excluded points, for the
/// conjunctive comparisons of a predicate.
#[derive(Debug, Default, Clone)]
struct Bounds {
    ranges: BTreeMap<String, (i64, i64)>,
    excluded: BTreeMap<String, BTreeSet<i64>>,
}

impl Bounds {
    fn of(cond: &CondExpr) -> Self {
        let mut bounds = Self::default();
        bounds.collect(cond);
        bounds
    }

    fn narrow(&mut self, sym: &str, lo: i64, hi: i64) {
        let entry = self
            .ranges
            .entry(sym.to_string())
            .or_insert((i64::MIN, i64::MAX));
        entry.0 = entry.0.max(lo);
        entry.1 = entry.1.min(hi);
    }

    fn collect(&mut self, cond: &CondExpr) {
        let CondExpr::Binary(op, l, r) = cond else {
            return;
        };
        if *op == CondOp::And {
            self.collect(l);
            self.collect(r);
            return;
        }
        if !op.is_comparison() {
            return;
        }
        // Normalize to `sym <op> constant`.
        let (sym, value, op) = match (&**l, &**r) {
            (CondExpr::Dim(DimExpr::Sym(s)), CondExpr::Dim(DimExpr::Int(v))) => (s, *v, *op),
            (CondExpr::Dim(DimExpr::Int(v)), CondExpr::Dim(DimExpr::Sym(s))) => {
                let flipped = match op {
                    CondOp::Lt => CondOp::Gt,
                    CondOp::Le => CondOp::Ge,
                    CondOp::Gt => CondOp::Lt,
                    CondOp::Ge => CondOp::Le,
                    other => *other,
                };
                (s, *v, flipped)
            }
            _ => return,
        };
        match op {
            CondOp::Eq => self.narrow(sym, value, value),
            CondOp::Lt => match value.checked_sub(1) {
                Some(hi) => self.narrow(sym, i64::MIN, hi),
                None => self.narrow(sym, i64::MAX, i64::MIN),
            },
            CondOp::Le => self.narrow(sym, i64::MIN, value),
            CondOp::Gt => match value.checked_add(1) {
                Some(lo) => self.narrow(sym, lo, i64::MAX),
                None => self.narrow(sym, i64::MAX, i64::MIN),
            },
            CondOp::Ge => self.narrow(sym, value, i64::MAX),
            CondOp::Ne => {
                self.excluded.entry(sym.to_string()).or_default().insert(value);
            }
            _ => {}
        }
    }

    fn point(&self, sym: &str) -> Option<i64> {
        self.ranges
            .get(sym)
            .and_then(|(lo, hi)| (lo == hi).then_some(*lo))
    }

    fn disjoint(&self, other: &Self) -> bool {
        let empty = |b: &Self| b.ranges.values().any(|(lo, hi)| lo > hi);
        if empty(self) || empty(other) {
            return true;
        }
        for (sym, (lo, hi)) in &self.ranges {
            if let Some((olo, ohi)) = other.ranges.get(sym) {
                if lo.max(olo) > hi.min(ohi) {
                    return true;
                }
            }
        }
        let excludes = |a: &Self, b: &Self| {
            a.excluded.iter().any(|(sym, points)| {
                b.point(sym).is_some_and(|p| points.contains(&p))
            })
        };
        excludes(self, other) || excludes(other, self)
    }
}

/// Whether no symbol assignment satisfies both predicates, as far as
/// interval reasoning over their conjunctive comparisons can tell.
pub fn provably_disjoint(a: &CondExpr, b: &CondExpr) -> bool {
    Bounds::of(a).disjoint(&Bounds::of(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_flips_comparisons() {
        let p = CondExpr::and(CondExpr::lt("S0", 1024), CondExpr::eq("S1", 1));
        assert_eq!(
            p.negate(),
            CondExpr::or(CondExpr::ge("S0", 1024), CondExpr::ne("S1", 1))
        );
    }

    #[test]
    fn evaluates() {
        let env = BTreeMap::from([("S0".to_string(), 512)]);
        assert!(CondExpr::lt("S0", 1024).holds(&env).unwrap());
        assert!(!CondExpr::ge("S0", 1024).holds(&env).unwrap());
        assert_eq!(CondExpr::modulo("S0", 7).evaluate(&env).unwrap(), 1);
        assert!(CondExpr::lt("S9", 1).evaluate(&env).is_err());
    }

    #[test]
    fn intervals() {
        assert!(provably_disjoint(&CondExpr::lt("S0", 1024), &CondExpr::ge("S0", 1024)));
        assert!(!provably_disjoint(&CondExpr::lt("S0", 1024), &CondExpr::ge("S0", 1000)));
        assert!(provably_disjoint(&CondExpr::eq("S0", 1), &CondExpr::ne("S0", 1)));
        assert!(!provably_disjoint(&CondExpr::lt("S0", 4), &CondExpr::lt("S1", 4)));
        assert!(provably_disjoint(&CondExpr::gt(8, "S0"), &CondExpr::ge("S0", 8)));
    }

    #[test]
    fn out_of_range_bounds_are_empty() {
        let never = CondExpr::lt("S0", i64::MIN);
        assert!(provably_disjoint(&never, &CondExpr::ge("S0", 0)));
        assert!(provably_disjoint(&CondExpr::gt("S0", i64::MAX), &CondExpr::lt("S0", 0)));
        assert!(!provably_disjoint(&CondExpr::le("S0", i64::MAX), &CondExpr::ge("S0", 0)));
    }
}
