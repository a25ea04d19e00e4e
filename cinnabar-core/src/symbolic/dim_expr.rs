use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashSet},
    fmt::{Debug, Display},
    ops::{Add, Div, Mul, Neg, Sub},
    sync::Arc,
};

use super::simplify::simplify;

/// Operand list of a variadic [`DimExpr`] node.
pub type Operands = Arc<[DimExpr]>;

/// A symbolic expression over integer shape dimensions.
///
/// Expressions built through the constructors on this type ([`DimExpr::add`],
/// [`DimExpr::mul`], the arithmetic operators, ...) are always canonical:
/// variadic nodes are flattened, constant-folded and sorted, and never hold
/// fewer than two operands. The `raw_*` constructors skip canonicalization
/// and exist for passes that rebuild trees piecewise.
///
/// ```
/// use cinnabar_core::DimExpr;
///
/// let s0 = DimExpr::sym("S0");
/// let e = (s0.clone() * 3 + 2) + (s0.clone() * 2 - 2);
/// assert_eq!(e, s0 * 5);
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum DimExpr {
    Int(i64),
    Sym(Arc<str>),
    Negative(Arc<DimExpr>),
    Reciprocal(Arc<DimExpr>),
    Add(Operands),
    Mul(Operands),
    Max(Operands),
    Min(Operands),
    Broadcast(Operands),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKind {
    Negative,
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariadicKind {
    Add,
    Mul,
    Max,
    Min,
    Broadcast,
}

impl UnaryKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Negative => "Negative",
            Self::Reciprocal => "Reciprocal",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Negative" => Some(Self::Negative),
            "Reciprocal" => Some(Self::Reciprocal),
            _ => None,
        }
    }
}

impl VariadicKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Mul => "Mul",
            Self::Max => "Max",
            Self::Min => "Min",
            Self::Broadcast => "Broadcast",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Add" => Some(Self::Add),
            "Mul" => Some(Self::Mul),
            "Max" => Some(Self::Max),
            "Min" => Some(Self::Min),
            "Broadcast" => Some(Self::Broadcast),
            _ => None,
        }
    }
}

impl DimExpr {
    pub fn int(value: i64) -> Self {
        Self::Int(value)
    }

    pub fn sym(name: &str) -> Self {
        Self::Sym(Arc::from(name))
    }

    /// Build a unary node without canonicalizing it.
    pub fn raw_unary(kind: UnaryKind, operand: DimExpr) -> Self {
        let operand = Arc::new(operand);
        match kind {
            UnaryKind::Negative => Self::Negative(operand),
            UnaryKind::Reciprocal => Self::Reciprocal(operand),
        }
    }

    /// Build a variadic node without canonicalizing it.
    ///
    /// # Panics
    /// An empty operand list is ill-typed and aborts.
    pub fn raw_variadic(kind: VariadicKind, operands: Vec<DimExpr>) -> Self {
        assert!(
            !operands.is_empty(),
            "variadic `{}` node built with no operands",
            kind.tag()
        );
        let operands: Operands = operands.into();
        match kind {
            VariadicKind::Add => Self::Add(operands),
            VariadicKind::Mul => Self::Mul(operands),
            VariadicKind::Max => Self::Max(operands),
            VariadicKind::Min => Self::Min(operands),
            VariadicKind::Broadcast => Self::Broadcast(operands),
        }
    }

    pub fn unary(kind: UnaryKind, operand: DimExpr) -> Self {
        Self::raw_unary(kind, operand).canonicalize()
    }

    pub fn variadic(kind: VariadicKind, operands: Vec<DimExpr>) -> Self {
        Self::raw_variadic(kind, operands).canonicalize()
    }

    pub fn add(operands: Vec<DimExpr>) -> Self {
        Self::variadic(VariadicKind::Add, operands)
    }

    pub fn mul(operands: Vec<DimExpr>) -> Self {
        Self::variadic(VariadicKind::Mul, operands)
    }

    pub fn max(operands: Vec<DimExpr>) -> Self {
        Self::variadic(VariadicKind::Max, operands)
    }

    pub fn min(operands: Vec<DimExpr>) -> Self {
        Self::variadic(VariadicKind::Min, operands)
    }

    pub fn broadcast(operands: Vec<DimExpr>) -> Self {
        Self::variadic(VariadicKind::Broadcast, operands)
    }

    pub fn reciprocal(&self) -> Self {
        Self::unary(UnaryKind::Reciprocal, self.clone())
    }

    /// Product of a list of dims; `1` for an empty list.
    pub fn product<'a>(dims: impl IntoIterator<Item = &'a DimExpr>) -> Self {
        let operands: Vec<_> = dims.into_iter().cloned().collect();
        if operands.is_empty() {
            return Self::Int(1);
        }
        Self::mul(operands)
    }

    /// Rewrite into canonical form. Idempotent.
    pub fn canonicalize(&self) -> Self {
        simplify(self)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<&str> {
        match self {
            Self::Sym(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub fn is_static(&self) -> bool {
        self.symbols().is_empty()
    }

    pub fn as_unary(&self) -> Option<(UnaryKind, &DimExpr)> {
        match self {
            Self::Negative(x) => Some((UnaryKind::Negative, x)),
            Self::Reciprocal(x) => Some((UnaryKind::Reciprocal, x)),
            _ => None,
        }
    }

    pub fn as_variadic(&self) -> Option<(VariadicKind, &[DimExpr])> {
        match self {
            Self::Add(xs) => Some((VariadicKind::Add, xs)),
            Self::Mul(xs) => Some((VariadicKind::Mul, xs)),
            Self::Max(xs) => Some((VariadicKind::Max, xs)),
            Self::Min(xs) => Some((VariadicKind::Min, xs)),
            Self::Broadcast(xs) => Some((VariadicKind::Broadcast, xs)),
            _ => None,
        }
    }

    /// All symbol names referenced by this expression.
    pub fn symbols(&self) -> BTreeSet<Arc<str>> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    pub(crate) fn collect_symbols(&self, out: &mut BTreeSet<Arc<str>>) {
        match self {
            Self::Int(_) => {}
            Self::Sym(name) => {
                out.insert(name.clone());
            }
            Self::Negative(x) | Self::Reciprocal(x) => x.collect_symbols(out),
            Self::Add(xs) | Self::Mul(xs) | Self::Max(xs) | Self::Min(xs) | Self::Broadcast(xs) => {
                for x in xs.iter() {
                    x.collect_symbols(out);
                }
            }
        }
    }

    /// Visit this node and every sub-expression, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&DimExpr)) {
        f(self);
        match self {
            Self::Int(_) | Self::Sym(_) => {}
            Self::Negative(x) | Self::Reciprocal(x) => x.walk(f),
            Self::Add(xs) | Self::Mul(xs) | Self::Max(xs) | Self::Min(xs) | Self::Broadcast(xs) => {
                for x in xs.iter() {
                    x.walk(f);
                }
            }
        }
    }

    /// Evaluate with concrete symbol values.
    ///
    /// Returns `None` if a symbol is unbound, a division is not exact, or a
    /// broadcast joins two different non-unit extents.
    pub fn evaluate(&self, env: &impl Fn(&str) -> Option<i64>) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Sym(name) => env(name),
            Self::Negative(x) => x.evaluate(env)?.checked_neg(),
            Self::Reciprocal(x) => match x.evaluate(env)? {
                1 => Some(1),
                -1 => Some(-1),
                _ => None,
            },
            Self::Add(xs) => xs
                .iter()
                .try_fold(0i64, |acc, x| acc.checked_add(x.evaluate(env)?)),
            Self::Mul(xs) => {
                let mut num = 1i64;
                let mut den = 1i64;
                for x in xs.iter() {
                    match x {
                        Self::Reciprocal(d) => den = den.checked_mul(d.evaluate(env)?)?,
                        _ => num = num.checked_mul(x.evaluate(env)?)?,
                    }
                }
                if den == 0 || num % den != 0 {
                    return None;
                }
                Some(num / den)
            }
            Self::Max(xs) => {
                xs.iter().try_fold(i64::MIN, |acc, x| Some(acc.max(x.evaluate(env)?)))
            }
            Self::Min(xs) => {
                xs.iter().try_fold(i64::MAX, |acc, x| Some(acc.min(x.evaluate(env)?)))
            }
            Self::Broadcast(xs) => {
                let mut out = 1i64;
                for x in xs.iter() {
                    let v = x.evaluate(env)?;
                    if v == 1 {
                        continue;
                    }
                    if out != 1 && out != v {
                        return None;
                    }
                    out = v;
                }
                Some(out)
            }
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Sym(_) => 1,
            Self::Negative(_) => 2,
            Self::Reciprocal(_) => 3,
            Self::Add(_) => 4,
            Self::Mul(_) => 5,
            Self::Max(_) => 6,
            Self::Min(_) => 7,
            Self::Broadcast(_) => 8,
        }
    }
}

/// Priority order used to sort commutative operands and to pick class
/// representatives: `Int < Sym < Negative < Reciprocal < Add < Mul < Max < Min < Broadcast`.
/// Symbols order by name length, then lexically.
impl Ord for DimExpr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind_rank()
            .cmp(&other.kind_rank())
            .then_with(|| match (self, other) {
                (Self::Int(a), Self::Int(b)) => a.cmp(b),
                (Self::Sym(a), Self::Sym(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
                (Self::Negative(a), Self::Negative(b))
                | (Self::Reciprocal(a), Self::Reciprocal(b)) => a.cmp(b),
                (Self::Add(a), Self::Add(b))
                | (Self::Mul(a), Self::Mul(b))
                | (Self::Max(a), Self::Max(b))
                | (Self::Min(a), Self::Min(b))
                | (Self::Broadcast(a), Self::Broadcast(b)) => {
                    a.len().cmp(&b.len()).then_with(|| a.iter().cmp(b.iter()))
                }
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for DimExpr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn write_joined(f: &mut std::fmt::Formatter<'_>, xs: &[DimExpr], sep: &str) -> std::fmt::Result {
    for (i, x) in xs.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{x}")?;
    }
    Ok(())
}

impl Display for DimExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Sym(name) => f.write_str(name),
            Self::Negative(x) => write!(f, "-{x}"),
            Self::Reciprocal(x) => write!(f, "1/{x}"),
            Self::Add(xs) => {
                f.write_str("(")?;
                write_joined(f, xs, " + ")?;
                f.write_str(")")
            }
            Self::Mul(xs) => {
                f.write_str("(")?;
                write_joined(f, xs, " * ")?;
                f.write_str(")")
            }
            Self::Max(xs) => {
                f.write_str("max(")?;
                write_joined(f, xs, ", ")?;
                f.write_str(")")
            }
            Self::Min(xs) => {
                f.write_str("min(")?;
                write_joined(f, xs, ", ")?;
                f.write_str(")")
            }
            Self::Broadcast(xs) => {
                f.write_str("broadcast(")?;
                write_joined(f, xs, ", ")?;
                f.write_str(")")
            }
        }
    }
}

impl Debug for DimExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<i64> for DimExpr {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for DimExpr {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<usize> for DimExpr {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<&str> for DimExpr {
    fn from(value: &str) -> Self {
        Self::sym(value)
    }
}

macro_rules! dim_binary_op {
    ($trait:ident, $fn:ident, |$a:ident, $b:ident| $body:expr) => {
        impl<R: Into<DimExpr>> $trait<R> for DimExpr {
            type Output = DimExpr;
            fn $fn(self, rhs: R) -> DimExpr {
                let $a = self;
                let $b: DimExpr = rhs.into();
                $body
            }
        }

        impl<R: Into<DimExpr>> $trait<R> for &DimExpr {
            type Output = DimExpr;
            fn $fn(self, rhs: R) -> DimExpr {
                let $a = self.clone();
                let $b: DimExpr = rhs.into();
                $body
            }
        }
    };
}

dim_binary_op!(Add, add, |a, b| DimExpr::add(vec![a, b]));
dim_binary_op!(Sub, sub, |a, b| DimExpr::add(vec![a, -b]));
dim_binary_op!(Mul, mul, |a, b| DimExpr::mul(vec![a, b]));
dim_binary_op!(Div, div, |a, b| DimExpr::mul(vec![a, b.reciprocal()]));

impl Neg for DimExpr {
    type Output = DimExpr;
    fn neg(self) -> DimExpr {
        DimExpr::unary(UnaryKind::Negative, self)
    }
}

impl Neg for &DimExpr {
    type Output = DimExpr;
    fn neg(self) -> DimExpr {
        DimExpr::unary(UnaryKind::Negative, self.clone())
    }
}

impl From<&DimExpr> for DimExpr {
    fn from(value: &DimExpr) -> Self {
        value.clone()
    }
}

/// Hash-consing table handing out shared canonical instances.
#[derive(Debug, Default)]
pub struct DimExprInterner {
    table: HashSet<DimExpr>,
}

impl DimExprInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize `expr` and return the shared instance equal to it.
    pub fn intern(&mut self, expr: &DimExpr) -> DimExpr {
        let canonical = expr.canonicalize();
        if let Some(existing) = self.table.get(&canonical) {
            return existing.clone();
        }
        self.table.insert(canonical.clone());
        canonical
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Produces fresh symbol names `S0`, `S1`, ...
#[derive(Debug, Default, Clone)]
pub struct SymbolGenerator {
    next: usize,
}

impl SymbolGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> DimExpr {
        let sym = DimExpr::sym(&format!("S{}", self.next));
        self.next += 1;
        sym
    }
}
