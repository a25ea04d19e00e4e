//! Bit-exact persistence of [`DimExpr`] trees as [`Attribute`] trees.
//!
//! | expression | attribute |
//! |---|---|
//! | `Int(i)` | `Int64(i)` |
//! | `Sym(s)` | `Str(s)` |
//! | `Negative(x)`, `Reciprocal(x)` | `Array([Str(tag), encode(x)])` |
//! | `Add(xs)` .. `Broadcast(xs)` | `Array([Str(tag), encode(xs[0]), ..])` |
//!
//! Decoding never panics: anything that is not a valid encoding yields `None`.

use crate::ir::Attribute;

use super::{DimExpr, ShapeOrData, UnaryKind, VariadicKind};

fn tagged(tag: &str, operands: &[DimExpr]) -> Attribute {
    let mut items = Vec::with_capacity(operands.len() + 1);
    items.push(Attribute::Str(tag.to_string()));
    items.extend(operands.iter().map(encode));
    Attribute::Array(items)
}

pub fn encode(expr: &DimExpr) -> Attribute {
    match expr {
        DimExpr::Int(v) => Attribute::Int64(*v),
        DimExpr::Sym(name) => Attribute::Str(name.to_string()),
        DimExpr::Negative(x) => tagged(UnaryKind::Negative.tag(), std::slice::from_ref(&**x)),
        DimExpr::Reciprocal(x) => tagged(UnaryKind::Reciprocal.tag(), std::slice::from_ref(&**x)),
        DimExpr::Add(xs) => tagged(VariadicKind::Add.tag(), xs),
        DimExpr::Mul(xs) => tagged(VariadicKind::Mul.tag(), xs),
        DimExpr::Max(xs) => tagged(VariadicKind::Max.tag(), xs),
        DimExpr::Min(xs) => tagged(VariadicKind::Min.tag(), xs),
        DimExpr::Broadcast(xs) => tagged(VariadicKind::Broadcast.tag(), xs),
    }
}

pub fn decode(attr: &Attribute) -> Option<DimExpr> {
    match attr {
        Attribute::Int32(_) | Attribute::Int64(_) => attr.as_i64().map(DimExpr::Int),
        Attribute::Str(name) => Some(DimExpr::sym(name)),
        Attribute::Array(items) => {
            let tag = items.first()?.as_str()?;
            if let Some(kind) = UnaryKind::from_tag(tag) {
                if items.len() != 2 {
                    return None;
                }
                return Some(DimExpr::unary(kind, decode(&items[1])?));
            }
            let kind = VariadicKind::from_tag(tag)?;
            if items.len() < 2 {
                return None;
            }
            let operands = items[1..].iter().map(decode).collect::<Option<Vec<_>>>()?;
            Some(DimExpr::variadic(kind, operands))
        }
        _ => None,
    }
}

pub fn encode_dims(dims: &[DimExpr]) -> Attribute {
    Attribute::Array(dims.iter().map(encode).collect())
}

pub fn decode_dims(attr: &Attribute) -> Option<Vec<DimExpr>> {
    attr.as_array()?.iter().map(decode).collect()
}

/// `[shape]` or `[shape, data]`.
pub fn encode_shape_or_data(value: &ShapeOrData) -> Attribute {
    let mut items = vec![encode_dims(value.dims())];
    if let Some(data) = value.data() {
        items.push(encode_dims(data));
    }
    Attribute::Array(items)
}

pub fn decode_shape_or_data(attr: &Attribute) -> Option<ShapeOrData> {
    match attr.as_array()? {
        [shape] => Some(ShapeOrData::shape(decode_dims(shape)?)),
        [shape, data] => Some(ShapeOrData::with_data(
            decode_dims(shape)?,
            decode_dims(data)?,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let e = DimExpr::sym("S0") * 3;
        assert_eq!(
            encode(&e),
            Attribute::Array(vec![
                Attribute::Str("Mul".into()),
                Attribute::Int64(3),
                Attribute::Str("S0".into()),
            ])
        );
        assert_eq!(
            encode(&-DimExpr::sym("S0")),
            Attribute::Array(vec![
                Attribute::Str("Negative".into()),
                Attribute::Str("S0".into()),
            ])
        );
    }

    #[test]
    fn malformed_is_none() {
        let unknown = Attribute::Array(vec![Attribute::Str("Pow".into()), Attribute::Int64(2)]);
        assert_eq!(decode(&unknown), None);
        let bad_unary = Attribute::Array(vec![
            Attribute::Str("Negative".into()),
            Attribute::Int64(1),
            Attribute::Int64(2),
        ]);
        assert_eq!(decode(&bad_unary), None);
        let empty_variadic = Attribute::Array(vec![Attribute::Str("Add".into())]);
        assert_eq!(decode(&empty_variadic), None);
        assert_eq!(decode(&Attribute::Array(vec![])), None);
        assert_eq!(decode(&Attribute::Float64(1.0)), None);
    }

    #[test]
    fn decode_canonicalizes() {
        let raw = Attribute::Array(vec![
            Attribute::Str("Add".into()),
            Attribute::Str("S1".into()),
            Attribute::Int64(2),
            Attribute::Int64(3),
        ]);
        assert_eq!(decode(&raw), Some(DimExpr::sym("S1") + 5));
    }

    #[test]
    fn shape_or_data_layout() {
        let sod =
            ShapeOrData::with_data(vec![DimExpr::Int(2)], vec![DimExpr::sym("S0"), 128.into()]);
        let attr = encode_shape_or_data(&sod);
        assert_eq!(attr.as_array().map(<[_]>::len), Some(2));
        assert_eq!(decode_shape_or_data(&attr), Some(sod));
    }
}
