use std::collections::BTreeMap;

use cinnabar_core::{
    canonicalize_with_constraints, codec, substitute_dim_exprs_based_on_constraints, BucketSpec,
    CondExpr, Constraint, DataType, DimExpr, ProgramBuilder, ShapeAnalysis, SubstitutionMap,
    UnionFind,
};
use proptest::prelude::*;

fn dim_expr() -> impl Strategy<Value = DimExpr> {
    let leaf = prop_oneof![
        (-3i64..6).prop_map(DimExpr::Int),
        prop::sample::select(vec!["S0", "S1", "S2"]).prop_map(DimExpr::sym),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 2..4).prop_map(DimExpr::add),
            prop::collection::vec(inner.clone(), 2..3).prop_map(DimExpr::mul),
            prop::collection::vec(inner.clone(), 2..3).prop_map(DimExpr::max),
            prop::collection::vec(inner.clone(), 2..3).prop_map(DimExpr::min),
            inner.prop_map(|x| -x),
        ]
    })
}

proptest! {
    #[test]
    fn canonicalize_is_idempotent(e in dim_expr()) {
        let once = e.canonicalize();
        prop_assert_eq!(once.canonicalize(), once);
    }

    #[test]
    fn codec_round_trips_to_canonical_form(e in dim_expr()) {
        let decoded = codec::decode(&codec::encode(&e));
        prop_assert_eq!(decoded, Some(e.canonicalize()));
    }

    #[test]
    fn union_find_has_one_representative_per_class(
        pairs in prop::collection::vec((0u8..12, 0u8..12), 0..16)
    ) {
        let mut uf = UnionFind::new();
        for (a, b) in &pairs {
            uf.union(*a, *b);
        }
        let clusters = uf.clusters();
        let total: usize = clusters.iter().map(Vec::len).sum();
        prop_assert_eq!(total, uf.len());
        for cluster in clusters {
            let representative = *uf.find(&cluster[0]).unwrap();
            prop_assert!(cluster.contains(&representative));
            for member in &cluster {
                prop_assert_eq!(uf.find(member).copied(), Some(representative));
            }
        }
    }

    #[test]
    fn exclusive_buckets_never_overlap(a in 1i64..4096, b in 1i64..4096, s0 in 1i64..8192) {
        let specs = [
            BucketSpec::new(CondExpr::lt("S0", a), "A"),
            BucketSpec::new(CondExpr::lt("S0", b), "B"),
            BucketSpec::new(CondExpr::ge("S0", a), "C"),
        ];
        let env = BTreeMap::from([("S0".to_string(), s0)]);
        let holding = cinnabar_core::make_exclusive(&specs)
            .iter()
            .filter(|spec| spec.predicate.holds(&env).unwrap())
            .count();
        prop_assert!(holding <= 1);
    }
}

#[test]
fn equal_symbols_collapse_to_constant() {
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
    let expected: SubstitutionMap =
        BTreeMap::from([(s0.clone(), DimExpr::Int(8)), (s1.clone(), DimExpr::Int(8))]);
    assert_eq!(mapping, expected);
}

#[test]
fn constraints_rewrite_every_shape() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
    let y = b.input("y", DataType::F32, vec![DimExpr::sym("S1"), DimExpr::Int(4)]);
    let z = b.add(x, y).unwrap();
    b.output(z);
    b.constrain_equal(DimExpr::sym("S0"), DimExpr::sym("S1"));
    b.constrain_equal(DimExpr::sym("S1"), DimExpr::Int(8));
    let program = b.build().unwrap();

    let mut analysis = ShapeAnalysis::from_program(&program);
    substitute_dim_exprs_based_on_constraints(&program, &mut analysis).unwrap();
    for value in [x, y] {
        assert_eq!(analysis.dims(value).unwrap(), &[DimExpr::Int(8), DimExpr::Int(4)]);
    }
    assert!(analysis.dims(z).unwrap().iter().all(DimExpr::is_static));
}

#[test]
fn identity_substitution_changes_nothing() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(4)]);
    let y = b.unary("exp", x).unwrap();
    b.output(y);
    let program = b.build().unwrap();

    let before = ShapeAnalysis::from_program(&program);
    let mut after = before.clone();
    let mapping = substitute_dim_exprs_based_on_constraints(&program, &mut after).unwrap();
    assert!(mapping.is_empty());
    for value in [x, y] {
        assert_eq!(before.get(value), after.get(value));
    }
}

#[test]
fn attribute_codec_round_trip() {
    let e = DimExpr::add(vec![
        DimExpr::mul(vec![DimExpr::sym("S0"), DimExpr::Int(3)]),
        DimExpr::sym("S1"),
    ]);
    assert_eq!(codec::decode(&codec::encode(&e)), Some(e.canonicalize()));
}
