use std::collections::BTreeSet;

use cinnabar_core::{
    cluster_ops, cluster_ops_into_one_group, passes::run_passes, DataType, DimExpr, Error, OpId,
    OpKind, PatternGraph, PolicyManager, Program, ProgramBuilder, ShapeAnalysis, StmtPattern,
    Type,
};
use test_case::test_case;

fn elementwise_chain() -> Program {
    let mut b = ProgramBuilder::new();
    let shape = b.shape_input("shape", vec![DimExpr::sym("S0"), DimExpr::Int(128)]);
    let x = b.full_with_tensor(shape, 1.0, DataType::F32).unwrap();
    let a = b.unary("tan", x).unwrap();
    let r = b.unary("relu", a).unwrap();
    let c = b.unary("tan", r).unwrap();
    let d = b.unary("relu", c).unwrap();
    b.output(d);
    b.build().unwrap()
}

fn softmax() -> Program {
    let dims = || vec![DimExpr::Int(2), DimExpr::Int(2), DimExpr::Int(4)];
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, dims());
    let m = b.reduce_max(x, &[-1], true).unwrap();
    let mb = b.broadcast_to(m, dims()).unwrap();
    let d = b.sub(x, mb).unwrap();
    let e = b.unary("exp", d).unwrap();
    let s = b.reduce_sum(e, &[-1], true).unwrap();
    let sb = b.broadcast_to(s, dims()).unwrap();
    let y = b.div(e, sb).unwrap();
    b.output(y);
    b.build().unwrap()
}

fn assert_partition(program: &Program) {
    let groups = cluster_ops(program, &PolicyManager::default()).unwrap();
    let mut seen = BTreeSet::new();
    for group in &groups {
        for op in group.ops() {
            assert!(seen.insert(*op), "{op} is in two groups");
        }
        let mut sorted = group.ops().to_vec();
        sorted.sort();
        assert_eq!(sorted, group.ops());
    }
    let all: BTreeSet<OpId> = program.ops().map(|op| op.id()).collect();
    assert_eq!(seen, all);
}

#[test_case("add", OpKind::Elementwise, StmtPattern::Trivial)]
#[test_case("relu", OpKind::Elementwise, StmtPattern::Trivial)]
#[test_case("broadcast", OpKind::Broadcast, StmtPattern::Trivial)]
#[test_case("reshape", OpKind::Reshape, StmtPattern::Trivial)]
#[test_case("reduce_sum", OpKind::Reduction, StmtPattern::Reduce)]
#[test_case("reduce_max", OpKind::Reduction, StmtPattern::Reduce)]
#[test_case("my_custom_op", OpKind::Opaque, StmtPattern::Unsupported)]
fn classification(name: &str, kind: OpKind, pattern: StmtPattern) {
    assert_eq!(OpKind::infer(name), kind);

    let mut program = Program::new();
    let ty = Type::new(DataType::F32, vec![DimExpr::Int(4)]);
    let x = program.add_argument("x", ty.clone());
    let id = program.append_op(name, vec![x], vec![ty], Default::default()).unwrap();
    assert_eq!(StmtPattern::classify(program.op(id)), pattern);
}

#[test]
fn elementwise_chain_is_one_group() {
    let program = elementwise_chain();
    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 1);
    let names: Vec<&str> = groups[0].ops().iter().map(|op| program.op(*op).name()).collect();
    assert_eq!(names, ["full_with_tensor", "tan", "relu", "tan", "relu"]);
    assert_eq!(groups[0].pattern(), &StmtPattern::Trivial);
    assert_partition(&program);
}

#[test]
fn softmax_is_one_reduce_tree() {
    let program = softmax();
    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 1);
    let StmtPattern::ReduceTree { root, members } = groups[0].pattern() else {
        panic!("expected a reduce tree, got {}", groups[0].pattern());
    };
    assert_eq!(members.len(), 2);
    assert_eq!(program.op(*root).name(), "reduce_sum");
    assert_partition(&program);
}

#[test]
fn passes_reach_a_fixed_point() {
    let program = softmax();
    let analysis = ShapeAnalysis::from_program(&program);
    let policy = PolicyManager::default();
    let mut graph = PatternGraph::from_program(&program, &analysis).unwrap();
    assert!(run_passes(&mut graph, &policy).unwrap() > 0);
    assert_eq!(run_passes(&mut graph, &policy).unwrap(), 0);
    graph.verify().unwrap();
}

#[test]
fn empty_and_single_op_programs() {
    let program = ProgramBuilder::new().build().unwrap();
    assert!(cluster_ops(&program, &PolicyManager::default()).unwrap().is_empty());

    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::Int(8)]);
    let y = b.unary("exp", x).unwrap();
    b.output(y);
    let program = b.build().unwrap();
    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].ops().len(), 1);
    assert_eq!(groups[0].inputs(), &[x]);
    assert_eq!(groups[0].outputs(), &[y]);
}

#[test]
fn opaque_ops_stay_alone() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::Int(8)]);
    let a = b.unary("exp", x).unwrap();
    let ty = Type::new(DataType::F32, vec![DimExpr::Int(8)]);
    let c = b.custom("my_custom_op", vec![a], vec![ty], Default::default()).unwrap()[0];
    let d = b.unary("relu", c).unwrap();
    b.output(d);
    let program = b.build().unwrap();

    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[1].pattern(), &StmtPattern::Unsupported);
    assert_eq!(groups[1].inputs(), &[a]);
    assert_partition(&program);
}

#[test]
fn mismatched_reductions_are_rejected() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::Int(4), DimExpr::Int(8)]);
    let r = b.reduce_sum(x, &[1], true).unwrap();
    let s = b.reduce_sum(r, &[0], true).unwrap();
    b.output(s);
    let program = b.build().unwrap();
    let analysis = ShapeAnalysis::from_program(&program);

    let ops: Vec<OpId> = program.ops().map(|op| op.id()).collect();
    let err = cluster_ops_into_one_group(&program, &analysis, &ops, &PolicyManager::default())
        .unwrap_err();
    assert!(matches!(err.root(), Error::PolicyRejected { .. }), "{err}");

    // Without policies the two reductions merge.
    let group =
        cluster_ops_into_one_group(&program, &analysis, &ops, &PolicyManager::new()).unwrap();
    assert_eq!(group.ops().len(), 2);
}

fn op_names(program: &Program, ops: &[OpId]) -> Vec<String> {
    let mut names: Vec<String> = ops.iter().map(|op| program.op(*op).name().to_string()).collect();
    names.sort();
    names
}

#[test]
fn sibling_reductions_follow_the_policy() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::Int(4), DimExpr::Int(8)]);
    let e = b.unary("exp", x).unwrap();
    let cols = b.reduce_sum(e, &[0], true).unwrap();
    let rows = b.reduce_sum(e, &[1], true).unwrap();
    b.output(cols);
    b.output(rows);
    let program = b.build().unwrap();

    // The reductions disagree on their axes, so exp joins only one of them.
    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 2);
    let mut names: Vec<Vec<String>> =
        groups.iter().map(|g| op_names(&program, g.ops())).collect();
    names.sort();
    assert_eq!(names, vec![vec!["exp", "reduce_sum"], vec!["reduce_sum"]]);
    let exp_group = groups.iter().find(|g| g.ops().len() == 2).unwrap();
    assert!(exp_group.outputs().contains(&e));
    assert_partition(&program);

    let groups = cluster_ops(&program, &PolicyManager::new()).unwrap();
    assert_eq!(groups.len(), 1);
    match groups[0].pattern() {
        StmtPattern::ReduceTree { members, .. } => assert_eq!(members.len(), 2),
        other => panic!("expected a reduce tree, got {other}"),
    }
}

#[test]
fn shared_trivial_producer_fans_out() {
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), DimExpr::Int(16)]);
    let e = b.unary("exp", x).unwrap();
    let t = b.unary("tan", e).unwrap();
    let r = b.unary("relu", e).unwrap();
    let y = b.add(t, r).unwrap();
    b.output(y);
    let program = b.build().unwrap();

    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(op_names(&program, groups[0].ops()), vec!["add", "exp", "relu", "tan"]);
    assert_eq!(groups[0].pattern(), &StmtPattern::Trivial);
    assert_partition(&program);
}

#[test]
fn pattern_graph_dot_is_written_to_disk() {
    let program = softmax();
    let analysis = ShapeAnalysis::from_program(&program);
    let mut graph = PatternGraph::from_program(&program, &analysis).unwrap();
    run_passes(&mut graph, &PolicyManager::default()).unwrap();

    let path = std::env::temp_dir().join(format!("cinnabar_softmax_{}.dot", std::process::id()));
    graph.write_dot(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert!(text.starts_with("digraph"), "{text}");
    assert_eq!(text, graph.to_dot());

    let missing = std::env::temp_dir().join("cinnabar_no_such_dir").join("graph.dot");
    let err = graph.write_dot(&missing).unwrap_err();
    assert!(err.to_string().starts_with("writing "), "{err}");
}

#[test]
fn ops_with_regions_are_isolated() {
    let ty = Type::new(DataType::F32, vec![DimExpr::Int(8)]);
    let mut program = Program::new();
    let x = program.add_argument("x", ty.clone());
    let exp = program.append_op("exp", vec![x], vec![ty.clone()], Default::default()).unwrap();
    let e = program.op(exp).results()[0];
    let body = program
        .append_op("relu", vec![e], vec![ty.clone()], Default::default())
        .unwrap();
    let b = program.op(body).results()[0];
    // The body reads `e` from the enclosing block.
    let inner = program
        .append_nested_op(body, 0, "tan", vec![e], vec![ty.clone()], Default::default())
        .unwrap();
    let t = program.append_op("tan", vec![b], vec![ty], Default::default()).unwrap();
    program.mark_output(program.op(t).results()[0]);
    program.verify().unwrap();

    assert_eq!(program.op(body).kind(), OpKind::Opaque);
    assert_eq!(program.op(body).regions().len(), 1);
    assert_eq!(program.len(), 3);
    assert!(program.captured_operands(body).contains(&e));
    assert!(!program.ops().any(|op| op.id() == inner));

    let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[1].pattern(), &StmtPattern::Unsupported);
    assert_eq!(groups[1].ops(), &[body]);
    assert_eq!(groups[0].outputs(), &[e]);
    assert_partition(&program);
}
