use cinnabar_core::{
    compile, CompileConfig, DataType, DimExpr, HostTensor, PatternGraph, ProgramBuilder,
    ShapeAnalysis,
};

fn main() {
    let dims = vec![DimExpr::sym("S0"), DimExpr::Int(4)];
    let mut b = ProgramBuilder::new();
    let x = b.input("x", DataType::F32, dims.clone());
    let m = b.reduce_max(x, &[-1], true).unwrap();
    let m = b.broadcast_to(m, dims.clone()).unwrap();
    let d = b.sub(x, m).unwrap();
    let e = b.unary("exp", d).unwrap();
    let s = b.reduce_sum(e, &[-1], true).unwrap();
    let s = b.broadcast_to(s, dims).unwrap();
    let y = b.div(e, s).unwrap();
    b.output(y);
    let program = b.build().unwrap();

    let analysis = ShapeAnalysis::from_program(&program);
    let graph = PatternGraph::from_program(&program, &analysis).unwrap();
    println!("{}", graph.to_dot());
    if let Err(err) = graph.visualize("softmax.png") {
        println!("skipping softmax.png: {err}");
    }

    let mut compiled = compile(&program, &CompileConfig::default()).unwrap();
    println!("{}", compiled.describe());

    let x = HostTensor::from_f32(vec![2, 4], vec![1.0, 2.0, 3.0, 4.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
    let out = compiled.run(&[x]).unwrap();
    println!("{}", out[0]);
}
