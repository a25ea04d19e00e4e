//! Reference CPU backend.
//!
//! The CPU kernel interprets the bucket's statement tree one statement at a
//! time over whole tensors. Intermediates come from the launch's buffer pools
//! and are returned to them when the launch ends, on success or failure.

use std::{collections::BTreeMap, sync::Arc};

use gemm::{gemm, Parallelism};
use rand::{
    distr::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};
use rand_distr::Normal;
use rayon::prelude::*;

use crate::{
    config::Target,
    ir::{Attribute, DataType, Value},
    lowering::{LoweredBucket, LoweredFunction, OpStmt, StmtOp},
    runtime::{HostTensor, PooledBuffer, TensorData, TensorPools},
    Context, Error, Result,
};

use super::{
    codegen::{emit_device_source, stmt_reduce_axes},
    Backend, Kernel, LaunchArgs, LoadedModule, SourceModule,
};

/// Element count above which elementwise loops run on the rayon pool.
const PAR_THRESHOLD: usize = 1 << 14;

const SUPPORTED: &[&str] = &[
    "full",
    "full_with_tensor",
    "uniform",
    "gaussian",
    "add",
    "sub",
    "mul",
    "div",
    "maximum",
    "minimum",
    "pow",
    "tan",
    "relu",
    "exp",
    "log",
    "sqrt",
    "abs",
    "neg",
    "sigmoid",
    "tanh",
    "cast",
    "scale",
    "broadcast",
    "expand",
    "reshape",
    "squeeze",
    "unsqueeze",
    "reduce_sum",
    "reduce_max",
    "reduce_min",
    "reduce_prod",
    "matmul",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn target(&self) -> Target {
        Target::Cpu
    }

    fn codegen(&self, function: &LoweredFunction) -> Result<SourceModule> {
        Ok(SourceModule {
            target: Target::Cpu,
            fn_name: function.fn_name.clone(),
            device: emit_device_source(function)?,
            host: function.host_source.clone(),
        })
    }

    fn compile(&self, _source: &SourceModule, function: &LoweredFunction) -> Result<LoadedModule> {
        let mut module = LoadedModule::new();
        for bucket in &function.buckets {
            let kernel = CpuKernel::new(function, bucket)?;
            module.insert(Arc::new(kernel));
        }
        Ok(module)
    }
}

/// One bucket, ready to interpret.
#[derive(Debug)]
struct CpuKernel {
    name: String,
    inputs: Vec<Value>,
    outputs: Vec<Value>,
    symbols: Vec<String>,
    dtypes: BTreeMap<Value, DataType>,
    shapes: BTreeMap<Value, Vec<crate::symbolic::DimExpr>>,
    stmts: Vec<OpStmt>,
}

impl CpuKernel {
    fn new(function: &LoweredFunction, bucket: &LoweredBucket) -> Result<Self> {
        let stmts: Vec<OpStmt> = bucket.body.body.op_stmts().into_iter().cloned().collect();
        if let Some(stmt) = stmts
            .iter()
            .find(|s| matches!(s.op, StmtOp::Op(_)) && !SUPPORTED.contains(&s.name.as_str()))
        {
            return Err(Error::unsupported(format!(
                "the cpu backend cannot execute `{}`",
                stmt.name
            )));
        }
        Ok(Self {
            name: bucket.kernel_name.clone(),
            inputs: function.inputs.iter().map(|d| d.value).collect(),
            outputs: function.outputs.iter().map(|d| d.value).collect(),
            symbols: function.symbols.clone(),
            dtypes: function.dtypes.clone(),
            shapes: bucket.shapes.clone(),
            stmts,
        })
    }
}

impl Kernel for CpuKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, args: LaunchArgs<'_>) -> Result<()> {
        if args.inputs.len() != self.inputs.len() || args.outputs.len() != self.outputs.len() {
            return Err(Error::runtime(format!(
                "{} expects {} inputs and {} outputs",
                self.name,
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        let env: BTreeMap<&str, i64> = self
            .symbols
            .iter()
            .map(String::as_str)
            .zip(args.scalars.iter().copied())
            .collect();
        let mut shapes = BTreeMap::new();
        for (value, dims) in &self.shapes {
            let dims = dims
                .iter()
                .map(|d| {
                    d.evaluate(&|s| env.get(s).copied())
                        .and_then(|x| usize::try_from(x).ok())
                        .ok_or_else(|| {
                            Error::runtime(format!("extent `{d}` of {value} is not evaluable"))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            shapes.insert(*value, dims);
        }

        let mut frame = Frame {
            pools: args.pools,
            inputs: self.inputs.iter().copied().zip(args.inputs.iter().copied()).collect(),
            values: BTreeMap::new(),
            shapes,
            dtypes: &self.dtypes,
        };
        for stmt in &self.stmts {
            frame.execute(stmt)?;
        }
        tracing::trace!(kernel = %self.name, grid = ?args.grid, "interpreted");

        for (value, out) in self.outputs.iter().zip(args.outputs.iter_mut()) {
            let buffer = frame
                .values
                .get(value)
                .ok_or_else(|| {
                    Error::invariant(format!("{} never wrote output {value}", self.name))
                })?;
            match (out.data_mut(), buffer) {
                (TensorData::F32(dst), Buffer::F32(src)) if dst.len() == src.len() => {
                    dst.copy_from_slice(src)
                }
                (TensorData::I64(dst), Buffer::I64(src)) if dst.len() == src.len() => {
                    dst.copy_from_slice(src)
                }
                _ => {
                    return Err(Error::runtime(format!(
                        "output {value} of {} does not match its allocation",
                        self.name
                    )))
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Buffer {
    F32(PooledBuffer<f32>),
    I64(PooledBuffer<i64>),
}

#[derive(Clone, Copy)]
enum View<'a> {
    F32(&'a [f32]),
    I64(&'a [i64]),
}

impl View<'_> {
    fn get(&self, i: usize) -> f64 {
        match self {
            Self::F32(v) => v.get(i).map_or(0.0, |x| *x as f64),
            Self::I64(v) => v.get(i).map_or(0.0, |x| *x as f64),
        }
    }
}

/// Row-major strides with zero strides on broadcast axes.
#[derive(Debug, Clone)]
struct Strided {
    out: Vec<usize>,
    strides: Vec<usize>,
}

impl Strided {
    fn new(out: &[usize], input: &[usize]) -> Result<Self> {
        let offset = out
            .len()
            .checked_sub(input.len())
            .ok_or_else(|| Error::runtime(format!("cannot broadcast {input:?} to {out:?}")))?;
        let mut strides = vec![0; out.len()];
        let mut acc = 1;
        for (i, d) in input.iter().enumerate().rev() {
            let o = i + offset;
            if *d == out[o] {
                strides[o] = acc;
            } else if *d != 1 {
                return Err(Error::runtime(format!("cannot broadcast {input:?} to {out:?}")));
            }
            acc *= d;
        }
        Ok(Self {
            out: out.to_vec(),
            strides,
        })
    }

    fn offset(&self, mut i: usize) -> usize {
        let mut off = 0;
        for (d, s) in self.out.iter().zip(&self.strides).rev() {
            if *d > 0 {
                off += (i % d) * s;
                i /= d;
            }
        }
        off
    }
}

fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn attr_f64(stmt: &OpStmt, key: &str) -> Result<f64> {
    stmt.attrs
        .get(key)
        .and_then(Attribute::as_f64)
        .ok_or_else(|| Error::invariant(format!("`{}` has no `{key}` attribute", stmt.name)))
}

fn unary(name: &str, x: f64) -> f64 {
    match name {
        "tan" => x.tan(),
        "relu" => x.max(0.0),
        "exp" => x.exp(),
        "log" => x.ln(),
        "sqrt" => x.sqrt(),
        "abs" => x.abs(),
        "neg" => -x,
        "sigmoid" => 1.0 / (1.0 + (-x).exp()),
        "tanh" => x.tanh(),
        _ => x,
    }
}

fn binary(name: &str, a: f64, b: f64, float: bool) -> f64 {
    match name {
        "add" => a + b,
        "sub" => a - b,
        "mul" => a * b,
        "div" if !float && b == 0.0 => 0.0,
        "div" if !float => (a / b).trunc(),
        "div" => a / b,
        "maximum" => a.max(b),
        "minimum" => a.min(b),
        "pow" => a.powf(b),
        _ => a,
    }
}

/// Live tensors of one launch.
struct Frame<'a> {
    pools: &'a TensorPools,
    inputs: BTreeMap<Value, &'a HostTensor>,
    values: BTreeMap<Value, Buffer>,
    shapes: BTreeMap<Value, Vec<usize>>,
    dtypes: &'a BTreeMap<Value, DataType>,
}

impl Frame<'_> {
    fn dtype(&self, v: Value) -> Result<DataType> {
        self.dtypes
            .get(&v)
            .copied()
            .ok_or_else(|| Error::invariant(format!("{v} has no element type")))
    }

    fn shape(&self, v: Value) -> Result<&[usize]> {
        self.shapes
            .get(&v)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::invariant(format!("{v} has no shape")))
    }

    fn view(&self, v: Value) -> Result<View<'_>> {
        if let Some(buffer) = self.values.get(&v) {
            return Ok(match buffer {
                Buffer::F32(b) => View::F32(b),
                Buffer::I64(b) => View::I64(b),
            });
        }
        let tensor = self
            .inputs
            .get(&v)
            .ok_or_else(|| Error::invariant(format!("{v} is read before it is written")))?;
        Ok(match tensor.data() {
            TensorData::F32(b) => View::F32(b),
            TensorData::I64(b) => View::I64(b),
        })
    }

    /// A pooled buffer of `n` elements with `f(i)` at index `i`.
    fn fill(&self, dtype: DataType, n: usize, f: impl Fn(usize) -> f64 + Sync) -> Result<Buffer> {
        if dtype.is_float() {
            let mut buf = self.pools.f32_buffer(n)?;
            if n >= PAR_THRESHOLD {
                buf.par_iter_mut().enumerate().for_each(|(i, o)| *o = f(i) as f32);
            } else {
                buf.iter_mut().enumerate().for_each(|(i, o)| *o = f(i) as f32);
            }
            Ok(Buffer::F32(buf))
        } else {
            let mut buf = self.pools.i64_buffer(n)?;
            if n >= PAR_THRESHOLD {
                buf.par_iter_mut().enumerate().for_each(|(i, o)| *o = f(i) as i64);
            } else {
                buf.iter_mut().enumerate().for_each(|(i, o)| *o = f(i) as i64);
            }
            Ok(Buffer::I64(buf))
        }
    }

    fn operand(&self, stmt: &OpStmt, k: usize) -> Result<Value> {
        stmt.inputs
            .get(k)
            .copied()
            .ok_or_else(|| Error::invariant(format!("`{}` is missing operand {k}", stmt.name)))
    }

    fn execute(&mut self, stmt: &OpStmt) -> Result<()> {
        let Some(out) = stmt.outputs.first().copied() else {
            return Ok(());
        };
        let buffer = match &stmt.op {
            StmtOp::MemoryBarrier => return Ok(()),
            StmtOp::Zeros { .. } => {
                let n = self.shape(out)?.iter().product();
                self.fill(self.dtype(out)?, n, |_| 0.0)?
            }
            StmtOp::InplaceAdd { .. } => {
                let sum = self.reduce(stmt, out)?;
                let acc = self.view(out)?;
                let sum_view = match &sum {
                    Buffer::F32(b) => View::F32(b),
                    Buffer::I64(b) => View::I64(b),
                };
                self.fill(self.dtype(out)?, self.shape(out)?.iter().product(), |i| {
                    acc.get(i) + sum_view.get(i)
                })?
            }
            StmtOp::Op(_) => self.op(stmt, out)?,
        };
        self.values.insert(out, buffer);
        Ok(())
    }

    fn op(&self, stmt: &OpStmt, out: Value) -> Result<Buffer> {
        let dtype = self.dtype(out)?;
        let out_shape = self.shape(out)?;
        let n: usize = out_shape.iter().product();
        let name = stmt.name.as_str();
        match name {
            "full" | "full_with_tensor" => {
                let value = attr_f64(stmt, "value")?;
                self.fill(dtype, n, |_| value)
            }
            "uniform" | "gaussian" => self.random(stmt, dtype, n),
            "tan" | "relu" | "exp" | "log" | "sqrt" | "abs" | "neg" | "sigmoid" | "tanh" | "cast"
            | "broadcast" | "expand" => {
                let x = self.operand(stmt, 0)?;
                let strided = Strided::new(out_shape, self.shape(x)?)?;
                let xv = self.view(x)?;
                self.fill(dtype, n, |i| unary(name, xv.get(strided.offset(i))))
            }
            "scale" => {
                let (scale, bias) = (attr_f64(stmt, "scale")?, attr_f64(stmt, "bias")?);
                let xv = self.view(self.operand(stmt, 0)?)?;
                self.fill(dtype, n, |i| xv.get(i) * scale + bias)
            }
            "reshape" | "squeeze" | "unsqueeze" => {
                let xv = self.view(self.operand(stmt, 0)?)?;
                self.fill(dtype, n, |i| xv.get(i))
            }
            "add" | "sub" | "mul" | "div" | "maximum" | "minimum" | "pow" => {
                let (a, b) = (self.operand(stmt, 0)?, self.operand(stmt, 1)?);
                let (sa, sb) = (
                    Strided::new(out_shape, self.shape(a)?)?,
                    Strided::new(out_shape, self.shape(b)?)?,
                );
                let (av, bv) = (self.view(a)?, self.view(b)?);
                let float = dtype.is_float();
                self.fill(dtype, n, |i| {
                    binary(name, av.get(sa.offset(i)), bv.get(sb.offset(i)), float)
                })
            }
            "reduce_sum" | "reduce_max" | "reduce_min" | "reduce_prod" => self.reduce(stmt, out),
            "matmul" => self.matmul(stmt, out),
            other => Err(Error::unsupported(format!("the cpu backend cannot execute `{other}`"))),
        }
    }

    fn random(&self, stmt: &OpStmt, dtype: DataType, n: usize) -> Result<Buffer> {
        let seed = stmt.attrs.get("seed").and_then(Attribute::as_i64).unwrap_or(0) as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        let samples: Vec<f64> = if stmt.name == "uniform" {
            let (lo, hi) = (attr_f64(stmt, "min")?, attr_f64(stmt, "max")?);
            let dist = Uniform::new(lo, hi).with_context(|| format!("uniform({lo}, {hi})"))?;
            (0..n).map(|_| dist.sample(&mut rng)).collect()
        } else {
            let (mean, std) = (attr_f64(stmt, "mean")?, attr_f64(stmt, "std")?);
            let dist =
                Normal::new(mean, std).with_context(|| format!("gaussian({mean}, {std})"))?;
            (0..n).map(|_| dist.sample(&mut rng)).collect()
        };
        self.fill(dtype, n, |i| samples[i])
    }

    fn reduce(&self, stmt: &OpStmt, out: Value) -> Result<Buffer> {
        let (axes, _) = stmt_reduce_axes(stmt)?;
        let input = self.operand(stmt, 0)?;
        let in_shape = self.shape(input)?.to_vec();
        let in_strides = contiguous_strides(&in_shape);
        let kept: Vec<usize> = (0..in_shape.len()).filter(|a| !axes.contains(a)).collect();
        let reduced: Vec<usize> = (0..in_shape.len()).filter(|a| axes.contains(a)).collect();
        let inner: usize = reduced.iter().map(|a| in_shape[*a]).product();
        let n: usize = kept.iter().map(|a| in_shape[*a]).product();
        let xv = self.view(input)?;
        let (init, combine): (f64, fn(f64, f64) -> f64) = match stmt.name.as_str() {
            "reduce_max" => (f64::NEG_INFINITY, f64::max),
            "reduce_min" => (f64::INFINITY, f64::min),
            "reduce_prod" => (1.0, |a, b| a * b),
            _ => (0.0, |a, b| a + b),
        };
        let offset_of = |mut i: usize, axes: &[usize]| {
            let mut off = 0;
            for a in axes.iter().rev() {
                off += (i % in_shape[*a]) * in_strides[*a];
                i /= in_shape[*a];
            }
            off
        };
        let dtype = self.dtype(out)?;
        self.fill(dtype, n, |o| {
            let base = offset_of(o, &kept);
            (0..inner).fold(init, |acc, r| combine(acc, xv.get(base + offset_of(r, &reduced))))
        })
    }

    fn matmul(&self, stmt: &OpStmt, out: Value) -> Result<Buffer> {
        let (a, b) = (self.operand(stmt, 0)?, self.operand(stmt, 1)?);
        let (a_shape, b_shape, out_shape) = (self.shape(a)?, self.shape(b)?, self.shape(out)?);
        let (ra, rb, r) = (a_shape.len(), b_shape.len(), out_shape.len());
        if ra < 2 || rb < 2 || r < 2 {
            return Err(Error::invariant("matmul operands need rank >= 2"));
        }
        let (m, k, n) = (a_shape[ra - 2], a_shape[ra - 1], b_shape[rb - 1]);
        if b_shape[rb - 2] != k {
            return Err(Error::runtime(format!(
                "matmul contraction mismatch: {a_shape:?} x {b_shape:?}"
            )));
        }
        let batch_out = &out_shape[..r - 2];
        let batches: usize = batch_out.iter().product();
        let (sa, sb) = (
            Strided::new(batch_out, &a_shape[..ra - 2])?,
            Strided::new(batch_out, &b_shape[..rb - 2])?,
        );
        let dtype = self.dtype(out)?;

        match (self.view(a)?, self.view(b)?) {
            (View::F32(lhs), View::F32(rhs)) => {
                let a_len: usize = a_shape.iter().product();
                let b_len: usize = b_shape.iter().product();
                if lhs.len() != a_len || rhs.len() != b_len {
                    return Err(Error::runtime("matmul operand storage does not match its shape"));
                }
                let mut dst = self.pools.f32_buffer(batches * m * n)?;
                let threads = num_cpus::get();
                let parallelism = if threads > 1 {
                    Parallelism::Rayon(threads)
                } else {
                    Parallelism::None
                };
                for batch in 0..batches {
                    let lhs_p = &lhs[sa.offset(batch) * m * k..][..m * k];
                    let rhs_p = &rhs[sb.offset(batch) * k * n..][..k * n];
                    let dst_p = &mut dst[batch * m * n..][..m * n];
                    // SAFETY: the three slices hold exactly m*k, k*n and m*n
                    // contiguous row-major elements.
                    unsafe {
                        gemm(
                            m,
                            n,
                            k,
                            dst_p.as_mut_ptr(),
                            1,
                            n as isize,
                            false,
                            lhs_p.as_ptr(),
                            1,
                            k as isize,
                            rhs_p.as_ptr(),
                            1,
                            n as isize,
                            0.0f32,
                            1.0f32,
                            false,
                            false,
                            false,
                            parallelism,
                        )
                    }
                }
                if dtype.is_float() {
                    Ok(Buffer::F32(dst))
                } else {
                    self.fill(dtype, dst.len(), |i| dst[i] as f64)
                }
            }
            (lhs, rhs) => self.fill(dtype, batches * m * n, |i| {
                let (batch, rest) = (i / (m * n), i % (m * n));
                let (row, col) = (rest / n, rest % n);
                let (ab, bb) = (sa.offset(batch) * m * k, sb.offset(batch) * k * n);
                (0..k).fold(0.0, |acc, p| {
                    acc + lhs.get(ab + row * k + p) * rhs.get(bb + p * n + col)
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_broadcast_offsets() {
        let s = Strided::new(&[2, 3], &[3]).unwrap();
        assert_eq!((0..6).map(|i| s.offset(i)).collect::<Vec<_>>(), vec![0, 1, 2, 0, 1, 2]);
        let s = Strided::new(&[2, 3], &[2, 1]).unwrap();
        assert_eq!((0..6).map(|i| s.offset(i)).collect::<Vec<_>>(), vec![0, 0, 0, 1, 1, 1]);
        assert!(Strided::new(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(binary("div", 7.0, 2.0, false), 3.0);
        assert_eq!(binary("div", -7.0, 2.0, false), -3.0);
        assert_eq!(binary("div", 7.0, 0.0, false), 0.0);
        assert_eq!(binary("div", 7.0, 2.0, true), 3.5);
    }
}
