//! C-family source emitter shared by every target.
//!
//! Each bucket becomes one kernel. Every statement whose result needs
//! storage is emitted as a phase: a loop over the result's elements that
//! evaluates the statement with its register-resident operands inlined.
//! Phases are separated by the barriers of the statement tree.

use std::{collections::BTreeMap, fmt::Write};

use crate::{
    config::{MemoryClass, Target},
    ir::{Attribute, DataType, Value},
    lowering::{dim_to_c, LoweredBucket, LoweredFunction, MapStmt, OpStmt, StmtOp},
    symbolic::DimExpr,
    Error, Result,
};

const HELPERS: &str = r#"
CINNABAR_FN float cinnabar_relu(float x) { return x > 0.0f ? x : 0.0f; }
CINNABAR_FN int64_t cinnabar_relu(int64_t x) { return x > 0 ? x : 0; }
CINNABAR_FN float cinnabar_sigmoid(float x) { return 1.0f / (1.0f + expf(-x)); }
CINNABAR_FN float cinnabar_max(float a, float b) { return a > b ? a : b; }
CINNABAR_FN int64_t cinnabar_max(int64_t a, int64_t b) { return a > b ? a : b; }
CINNABAR_FN float cinnabar_min(float a, float b) { return a < b ? a : b; }
CINNABAR_FN int64_t cinnabar_min(int64_t a, int64_t b) { return a < b ? a : b; }
CINNABAR_FN uint64_t cinnabar_hash(uint64_t seed, uint64_t i) {
  uint64_t z = seed + 0x9E3779B97F4A7C15ull * (i + 1);
  z = (z ^ (z >> 30)) * 0xBF58476D1CE4E5B9ull;
  z = (z ^ (z >> 27)) * 0x94D049BB133111EBull;
  return z ^ (z >> 31);
}
CINNABAR_FN float cinnabar_unit(uint64_t seed, uint64_t i) {
  return (float)(cinnabar_hash(seed, i) >> 40) * (1.0f / 16777216.0f);
}
CINNABAR_FN float cinnabar_uniform(uint64_t seed, uint64_t i, float lo, float hi) {
  return lo + (hi - lo) * cinnabar_unit(seed, i);
}
CINNABAR_FN float cinnabar_gaussian(uint64_t seed, uint64_t i, float mean, float std) {
  float u1 = cinnabar_unit(seed, 2 * i) + 1e-7f;
  float u2 = cinnabar_unit(seed, 2 * i + 1);
  return mean + std * sqrtf(-2.0f * logf(u1)) * cosf(6.2831853f * u2);
}
"#;

const INT_MIN_MAX: &str = "\
CINNABAR_FN int64_t max(int64_t a, int64_t b) { return a > b ? a : b; }
CINNABAR_FN int64_t min(int64_t a, int64_t b) { return a < b ? a : b; }
";

fn prelude(target: Target, dtypes: impl Iterator<Item = DataType>) -> String {
    let mut src = String::new();
    match target {
        Target::Cuda => {
            src.push_str("typedef unsigned char uint8_t;\ntypedef unsigned int uint32_t;\n");
            src.push_str("typedef long long int int64_t;\n");
            src.push_str("typedef unsigned long long int uint64_t;\n");
            src.push_str("#define CINNABAR_FN __device__ __forceinline__\n");
        }
        Target::Hip => {
            src.push_str("#include <hip/hip_runtime.h>\n");
            src.push_str("#define CINNABAR_FN __device__ __forceinline__\n");
        }
        Target::Sycl => {
            src.push_str("#include <sycl/sycl.hpp>\n#include <cstdint>\n");
            src.push_str("#define CINNABAR_FN static inline\n");
            src.push_str(INT_MIN_MAX);
        }
        Target::Cpu => {
            src.push_str("#include <stdint.h>\n#include <stdbool.h>\n#include <math.h>\n");
            src.push_str("#define CINNABAR_FN static inline\n");
            src.push_str(INT_MIN_MAX);
        }
    }
    if target == Target::Cuda {
        let mut deps: Vec<&str> = dtypes.filter_map(|d| d.c_dep()).collect();
        deps.sort_unstable();
        deps.dedup();
        for dep in deps {
            src.push_str(dep);
            src.push('\n');
        }
    }
    src.push_str(HELPERS);
    src
}

fn float_lit(v: f64) -> String {
    let v = v as f32;
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        format!("{v:?}f")
    }
}

fn lit(v: f64, dtype: DataType) -> String {
    if dtype.is_float() {
        float_lit(v)
    } else {
        format!("{}ll", v as i64)
    }
}

fn attr_f64(stmt: &OpStmt, key: &str) -> Result<f64> {
    stmt.attrs
        .get(key)
        .and_then(Attribute::as_f64)
        .ok_or_else(|| Error::invariant(format!("`{}` has no `{key}` attribute", stmt.name)))
}

/// Reduced axes and keepdim flag of a reduction statement.
pub(crate) fn stmt_reduce_axes(stmt: &OpStmt) -> Result<(Vec<usize>, bool)> {
    let axes = stmt
        .attrs
        .get("axis")
        .and_then(Attribute::as_i64_vec)
        .ok_or_else(|| Error::invariant(format!("`{}` has no axis attribute", stmt.name)))?;
    let keepdim = stmt
        .attrs
        .get("keepdim")
        .and_then(Attribute::as_bool)
        .unwrap_or(false);
    Ok((axes.into_iter().map(|a| a.max(0) as usize).collect(), keepdim))
}

/// Row-major linear offset of `coords` in a tensor of `dims`.
fn ravel(coords: &[String], dims: &[DimExpr]) -> String {
    let mut iter = coords.iter().zip(dims);
    let Some((first, _)) = iter.next() else {
        return "0".to_string();
    };
    iter.fold(first.clone(), |acc, (c, d)| format!("({acc} * {} + {c})", dim_to_c(d)))
}

/// Right-aligned broadcast of output coordinates onto an operand.
fn map_coords(out: &[DimExpr], operand: &[DimExpr], coords: &[String]) -> Result<Vec<String>> {
    let offset = out
        .len()
        .checked_sub(operand.len())
        .ok_or_else(|| Error::invariant("operand has higher rank than its result"))?;
    Ok(operand
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let o = i + offset;
            if *d == DimExpr::Int(1) {
                "0".to_string()
            } else if *d == out[o] || d.is_int() {
                coords[o].clone()
            } else {
                format!("({} == 1ll ? 0ll : {})", dim_to_c(d), coords[o])
            }
        })
        .collect())
}

#[derive(Debug, Clone)]
enum Storage {
    Pointer(String),
    Register,
}

/// Emits the device kernel of one bucket.
pub struct CodeEmitter<'a> {
    function: &'a LoweredFunction,
    bucket: &'a LoweredBucket,
    target: Target,
    storage: BTreeMap<Value, Storage>,
    defs: BTreeMap<Value, &'a OpStmt>,
    src: String,
}

impl<'a> CodeEmitter<'a> {
    pub fn new(function: &'a LoweredFunction, bucket: &'a LoweredBucket) -> Self {
        let mut storage = BTreeMap::new();
        for decl in function.inputs.iter().chain(&function.outputs) {
            storage.insert(decl.value, Storage::Pointer(format!("v{}", decl.value.index())));
        }
        for temp in &bucket.temps {
            let s = match temp.class {
                MemoryClass::SSAShadow => Storage::Register,
                _ => Storage::Pointer(format!("t{}", temp.value.index())),
            };
            storage.entry(temp.value).or_insert(s);
        }
        let mut defs = BTreeMap::new();
        for stmt in bucket.body.body.op_stmts() {
            if matches!(stmt.op, StmtOp::Op(_)) {
                for out in &stmt.outputs {
                    defs.insert(*out, stmt);
                }
            }
        }
        Self {
            function,
            bucket,
            target: function.target,
            storage,
            defs,
            src: String::new(),
        }
    }

    fn dtype(&self, v: Value) -> Result<DataType> {
        self.function
            .dtypes
            .get(&v)
            .copied()
            .ok_or_else(|| Error::invariant(format!("{v} has no element type")))
    }

    fn ctype(&self, v: Value) -> Result<&'static str> {
        Ok(self.dtype(v)?.storage_c_name())
    }

    fn dims(&self, v: Value) -> Result<&'a [DimExpr]> {
        self.bucket
            .shapes
            .get(&v)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                Error::invariant(format!("{v} has no shape in {}", self.bucket.kernel_name))
            })
    }

    fn is_stored(&self, v: Value) -> bool {
        matches!(self.storage.get(&v), Some(Storage::Pointer(_)))
    }

    fn pointer(&self, v: Value) -> Result<&str> {
        match self.storage.get(&v) {
            Some(Storage::Pointer(p)) => Ok(p),
            _ => Err(Error::invariant(format!("{v} has no storage"))),
        }
    }

    fn barrier(&self) -> &'static str {
        match self.target {
            Target::Cuda | Target::Hip => "__syncthreads();",
            Target::Sycl => "sycl::group_barrier(item.get_group());",
            Target::Cpu => "__atomic_thread_fence(__ATOMIC_SEQ_CST);",
        }
    }

    fn loop_head(&self, n: &str) -> String {
        match self.target {
            Target::Cuda | Target::Hip => format!(
                "for (int64_t idx = (int64_t)(blockIdx.y * gridDim.x + blockIdx.x) * blockDim.x \
                 + threadIdx.x; idx < {n}; idx += (int64_t)gridDim.x * gridDim.y * blockDim.x)"
            ),
            Target::Sycl => format!(
                "for (int64_t idx = item.get_global_linear_id(); idx < {n}; \
                 idx += item.get_global_range().size())"
            ),
            Target::Cpu => format!("for (int64_t idx = 0; idx < {n}; ++idx)"),
        }
    }

    /// Read `v` at `coords`, inlining register values.
    fn load(&self, v: Value, coords: &[String]) -> Result<String> {
        if self.is_stored(v) {
            return Ok(format!("{}[{}]", self.pointer(v)?, ravel(coords, self.dims(v)?)));
        }
        let stmt = self
            .defs
            .get(&v)
            .ok_or_else(|| Error::invariant(format!("register value {v} has no definition")))?;
        self.op_expr(stmt, v, coords)
    }

    fn operand(&self, stmt: &OpStmt, k: usize, out: Value, coords: &[String]) -> Result<String> {
        let v = *stmt
            .inputs
            .get(k)
            .ok_or_else(|| Error::invariant(format!("`{}` is missing operand {k}", stmt.name)))?;
        let mapped = map_coords(self.dims(out)?, self.dims(v)?, coords)?;
        self.load(v, &mapped)
    }

    fn op_expr(&self, stmt: &OpStmt, out: Value, coords: &[String]) -> Result<String> {
        let dtype = self.dtype(out)?;
        let float = dtype.is_float();
        let unary_math = |f: &str, x: String| {
            if float {
                format!("{f}({x})")
            } else {
                format!("(int64_t){f}((float)({x}))")
            }
        };
        let expr = match stmt.name.as_str() {
            "full" | "full_with_tensor" => lit(attr_f64(stmt, "value")?, dtype),
            "uniform" | "gaussian" => {
                let (ka, kb) =
                    if stmt.name == "uniform" { ("min", "max") } else { ("mean", "std") };
                let seed = stmt.attrs.get("seed").and_then(Attribute::as_i64).unwrap_or(0);
                let call = format!(
                    "cinnabar_{}({}ull, (uint64_t)({}), {}, {})",
                    stmt.name,
                    seed as u64,
                    ravel(coords, self.dims(out)?),
                    float_lit(attr_f64(stmt, ka)?),
                    float_lit(attr_f64(stmt, kb)?)
                );
                if float { call } else { format!("(int64_t){call}") }
            }
            "tan" | "exp" | "log" | "sqrt" | "tanh" => {
                let f = format!("{}f", stmt.name);
                unary_math(&f, self.operand(stmt, 0, out, coords)?)
            }
            "abs" => {
                let x = self.operand(stmt, 0, out, coords)?;
                if float { format!("fabsf({x})") } else { format!("llabs({x})") }
            }
            "relu" => format!("cinnabar_relu({})", self.operand(stmt, 0, out, coords)?),
            "sigmoid" => unary_math("cinnabar_sigmoid", self.operand(stmt, 0, out, coords)?),
            "neg" => format!("(-({}))", self.operand(stmt, 0, out, coords)?),
            "scale" => format!(
                "({} * {} + {})",
                self.operand(stmt, 0, out, coords)?,
                lit(attr_f64(stmt, "scale")?, dtype),
                lit(attr_f64(stmt, "bias")?, dtype)
            ),
            "cast" => {
                format!("(({})({}))", dtype.storage_c_name(), self.operand(stmt, 0, out, coords)?)
            }
            "add" | "sub" | "mul" | "div" => {
                let op = match stmt.name.as_str() {
                    "add" => "+",
                    "sub" => "-",
                    "mul" => "*",
                    _ => "/",
                };
                format!(
                    "({} {op} {})",
                    self.operand(stmt, 0, out, coords)?,
                    self.operand(stmt, 1, out, coords)?
                )
            }
            "maximum" | "minimum" => format!(
                "cinnabar_{}({}, {})",
                &stmt.name[..3],
                self.operand(stmt, 0, out, coords)?,
                self.operand(stmt, 1, out, coords)?
            ),
            "pow" => {
                let a = self.operand(stmt, 0, out, coords)?;
                let b = self.operand(stmt, 1, out, coords)?;
                if float {
                    format!("powf({a}, {b})")
                } else {
                    format!("(int64_t)powf((float)({a}), (float)({b}))")
                }
            }
            "broadcast" | "expand" => self.operand(stmt, 0, out, coords)?,
            "reshape" | "squeeze" | "unsqueeze" => {
                let input = *stmt
                    .inputs
                    .first()
                    .ok_or_else(|| Error::invariant("reshape without operand"))?;
                let lin = ravel(coords, self.dims(out)?);
                let in_dims = self.dims(input)?;
                let mapped = in_dims
                    .iter()
                    .enumerate()
                    .map(|(i, d)| {
                        let stride = DimExpr::product(&in_dims[i + 1..]);
                        format!("(({lin} / {}) % {})", dim_to_c(&stride), dim_to_c(d))
                    })
                    .collect::<Vec<_>>();
                self.load(input, &mapped)?
            }
            other => {
                return Err(Error::unsupported(format!(
                    "no {} lowering for `{other}` in registers",
                    self.target
                )))
            }
        };
        Ok(expr)
    }

    fn open_phase(&mut self, out: Value) -> Result<Vec<String>> {
        let dims = self.dims(out)?;
        let n = dim_to_c(&DimExpr::product(dims));
        let head = self.loop_head(&n);
        writeln!(self.src, "  {head} {{")?;
        writeln!(self.src, "    int64_t rem = idx;")?;
        let mut coords = vec![String::new(); dims.len()];
        for (i, d) in dims.iter().enumerate().rev() {
            writeln!(
                self.src,
                "    const int64_t i{i} = rem % {d}; rem /= {d};",
                d = dim_to_c(d)
            )?;
            coords[i] = format!("i{i}");
        }
        Ok(coords)
    }

    fn close_phase(&mut self) -> Result<()> {
        writeln!(self.src, "    (void)rem;\n  }}")?;
        Ok(())
    }

    fn store_phase(&mut self, stmt: &OpStmt, out: Value) -> Result<()> {
        let coords = self.open_phase(out)?;
        let ptr = self.pointer(out)?.to_string();
        if stmt.name == "matmul" {
            let body = self.matmul(stmt, out, &coords)?;
            self.src.push_str(&body);
            writeln!(self.src, "    {ptr}[idx] = acc;")?;
        } else {
            let expr = self.op_expr(stmt, out, &coords)?;
            writeln!(self.src, "    {ptr}[idx] = {expr};")?;
        }
        self.close_phase()?;
        Ok(())
    }

    fn matmul(&self, stmt: &OpStmt, out: Value, coords: &[String]) -> Result<String> {
        let (a, b) = match stmt.inputs.as_slice() {
            [a, b] => (*a, *b),
            _ => return Err(Error::invariant("matmul needs two operands")),
        };
        let (out_dims, a_dims, b_dims) = (self.dims(out)?, self.dims(a)?, self.dims(b)?);
        let (r, ra, rb) = (out_dims.len(), a_dims.len(), b_dims.len());
        if r < 2 || ra < 2 || rb < 2 {
            return Err(Error::invariant("matmul operands need rank >= 2"));
        }
        let batch = &coords[..r - 2];
        let mut a_coords = map_coords(&out_dims[..r - 2], &a_dims[..ra - 2], batch)?;
        a_coords.extend([coords[r - 2].clone(), "k".to_string()]);
        let mut b_coords = map_coords(&out_dims[..r - 2], &b_dims[..rb - 2], batch)?;
        b_coords.extend(["k".to_string(), coords[r - 1].clone()]);
        Ok(format!(
            "    {ty} acc = 0;\n    for (int64_t k = 0; k < {kd}; ++k) {{\n      \
             acc += {} * {};\n    }}\n",
            self.load(a, &a_coords)?,
            self.load(b, &b_coords)?,
            ty = self.ctype(out)?,
            kd = dim_to_c(&a_dims[ra - 1]),
        ))
    }

    fn reduce_phase(&mut self, stmt: &OpStmt) -> Result<()> {
        let (axes, keepdim) = stmt_reduce_axes(stmt)?;
        let out = *stmt
            .outputs
            .first()
            .ok_or_else(|| Error::invariant(format!("`{}` has no result", stmt.name)))?;
        let input = *stmt
            .inputs
            .first()
            .ok_or_else(|| Error::invariant(format!("`{}` has no operand", stmt.name)))?;
        let in_dims = self.dims(input)?;
        let dtype = self.dtype(out)?;
        let coords = self.open_phase(out)?;
        let ptr = self.pointer(out)?.to_string();

        let mut in_coords = Vec::with_capacity(in_dims.len());
        let mut skipped = 0;
        for a in 0..in_dims.len() {
            if axes.contains(&a) {
                in_coords.push(format!("r{a}"));
                skipped += 1;
            } else if keepdim {
                in_coords.push(coords[a].clone());
            } else {
                in_coords.push(coords[a - skipped].clone());
            }
        }
        let value = self.load(input, &in_coords)?;
        let (init, combine) = match (&stmt.op, stmt.name.as_str()) {
            (StmtOp::InplaceAdd { .. }, _) => {
                (format!("{ptr}[idx]"), format!("acc = acc + {value};"))
            }
            (_, "reduce_sum") => (lit(0.0, dtype), format!("acc = acc + {value};")),
            (_, "reduce_prod") => (lit(1.0, dtype), format!("acc = acc * {value};")),
            (_, "reduce_max") => (
                if dtype.is_float() { "(-INFINITY)".to_string() } else { "INT64_MIN".to_string() },
                format!("acc = cinnabar_max(acc, {value});"),
            ),
            (_, "reduce_min") => (
                if dtype.is_float() { "INFINITY".to_string() } else { "INT64_MAX".to_string() },
                format!("acc = cinnabar_min(acc, {value});"),
            ),
            (_, other) => return Err(Error::unsupported(format!("reduction `{other}`"))),
        };
        writeln!(self.src, "    {} acc = {init};", dtype.storage_c_name())?;
        let mut pad = "    ".to_string();
        for a in &axes {
            if let Some(d) = in_dims.get(*a) {
                let extent = dim_to_c(d);
                writeln!(self.src, "{pad}for (int64_t r{a} = 0; r{a} < {extent}; ++r{a}) {{")?;
                pad.push_str("  ");
            }
        }
        writeln!(self.src, "{pad}{combine}")?;
        for _ in axes.iter().filter(|a| **a < in_dims.len()) {
            pad.truncate(pad.len() - 2);
            writeln!(self.src, "{pad}}}")?;
        }
        writeln!(self.src, "    {ptr}[idx] = acc;")?;
        self.close_phase()?;
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &OpStmt) -> Result<()> {
        match &stmt.op {
            StmtOp::MemoryBarrier => {
                writeln!(self.src, "  {}", self.barrier())?;
            }
            StmtOp::Zeros { .. } => {
                for out in &stmt.outputs {
                    let ptr = self.pointer(*out)?.to_string();
                    self.open_phase(*out)?;
                    writeln!(self.src, "    {ptr}[idx] = 0;")?;
                    self.close_phase()?;
                }
            }
            StmtOp::InplaceAdd { .. } => self.reduce_phase(stmt)?,
            StmtOp::Op(_) if stmt.name.starts_with("reduce_") => self.reduce_phase(stmt)?,
            StmtOp::Op(_) => {
                for out in &stmt.outputs {
                    if self.is_stored(*out) {
                        self.store_phase(stmt, *out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_children(&mut self, children: &'a [MapStmt]) -> Result<()> {
        for child in children {
            match child {
                MapStmt::Op(stmt) => self.emit_stmt(stmt)?,
                MapStmt::Map { children, .. } => self.emit_children(children)?,
            }
        }
        Ok(())
    }

    fn signature(&self) -> Result<String> {
        let restrict = if self.target.is_gpu() { " __restrict__" } else { "" };
        let mut params = Vec::new();
        if self.target == Target::Sycl {
            params.push("sycl::nd_item<3> item".to_string());
            params.push("char* smem".to_string());
        }
        for decl in &self.function.inputs {
            params.push(format!(
                "const {}*{restrict} v{}",
                decl.dtype.storage_c_name(),
                decl.value.index()
            ));
        }
        for decl in &self.function.outputs {
            params.push(format!(
                "{}*{restrict} v{}",
                decl.dtype.storage_c_name(),
                decl.value.index()
            ));
        }
        params.push("char* scratch".to_string());
        params.extend(self.function.symbols.iter().map(|s| format!("int64_t {s}")));
        let qualifier = match self.target {
            Target::Cuda | Target::Hip => "extern \"C\" __global__ void",
            Target::Sycl => "SYCL_EXTERNAL void",
            Target::Cpu => "extern \"C\" void",
        };
        Ok(format!("{qualifier} {}({})", self.bucket.kernel_name, params.join(", ")))
    }

    /// The kernel source.
    pub fn emit(mut self) -> Result<String> {
        let signature = self.signature()?;
        writeln!(self.src, "// {} if {}", self.bucket.kernel_name, self.bucket.predicate)?;
        writeln!(self.src, "{signature} {{")?;
        if self.target.is_gpu()
            && self.target != Target::Sycl
            && self.bucket.shared_bytes != DimExpr::Int(0)
        {
            writeln!(self.src, "  extern __shared__ char smem[];")?;
        }
        for temp in &self.bucket.temps {
            let base = match temp.class {
                MemoryClass::SSAShadow => continue,
                MemoryClass::Shared => "smem",
                MemoryClass::Global => "scratch",
            };
            let ty = self.ctype(temp.value)?;
            writeln!(
                self.src,
                "  {ty}* t{} = ({ty}*)({base} + {});",
                temp.value.index(),
                dim_to_c(&temp.byte_offset)
            )?;
        }
        let bucket = self.bucket;
        match &bucket.body.body {
            MapStmt::Map { children, .. } => self.emit_children(children)?,
            MapStmt::Op(stmt) => self.emit_stmt(stmt)?,
        }
        writeln!(self.src, "}}")?;
        Ok(self.src)
    }
}

/// Device source of every bucket of `function`.
pub fn emit_device_source(function: &LoweredFunction) -> Result<String> {
    let mut src = prelude(function.target, function.dtypes.values().copied());
    for bucket in &function.buckets {
        src.push('\n');
        src.push_str(&CodeEmitter::new(function, bucket).emit()?);
    }
    tracing::trace!(fn_name = %function.fn_name, bytes = src.len(), "emitted device source");
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompileConfig,
        fusion::{cluster_ops, PolicyManager},
        ir::ProgramBuilder,
        lowering::lower,
        symbolic::ShapeAnalysis,
    };

    fn lowered(target: Target) -> LoweredFunction {
        let mut b = ProgramBuilder::new();
        let x = b.input("x", DataType::F32, vec![DimExpr::sym("S0"), 4.into()]);
        let m = b.reduce_max(x, &[-1], true).unwrap();
        let mb = b.broadcast_to(m, vec![DimExpr::sym("S0"), 4.into()]).unwrap();
        let d = b.sub(x, mb).unwrap();
        let e = b.unary("exp", d).unwrap();
        b.output(e);
        let program = b.build().unwrap();
        let groups = cluster_ops(&program, &PolicyManager::default()).unwrap();
        assert_eq!(groups.len(), 1);
        let analysis = ShapeAnalysis::from_program(&program);
        let config = CompileConfig::default().with_target(target);
        lower(&groups[0], &program, &analysis, &config, &[]).unwrap()
    }

    #[test]
    fn cuda_kernel_has_barrier_and_scalar_params() {
        let src = emit_device_source(&lowered(Target::Cuda)).unwrap();
        assert!(src.contains("extern \"C\" __global__ void fn_"));
        assert!(src.contains("__COND_TRUE__kernel("));
        assert!(src.contains("int64_t S0)"));
        assert!(src.contains("__syncthreads();"));
        assert!(src.contains("cinnabar_max(acc, "));
        assert!(src.contains("expf("));
    }

    #[test]
    fn targets_differ_in_loops_and_barriers() {
        let cpu = emit_device_source(&lowered(Target::Cpu)).unwrap();
        assert!(cpu.contains("for (int64_t idx = 0;"));
        assert!(cpu.contains("__atomic_thread_fence"));
        let sycl = emit_device_source(&lowered(Target::Sycl)).unwrap();
        assert!(sycl.contains("sycl::nd_item<3> item"));
        assert!(sycl.contains("sycl::group_barrier"));
    }

    #[test]
    fn broadcast_coordinates_align_right() {
        let out = [DimExpr::sym("S0"), DimExpr::Int(4)];
        let coords = ["i0".to_string(), "i1".to_string()];
        let mapped = map_coords(&out, &[DimExpr::Int(4)], &coords).unwrap();
        assert_eq!(mapped, vec!["i1"]);
        let mapped = map_coords(&out, &[DimExpr::sym("S1"), DimExpr::Int(1)], &coords).unwrap();
        assert_eq!(mapped, vec!["(S1 == 1ll ? 0ll : i0)", "0"]);
        assert_eq!(ravel(&coords, &out), "(i0 * 4ll + i1)");
    }

    #[test]
    fn literals() {
        assert_eq!(float_lit(1.0), "1.0f");
        assert_eq!(float_lit(f64::NEG_INFINITY), "(-INFINITY)");
        assert_eq!(lit(3.0, DataType::I64), "3ll");
    }
}
