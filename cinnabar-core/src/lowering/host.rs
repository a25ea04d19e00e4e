use std::fmt::Write;

use crate::{config::Target, symbolic::DimExpr, Result};

use super::{cond::dim_to_c, GridExtent, LoweredFunction};

fn grid_to_c(extent: &GridExtent) -> String {
    if extent.divisor == 1 {
        format!("(uint32_t){}", dim_to_c(&extent.numel))
    } else {
        format!(
            "(uint32_t)(({} + {d} - 1) / {d})",
            dim_to_c(&extent.numel),
            d = extent.divisor
        )
    }
}

fn alloc_call(target: Target) -> &'static str {
    match target {
        Target::Cuda | Target::Hip | Target::Sycl => "cinnabar_device_alloc",
        Target::Cpu => "cinnabar_host_alloc",
    }
}

/// Host launcher of a lowered function.
///
/// The packed `args` hold the input and output tensor pointers followed by
/// one pointer per scalar shape argument. Buckets are tested in order and
/// the first holding predicate launches; an unconditional bucket is called
/// without a guard.
pub fn emit_host_launcher(function: &LoweredFunction) -> Result<String> {
    let mut src = String::new();
    let tensors = function.inputs.len() + function.outputs.len();
    writeln!(src, "// host launcher of {}", function.fn_name)?;
    writeln!(
        src,
        "extern \"C\" int32_t {}(void** args, int32_t num_args, void* stream) {{",
        function.fn_name
    )?;
    for (pos, binding) in &function.int_args_map {
        writeln!(
            src,
            "  const int64_t {} = *(const int64_t*)args[{pos}]; // {binding}",
            binding.symbol()
        )?;
    }

    let kernel_args = |scratch: &str| {
        let mut args: Vec<String> = (0..tensors).map(|i| format!("args[{i}]")).collect();
        args.push(format!("&{scratch}"));
        args.extend((tensors..function.num_args()).map(|i| format!("args[{i}]")));
        args
    };

    let mut opened = false;
    for bucket in &function.buckets {
        let guarded = !bucket.predicate.is_true();
        if guarded {
            let keyword = if opened { "} else if" } else { "if" };
            writeln!(src, "  {keyword} ({}) {{", bucket.predicate.to_c())?;
        } else if opened {
            writeln!(src, "  }} else {{")?;
        }
        let indent = if guarded || opened { "    " } else { "  " };
        opened |= guarded;
        let scratch = "scratch";
        writeln!(src, "{indent}char* {scratch} = nullptr;")?;
        if bucket.scratch_bytes != DimExpr::Int(0) {
            writeln!(
                src,
                "{indent}{scratch} = (char*){}({}, stream);",
                alloc_call(function.target),
                dim_to_c(&bucket.scratch_bytes)
            )?;
        }
        for temp in &bucket.temps {
            writeln!(
                src,
                "{indent}// {} in {} at +{}",
                temp.name,
                temp.class,
                dim_to_c(&temp.byte_offset)
            )?;
        }
        let args = kernel_args(scratch);
        writeln!(src, "{indent}void* kernel_args[] = {{{}}};", args.join(", "))?;
        let [gx, gy, gz] = &bucket.launch.grid;
        let [bx, by, bz] = bucket.launch.block;
        writeln!(
            src,
            "{indent}int32_t status = call_kernel(\"{}\", kernel_args, {}, {}, {}, {}, \
             {bx}, {by}, {bz}, {}, stream);",
            bucket.kernel_name,
            args.len(),
            grid_to_c(gx),
            grid_to_c(gy),
            grid_to_c(gz),
            dim_to_c(&bucket.shared_bytes),
        )?;
        if bucket.scratch_bytes != DimExpr::Int(0) {
            writeln!(src, "{indent}cinnabar_free({scratch}, stream);")?;
        }
        writeln!(src, "{indent}return status;")?;
        if !guarded {
            break;
        }
    }
    if opened {
        writeln!(src, "  }}")?;
    }
    if function.buckets.iter().all(|b| !b.predicate.is_true()) {
        writeln!(src, "  return CINNABAR_NO_BUCKET;")?;
    }
    writeln!(src, "}}")?;
    Ok(src)
}
