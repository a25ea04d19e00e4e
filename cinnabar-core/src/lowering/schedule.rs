use std::{collections::BTreeMap, fmt::Display};

use crate::{config::Target, symbolic::DimExpr, Error, Result};

/// Parallelization of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopTag {
    Serial,
    /// SIMD over the given lane count.
    Vectorized(u32),
    ThreadParallel,
    BlockParallel,
}

impl Display for LoopTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Vectorized(lanes) => write!(f, "vectorized({lanes})"),
            Self::ThreadParallel => f.write_str("thread"),
            Self::BlockParallel => f.write_str("block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopDesc {
    /// Axis of the iteration domain this loop walks.
    pub axis: usize,
    pub extent: DimExpr,
    /// Tile size for split loops.
    pub tile: Option<i64>,
    pub tag: LoopTag,
    pub is_reduce: bool,
}

/// Loop order, tiling and parallelization of one loop nest, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ScheduleDescriptor {
    pub loops: Vec<LoopDesc>,
}

const VECTOR_LANES: i64 = 8;

impl ScheduleDescriptor {
    /// Default schedule of a spatial domain.
    ///
    /// GPU-family targets bind the innermost loop to threads, tiled by the
    /// target's block size, and every outer loop to blocks. The CPU runs
    /// loops serially and vectorizes the innermost one when its extent is a
    /// static multiple of the lane count.
    pub fn spatial(target: Target, domain: &[DimExpr]) -> Self {
        let last = domain.len().saturating_sub(1);
        let loops = domain
            .iter()
            .enumerate()
            .map(|(axis, extent)| {
                let innermost = axis == last;
                let (tag, tile) = match (target.is_gpu(), innermost) {
                    (true, true) => {
                        let threads = target.max_threads_per_block();
                        let tile = extent.as_int().map_or(threads, |e| e.clamp(1, threads));
                        (LoopTag::ThreadParallel, Some(tile))
                    }
                    (true, false) => (LoopTag::BlockParallel, None),
                    (false, true)
                        if extent.as_int().is_some_and(|e| e > 0 && e % VECTOR_LANES == 0) =>
                    {
                        (LoopTag::Vectorized(VECTOR_LANES as u32), Some(VECTOR_LANES))
                    }
                    (false, _) => (LoopTag::Serial, None),
                };
                LoopDesc {
                    axis,
                    extent: extent.clone(),
                    tile,
                    tag,
                    is_reduce: false,
                }
            })
            .collect();
        Self { loops }
    }

    /// Serial loops over the reduced axes of a reduction input.
    pub fn reduction(axes: &[(usize, DimExpr)]) -> Self {
        Self {
            loops: axes
                .iter()
                .map(|(axis, extent)| LoopDesc {
                    axis: *axis,
                    extent: extent.clone(),
                    tile: None,
                    tag: LoopTag::Serial,
                    is_reduce: true,
                })
                .collect(),
        }
    }

    pub fn loop_order(&self) -> Vec<usize> {
        self.loops.iter().map(|l| l.axis).collect()
    }

    /// Grid and block shape implied by the parallel loops.
    pub fn launch_dims(&self, target: Target) -> LaunchDims {
        if !target.is_gpu() {
            return LaunchDims::serial();
        }
        let mut block_x = 1;
        let mut grid_x = GridExtent::fixed(1);
        let mut outer = Vec::new();
        for l in &self.loops {
            match l.tag {
                LoopTag::ThreadParallel => {
                    let tile = l.tile.unwrap_or(1).max(1);
                    block_x = tile;
                    grid_x = GridExtent {
                        numel: l.extent.clone(),
                        divisor: tile,
                    };
                }
                LoopTag::BlockParallel => outer.push(l.extent.clone()),
                _ => {}
            }
        }
        LaunchDims {
            grid: [
                grid_x,
                GridExtent {
                    numel: DimExpr::product(&outer),
                    divisor: 1,
                },
                GridExtent::fixed(1),
            ],
            block: [block_x, 1, 1],
        }
    }
}

impl Display for ScheduleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, l) in self.loops.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let kind = if l.is_reduce { "r" } else { "i" };
            write!(f, "{kind}{}:{}@{}", l.axis, l.extent, l.tag)?;
            if let Some(tile) = l.tile {
                write!(f, "/{tile}")?;
            }
        }
        Ok(())
    }
}

/// `ceil(numel / divisor)`, evaluated at launch time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridExtent {
    pub numel: DimExpr,
    pub divisor: i64,
}

impl GridExtent {
    pub fn fixed(value: i64) -> Self {
        Self {
            numel: DimExpr::Int(value),
            divisor: 1,
        }
    }

    pub fn evaluate(&self, env: &BTreeMap<String, i64>) -> Result<u32> {
        let numel = self
            .numel
            .evaluate(&|s| env.get(s).copied())
            .ok_or_else(|| {
                Error::runtime(format!("grid extent `{}` is not evaluable", self.numel))
            })?;
        let blocks = (numel.max(0) + self.divisor - 1) / self.divisor.max(1);
        u32::try_from(blocks.max(1)).map_err(Error::wrap)
    }
}

impl Display for GridExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.divisor == 1 {
            write!(f, "{}", self.numel)
        } else {
            write!(f, "ceil({} / {})", self.numel, self.divisor)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchDims {
    pub grid: [GridExtent; 3],
    pub block: [i64; 3],
}

impl LaunchDims {
    pub fn serial() -> Self {
        Self {
            grid: [GridExtent::fixed(1), GridExtent::fixed(1), GridExtent::fixed(1)],
            block: [1, 1, 1],
        }
    }

    pub fn evaluate_grid(&self, env: &BTreeMap<String, i64>) -> Result<[u32; 3]> {
        Ok([
            self.grid[0].evaluate(env)?,
            self.grid[1].evaluate(env)?,
            self.grid[2].evaluate(env)?,
        ])
    }

    pub fn block_u32(&self) -> [u32; 3] {
        self.block.map(|b| b.clamp(1, u32::MAX as i64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_binds_innermost_to_threads() {
        let domain = [DimExpr::sym("S0"), DimExpr::Int(128)];
        let schedule = ScheduleDescriptor::spatial(Target::Cuda, &domain);
        assert_eq!(schedule.loops[0].tag, LoopTag::BlockParallel);
        assert_eq!(schedule.loops[1].tag, LoopTag::ThreadParallel);
        assert_eq!(schedule.loops[1].tile, Some(128));
        let dims = schedule.launch_dims(Target::Cuda);
        let env = BTreeMap::from([("S0".to_string(), 64)]);
        assert_eq!(dims.evaluate_grid(&env).unwrap(), [1, 64, 1]);
        assert_eq!(dims.block, [128, 1, 1]);
    }

    #[test]
    fn cpu_vectorizes_multiples_of_eight() {
        let schedule =
            ScheduleDescriptor::spatial(Target::Cpu, &[DimExpr::Int(4), DimExpr::Int(16)]);
        assert_eq!(schedule.loops[0].tag, LoopTag::Serial);
        assert_eq!(schedule.loops[1].tag, LoopTag::Vectorized(8));
        let schedule = ScheduleDescriptor::spatial(Target::Cpu, &[DimExpr::sym("S0")]);
        assert_eq!(schedule.loops[0].tag, LoopTag::Serial);
        assert_eq!(schedule.launch_dims(Target::Cpu), LaunchDims::serial());
    }

    #[test]
    fn symbolic_grid_rounds_up() {
        let schedule = ScheduleDescriptor::spatial(Target::Hip, &[DimExpr::sym("S0")]);
        let dims = schedule.launch_dims(Target::Hip);
        let env = BTreeMap::from([("S0".to_string(), 1000)]);
        assert_eq!(dims.evaluate_grid(&env).unwrap(), [4, 1, 1]);
    }
}
