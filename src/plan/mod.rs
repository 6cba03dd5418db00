//! Tile planning for the GEMM kernel.
//!
//! [`plan`] turns problem dimensions and an element width into a [`TilePlan`]:
//! the block tile owned by one cooperating group, the reduction step staged
//! through scratch memory per iteration, the micro-tile owned by each group
//! member, and the grid of groups covering the output.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{KernelError, Result};

/// Accumulators are f32 regardless of storage type.
const ACCUMULATOR_BYTES: usize = 4;

/// Smallest tile edge on any axis.
const MIN_TILE: usize = 8;

/// Block tiles, largest first.
const BLOCK_CANDIDATES: [(usize, usize); 13] = [
    (128, 128),
    (128, 64),
    (64, 128),
    (64, 64),
    (64, 32),
    (32, 64),
    (32, 32),
    (32, 16),
    (16, 32),
    (16, 16),
    (16, 8),
    (8, 16),
    (8, 8),
];

/// Reduction steps, largest first.
const K_CANDIDATES: [usize; 4] = [64, 32, 16, 8];

/// Hardware parameters the planner sizes tiles against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceLimits {
    /// Fast on-chip scratch available to one cooperating group, in bytes.
    pub scratch_bytes: usize,
    /// Maximum members in one cooperating group.
    pub max_threads_per_group: usize,
    /// Members scheduled in lockstep.
    pub warp_size: usize,
    /// Parallel execution units; the planner tries to give each one a group.
    pub compute_units: usize,
    /// Largest group count along one grid axis.
    pub max_grid_dim: usize,
    /// Largest dimension the kernels' index arithmetic can address.
    pub max_index: usize,
}

impl DeviceLimits {
    /// Limits for the host backend.
    pub fn cpu() -> Self {
        Self {
            scratch_bytes: 32 * 1024,
            max_threads_per_group: 1024,
            warp_size: 32,
            compute_units: rayon::current_num_threads().max(1),
            max_grid_dim: u32::MAX as usize,
            max_index: i32::MAX as usize,
        }
    }

    /// Conservative limits for CUDA devices of compute capability 5.3 and up.
    pub fn cuda() -> Self {
        Self {
            scratch_bytes: 48 * 1024,
            max_threads_per_group: 1024,
            warp_size: 32,
            compute_units: 16,
            max_grid_dim: 65_535,
            max_index: u32::MAX as usize,
        }
    }

    /// Apply `TILED_SCRATCH_BYTES`, `TILED_MAX_THREADS` and `TILED_COMPUTE_UNITS`.
    ///
    /// Unparsable or zero values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        fn read(key: &str) -> Option<usize> {
            let raw = std::env::var(key).ok()?;
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    warn!(key, value = %raw, "Ignoring invalid device limit override");
                    None
                }
            }
        }
        if let Some(v) = read("TILED_SCRATCH_BYTES") {
            self.scratch_bytes = v;
        }
        if let Some(v) = read("TILED_MAX_THREADS") {
            self.max_threads_per_group = v;
        }
        if let Some(v) = read("TILED_COMPUTE_UNITS") {
            self.compute_units = v;
        }
        self
    }
}

/// Launch plan for one GEMM invocation.
///
/// Only [`plan`] and [`TilePlan::fixed`] construct one, and a plan cannot be
/// changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TilePlan {
    m: usize,
    n: usize,
    k: usize,
    block_m: usize,
    block_n: usize,
    block_k: usize,
    /// Output rows owned by one member.
    thread_m: usize,
    /// Output columns owned by one member.
    thread_n: usize,
    threads_per_group: usize,
    grid_m: usize,
    grid_n: usize,
    /// Scratch bytes one group stages per reduction step, plus its accumulators.
    scratch_bytes: usize,
}

impl TilePlan {
    /// Plan with caller-chosen tile sizes, for kernels compiled for one shape.
    #[allow(clippy::too_many_arguments)]
    pub fn fixed(
        m: usize,
        n: usize,
        k: usize,
        element_width: usize,
        block: (usize, usize, usize),
        thread: (usize, usize),
        limits: &DeviceLimits,
    ) -> Result<Self> {
        check_problem(m, n, k, element_width, limits)?;
        let (block_m, block_n, block_k) = block;
        let (thread_m, thread_n) = thread;
        // No edge wider than the scratch budget can be staged.
        let edge_limit = limits.max_index.min(limits.scratch_bytes);
        for (name, edge) in [("block_m", block_m), ("block_n", block_n), ("block_k", block_k)] {
            check_dim(name, edge, edge_limit)?;
        }
        if thread_m == 0 || thread_n == 0 || block_m % thread_m != 0 || block_n % thread_n != 0 {
            return Err(KernelError::PlanMismatch(format!(
                "micro-tile {}x{} does not divide block {}x{}",
                thread_m, thread_n, block_m, block_n
            )));
        }
        let threads_per_group = (block_m / thread_m) * (block_n / thread_n);
        if threads_per_group > limits.max_threads_per_group {
            return Err(KernelError::InvalidDimension {
                name: "threads_per_group",
                value: threads_per_group,
                limit: limits.max_threads_per_group,
            });
        }
        let plan = Self {
            m,
            n,
            k,
            block_m,
            block_n,
            block_k,
            thread_m,
            thread_n,
            threads_per_group,
            grid_m: m.div_ceil(block_m),
            grid_n: n.div_ceil(block_n),
            scratch_bytes: staged_bytes(block_m, block_n, block_k, element_width),
        };
        if plan.scratch_bytes > limits.scratch_bytes {
            return Err(KernelError::InsufficientScratch {
                required: plan.scratch_bytes,
                available: limits.scratch_bytes,
            });
        }
        check_grid(&plan, limits)?;
        Ok(plan)
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn block_m(&self) -> usize {
        self.block_m
    }

    pub fn block_n(&self) -> usize {
        self.block_n
    }

    pub fn block_k(&self) -> usize {
        self.block_k
    }

    /// Output rows owned by one member.
    pub fn thread_m(&self) -> usize {
        self.thread_m
    }

    /// Output columns owned by one member.
    pub fn thread_n(&self) -> usize {
        self.thread_n
    }

    pub fn threads_per_group(&self) -> usize {
        self.threads_per_group
    }

    pub fn grid_m(&self) -> usize {
        self.grid_m
    }

    pub fn grid_n(&self) -> usize {
        self.grid_n
    }

    /// Scratch bytes one group stages per reduction step, plus its accumulators.
    pub fn scratch_bytes(&self) -> usize {
        self.scratch_bytes
    }

    /// Total number of cooperating groups.
    pub fn groups(&self) -> usize {
        self.grid_m * self.grid_n
    }

    /// First output (row, column) of group `g`; groups are numbered row-major.
    pub fn tile_origin(&self, g: usize) -> (usize, usize) {
        ((g / self.grid_n) * self.block_m, (g % self.grid_n) * self.block_n)
    }

    /// Number of block_k steps along the reduction axis.
    pub fn k_steps(&self) -> usize {
        self.k.div_ceil(self.block_k)
    }

    /// Flops per byte staged from global memory, per reduction step.
    pub fn arithmetic_intensity(&self, element_width: usize) -> f64 {
        let flops = 2.0 * (self.block_m * self.block_n * self.block_k) as f64;
        let bytes = ((self.block_m + self.block_n) * self.block_k * element_width) as f64;
        flops / bytes
    }

    /// Whether the output tile of group `g` is cut by the M or N bound.
    pub fn is_boundary_tile(&self, g: usize) -> bool {
        let (r0, c0) = self.tile_origin(g);
        r0 + self.block_m > self.m || c0 + self.block_n > self.n
    }
}

/// Operand tiles plus the accumulator tile.
fn staged_bytes(bm: usize, bn: usize, bk: usize, element_width: usize) -> usize {
    (bm * bk + bk * bn) * element_width + bm * bn * ACCUMULATOR_BYTES
}

fn check_dim(name: &'static str, value: usize, limit: usize) -> Result<()> {
    if value == 0 || value > limit {
        return Err(KernelError::InvalidDimension { name, value, limit });
    }
    Ok(())
}

fn check_problem(m: usize, n: usize, k: usize, element_width: usize, limits: &DeviceLimits) -> Result<()> {
    check_dim("M", m, limits.max_index)?;
    check_dim("N", n, limits.max_index)?;
    check_dim("K", k, limits.max_index)?;
    if !matches!(element_width, 1 | 2 | 4 | 8) {
        return Err(KernelError::InvalidDimension {
            name: "element_width",
            value: element_width,
            limit: 8,
        });
    }
    Ok(())
}

fn check_grid(plan: &TilePlan, limits: &DeviceLimits) -> Result<()> {
    check_dim("grid_m", plan.grid_m, limits.max_grid_dim)?;
    check_dim("grid_n", plan.grid_n, limits.max_grid_dim)
}

/// Micro-tile edge for a block edge.
fn micro_tile(block: usize) -> usize {
    if block >= 64 {
        4
    } else if block >= 16 {
        2
    } else {
        1
    }
}

/// Derive a tile plan for an `m x k` by `k x n` product.
///
/// Fails only for zero or oversized dimensions, or when the device cannot hold
/// even the smallest tile in scratch memory.
pub fn plan(
    m: usize,
    n: usize,
    k: usize,
    element_width: usize,
    limits: &DeviceLimits,
) -> Result<TilePlan> {
    check_problem(m, n, k, element_width, limits)?;

    let m_cap = m.next_power_of_two().max(MIN_TILE);
    let n_cap = n.next_power_of_two().max(MIN_TILE);
    let k_cap = k.next_power_of_two().max(MIN_TILE);

    let eligible: Vec<(usize, usize)> = BLOCK_CANDIDATES
        .iter()
        .copied()
        .filter(|&(bm, bn)| {
            bm <= m_cap
                && bn <= n_cap
                && staged_bytes(bm, bn, MIN_TILE, element_width) <= limits.scratch_bytes
        })
        .collect();

    let groups = |bm: usize, bn: usize| m.div_ceil(bm) * n.div_ceil(bn);
    let (block_m, block_n) = match eligible
        .iter()
        .copied()
        .find(|&(bm, bn)| groups(bm, bn) >= limits.compute_units)
        .or_else(|| eligible.last().copied())
    {
        Some(tile) => tile,
        None => {
            return Err(KernelError::InsufficientScratch {
                required: staged_bytes(MIN_TILE, MIN_TILE, MIN_TILE, element_width),
                available: limits.scratch_bytes,
            })
        }
    };

    let block_k = K_CANDIDATES
        .iter()
        .copied()
        .find(|&bk| bk <= k_cap && staged_bytes(block_m, block_n, bk, element_width) <= limits.scratch_bytes)
        .unwrap_or(MIN_TILE);

    let max_threads = limits.max_threads_per_group.max(1);
    let mut thread_m = micro_tile(block_m);
    let mut thread_n = micro_tile(block_n);
    while (block_m / thread_m) * (block_n / thread_n) > max_threads {
        let grow_m = thread_m * 2 <= block_m;
        let grow_n = thread_n * 2 <= block_n;
        match (grow_m, grow_n) {
            (true, true) if thread_m <= thread_n => thread_m *= 2,
            (_, true) => thread_n *= 2,
            (true, false) => thread_m *= 2,
            (false, false) => break,
        }
    }

    let plan = TilePlan {
        m,
        n,
        k,
        block_m,
        block_n,
        block_k,
        thread_m,
        thread_n,
        threads_per_group: (block_m / thread_m) * (block_n / thread_n),
        grid_m: m.div_ceil(block_m),
        grid_n: n.div_ceil(block_n),
        scratch_bytes: staged_bytes(block_m, block_n, block_k, element_width),
    };
    check_grid(&plan, limits)?;

    debug!(
        m,
        n,
        k,
        block_m,
        block_n,
        block_k,
        thread_m,
        thread_n,
        groups = plan.groups(),
        intensity = plan.arithmetic_intensity(element_width),
        "Planned GEMM tiling"
    );
    Ok(plan)
}
