//! Host execution of the tiled GEMM kernel.
//!
//! One rayon task per cooperating group. Inside a group the members run the
//! kernel phase by phase: all members stage their share of the A and B slices
//! into group scratch, then (after the barrier) each member accumulates its
//! `thread_m x thread_n` micro-tile from scratch. Every output element sees
//! its K terms in ascending order, so results do not depend on tile position.

use rayon::prelude::*;

use crate::buffer::{DeviceBufferView, HostMemory};
use crate::plan::TilePlan;
use crate::tensor::TensorDtype;

/// A row-major matrix operand in host memory.
pub(super) struct Operand<'a> {
    mem: &'a HostMemory,
    offset: usize,
    row_stride: usize,
    dtype: TensorDtype,
}

impl<'a> Operand<'a> {
    pub(super) fn new(view: &DeviceBufferView<'_>, mem: &'a HostMemory) -> Self {
        Self {
            mem,
            offset: view.offset(),
            row_stride: view.strides()[0],
            dtype: view.dtype(),
        }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> usize {
        let width = self.dtype.byte_width();
        self.offset + row * self.row_stride + col * width
    }

    #[inline]
    fn load(&self, row: usize, col: usize) -> f32 {
        let bits = self.mem.load(self.at(row, col), self.dtype.byte_width());
        self.dtype.decode_f32(bits)
    }

    #[inline]
    fn store(&self, row: usize, col: usize, value: f32) {
        self.mem
            .store(self.at(row, col), self.dtype.byte_width(), self.dtype.encode_f32(value));
    }
}

/// Group-private scratch: one `block_m x block_k` slice of A and one
/// `block_k x block_n` slice of B, widened to f32.
struct GroupScratch {
    a: Vec<f32>,
    b: Vec<f32>,
}

/// Run every group of `plan`.
pub(super) fn run(a: Operand<'_>, b: Operand<'_>, c: Operand<'_>, plan: &TilePlan) {
    (0..plan.groups())
        .into_par_iter()
        .for_each(|g| run_group(&a, &b, &c, plan, g));
}

fn run_group(a: &Operand<'_>, b: &Operand<'_>, c: &Operand<'_>, plan: &TilePlan, g: usize) {
    let (bm, bn, bk) = (plan.block_m(), plan.block_n(), plan.block_k());
    let (tm, tn) = (plan.thread_m(), plan.thread_n());
    let members = plan.threads_per_group();
    let members_n = bn / tn;
    let (row0, col0) = plan.tile_origin(g);

    let mut scratch = GroupScratch {
        a: vec![0.0; bm * bk],
        b: vec![0.0; bk * bn],
    };
    // Per-member accumulators, member-major.
    let mut acc = vec![0.0f32; members * tm * tn];

    for step in 0..plan.k_steps() {
        let k0 = step * bk;

        // Cooperative staging: member t loads elements t, t + members, ...
        // Out-of-bounds elements are zero-filled.
        for t in 0..members {
            for e in (t..bm * bk).step_by(members) {
                let (r, kk) = (e / bk, e % bk);
                let (row, k) = (row0 + r, k0 + kk);
                scratch.a[e] = if row < plan.m() && k < plan.k() {
                    a.load(row, k)
                } else {
                    0.0
                };
            }
            for e in (t..bk * bn).step_by(members) {
                let (kk, cc) = (e / bn, e % bn);
                let (k, col) = (k0 + kk, col0 + cc);
                scratch.b[e] = if k < plan.k() && col < plan.n() {
                    b.load(k, col)
                } else {
                    0.0
                };
            }
        }

        // Barrier: scratch is fully staged before any member reads it.
        for t in 0..members {
            let (mr, mc) = ((t / members_n) * tm, (t % members_n) * tn);
            let acc = &mut acc[t * tm * tn..(t + 1) * tm * tn];
            for kk in 0..bk {
                for i in 0..tm {
                    let av = scratch.a[(mr + i) * bk + kk];
                    for j in 0..tn {
                        acc[i * tn + j] += av * scratch.b[kk * bn + mc + j];
                    }
                }
            }
        }
    }

    // Epilogue: one masked store per output element.
    for t in 0..members {
        let (mr, mc) = ((t / members_n) * tm, (t % members_n) * tn);
        let acc = &acc[t * tm * tn..(t + 1) * tm * tn];
        for i in 0..tm {
            let row = row0 + mr + i;
            if row >= plan.m() {
                break;
            }
            for j in 0..tn {
                let col = col0 + mc + j;
                if col >= plan.n() {
                    break;
                }
                c.store(row, col, acc[i * tn + j]);
            }
        }
    }
}
