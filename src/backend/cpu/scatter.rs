//! Host execution of the scatter kernel: one rayon task per update row.

use rayon::prelude::*;

use crate::buffer::{DeviceBufferView, HostMemory};
use crate::scatter::{AccumulationMode, ScatterIndexSet};
use crate::tensor::compute_strides;

/// Byte offsets of every element of a `shape`/`strides` region relative to its
/// first element, in row-major order.
fn relative_offsets(shape: &[usize], strides: &[usize]) -> Vec<usize> {
    let n: usize = shape.iter().product();
    let dense = compute_strides(shape);
    (0..n)
        .map(|flat| {
            dense
                .iter()
                .zip(shape)
                .zip(strides)
                .map(|((&d, &len), &s)| (flat / d) % len * s)
                .sum()
        })
        .collect()
}

pub(super) fn run(
    indices: &ScatterIndexSet,
    updates: &DeviceBufferView<'_>,
    updates_mem: &HostMemory,
    dest: &DeviceBufferView<'_>,
    dest_mem: &HostMemory,
    mode: AccumulationMode,
) {
    let dtype = dest.dtype();
    let width = dtype.byte_width();
    let depth = indices.depth();

    let slice_bases = indices.slice_offsets(dest);
    let dest_rel = relative_offsets(&dest.shape()[depth..], &dest.strides()[depth..]);
    let update_rel = relative_offsets(&updates.shape()[1..], &updates.strides()[1..]);
    let update_row_stride = updates.strides()[0];

    slice_bases.par_iter().enumerate().for_each(|(row, &base)| {
        let update_base = updates.offset() + row * update_row_stride;
        for (&d, &u) in dest_rel.iter().zip(&update_rel) {
            let bits = updates_mem.load(update_base + u, width);
            match mode {
                AccumulationMode::Overwrite => dest_mem.store(base + d, width, bits),
                AccumulationMode::Sum | AccumulationMode::Max => {
                    dest_mem.update(base + d, width, |current| {
                        mode.combine(dtype, current, bits)
                    });
                }
            }
        }
    });
}
