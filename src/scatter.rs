//! Scattered-index update kernel.
//!
//! [`ScatterKernel::execute`] writes or accumulates rows of `updates` into the
//! slices of `dest` selected by a [`ScatterIndexSet`]. All indices are validated
//! on the host before any write is issued, so a rejected call leaves `dest`
//! untouched.
//!
//! Colliding indices are allowed. Under [`AccumulationMode::Sum`] and
//! [`AccumulationMode::Max`] every destination element is combined with an
//! atomic read-modify-write, so the result does not depend on the order in
//! which colliding rows arrive. Under [`AccumulationMode::Overwrite`] the
//! element ends up holding exactly one of the contending values; which one is
//! unspecified and callers must not rely on last-writer-wins.

use serde::Serialize;
use tracing::trace;

use crate::backend::KernelBackend;
use crate::buffer::DeviceBufferView;
use crate::error::{KernelError, Result};
use crate::tensor::TensorDtype;

/// How a scattered update combines with the destination element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    Overwrite,
    Sum,
    Max,
}

impl AccumulationMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "overwrite" | "assign" => Some(AccumulationMode::Overwrite),
            "sum" | "add" => Some(AccumulationMode::Sum),
            "max" => Some(AccumulationMode::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccumulationMode::Overwrite => "overwrite",
            AccumulationMode::Sum => "sum",
            AccumulationMode::Max => "max",
        }
    }

    /// New element bits for `current` combined with `update`, or `None` to keep
    /// `current`.
    ///
    /// Float sums are computed in f32 and rounded to the storage type; integer
    /// sums wrap. Max replaces only when `update > current`, so NaN never
    /// replaces and is never replaced.
    pub fn combine(&self, dtype: TensorDtype, current: u32, update: u32) -> Option<u32> {
        match (self, dtype) {
            (AccumulationMode::Overwrite, _) => Some(update),
            (AccumulationMode::Sum, TensorDtype::I32) => {
                Some((current as i32).wrapping_add(update as i32) as u32)
            }
            (AccumulationMode::Sum, _) => {
                Some(dtype.encode_f32(dtype.decode_f32(current) + dtype.decode_f32(update)))
            }
            (AccumulationMode::Max, TensorDtype::I32) => {
                ((update as i32) > (current as i32)).then_some(update)
            }
            (AccumulationMode::Max, _) => {
                (dtype.decode_f32(update) > dtype.decode_f32(current)).then_some(update)
            }
        }
    }
}

/// Ordered indices into the leading dimensions of a scatter destination.
///
/// Each entry is a tuple of `depth` coordinates; with depth 1 the entries are
/// plain row indices. Duplicates are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterIndexSet {
    coords: Vec<i64>,
    depth: usize,
}

impl ScatterIndexSet {
    /// Row indices into the destination's leading dimension.
    pub fn new(indices: Vec<i64>) -> Self {
        Self {
            coords: indices,
            depth: 1,
        }
    }

    /// Flattened index tuples of `depth` coordinates each.
    pub fn nd(coords: Vec<i64>, depth: usize) -> Result<Self> {
        if depth == 0 || coords.len() % depth != 0 {
            return Err(KernelError::ShapeMismatch {
                op: "scatter_nd index tuples",
                expected: vec![coords.len() / depth.max(1), depth],
                actual: vec![coords.len()],
            });
        }
        Ok(Self { coords, depth })
    }

    /// Number of index tuples, which is the number of update rows.
    pub fn len(&self) -> usize {
        self.coords.len() / self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn tuple(&self, i: usize) -> &[i64] {
        &self.coords[i * self.depth..(i + 1) * self.depth]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[i64]> {
        self.coords.chunks_exact(self.depth)
    }

    /// Check every coordinate against the destination's leading dimensions.
    pub fn validate(&self, dest_shape: &[usize]) -> Result<()> {
        if self.depth > dest_shape.len() {
            return Err(KernelError::ShapeMismatch {
                op: "scatter_nd index depth",
                expected: dest_shape.to_vec(),
                actual: vec![self.depth],
            });
        }
        for (position, tuple) in self.iter().enumerate() {
            for (axis, (&index, &bound)) in tuple.iter().zip(dest_shape).enumerate() {
                if index < 0 || index as u64 >= bound as u64 {
                    return Err(KernelError::IndexOutOfRange {
                        position,
                        axis,
                        index,
                        bound,
                    });
                }
            }
        }
        Ok(())
    }

    /// Buffer byte offset of the destination slice addressed by each tuple.
    ///
    /// Only meaningful after [`validate`](Self::validate) succeeded.
    pub fn slice_offsets(&self, dest: &DeviceBufferView<'_>) -> Vec<usize> {
        let strides = &dest.strides()[..self.depth];
        self.iter()
            .map(|tuple| {
                dest.offset()
                    + tuple
                        .iter()
                        .zip(strides)
                        .map(|(&i, &s)| i as usize * s)
                        .sum::<usize>()
            })
            .collect()
    }
}

/// Scattered update of a destination view.
pub struct ScatterKernel;

impl ScatterKernel {
    /// Validate the call, then scatter `updates` into `dest` in place.
    ///
    /// `updates` must have shape `[indices.len()] ++ dest.shape[depth..]`.
    pub fn execute(
        backend: &dyn KernelBackend,
        indices: &ScatterIndexSet,
        updates: &DeviceBufferView<'_>,
        dest: &DeviceBufferView<'_>,
        mode: AccumulationMode,
    ) -> Result<()> {
        let depth = indices.depth();
        if depth > dest.rank() {
            return Err(KernelError::ShapeMismatch {
                op: "scatter_nd index depth",
                expected: dest.shape().to_vec(),
                actual: vec![depth],
            });
        }

        let mut expected = vec![indices.len()];
        expected.extend_from_slice(&dest.shape()[depth..]);
        if updates.shape() != expected.as_slice() {
            return Err(KernelError::ShapeMismatch {
                op: "scatter_nd updates",
                expected,
                actual: updates.shape().to_vec(),
            });
        }

        if updates.dtype() != dest.dtype() {
            return Err(KernelError::UnsupportedDtype {
                op: "scatter_nd (updates and dest differ)",
                dtype: updates.dtype(),
            });
        }
        if !backend.supports_scatter(dest.dtype()) {
            return Err(KernelError::UnsupportedDtype {
                op: "scatter_nd",
                dtype: dest.dtype(),
            });
        }
        if !dest.is_non_overlapping() {
            return Err(KernelError::UnsupportedLayout(format!(
                "scatter_nd: dest strides {:?} map distinct elements to the same memory",
                dest.strides()
            )));
        }
        if dest.overlaps(updates) {
            return Err(KernelError::AliasedBuffers(
                "scatter_nd destination overlaps updates".to_string(),
            ));
        }

        indices.validate(dest.shape())?;

        if indices.is_empty() || updates.n_elements() == 0 {
            trace!("scatter_nd with no elements, nothing to do");
            return Ok(());
        }

        trace!(
            rows = indices.len(),
            depth,
            mode = mode.as_str(),
            dtype = ?dest.dtype(),
            backend = backend.name(),
            "Launching scatter_nd"
        );
        backend.launch_scatter(indices, updates, dest, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::buffer::DeviceTensor;
    use crate::tensor::Tensor;

    fn upload(b: &CpuBackend, t: &Tensor) -> DeviceTensor {
        b.upload(t).unwrap()
    }

    #[test]
    fn test_combine_float_modes() {
        let f = TensorDtype::F32;
        let (three, five) = (3.0f32.to_bits(), 5.0f32.to_bits());
        assert_eq!(AccumulationMode::Overwrite.combine(f, three, five), Some(five));
        assert_eq!(
            AccumulationMode::Sum.combine(f, three, five),
            Some(8.0f32.to_bits())
        );
        assert_eq!(AccumulationMode::Max.combine(f, three, five), Some(five));
        assert_eq!(AccumulationMode::Max.combine(f, five, three), None);
    }

    #[test]
    fn test_combine_max_nan_is_sticky_and_ignored() {
        let f = TensorDtype::F32;
        let nan = f32::NAN.to_bits();
        assert_eq!(AccumulationMode::Max.combine(f, 1.0f32.to_bits(), nan), None);
        assert_eq!(AccumulationMode::Max.combine(f, nan, 1.0f32.to_bits()), None);
    }

    #[test]
    fn test_combine_i32_wraps() {
        let i = TensorDtype::I32;
        let got = AccumulationMode::Sum.combine(i, i32::MAX as u32, 1).unwrap();
        assert_eq!(got as i32, i32::MIN);
        assert_eq!(AccumulationMode::Max.combine(i, (-5i32) as u32, (-7i32) as u32), None);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(AccumulationMode::parse("SUM"), Some(AccumulationMode::Sum));
        assert_eq!(AccumulationMode::parse("assign"), Some(AccumulationMode::Overwrite));
        assert_eq!(AccumulationMode::parse("min"), None);
    }

    #[test]
    fn test_index_set_nd_shape() {
        let set = ScatterIndexSet::nd(vec![0, 1, 2, 3], 2).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.tuple(1), &[2, 3]);
        assert!(ScatterIndexSet::nd(vec![0, 1, 2], 2).is_err());
        assert!(ScatterIndexSet::nd(vec![], 0).is_err());
    }

    #[test]
    fn test_validate_reports_first_bad_index() {
        let set = ScatterIndexSet::new(vec![0, 2, 3, -1]);
        match set.validate(&[3, 4]) {
            Err(KernelError::IndexOutOfRange {
                position: 2,
                axis: 0,
                index: 3,
                bound: 3,
            }) => {}
            other => panic!("expected IndexOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_negative_index() {
        let set = ScatterIndexSet::new(vec![-1]);
        assert!(matches!(
            set.validate(&[3]),
            Err(KernelError::IndexOutOfRange { index: -1, .. })
        ));
    }

    #[test]
    fn test_validate_depth_exceeds_rank() {
        let set = ScatterIndexSet::nd(vec![0, 0], 2).unwrap();
        assert!(matches!(
            set.validate(&[3]),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_execute_rejects_update_count_mismatch() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::zeros(&[3, 2], TensorDtype::F32));
        let updates = upload(&b, &Tensor::zeros(&[3, 2], TensorDtype::F32));
        let indices = ScatterIndexSet::new(vec![0, 1]);
        let result = ScatterKernel::execute(
            &b,
            &indices,
            &updates.view(),
            &dest.view(),
            AccumulationMode::Sum,
        );
        match result {
            Err(KernelError::ShapeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, vec![2, 2]);
                assert_eq!(actual, vec![3, 2]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_rejects_trailing_dim_mismatch() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::zeros(&[3, 2], TensorDtype::F32));
        let updates = upload(&b, &Tensor::zeros(&[2, 3], TensorDtype::F32));
        let indices = ScatterIndexSet::new(vec![0, 1]);
        let result = ScatterKernel::execute(
            &b,
            &indices,
            &updates.view(),
            &dest.view(),
            AccumulationMode::Overwrite,
        );
        assert!(matches!(result, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_execute_rejects_dtype_mismatch() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::zeros(&[3], TensorDtype::F32));
        let updates = upload(&b, &Tensor::zeros(&[1], TensorDtype::I32));
        let indices = ScatterIndexSet::new(vec![0]);
        let result = ScatterKernel::execute(
            &b,
            &indices,
            &updates.view(),
            &dest.view(),
            AccumulationMode::Sum,
        );
        assert!(matches!(result, Err(KernelError::UnsupportedDtype { .. })));
    }

    #[test]
    fn test_execute_rejects_aliased_updates() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]));
        let full = dest.view();
        let updates = full.narrow(0, 0, 2).unwrap();
        let indices = ScatterIndexSet::new(vec![2, 3]);
        let result = ScatterKernel::execute(&b, &indices, &updates, &full, AccumulationMode::Sum);
        assert!(matches!(result, Err(KernelError::AliasedBuffers(_))));
    }

    #[test]
    fn test_execute_rejects_broadcast_dest() {
        let b = CpuBackend::new();
        let raw = upload(&b, &Tensor::new(vec![2], vec![1.0, 2.0]));
        // Rows 0..3 of dest all alias the same two elements.
        let dest =
            DeviceBufferView::new(raw.buffer(), 0, TensorDtype::F32, vec![3, 2], vec![0, 4])
                .unwrap();
        let updates = upload(&b, &Tensor::new(vec![2, 2], vec![5.0, 6.0, 7.0, 8.0]));
        let indices = ScatterIndexSet::new(vec![0, 2]);
        let result =
            ScatterKernel::execute(&b, &indices, &updates.view(), &dest, AccumulationMode::Sum);
        assert!(matches!(result, Err(KernelError::UnsupportedLayout(_))));
        assert_eq!(b.download(&raw.view()).unwrap().as_f32(), &[1.0, 2.0]);
    }

    #[test]
    fn test_out_of_range_leaves_dest_unmodified() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::new(vec![3], vec![1.0, 2.0, 3.0]));
        let updates = upload(&b, &Tensor::new(vec![3], vec![10.0, 20.0, 30.0]));
        // The bad index comes last: nothing before it may be applied either.
        let indices = ScatterIndexSet::new(vec![0, 1, 3]);
        let result = ScatterKernel::execute(
            &b,
            &indices,
            &updates.view(),
            &dest.view(),
            AccumulationMode::Sum,
        );
        assert!(matches!(result, Err(KernelError::IndexOutOfRange { position: 2, .. })));
        let after = b.download(&dest.view()).unwrap();
        assert_eq!(after.as_f32(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_empty_index_set_is_noop() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]));
        let updates = upload(&b, &Tensor::zeros(&[0, 2], TensorDtype::F32));
        let indices = ScatterIndexSet::new(vec![]);
        ScatterKernel::execute(
            &b,
            &indices,
            &updates.view(),
            &dest.view(),
            AccumulationMode::Overwrite,
        )
        .unwrap();
        assert_eq!(b.download(&dest.view()).unwrap().as_f32(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_slice_offsets_follow_dest_strides() {
        let b = CpuBackend::new();
        let dest = upload(&b, &Tensor::zeros(&[2, 3, 4], TensorDtype::F32));
        let indices = ScatterIndexSet::nd(vec![1, 2, 0, 1], 2).unwrap();
        let offsets = indices.slice_offsets(&dest.view());
        assert_eq!(offsets, vec![(12 + 8) * 4, 4 * 4]);
    }
}
