//! Tiled general matrix multiply.
//!
//! [`GemmKernel::execute`] computes `C = A x B` for row-major operands whose
//! innermost dimension is densely packed (rows may be padded). The launch is
//! described by a [`TilePlan`]; each cooperating group owns one output tile,
//! walks K in `block_k` steps through group-private scratch memory, and
//! accumulates in f32 before a single masked store per output element.

use tracing::trace;

use crate::backend::KernelBackend;
use crate::buffer::DeviceBufferView;
use crate::error::{KernelError, Result};
use crate::plan::TilePlan;

/// Problem dimensions `(M, K, N)` of `a x b`, or `ShapeMismatch`.
pub fn gemm_dims(a: &DeviceBufferView<'_>, b: &DeviceBufferView<'_>) -> Result<(usize, usize, usize)> {
    if a.rank() != 2 {
        return Err(KernelError::ShapeMismatch {
            op: "gemm: A must be rank 2",
            expected: vec![a.n_elements()],
            actual: a.shape().to_vec(),
        });
    }
    if b.rank() != 2 {
        return Err(KernelError::ShapeMismatch {
            op: "gemm: B must be rank 2",
            expected: vec![b.n_elements()],
            actual: b.shape().to_vec(),
        });
    }
    let (m, k) = (a.shape()[0], a.shape()[1]);
    let n = b.shape()[1];
    if b.shape()[0] != k {
        return Err(KernelError::ShapeMismatch {
            op: "gemm: B rows must equal A columns",
            expected: vec![k, n],
            actual: b.shape().to_vec(),
        });
    }
    Ok((m, k, n))
}

/// Tiled matrix multiply-accumulate.
pub struct GemmKernel;

impl GemmKernel {
    /// Validate the operands against each other and `plan`, then launch.
    ///
    /// Writes only to `c`; `a` and `b` are read-only.
    pub fn execute(
        backend: &dyn KernelBackend,
        a: &DeviceBufferView<'_>,
        b: &DeviceBufferView<'_>,
        c: &DeviceBufferView<'_>,
        plan: &TilePlan,
    ) -> Result<()> {
        let (m, k, n) = gemm_dims(a, b)?;
        if c.shape() != [m, n] {
            return Err(KernelError::ShapeMismatch {
                op: "gemm: C must be M x N",
                expected: vec![m, n],
                actual: c.shape().to_vec(),
            });
        }
        if (plan.m(), plan.n(), plan.k()) != (m, n, k) {
            return Err(KernelError::PlanMismatch(format!(
                "plan is for {}x{}x{}, operands are {}x{}x{}",
                plan.m(), plan.n(), plan.k(), m, n, k
            )));
        }

        for (name, view) in [("A", a), ("B", b), ("C", c)] {
            if !view.is_inner_contiguous() {
                return Err(KernelError::UnsupportedLayout(format!(
                    "gemm: {} has inner stride {} bytes for {}-byte elements",
                    name,
                    view.strides()[1],
                    view.dtype().byte_width()
                )));
            }
        }

        if !c.is_non_overlapping() {
            return Err(KernelError::UnsupportedLayout(format!(
                "gemm: C strides {:?} map distinct elements to the same memory",
                c.strides()
            )));
        }

        let dtype = a.dtype();
        if b.dtype() != dtype || c.dtype() != dtype {
            return Err(KernelError::UnsupportedDtype {
                op: "gemm (operands must share one element type)",
                dtype: if b.dtype() != dtype { b.dtype() } else { c.dtype() },
            });
        }
        if !dtype.is_float() || !backend.supports_gemm(dtype) {
            return Err(KernelError::UnsupportedDtype { op: "gemm", dtype });
        }

        if c.overlaps(a) || c.overlaps(b) {
            return Err(KernelError::AliasedBuffers(
                "gemm output overlaps an input operand".to_string(),
            ));
        }

        trace!(
            m,
            n,
            k,
            dtype = ?dtype,
            groups = plan.groups(),
            backend = backend.name(),
            "Launching gemm"
        );
        backend.launch_gemm(a, b, c, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::buffer::{DeviceBuffer, DeviceTensor};
    use crate::tensor::{Tensor, TensorDtype};

    fn setup(
        b: &CpuBackend,
        a_shape: &[usize],
        b_shape: &[usize],
        c_shape: &[usize],
    ) -> (DeviceTensor, DeviceTensor, DeviceTensor) {
        (
            b.upload(&Tensor::zeros(a_shape, TensorDtype::F32)).unwrap(),
            b.upload(&Tensor::zeros(b_shape, TensorDtype::F32)).unwrap(),
            b.upload(&Tensor::zeros(c_shape, TensorDtype::F32)).unwrap(),
        )
    }

    #[test]
    fn test_gemm_dims() {
        let be = CpuBackend::new();
        let (a, b, _) = setup(&be, &[2, 3], &[3, 5], &[2, 5]);
        assert_eq!(gemm_dims(&a.view(), &b.view()).unwrap(), (2, 3, 5));
    }

    #[test]
    fn test_inner_dimension_mismatch() {
        let be = CpuBackend::new();
        let (a, b, c) = setup(&be, &[2, 3], &[4, 2], &[2, 2]);
        let plan = be.plan_gemm(2, 2, 3, TensorDtype::F32).unwrap();
        match GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan) {
            Err(KernelError::ShapeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, vec![3, 2]);
                assert_eq!(actual, vec![4, 2]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_output_shape_mismatch() {
        let be = CpuBackend::new();
        let (a, b, c) = setup(&be, &[2, 3], &[3, 2], &[2, 3]);
        let plan = be.plan_gemm(2, 2, 3, TensorDtype::F32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rank_mismatch() {
        let be = CpuBackend::new();
        let (a, b, c) = setup(&be, &[6], &[3, 2], &[2, 2]);
        let plan = be.plan_gemm(2, 2, 3, TensorDtype::F32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_plan_for_other_problem() {
        let be = CpuBackend::new();
        let (a, b, c) = setup(&be, &[2, 3], &[3, 2], &[2, 2]);
        let plan = be.plan_gemm(4, 2, 3, TensorDtype::F32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan),
            Err(KernelError::PlanMismatch(_))
        ));
    }

    #[test]
    fn test_transposed_operand_is_unsupported_layout() {
        let be = CpuBackend::new();
        let (a, _, c) = setup(&be, &[2, 3], &[3, 2], &[2, 2]);
        // B viewed as the transpose of a row-major 2x3 buffer.
        let raw = DeviceBuffer::host(6 * 4);
        let bt = DeviceBufferView::new(&raw, 0, TensorDtype::F32, vec![3, 2], vec![4, 12]).unwrap();
        let plan = be.plan_gemm(2, 2, 3, TensorDtype::F32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &bt, &c.view(), &plan),
            Err(KernelError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn test_mixed_dtypes_rejected() {
        let be = CpuBackend::new();
        let a = be.upload(&Tensor::zeros(&[2, 2], TensorDtype::F16)).unwrap();
        let (_, b, c) = setup(&be, &[2, 2], &[2, 2], &[2, 2]);
        let plan = be.plan_gemm(2, 2, 2, TensorDtype::F16).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan),
            Err(KernelError::UnsupportedDtype { .. })
        ));
    }

    #[test]
    fn test_integer_gemm_rejected() {
        let be = CpuBackend::new();
        let a = be.upload(&Tensor::zeros(&[2, 2], TensorDtype::I32)).unwrap();
        let b = be.upload(&Tensor::zeros(&[2, 2], TensorDtype::I32)).unwrap();
        let c = be.upload(&Tensor::zeros(&[2, 2], TensorDtype::I32)).unwrap();
        let plan = be.plan_gemm(2, 2, 2, TensorDtype::I32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c.view(), &plan),
            Err(KernelError::UnsupportedDtype { dtype: TensorDtype::I32, .. })
        ));
    }

    #[test]
    fn test_output_aliasing_input_rejected() {
        let be = CpuBackend::new();
        let buf = be.upload(&Tensor::zeros(&[2, 2], TensorDtype::F32)).unwrap();
        let plan = be.plan_gemm(2, 2, 2, TensorDtype::F32).unwrap();
        let v = buf.view();
        assert!(matches!(
            GemmKernel::execute(&be, &v, &v, &v, &plan),
            Err(KernelError::AliasedBuffers(_))
        ));
    }

    #[test]
    fn test_broadcast_output_rejected() {
        let be = CpuBackend::new();
        let (a, b, _) = setup(&be, &[3, 2], &[2, 2], &[3, 2]);
        // Every row of C maps onto the same two floats.
        let raw = DeviceBuffer::host(2 * 4);
        let c = DeviceBufferView::new(&raw, 0, TensorDtype::F32, vec![3, 2], vec![0, 4]).unwrap();
        let plan = be.plan_gemm(3, 2, 2, TensorDtype::F32).unwrap();
        assert!(matches!(
            GemmKernel::execute(&be, &a.view(), &b.view(), &c, &plan),
            Err(KernelError::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn test_broadcast_input_is_allowed() {
        let be = CpuBackend::new();
        // A repeats the row [1, 2] three times; inputs are only read.
        let row = be.upload(&Tensor::new(vec![2], vec![1.0, 2.0])).unwrap();
        let a = DeviceBufferView::new(row.buffer(), 0, TensorDtype::F32, vec![3, 2], vec![0, 4])
            .unwrap();
        let b = be.upload(&Tensor::new(vec![2, 1], vec![3.0, 4.0])).unwrap();
        let c = be.upload(&Tensor::zeros(&[3, 1], TensorDtype::F32)).unwrap();
        let plan = be.plan_gemm(3, 1, 2, TensorDtype::F32).unwrap();
        GemmKernel::execute(&be, &a, &b.view(), &c.view(), &plan).unwrap();
        assert_eq!(be.download(&c.view()).unwrap().as_f32(), &[11.0, 11.0, 11.0]);
    }

    #[test]
    fn test_disjoint_regions_of_one_buffer_are_allowed() {
        let be = CpuBackend::new();
        // A (2x2), B (2x2) and C (2x2) stacked in one 6x2 allocation.
        let host = Tensor::new(
            vec![6, 2],
            vec![1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        );
        let buf = be.upload(&host).unwrap();
        let all = buf.view();
        let (a, b, c) = (
            all.narrow(0, 0, 2).unwrap(),
            all.narrow(0, 2, 2).unwrap(),
            all.narrow(0, 4, 2).unwrap(),
        );
        let plan = be.plan_gemm(2, 2, 2, TensorDtype::F32).unwrap();
        GemmKernel::execute(&be, &a, &b, &c, &plan).unwrap();
        assert_eq!(be.download(&c).unwrap().as_f32(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
