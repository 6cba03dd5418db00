//! Operator entry points for host frameworks.
//!
//! [`gemm`] allocates its output; [`scatter_nd`] updates its destination in
//! place. [`dispatch`] resolves an [`OperatorCall`] to one of them.

use tracing::debug;

use crate::backend::KernelBackend;
use crate::buffer::{DeviceBufferView, DeviceTensor};
use crate::error::Result;
use crate::gemm::{gemm_dims, GemmKernel};
use crate::registry::OperatorKind;
use crate::scatter::{AccumulationMode, ScatterIndexSet, ScatterKernel};

/// Multiply `a` ([M, K]) by `b` ([K, N]) into a new [M, N] tensor of the same
/// element type.
pub fn gemm(
    backend: &dyn KernelBackend,
    a: &DeviceBufferView<'_>,
    b: &DeviceBufferView<'_>,
) -> Result<DeviceTensor> {
    let (m, k, n) = gemm_dims(a, b)?;
    let dtype = a.dtype();
    let plan = backend.plan_gemm(m, n, k, dtype)?;
    let out = backend.alloc(m * n * dtype.byte_width())?;
    let c = DeviceTensor::new(out, dtype, vec![m, n])?;
    GemmKernel::execute(backend, a, b, &c.view(), &plan)?;
    Ok(c)
}

/// Scatter `updates` into `dest` at `indices`, in place.
pub fn scatter_nd(
    backend: &dyn KernelBackend,
    dest: &DeviceBufferView<'_>,
    indices: &ScatterIndexSet,
    updates: &DeviceBufferView<'_>,
    mode: AccumulationMode,
) -> Result<()> {
    ScatterKernel::execute(backend, indices, updates, dest, mode)
}

/// One operator invocation with its arguments.
#[derive(Debug, Clone)]
pub enum OperatorCall<'a> {
    Gemm {
        a: DeviceBufferView<'a>,
        b: DeviceBufferView<'a>,
    },
    ScatterNd {
        dest: DeviceBufferView<'a>,
        indices: &'a ScatterIndexSet,
        updates: DeviceBufferView<'a>,
        mode: AccumulationMode,
    },
}

impl OperatorCall<'_> {
    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorCall::Gemm { .. } => OperatorKind::Gemm,
            OperatorCall::ScatterNd { .. } => OperatorKind::ScatterNd,
        }
    }
}

/// Result of a dispatched call.
#[derive(Debug)]
pub enum OperatorOutput {
    /// A newly allocated result.
    Tensor(DeviceTensor),
    /// The call updated one of its arguments in place.
    InPlace,
}

impl OperatorOutput {
    pub fn into_tensor(self) -> Option<DeviceTensor> {
        match self {
            OperatorOutput::Tensor(t) => Some(t),
            OperatorOutput::InPlace => None,
        }
    }
}

/// Run `call` on `backend`.
pub fn dispatch(backend: &dyn KernelBackend, call: OperatorCall<'_>) -> Result<OperatorOutput> {
    debug!(op = call.kind().name(), backend = backend.name(), "Dispatching operator");
    match call {
        OperatorCall::Gemm { a, b } => gemm(backend, &a, &b).map(OperatorOutput::Tensor),
        OperatorCall::ScatterNd {
            dest,
            indices,
            updates,
            mode,
        } => scatter_nd(backend, &dest, indices, &updates, mode).map(|()| OperatorOutput::InPlace),
    }
}
