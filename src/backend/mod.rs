//! Kernel backend trait and backend selection.
//!
//! Defines the [`KernelBackend`] trait: device memory management plus launch
//! entry points for the tiled GEMM and scatter kernels. Argument validation
//! lives in [`GemmKernel`](crate::gemm::GemmKernel) and
//! [`ScatterKernel`](crate::scatter::ScatterKernel); a backend's `launch_*`
//! methods may assume they receive validated operands.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use std::sync::Arc;

use tracing::info;

use crate::buffer::{DeviceBuffer, DeviceBufferView, DeviceTensor};
use crate::error::Result;
use crate::plan::{self, DeviceLimits, TilePlan};
use crate::scatter::{AccumulationMode, ScatterIndexSet};
use crate::tensor::{Tensor, TensorDtype};

/// A device the kernels can run on.
///
/// Implementations exist for the host CPU (always available) and for CUDA
/// devices (behind the `cuda` feature).
pub trait KernelBackend: Send + Sync {
    /// Short backend name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Whether buffers live in GPU memory.
    fn is_gpu(&self) -> bool {
        false
    }

    /// Hardware limits used to plan launches on this backend.
    fn limits(&self) -> &DeviceLimits;

    /// Wait for all pending device work to complete.
    /// Default is no-op for synchronous backends.
    fn sync_device(&self) -> Result<()> {
        Ok(())
    }

    /// Allocate `byte_len` zeroed bytes of device memory.
    fn alloc(&self, byte_len: usize) -> Result<DeviceBuffer>;

    /// Copy a host tensor into a new device allocation.
    fn upload(&self, tensor: &Tensor) -> Result<DeviceTensor>;

    /// Copy the elements of a view back to a packed host tensor.
    fn download(&self, view: &DeviceBufferView<'_>) -> Result<Tensor>;

    /// Plan a GEMM launch for an `m x k` by `k x n` product.
    fn plan_gemm(&self, m: usize, n: usize, k: usize, dtype: TensorDtype) -> Result<TilePlan> {
        plan::plan(m, n, k, dtype.byte_width(), self.limits())
    }

    /// Whether `launch_gemm` accepts operands of `dtype`.
    fn supports_gemm(&self, dtype: TensorDtype) -> bool {
        dtype.is_float()
    }

    /// Whether `launch_scatter` accepts operands of `dtype`.
    fn supports_scatter(&self, _dtype: TensorDtype) -> bool {
        true
    }

    /// Compute `c = a x b` following `plan`. Operands are already validated.
    fn launch_gemm(
        &self,
        a: &DeviceBufferView<'_>,
        b: &DeviceBufferView<'_>,
        c: &DeviceBufferView<'_>,
        plan: &TilePlan,
    ) -> Result<()>;

    /// Scatter `updates` into `dest` at `indices`. Operands are already validated.
    fn launch_scatter(
        &self,
        indices: &ScatterIndexSet,
        updates: &DeviceBufferView<'_>,
        dest: &DeviceBufferView<'_>,
        mode: AccumulationMode,
    ) -> Result<()>;

    /// Reset profile counters (no-op for backends without profiling).
    fn reset_profile(&self) {}

    /// Return a summary string of profile counters since last reset.
    fn profile_summary(&self) -> String {
        String::new()
    }
}

/// Auto-detect and return the best available kernel backend.
///
/// Priority: CUDA > CPU.
pub fn select_backend() -> Arc<dyn KernelBackend> {
    #[cfg(feature = "cuda")]
    {
        match cuda::CudaBackend::try_new() {
            Ok(backend) => {
                info!("Selected CUDA backend");
                return Arc::new(backend);
            }
            Err(e) => {
                info!(error = %e, "CUDA not available, falling back to CPU");
            }
        }
    }

    info!("Selected CPU backend");
    Arc::new(cpu::CpuBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_backend_always_succeeds() {
        let backend = select_backend();
        assert!(!backend.name().is_empty());
        assert!(backend.limits().max_threads_per_group > 0);
    }

    #[test]
    fn test_default_plan_uses_backend_limits() {
        let backend = cpu::CpuBackend::new();
        let plan = backend.plan_gemm(100, 100, 100, TensorDtype::F32).unwrap();
        assert!(plan.scratch_bytes() <= backend.limits().scratch_bytes);
        assert_eq!((plan.m(), plan.n(), plan.k()), (100, 100, 100));
    }
}
