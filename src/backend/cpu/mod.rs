//! CPU kernel backend.
//!
//! Runs the tiled kernels on the host by emulating the SIMT execution model:
//! every cooperating group of a launch is a rayon task, and the members of a
//! group step through the kernel's phases together. Buffers are
//! [`HostMemory`], so concurrent element updates are real atomic operations.
//! No unsafe code. No external C dependencies.

mod gemm;
mod scatter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, trace};

use crate::buffer::{DeviceBuffer, DeviceBufferView, DeviceTensor, HostMemory};
use crate::error::{KernelError, Result};
use crate::plan::{DeviceLimits, TilePlan};
use crate::scatter::{AccumulationMode, ScatterIndexSet};
use crate::tensor::Tensor;

use super::KernelBackend;

/// Launch counters, collected when `TILED_PROFILE=1`.
#[derive(Default)]
struct Profile {
    gemm_launches: AtomicU64,
    gemm_flops: AtomicU64,
    gemm_nanos: AtomicU64,
    scatter_launches: AtomicU64,
    scatter_elements: AtomicU64,
    scatter_nanos: AtomicU64,
}

impl Profile {
    fn reset(&self) {
        for counter in [
            &self.gemm_launches,
            &self.gemm_flops,
            &self.gemm_nanos,
            &self.scatter_launches,
            &self.scatter_elements,
            &self.scatter_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// CPU kernel backend. All launches run on the host through rayon.
pub struct CpuBackend {
    limits: DeviceLimits,
    profile: Option<Profile>,
}

impl CpuBackend {
    /// Create a new CPU backend with host limits and any environment overrides.
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::cpu().with_env_overrides())
    }

    /// Create a CPU backend that plans against the given limits.
    pub fn with_limits(limits: DeviceLimits) -> Self {
        let profiling = std::env::var("TILED_PROFILE").is_ok_and(|v| v == "1");
        debug!(?limits, profiling, "Initialized CpuBackend");
        Self {
            limits,
            profile: profiling.then(Profile::default),
        }
    }

    fn host_memory<'a>(view: &DeviceBufferView<'a>) -> Result<&'a HostMemory> {
        view.buffer().host_memory().ok_or_else(|| {
            KernelError::Backend("CPU backend given a device-resident buffer".to_string())
        })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn alloc(&self, byte_len: usize) -> Result<DeviceBuffer> {
        Ok(DeviceBuffer::host(byte_len))
    }

    fn upload(&self, tensor: &Tensor) -> Result<DeviceTensor> {
        trace!(shape = ?tensor.shape(), dtype = ?tensor.dtype(), "CPU upload");
        let bytes = tensor.to_le_bytes();
        let buffer = self.alloc(bytes.len())?;
        if let Some(mem) = buffer.host_memory() {
            mem.write_bytes(0, &bytes);
        }
        DeviceTensor::new(buffer, tensor.dtype(), tensor.shape().to_vec())
    }

    fn download(&self, view: &DeviceBufferView<'_>) -> Result<Tensor> {
        trace!(shape = ?view.shape(), dtype = ?view.dtype(), "CPU download");
        let mem = Self::host_memory(view)?;
        let width = view.dtype().byte_width();
        let bytes = if view.is_contiguous() {
            mem.read_bytes(view.offset(), view.n_elements() * width)
        } else {
            let mut bytes = Vec::with_capacity(view.n_elements() * width);
            view.for_each_offset(|offset| {
                let bits = mem.load(offset, width);
                bytes.extend_from_slice(&bits.to_le_bytes()[..width]);
            });
            bytes
        };
        Tensor::from_le_bytes(view.shape().to_vec(), view.dtype(), &bytes)
    }

    fn launch_gemm(
        &self,
        a: &DeviceBufferView<'_>,
        b: &DeviceBufferView<'_>,
        c: &DeviceBufferView<'_>,
        plan: &TilePlan,
    ) -> Result<()> {
        let start = Instant::now();
        gemm::run(
            gemm::Operand::new(a, Self::host_memory(a)?),
            gemm::Operand::new(b, Self::host_memory(b)?),
            gemm::Operand::new(c, Self::host_memory(c)?),
            plan,
        );
        if let Some(p) = &self.profile {
            p.gemm_launches.fetch_add(1, Ordering::Relaxed);
            p.gemm_flops
                .fetch_add((2 * plan.m() * plan.n() * plan.k()) as u64, Ordering::Relaxed);
            p.gemm_nanos
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn launch_scatter(
        &self,
        indices: &ScatterIndexSet,
        updates: &DeviceBufferView<'_>,
        dest: &DeviceBufferView<'_>,
        mode: AccumulationMode,
    ) -> Result<()> {
        let start = Instant::now();
        scatter::run(
            indices,
            updates,
            Self::host_memory(updates)?,
            dest,
            Self::host_memory(dest)?,
            mode,
        );
        if let Some(p) = &self.profile {
            p.scatter_launches.fetch_add(1, Ordering::Relaxed);
            p.scatter_elements
                .fetch_add(updates.n_elements() as u64, Ordering::Relaxed);
            p.scatter_nanos
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn reset_profile(&self) {
        if let Some(p) = &self.profile {
            p.reset();
        }
    }

    fn profile_summary(&self) -> String {
        let Some(p) = &self.profile else {
            return String::new();
        };
        let gemm_nanos = p.gemm_nanos.load(Ordering::Relaxed);
        let gemm_flops = p.gemm_flops.load(Ordering::Relaxed);
        let gflops = if gemm_nanos == 0 {
            0.0
        } else {
            gemm_flops as f64 / gemm_nanos as f64
        };
        format!(
            "gemm: {} launches, {:.3} ms, {:.2} GFLOP/s | scatter: {} launches, {} elements, {:.3} ms",
            p.gemm_launches.load(Ordering::Relaxed),
            gemm_nanos as f64 / 1e6,
            gflops,
            p.scatter_launches.load(Ordering::Relaxed),
            p.scatter_elements.load(Ordering::Relaxed),
            p.scatter_nanos.load(Ordering::Relaxed) as f64 / 1e6,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorDtype;

    fn backend() -> CpuBackend {
        CpuBackend::new()
    }

    #[test]
    fn test_upload_download() {
        let b = backend();
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let dev = b.upload(&t).unwrap();
        let back = b.download(&dev.view()).unwrap();
        assert_eq!(back.as_f32(), t.as_f32());
        assert_eq!(back.shape(), t.shape());
    }

    #[test]
    fn test_upload_download_half_precision() {
        let b = backend();
        let t = Tensor::from_f32_as(vec![3], &[0.5, -1.25, 7.0], TensorDtype::F16);
        let dev = b.upload(&t).unwrap();
        assert_eq!(dev.buffer().byte_len(), 6);
        let back = b.download(&dev.view()).unwrap();
        assert_eq!(back.dtype(), TensorDtype::F16);
        assert_eq!(back.to_f32_vec(), vec![0.5, -1.25, 7.0]);
    }

    #[test]
    fn test_download_strided_view() {
        let b = backend();
        let t = Tensor::new(
            vec![3, 4],
            (0..12).map(|v| v as f32).collect(),
        );
        let dev = b.upload(&t).unwrap();
        // Second and third columns of every row.
        let cols = dev.view().narrow(1, 1, 2).unwrap();
        let back = b.download(&cols).unwrap();
        assert_eq!(back.shape(), &[3, 2]);
        assert_eq!(back.as_f32(), &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_download_odd_length_half_view() {
        let b = backend();
        let t = Tensor::from_f32_as(vec![5], &[1.0, 2.0, 3.0, 4.0, 5.0], TensorDtype::BF16);
        let dev = b.upload(&t).unwrap();
        let tail = dev.view().narrow(0, 1, 3).unwrap();
        assert_eq!(b.download(&tail).unwrap().to_f32_vec(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_alloc_is_zeroed() {
        let b = backend();
        let buf = b.alloc(16).unwrap();
        let view = DeviceBufferView::contiguous(&buf, 0, TensorDtype::I32, vec![4]).unwrap();
        assert_eq!(b.download(&view).unwrap().as_i32(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_profile_disabled_is_empty() {
        let b = CpuBackend {
            limits: DeviceLimits::cpu(),
            profile: None,
        };
        assert!(b.profile_summary().is_empty());
    }

    #[test]
    fn test_profile_counts_launches() {
        let b = CpuBackend {
            limits: DeviceLimits::cpu(),
            profile: Some(Profile::default()),
        };
        let dest = b.upload(&Tensor::zeros(&[3], TensorDtype::F32)).unwrap();
        let upd = b.upload(&Tensor::new(vec![2], vec![1.0, 2.0])).unwrap();
        let idx = ScatterIndexSet::new(vec![0, 2]);
        b.launch_scatter(&idx, &upd.view(), &dest.view(), AccumulationMode::Sum)
            .unwrap();
        let summary = b.profile_summary();
        assert!(summary.contains("scatter: 1 launches, 2 elements"), "{}", summary);

        b.reset_profile();
        assert!(b.profile_summary().contains("scatter: 0 launches"));
    }
}
