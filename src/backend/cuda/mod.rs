//! CUDA kernel backend.
//!
//! Loads the CUDA driver at runtime (no link-time dependency) and runs the
//! GEMM and scatter kernels from the PTX module in [`kernels`]. Falls back
//! gracefully if CUDA is not available: `CudaBackend::try_new()` returns
//! `Err` and the backend selector moves on to the CPU.
//!
//! Differences from the CPU backend:
//! - GEMM kernels are compiled for one tiling (16x16 output tile, 16-deep
//!   K steps, one output element per thread); `plan_gemm` returns that plan
//!   and `launch_gemm` rejects any other with `PlanMismatch`.
//! - GEMM supports F32 and F16; scatter supports F32 and I32.
//! - Scatter needs dense update rows and dense destination slices.

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffer::{DeviceBuffer, DeviceBufferView, DeviceTensor};
use crate::error::{KernelError, Result};
use crate::plan::{DeviceLimits, TilePlan};
use crate::scatter::{AccumulationMode, ScatterIndexSet};
use crate::tensor::{Tensor, TensorDtype};

use super::KernelBackend;
use ffi::{CUdeviceptr, CUfunction, CUmodule, CUstream, CudaApi};

pub mod ffi;
pub mod kernels;

// ---------------------------------------------------------------------------
// CudaBuffer: RAII wrapper for a device allocation
// ---------------------------------------------------------------------------

/// A buffer allocated on the CUDA device. Freed when dropped.
struct CudaBuffer {
    ptr: CUdeviceptr,
    api: Arc<CudaApi>,
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            if let Err(e) = self.api.mem_free(self.ptr) {
                warn!(error = %e, "CUDA: failed to free device memory");
            }
        }
    }
}

// SAFETY: CudaBuffer holds a u64 device pointer and an Arc to the thread-safe
// driver API. The pointer does not reference host memory.
unsafe impl Send for CudaBuffer {}
unsafe impl Sync for CudaBuffer {}

// ---------------------------------------------------------------------------
// CudaBackend
// ---------------------------------------------------------------------------

/// CUDA kernel backend.
///
/// Owns a context on device 0, one compute stream, the loaded PTX module and
/// the resolved kernel handles. Launches are asynchronous on the stream;
/// downloads and `sync_device` wait for them.
pub struct CudaBackend {
    api: Arc<CudaApi>,
    stream: CUstream,
    #[allow(dead_code)]
    module: CUmodule,
    limits: DeviceLimits,

    fn_gemm_f32: CUfunction,
    fn_gemm_f16: CUfunction,
    fn_scatter_f32: CUfunction,
    fn_scatter_i32: CUfunction,
}

// SAFETY: function, module and stream handles are process-global driver
// handles, and the driver API is documented as thread-safe.
unsafe impl Send for CudaBackend {}
unsafe impl Sync for CudaBackend {}

impl CudaBackend {
    /// Attempt to create a new CUDA backend.
    ///
    /// This will:
    /// 1. Load the CUDA driver library and create a context on device 0.
    /// 2. Query device limits.
    /// 3. Create a compute stream.
    /// 4. Load the PTX module and resolve every kernel function handle.
    ///
    /// Returns `Err` if any step fails (no CUDA driver, no GPU, PTX load error, etc.).
    pub fn try_new() -> Result<Self> {
        let api = Arc::new(CudaApi::load()?);

        let attrs = api.device_attributes()?;
        let mut limits = DeviceLimits::cuda();
        if attrs.shared_memory_per_block > 0 {
            limits.scratch_bytes = attrs.shared_memory_per_block;
        }
        if attrs.max_threads_per_block > 0 {
            limits.max_threads_per_group = attrs.max_threads_per_block;
        }
        if attrs.warp_size > 0 {
            limits.warp_size = attrs.warp_size;
        }
        if attrs.multiprocessor_count > 0 {
            limits.compute_units = attrs.multiprocessor_count;
        }
        if attrs.max_grid_dim_y > 0 {
            limits.max_grid_dim = attrs.max_grid_dim_y;
        }
        let limits = limits.with_env_overrides();

        let stream = api.stream_create()?;
        let module = api.module_load_data(kernels::PTX_MODULE)?;

        let get_fn = |name: &CStr| -> Result<CUfunction> {
            api.module_get_function(module, name).map_err(|e| {
                KernelError::Backend(format!("CUDA kernel '{}': {}", name.to_string_lossy(), e))
            })
        };
        let fn_gemm_f32 = get_fn(c"gemm_f32")?;
        let fn_gemm_f16 = get_fn(c"gemm_f16")?;
        let fn_scatter_f32 = get_fn(c"scatter_f32")?;
        let fn_scatter_i32 = get_fn(c"scatter_i32")?;

        debug!(?limits, "CudaBackend initialized with 4 kernel functions");

        Ok(Self {
            api,
            stream,
            module,
            limits,
            fn_gemm_f32,
            fn_gemm_f16,
            fn_scatter_f32,
            fn_scatter_i32,
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Allocate device memory; zeroed when `zero` is set.
    fn alloc_raw(&self, bytes: usize, zero: bool) -> Result<CudaBuffer> {
        let ptr = self.api.mem_alloc(bytes)?;
        let buf = CudaBuffer {
            ptr,
            api: Arc::clone(&self.api),
        };
        if zero {
            self.api.memset_zero(ptr, bytes)?;
        }
        Ok(buf)
    }

    /// Device address of a view's first element.
    fn device_ptr(view: &DeviceBufferView<'_>) -> Result<CUdeviceptr> {
        let buf = view
            .buffer()
            .device_inner::<CudaBuffer>()
            .ok_or_else(|| {
                KernelError::Backend("CUDA backend given a buffer it does not own".to_string())
            })?;
        Ok(buf.ptr + view.offset() as u64)
    }

    fn to_u32(name: &'static str, value: usize) -> Result<u32> {
        u32::try_from(value).map_err(|_| KernelError::InvalidDimension {
            name,
            value,
            limit: u32::MAX as usize,
        })
    }

    /// Check that the largest 32-bit element index a gemm kernel forms for a
    /// `rows x cols` operand with leading dimension `ld` stays below 2^32.
    fn check_operand_index(name: &'static str, rows: usize, ld: usize, cols: usize) -> Result<()> {
        let last = rows
            .saturating_sub(1)
            .checked_mul(ld)
            .and_then(|v| v.checked_add(cols))
            .unwrap_or(usize::MAX);
        Self::to_u32(name, last).map(|_| ())
    }

    /// Launch a kernel on the compute stream.
    ///
    /// # Safety
    ///
    /// `params` must be a correctly constructed parameter array matching the
    /// kernel signature.
    unsafe fn launch(
        &self,
        func: CUfunction,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        params: &mut [*mut c_void],
    ) -> Result<()> {
        self.api.launch_kernel(func, grid, block, self.stream, params)
    }
}

impl KernelBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn is_gpu(&self) -> bool {
        true
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn sync_device(&self) -> Result<()> {
        self.api.stream_synchronize(self.stream)
    }

    fn alloc(&self, byte_len: usize) -> Result<DeviceBuffer> {
        let buf = self.alloc_raw(byte_len, true)?;
        Ok(DeviceBuffer::from_device(byte_len, Box::new(buf)))
    }

    fn upload(&self, tensor: &Tensor) -> Result<DeviceTensor> {
        trace!(shape = ?tensor.shape(), dtype = ?tensor.dtype(), "CUDA upload");
        let bytes = tensor.to_le_bytes();
        let buf = self.alloc_raw(bytes.len(), false)?;
        self.api.memcpy_h_to_d(buf.ptr, &bytes)?;
        DeviceTensor::new(
            DeviceBuffer::from_device(bytes.len(), Box::new(buf)),
            tensor.dtype(),
            tensor.shape().to_vec(),
        )
    }

    fn download(&self, view: &DeviceBufferView<'_>) -> Result<Tensor> {
        trace!(shape = ?view.shape(), dtype = ?view.dtype(), "CUDA download");
        self.sync_device()?;
        let range = view.byte_range();
        let base = Self::device_ptr(view)? - view.offset() as u64;
        let mut span = vec![0u8; range.len()];
        self.api.memcpy_d_to_h(&mut span, base + range.start as u64)?;

        let bytes = if view.is_contiguous() {
            span
        } else {
            let width = view.dtype().byte_width();
            let mut packed = Vec::with_capacity(view.n_elements() * width);
            view.for_each_offset(|offset| {
                let at = offset - range.start;
                packed.extend_from_slice(&span[at..at + width]);
            });
            packed
        };
        Tensor::from_le_bytes(view.shape().to_vec(), view.dtype(), &bytes)
    }

    fn plan_gemm(&self, m: usize, n: usize, k: usize, dtype: TensorDtype) -> Result<TilePlan> {
        let tile = kernels::GEMM_TILE as usize;
        TilePlan::fixed(m, n, k, dtype.byte_width(), (tile, tile, tile), (1, 1), &self.limits)
    }

    fn supports_gemm(&self, dtype: TensorDtype) -> bool {
        matches!(dtype, TensorDtype::F32 | TensorDtype::F16)
    }

    fn supports_scatter(&self, dtype: TensorDtype) -> bool {
        matches!(dtype, TensorDtype::F32 | TensorDtype::I32)
    }

    fn launch_gemm(
        &self,
        a: &DeviceBufferView<'_>,
        b: &DeviceBufferView<'_>,
        c: &DeviceBufferView<'_>,
        plan: &TilePlan,
    ) -> Result<()> {
        let tile = kernels::GEMM_TILE as usize;
        if (plan.block_m(), plan.block_n(), plan.block_k(), plan.thread_m(), plan.thread_n())
            != (tile, tile, tile, 1, 1)
        {
            return Err(KernelError::PlanMismatch(format!(
                "CUDA gemm kernels are built for {0}x{0}x{0} tiles with 1x1 micro-tiles, plan has {1}x{2}x{3} with {4}x{5}",
                tile, plan.block_m(), plan.block_n(), plan.block_k(), plan.thread_m(), plan.thread_n()
            )));
        }
        let func = match a.dtype() {
            TensorDtype::F32 => self.fn_gemm_f32,
            TensorDtype::F16 => self.fn_gemm_f16,
            dtype => return Err(KernelError::UnsupportedDtype { op: "cuda gemm", dtype }),
        };
        let width = a.dtype().byte_width();

        let mut p_a = Self::device_ptr(a)?;
        let mut p_b = Self::device_ptr(b)?;
        let mut p_c = Self::device_ptr(c)?;
        let mut p_m = Self::to_u32("M", plan.m())?;
        let mut p_k = Self::to_u32("K", plan.k())?;
        let mut p_n = Self::to_u32("N", plan.n())?;
        let mut p_lda = Self::to_u32("lda", a.strides()[0] / width)?;
        let mut p_ldb = Self::to_u32("ldb", b.strides()[0] / width)?;
        let mut p_ldc = Self::to_u32("ldc", c.strides()[0] / width)?;
        Self::check_operand_index("A index", plan.m(), p_lda as usize, plan.k())?;
        Self::check_operand_index("B index", plan.k(), p_ldb as usize, plan.n())?;
        Self::check_operand_index("C index", plan.m(), p_ldc as usize, plan.n())?;

        let mut params: [*mut c_void; 9] = [
            &mut p_a as *mut _ as *mut c_void,
            &mut p_b as *mut _ as *mut c_void,
            &mut p_c as *mut _ as *mut c_void,
            &mut p_m as *mut _ as *mut c_void,
            &mut p_k as *mut _ as *mut c_void,
            &mut p_n as *mut _ as *mut c_void,
            &mut p_lda as *mut _ as *mut c_void,
            &mut p_ldb as *mut _ as *mut c_void,
            &mut p_ldc as *mut _ as *mut c_void,
        ];

        let grid = (
            Self::to_u32("grid_n", plan.grid_n())?,
            Self::to_u32("grid_m", plan.grid_m())?,
            1,
        );
        let block = (kernels::GEMM_TILE, kernels::GEMM_TILE, 1);
        trace!(?grid, ?block, "CUDA gemm launch");
        // SAFETY: params match the gemm_f32/gemm_f16 signature and the views
        // were validated to lie inside their allocations.
        unsafe { self.launch(func, grid, block, &mut params) }
    }

    fn launch_scatter(
        &self,
        indices: &ScatterIndexSet,
        updates: &DeviceBufferView<'_>,
        dest: &DeviceBufferView<'_>,
        mode: AccumulationMode,
    ) -> Result<()> {
        let depth = indices.depth();
        if !updates.is_contiguous() || !dest.is_contiguous_from(depth) {
            return Err(KernelError::UnsupportedLayout(
                "CUDA scatter needs dense update rows and dense destination slices".to_string(),
            ));
        }
        let func = match dest.dtype() {
            TensorDtype::F32 => self.fn_scatter_f32,
            TensorDtype::I32 => self.fn_scatter_i32,
            dtype => return Err(KernelError::UnsupportedDtype { op: "cuda scatter_nd", dtype }),
        };
        let width = dest.dtype().byte_width();
        let n_rows = indices.len();
        let slice: usize = dest.shape()[depth..].iter().product();
        Self::to_u32("scatter elements", n_rows * slice)?;
        if n_rows > self.limits.max_grid_dim {
            return Err(KernelError::InvalidDimension {
                name: "scatter rows",
                value: n_rows,
                limit: self.limits.max_grid_dim,
            });
        }

        // Row offsets relative to the buffer start, in elements.
        let base = Self::device_ptr(dest)? - dest.offset() as u64;
        let row_offsets = indices
            .slice_offsets(dest)
            .into_iter()
            .map(|bytes| Self::to_u32("dest offset", bytes / width))
            .collect::<Result<Vec<u32>>>()?;
        let row_bytes: Vec<u8> = row_offsets.iter().flat_map(|v| v.to_le_bytes()).collect();
        let rows_buf = self.alloc_raw(row_bytes.len(), false)?;
        self.api.memcpy_h_to_d(rows_buf.ptr, &row_bytes)?;

        let mut p_dest = base;
        let mut p_updates = Self::device_ptr(updates)?;
        let mut p_rows = rows_buf.ptr;
        let mut p_n_rows = n_rows as u32;
        let mut p_slice = slice as u32;
        let mut p_mode = match mode {
            AccumulationMode::Overwrite => kernels::MODE_OVERWRITE,
            AccumulationMode::Sum => kernels::MODE_SUM,
            AccumulationMode::Max => kernels::MODE_MAX,
        };

        let mut params: [*mut c_void; 6] = [
            &mut p_dest as *mut _ as *mut c_void,
            &mut p_updates as *mut _ as *mut c_void,
            &mut p_rows as *mut _ as *mut c_void,
            &mut p_n_rows as *mut _ as *mut c_void,
            &mut p_slice as *mut _ as *mut c_void,
            &mut p_mode as *mut _ as *mut c_void,
        ];

        let grid = (
            (slice as u32).div_ceil(kernels::SCATTER_BLOCK),
            n_rows as u32,
            1,
        );
        trace!(?grid, mode = mode.as_str(), "CUDA scatter launch");
        // SAFETY: params match the scatter_f32/scatter_i32 signature; row
        // offsets were computed from validated indices.
        unsafe { self.launch(func, grid, (kernels::SCATTER_BLOCK, 1, 1), &mut params)? };

        // The offsets buffer must outlive the kernel.
        self.sync_device()?;
        drop(rows_buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_index_fits_u32() {
        assert!(CudaBackend::check_operand_index("A index", 1024, 1024, 1024).is_ok());
        // Largest index is exactly u32::MAX.
        assert!(CudaBackend::check_operand_index("A index", 2, u32::MAX as usize - 1, 1).is_ok());
    }

    #[test]
    fn test_operand_index_rejects_wrapping_product() {
        // Each factor fits in u32 but (M - 1) * lda + K does not.
        match CudaBackend::check_operand_index("A index", 70_000, 70_000, 70_000) {
            Err(KernelError::InvalidDimension { name, value, .. }) => {
                assert_eq!(name, "A index");
                assert_eq!(value, 69_999 * 70_000 + 70_000);
            }
            other => panic!("expected InvalidDimension, got {:?}", other.map(|_| ())),
        }
        assert!(CudaBackend::check_operand_index("C index", 1, usize::MAX, 1).is_ok());
        assert!(CudaBackend::check_operand_index("C index", 3, usize::MAX, 1).is_err());
    }
}
