//! Minimal CUDA driver API bindings loaded at runtime with `libloading`.
//!
//! Only the entry points the kernel backend needs are resolved. Every call
//! returns the driver's status as a `KernelError::Backend` on failure.

use std::ffi::{c_char, c_void, CStr};

use libloading::Library;

use crate::error::{KernelError, Result};

pub type CUresult = i32;
pub type CUdevice = i32;
pub type CUcontext = *mut c_void;
pub type CUdeviceptr = u64;
pub type CUmodule = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

const CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK: i32 = 1;
const CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y: i32 = 6;
const CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK: i32 = 8;
const CU_DEVICE_ATTRIBUTE_WARP_SIZE: i32 = 10;
const CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT: i32 = 16;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuModuleLoadDataFn = unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memset_d8_v2: CuMemsetD8V2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_module_load_data: CuModuleLoadDataFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// Hardware attributes of device 0.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttributes {
    pub max_threads_per_block: usize,
    pub max_grid_dim_y: usize,
    pub shared_memory_per_block: usize,
    pub warp_size: usize,
    pub multiprocessor_count: usize,
}

/// A loaded CUDA driver with a context current on device 0.
pub struct CudaApi {
    _lib: Library,
    fns: DriverFns,
    device: CUdevice,
    ctx: CUcontext,
}

impl Drop for CudaApi {
    fn drop(&mut self) {
        if !self.ctx.is_null() {
            // SAFETY: the context is owned by this instance and destroyed once.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx) };
        }
    }
}

// SAFETY: the driver API is thread-safe; the context handle is only made
// current, never mutated, after construction.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

fn check(code: CUresult, op: &str) -> Result<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(KernelError::Backend(format!(
            "CUDA driver call {} failed with code {}",
            op, code
        )))
    }
}

fn load_library() -> Result<Library> {
    for candidate in ["libcuda.so.1", "libcuda.so", "nvcuda.dll"] {
        // SAFETY: probing the library runs no symbols.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(KernelError::Backend(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll)".to_string(),
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: each call site names the symbol with its driver API signature.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|e| {
        KernelError::Backend(format!(
            "failed to resolve CUDA symbol {}: {}",
            String::from_utf8_lossy(name),
            e
        ))
    })?;
    Ok(*sym)
}

impl CudaApi {
    /// Load the driver, initialise it and create a context on device 0.
    pub fn load() -> Result<Self> {
        let lib = load_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_module_load_data: load_symbol(&lib, b"cuModuleLoadData\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        // SAFETY: out pointers are valid locals.
        unsafe {
            check((fns.cu_init)(0), "cuInit")?;
            let mut device: CUdevice = 0;
            check((fns.cu_device_get)(&mut device, 0), "cuDeviceGet")?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check((fns.cu_ctx_create_v2)(&mut ctx, 0, device), "cuCtxCreate_v2")?;
            Ok(Self {
                _lib: lib,
                fns,
                device,
                ctx,
            })
        }
    }

    fn ensure_current(&self) -> Result<()> {
        // SAFETY: the context lives until drop.
        unsafe { check((self.fns.cu_ctx_set_current)(self.ctx), "cuCtxSetCurrent") }
    }

    fn attribute(&self, attrib: i32) -> Result<usize> {
        let mut value = 0i32;
        // SAFETY: out pointer is a valid local.
        unsafe {
            check(
                (self.fns.cu_device_get_attribute)(&mut value, attrib, self.device),
                "cuDeviceGetAttribute",
            )?;
        }
        Ok(value.max(0) as usize)
    }

    pub fn device_attributes(&self) -> Result<DeviceAttributes> {
        Ok(DeviceAttributes {
            max_threads_per_block: self.attribute(CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            max_grid_dim_y: self.attribute(CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y)?,
            shared_memory_per_block: self
                .attribute(CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?,
            warp_size: self.attribute(CU_DEVICE_ATTRIBUTE_WARP_SIZE)?,
            multiprocessor_count: self.attribute(CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?,
        })
    }

    pub fn stream_create(&self) -> Result<CUstream> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: out pointer is a valid local.
        unsafe { check((self.fns.cu_stream_create)(&mut stream, 0), "cuStreamCreate")? };
        Ok(stream)
    }

    pub fn stream_synchronize(&self, stream: CUstream) -> Result<()> {
        self.ensure_current()?;
        // SAFETY: stream was created by this context.
        unsafe { check((self.fns.cu_stream_synchronize)(stream), "cuStreamSynchronize") }
    }

    pub fn mem_alloc(&self, bytes: usize) -> Result<CUdeviceptr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // cuMemAlloc rejects zero-byte requests.
        // SAFETY: out pointer is a valid local.
        unsafe { check((self.fns.cu_mem_alloc_v2)(&mut ptr, bytes.max(1)), "cuMemAlloc_v2")? };
        Ok(ptr)
    }

    pub fn mem_free(&self, ptr: CUdeviceptr) -> Result<()> {
        self.ensure_current()?;
        // SAFETY: ptr was returned by mem_alloc and is freed once by its owner.
        unsafe { check((self.fns.cu_mem_free_v2)(ptr), "cuMemFree_v2") }
    }

    pub fn memset_zero(&self, ptr: CUdeviceptr, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: caller guarantees ptr is valid for `bytes`.
        unsafe { check((self.fns.cu_memset_d8_v2)(ptr, 0, bytes), "cuMemsetD8_v2") }
    }

    pub fn memcpy_h_to_d(&self, dst: CUdeviceptr, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: caller guarantees dst is valid for src.len() bytes.
        unsafe {
            check(
                (self.fns.cu_memcpy_hto_d_v2)(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn memcpy_d_to_h(&self, dst: &mut [u8], src: CUdeviceptr) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: caller guarantees src is valid for dst.len() bytes.
        unsafe {
            check(
                (self.fns.cu_memcpy_dto_h_v2)(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    /// Load a null-terminated PTX image.
    pub fn module_load_data(&self, image: &str) -> Result<CUmodule> {
        if !image.ends_with('\0') {
            return Err(KernelError::Backend("PTX image is not null-terminated".to_string()));
        }
        self.ensure_current()?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: image is a null-terminated string that outlives the call.
        unsafe {
            check(
                (self.fns.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void),
                "cuModuleLoadData",
            )?;
        }
        Ok(module)
    }

    pub fn module_get_function(&self, module: CUmodule, name: &CStr) -> Result<CUfunction> {
        self.ensure_current()?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module was loaded by this context; name is null-terminated.
        unsafe {
            check(
                (self.fns.cu_module_get_function)(&mut function, module, name.as_ptr()),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function)
    }

    /// Launch `function` on `stream`.
    ///
    /// # Safety
    /// `params` must point to values whose types and order match the kernel's
    /// parameter list, and every device pointer among them must be valid for
    /// the accesses the kernel makes.
    pub unsafe fn launch_kernel(
        &self,
        function: CUfunction,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        stream: CUstream,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        self.ensure_current()?;
        check(
            (self.fns.cu_launch_kernel)(
                function,
                grid.0,
                grid.1,
                grid.2,
                block.0,
                block.1,
                block.2,
                0,
                stream,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            ),
            "cuLaunchKernel",
        )
    }
}
