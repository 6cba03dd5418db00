//! Backend selection from CLI --backend flag.

use std::sync::Arc;

use crate::backend::KernelBackend;
use crate::error::{KernelError, Result};

/// Resolve a kernel backend from the --backend CLI flag.
///
/// Accepted values: "auto" (default), "cpu", "cuda".
pub fn resolve_backend(name: Option<&str>) -> Result<Arc<dyn KernelBackend>> {
    match name.unwrap_or("auto") {
        "auto" => Ok(crate::backend::select_backend()),

        "cpu" => Ok(Arc::new(crate::backend::cpu::CpuBackend::new())),

        "cuda" => {
            #[cfg(feature = "cuda")]
            {
                Ok(Arc::new(crate::backend::cuda::CudaBackend::try_new()?))
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(KernelError::Backend(
                    "CUDA backend not available (compile with --features cuda)".to_string(),
                ))
            }
        }

        other => Err(KernelError::Backend(format!(
            "Unknown backend '{}'. Options: auto, cpu, cuda",
            other
        ))),
    }
}
