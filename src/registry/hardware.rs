//! Hardware detection for automatic backend selection.

use serde::Serialize;

use crate::plan::DeviceLimits;

/// Information about available compute hardware.
#[derive(Debug, Clone, Serialize)]
pub struct HardwareInfo {
    pub cuda_available: bool,
    pub cpu_available: bool,
    pub cpu_threads: usize,
    pub recommended_backend: String,
}

impl HardwareInfo {
    /// Detect available hardware backends.
    ///
    /// Probes CUDA > CPU (same priority as `select_backend`).
    /// Never panics; if probing fails, that backend is marked unavailable.
    pub fn detect() -> Self {
        let cuda_available = Self::probe_cuda();
        let recommended_backend = if cuda_available { "cuda" } else { "cpu" }.to_string();

        Self {
            cuda_available,
            cpu_available: true,
            cpu_threads: DeviceLimits::cpu().compute_units,
            recommended_backend,
        }
    }

    fn probe_cuda() -> bool {
        #[cfg(feature = "cuda")]
        {
            crate::backend::cuda::CudaBackend::try_new().is_ok()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::select_backend;

    #[test]
    fn test_cpu_threads_match_planner_limits() {
        let info = HardwareInfo::detect();
        assert!(info.cpu_available);
        assert_eq!(info.cpu_threads, DeviceLimits::cpu().compute_units);
    }

    #[test]
    fn test_recommendation_agrees_with_selection() {
        let info = HardwareInfo::detect();
        assert_eq!(info.recommended_backend, select_backend().name());
        assert_eq!(info.cuda_available, info.recommended_backend == "cuda");
    }

    #[test]
    fn test_serializes_for_reports() {
        let json = serde_json::to_value(HardwareInfo::detect()).unwrap();
        assert_eq!(json["cpu_available"], true);
        assert!(json["cpu_threads"].as_u64().unwrap() >= 1);
    }
}
