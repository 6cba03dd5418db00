//! Tiled GEMM and atomic scatter-nd over strided device buffer views.

pub mod error;
pub mod tensor;
pub mod buffer;
pub mod plan;
pub mod gemm;
pub mod scatter;
pub mod backend;
pub mod ops;
pub mod registry;
pub mod cli;

pub use error::{KernelError, Result};
pub use tensor::{Tensor, TensorDtype};
pub use buffer::{DeviceBuffer, DeviceBufferView, DeviceTensor};
pub use plan::{DeviceLimits, TilePlan};
pub use gemm::GemmKernel;
pub use scatter::{AccumulationMode, ScatterIndexSet, ScatterKernel};
pub use backend::{select_backend, KernelBackend};
pub use ops::{dispatch, OperatorCall, OperatorOutput};
pub use registry::{register_operators, OperatorKind, OperatorSet, OperatorTable};
