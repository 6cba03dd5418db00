use thiserror::Error;

use crate::tensor::TensorDtype;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}: shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Index out of range at position {position} (axis {axis}): {index} not in [0, {bound})")]
    IndexOutOfRange {
        position: usize,
        axis: usize,
        index: i64,
        bound: usize,
    },

    #[error("Unsupported layout: {0}")]
    UnsupportedLayout(String),

    #[error("{op}: unsupported element type {dtype:?}")]
    UnsupportedDtype {
        op: &'static str,
        dtype: TensorDtype,
    },

    #[error("Invalid dimension {name}={value} (must be in 1..={limit})")]
    InvalidDimension {
        name: &'static str,
        value: usize,
        limit: usize,
    },

    #[error("Insufficient scratch memory: need {required} bytes, device has {available}")]
    InsufficientScratch { required: usize, available: usize },

    #[error("Invalid buffer view: {0}")]
    InvalidView(String),

    #[error("Aliased buffers: {0}")]
    AliasedBuffers(String),

    #[error("Plan mismatch: {0}")]
    PlanMismatch(String),

    #[error("Operator already registered: {0}")]
    DuplicateOperator(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
