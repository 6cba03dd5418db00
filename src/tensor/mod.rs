//! Host-side tensors and element-type numerics.
//!
//! [`Tensor`] is the host staging format used to move data in and out of device
//! buffers. [`TensorDtype`] carries the per-element encode/decode rules shared by
//! every kernel: values travel through the kernels as raw little-endian bit
//! patterns and are widened to f32 for arithmetic.

use tracing::debug;

use crate::error::{KernelError, Result};

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDtype {
    F32,
    F16,
    BF16,
    I32,
}

impl TensorDtype {
    /// Size in bytes of one element.
    pub fn byte_width(&self) -> usize {
        match self {
            TensorDtype::F32 | TensorDtype::I32 => 4,
            TensorDtype::F16 | TensorDtype::BF16 => 2,
        }
    }

    /// Whether the type is a floating-point format.
    pub fn is_float(&self) -> bool {
        !matches!(self, TensorDtype::I32)
    }

    /// Whether the type is narrower than the f32 accumulator.
    pub fn is_reduced_precision(&self) -> bool {
        matches!(self, TensorDtype::F16 | TensorDtype::BF16)
    }

    /// Unit roundoff of the storage format.
    pub fn epsilon(&self) -> f32 {
        match self {
            TensorDtype::F32 => f32::EPSILON,
            TensorDtype::F16 => half::f16::EPSILON.to_f32(),
            TensorDtype::BF16 => half::bf16::EPSILON.to_f32(),
            TensorDtype::I32 => 0.0,
        }
    }

    /// Widen raw element bits (low `byte_width` bytes) to f32.
    pub fn decode_f32(&self, bits: u32) -> f32 {
        match self {
            TensorDtype::F32 => f32::from_bits(bits),
            TensorDtype::F16 => half::f16::from_bits(bits as u16).to_f32(),
            TensorDtype::BF16 => half::bf16::from_bits(bits as u16).to_f32(),
            TensorDtype::I32 => bits as i32 as f32,
        }
    }

    /// Round an f32 into the storage format and return its raw bits.
    ///
    /// Reduced-precision formats round to nearest, ties to even.
    pub fn encode_f32(&self, value: f32) -> u32 {
        match self {
            TensorDtype::F32 => value.to_bits(),
            TensorDtype::F16 => half::f16::from_f32(value).to_bits() as u32,
            TensorDtype::BF16 => half::bf16::from_f32(value).to_bits() as u32,
            TensorDtype::I32 => (value as i32) as u32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDtype::F32 => "f32",
            TensorDtype::F16 => "f16",
            TensorDtype::BF16 => "bf16",
            TensorDtype::I32 => "i32",
        }
    }

    /// Parse a dtype name as used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" => Some(TensorDtype::F32),
            "f16" => Some(TensorDtype::F16),
            "bf16" => Some(TensorDtype::BF16),
            "i32" => Some(TensorDtype::I32),
            _ => None,
        }
    }
}

/// Storage for tensor data, varying by dtype.
#[derive(Debug, Clone)]
pub enum TensorStorage {
    F32(Vec<f32>),
    /// Raw f16 bits.
    F16(Vec<u16>),
    /// Raw bf16 bits.
    BF16(Vec<u16>),
    I32(Vec<i32>),
}

/// Row-major host tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: TensorDtype,
    storage: TensorStorage,
}

/// Compute row-major element strides from shape.
pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    if shape.is_empty() {
        return strides;
    }
    strides[shape.len() - 1] = 1;
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn check_len(len: usize, shape: &[usize], what: &str) {
    let n_elements: usize = shape.iter().product();
    assert_eq!(
        len, n_elements,
        "{} data length {} does not match shape {:?} (expected {})",
        what, len, shape, n_elements
    );
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        check_len(data.len(), &shape, "F32");
        debug!(dtype = ?TensorDtype::F32, ?shape, "Created tensor");
        Self {
            shape,
            dtype: TensorDtype::F32,
            storage: TensorStorage::F32(data),
        }
    }

    /// Create a zero-filled tensor of the given dtype.
    pub fn zeros(shape: &[usize], dtype: TensorDtype) -> Self {
        let n: usize = shape.iter().product();
        let storage = match dtype {
            TensorDtype::F32 => TensorStorage::F32(vec![0.0; n]),
            TensorDtype::F16 => TensorStorage::F16(vec![0; n]),
            TensorDtype::BF16 => TensorStorage::BF16(vec![0; n]),
            TensorDtype::I32 => TensorStorage::I32(vec![0; n]),
        };
        Self {
            shape: shape.to_vec(),
            dtype,
            storage,
        }
    }

    /// Create an F16 tensor from raw bits.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_f16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        check_len(data.len(), &shape, "F16");
        Self {
            shape,
            dtype: TensorDtype::F16,
            storage: TensorStorage::F16(data),
        }
    }

    /// Create a BF16 tensor from raw bits.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_bf16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        check_len(data.len(), &shape, "BF16");
        Self {
            shape,
            dtype: TensorDtype::BF16,
            storage: TensorStorage::BF16(data),
        }
    }

    /// Create an I32 tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Self {
        check_len(data.len(), &shape, "I32");
        Self {
            shape,
            dtype: TensorDtype::I32,
            storage: TensorStorage::I32(data),
        }
    }

    /// Round f32 values into a tensor of the given storage dtype.
    pub fn from_f32_as(shape: Vec<usize>, data: &[f32], dtype: TensorDtype) -> Self {
        check_len(data.len(), &shape, "source");
        match dtype {
            TensorDtype::F32 => Tensor::new(shape, data.to_vec()),
            TensorDtype::F16 => Tensor::from_f16(
                shape,
                data.iter().map(|&v| half::f16::from_f32(v).to_bits()).collect(),
            ),
            TensorDtype::BF16 => Tensor::from_bf16(
                shape,
                data.iter().map(|&v| half::bf16::from_f32(v).to_bits()).collect(),
            ),
            TensorDtype::I32 => Tensor::from_i32(shape, data.iter().map(|&v| v as i32).collect()),
        }
    }

    /// Rebuild a tensor from packed little-endian element bytes.
    pub fn from_le_bytes(shape: Vec<usize>, dtype: TensorDtype, bytes: &[u8]) -> Result<Self> {
        let n: usize = shape.iter().product();
        let expected = n * dtype.byte_width();
        if bytes.len() != expected {
            return Err(KernelError::InvalidView(format!(
                "expected {} bytes for {:?} {:?}, got {}",
                expected,
                dtype,
                shape,
                bytes.len()
            )));
        }
        let tensor = match dtype {
            TensorDtype::F32 => Tensor::new(
                shape,
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            TensorDtype::I32 => Tensor::from_i32(
                shape,
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            TensorDtype::F16 | TensorDtype::BF16 => {
                let bits: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                if dtype == TensorDtype::F16 {
                    Tensor::from_f16(shape, bits)
                } else {
                    Tensor::from_bf16(shape, bits)
                }
            }
        };
        Ok(tensor)
    }

    /// Packed little-endian element bytes, row-major.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.storage {
            TensorStorage::F32(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::I32(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorStorage::F16(bits) | TensorStorage::BF16(bits) => {
                bits.iter().flat_map(|v| v.to_le_bytes()).collect()
            }
        }
    }

    /// Raw bits of element `i` in the low bytes of a u32.
    pub fn element_bits(&self, i: usize) -> u32 {
        match &self.storage {
            TensorStorage::F32(data) => data[i].to_bits(),
            TensorStorage::I32(data) => data[i] as u32,
            TensorStorage::F16(bits) | TensorStorage::BF16(bits) => bits[i] as u32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major element strides.
    pub fn strides(&self) -> Vec<usize> {
        compute_strides(&self.shape)
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Returns the underlying I32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not I32 dtype.
    pub fn as_i32(&self) -> &[i32] {
        match &self.storage {
            TensorStorage::I32(data) => data,
            _ => panic!("Tensor is {:?}, not I32", self.dtype),
        }
    }

    /// Widen every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.storage {
            TensorStorage::F32(data) => data.clone(),
            TensorStorage::I32(data) => data.iter().map(|&v| v as f32).collect(),
            TensorStorage::F16(bits) => bits
                .iter()
                .map(|&b| half::f16::from_bits(b).to_f32())
                .collect(),
            TensorStorage::BF16(bits) => bits
                .iter()
                .map(|&b| half::bf16::from_bits(b).to_f32())
                .collect(),
        }
    }

    /// Convert the tensor to F32.
    pub fn to_f32(&self) -> Tensor {
        match self.dtype {
            TensorDtype::F32 => self.clone(),
            _ => Tensor::new(self.shape.clone(), self.to_f32_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[3, 5]), vec![5, 1]);
        assert_eq!(compute_strides(&[10]), vec![1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_new_f32_tensor() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), TensorDtype::F32);
        assert_eq!(t.n_elements(), 6);
        assert_eq!(t.strides(), vec![3, 1]);
        assert_eq!(t.as_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "data length")]
    fn test_new_shape_mismatch() {
        Tensor::new(vec![2, 3], vec![1.0, 2.0]);
    }

    #[test]
    fn test_zeros_all_dtypes() {
        for dtype in [
            TensorDtype::F32,
            TensorDtype::F16,
            TensorDtype::BF16,
            TensorDtype::I32,
        ] {
            let t = Tensor::zeros(&[3, 4], dtype);
            assert_eq!(t.dtype(), dtype);
            assert_eq!(t.n_elements(), 12);
            assert!(t.to_f32_vec().iter().all(|&v| v == 0.0));
            assert_eq!(t.to_le_bytes().len(), 12 * dtype.byte_width());
        }
    }

    #[test]
    fn test_byte_widths() {
        assert_eq!(TensorDtype::F32.byte_width(), 4);
        assert_eq!(TensorDtype::I32.byte_width(), 4);
        assert_eq!(TensorDtype::F16.byte_width(), 2);
        assert_eq!(TensorDtype::BF16.byte_width(), 2);
    }

    #[test]
    fn test_encode_decode_rounds_to_storage() {
        // 1 + 2^-11 is exactly halfway between two f16 values; ties go to even (1.0).
        let v = 1.0 + 2f32.powi(-11);
        let bits = TensorDtype::F16.encode_f32(v);
        assert_eq!(TensorDtype::F16.decode_f32(bits), 1.0);

        let bits = TensorDtype::BF16.encode_f32(3.0);
        assert_eq!(TensorDtype::BF16.decode_f32(bits), 3.0);

        let bits = TensorDtype::I32.encode_f32(-7.0);
        assert_eq!(bits as i32, -7);
        assert_eq!(TensorDtype::I32.decode_f32(bits), -7.0);
    }

    #[test]
    fn test_le_bytes_roundtrip_preserves_values() {
        let t = Tensor::from_f32_as(vec![2, 2], &[1.5, -2.0, 0.25, 8.0], TensorDtype::BF16);
        let back = Tensor::from_le_bytes(vec![2, 2], TensorDtype::BF16, &t.to_le_bytes()).unwrap();
        assert_eq!(back.to_f32_vec(), vec![1.5, -2.0, 0.25, 8.0]);
    }

    #[test]
    fn test_from_le_bytes_wrong_length() {
        let result = Tensor::from_le_bytes(vec![3], TensorDtype::F32, &[0u8; 8]);
        assert!(matches!(result, Err(KernelError::InvalidView(_))));
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(TensorDtype::parse("f16"), Some(TensorDtype::F16));
        assert_eq!(TensorDtype::parse("BF16"), Some(TensorDtype::BF16));
        assert_eq!(TensorDtype::parse("q8_0"), None);
        assert_eq!(TensorDtype::parse(TensorDtype::BF16.as_str()), Some(TensorDtype::BF16));
    }

    #[test]
    #[should_panic(expected = "not F32")]
    fn test_as_f32_wrong_type() {
        let t = Tensor::from_i32(vec![1], vec![3]);
        t.as_f32();
    }
}
