//! Device memory: owning allocations and non-owning strided views.
//!
//! A [`DeviceBuffer`] is an allocation on some compute device. The host backend
//! backs it with [`HostMemory`], a word array of `AtomicU32`, so any number of
//! parallel workers may load, store and read-modify-write elements through a
//! shared reference, the same way kernels address global device memory. GPU
//! backends store an opaque handle instead.
//!
//! A [`DeviceBufferView`] describes a region of a buffer (byte offset, element
//! type, shape, byte strides) and is the input/output contract of every kernel.

use std::any::Any;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::error::{KernelError, Result};
use crate::tensor::{compute_strides, TensorDtype};

// ---------------------------------------------------------------------------
// HostMemory
// ---------------------------------------------------------------------------

/// Byte-addressed host memory stored as 32-bit atomic words.
///
/// Element accesses must be naturally aligned and 1, 2 or 4 bytes wide, so an
/// element never straddles two words. Words are little-endian.
pub struct HostMemory {
    words: Box<[AtomicU32]>,
    byte_len: usize,
}

impl HostMemory {
    /// Allocate `byte_len` zeroed bytes.
    pub fn zeroed(byte_len: usize) -> Self {
        let n_words = byte_len.div_ceil(4);
        let words = (0..n_words).map(|_| AtomicU32::new(0)).collect();
        Self { words, byte_len }
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    #[inline]
    fn locate(&self, offset: usize, width: usize) -> (&AtomicU32, u32, u32) {
        debug_assert!(matches!(width, 1 | 2 | 4), "unsupported width {}", width);
        debug_assert_eq!(offset % width, 0, "misaligned access at {}", offset);
        debug_assert!(offset + width <= self.byte_len, "access past end at {}", offset);
        let shift = ((offset % 4) * 8) as u32;
        let mask = if width == 4 {
            u32::MAX
        } else {
            ((1u32 << (width * 8)) - 1) << shift
        };
        (&self.words[offset / 4], shift, mask)
    }

    /// Load the element at `offset` into the low bits of a u32.
    #[inline]
    pub fn load(&self, offset: usize, width: usize) -> u32 {
        let (word, shift, mask) = self.locate(offset, width);
        (word.load(Ordering::Relaxed) & mask) >> shift
    }

    /// Store the low `width` bytes of `bits` at `offset`.
    ///
    /// Other bytes sharing the word are left untouched even when they are
    /// written concurrently, and racing stores to the same element leave
    /// exactly one of the stored values.
    #[inline]
    pub fn store(&self, offset: usize, width: usize, bits: u32) {
        if width == 4 {
            self.words[offset / 4].store(bits, Ordering::Relaxed);
        } else {
            self.update(offset, width, |_| Some(bits));
        }
    }

    /// Atomically replace the element at `offset` with `f(current)`.
    ///
    /// `f` returns `None` to leave the element unchanged. Returns the previous
    /// element bits.
    #[inline]
    pub fn update<F>(&self, offset: usize, width: usize, mut f: F) -> u32
    where
        F: FnMut(u32) -> Option<u32>,
    {
        let (word, shift, mask) = self.locate(offset, width);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let old = (current & mask) >> shift;
            let Some(new) = f(old) else {
                return old;
            };
            let next = (current & !mask) | ((new << shift) & mask);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return old,
                Err(actual) => current = actual,
            }
        }
    }

    /// Copy bytes in at `offset`.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        let mut i = 0;
        while i < bytes.len() {
            let at = offset + i;
            if at % 4 == 0 && bytes.len() - i >= 4 {
                let word = u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
                self.store(at, 4, word);
                i += 4;
            } else {
                self.store(at, 1, bytes[i] as u32);
                i += 1;
            }
        }
    }

    /// Copy `len` bytes out from `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut i = 0;
        while i < len {
            let at = offset + i;
            if at % 4 == 0 && len - i >= 4 {
                out.extend_from_slice(&self.load(at, 4).to_le_bytes());
                i += 4;
            } else {
                out.push(self.load(at, 1) as u8);
                i += 1;
            }
        }
        out
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostMemory({} bytes)", self.byte_len)
    }
}

// ---------------------------------------------------------------------------
// DeviceBuffer
// ---------------------------------------------------------------------------

enum BufferStorage {
    Host(HostMemory),
    Device(Box<dyn Any + Send + Sync>),
}

/// An allocation on a compute device.
pub struct DeviceBuffer {
    byte_len: usize,
    storage: BufferStorage,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.storage {
            BufferStorage::Host(mem) => write!(f, "DeviceBuffer::Host({:?})", mem),
            BufferStorage::Device(_) => write!(f, "DeviceBuffer::Device({} bytes)", self.byte_len),
        }
    }
}

impl DeviceBuffer {
    /// Zeroed host-resident buffer.
    pub fn host(byte_len: usize) -> Self {
        Self {
            byte_len,
            storage: BufferStorage::Host(HostMemory::zeroed(byte_len)),
        }
    }

    /// Wrap an opaque device allocation.
    #[allow(dead_code)]
    pub(crate) fn from_device(byte_len: usize, inner: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            byte_len,
            storage: BufferStorage::Device(inner),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Host memory, or `None` for device-resident buffers.
    pub fn host_memory(&self) -> Option<&HostMemory> {
        match &self.storage {
            BufferStorage::Host(mem) => Some(mem),
            BufferStorage::Device(_) => None,
        }
    }

    /// Downcast the device-resident handle to a concrete type.
    #[allow(dead_code)]
    pub(crate) fn device_inner<T: 'static>(&self) -> Option<&T> {
        match &self.storage {
            BufferStorage::Device(inner) => inner.downcast_ref::<T>(),
            BufferStorage::Host(_) => None,
        }
    }
}

/// A buffer owned together with the dtype and contiguous shape of its contents.
#[derive(Debug)]
pub struct DeviceTensor {
    buffer: DeviceBuffer,
    dtype: TensorDtype,
    shape: Vec<usize>,
}

impl DeviceTensor {
    pub fn new(buffer: DeviceBuffer, dtype: TensorDtype, shape: Vec<usize>) -> Result<Self> {
        let needed = shape
            .iter()
            .try_fold(dtype.byte_width(), |n, &d| n.checked_mul(d));
        if needed.map_or(true, |n| n > buffer.byte_len()) {
            return Err(KernelError::InvalidView(format!(
                "{:?} {:?} needs {:?} bytes, buffer has {}",
                dtype,
                shape,
                needed,
                buffer.byte_len()
            )));
        }
        Ok(Self {
            buffer,
            dtype,
            shape,
        })
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Contiguous row-major view of the whole tensor.
    pub fn view(&self) -> DeviceBufferView<'_> {
        let width = self.dtype.byte_width();
        DeviceBufferView {
            buffer: &self.buffer,
            offset: 0,
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: compute_strides(&self.shape)
                .into_iter()
                .map(|s| s * width)
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceBufferView
// ---------------------------------------------------------------------------

/// Non-owning description of a strided region of a [`DeviceBuffer`].
///
/// Offset and strides are in bytes. Construction checks that every addressed
/// element lies inside the buffer and is aligned to the element width.
#[derive(Debug, Clone)]
pub struct DeviceBufferView<'a> {
    buffer: &'a DeviceBuffer,
    offset: usize,
    dtype: TensorDtype,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl<'a> DeviceBufferView<'a> {
    /// Create a strided view.
    pub fn new(
        buffer: &'a DeviceBuffer,
        offset: usize,
        dtype: TensorDtype,
        shape: Vec<usize>,
        strides: Vec<usize>,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(KernelError::InvalidView(format!(
                "shape {:?} and strides {:?} differ in rank",
                shape, strides
            )));
        }
        let width = dtype.byte_width();
        if offset % width != 0 || strides.iter().any(|s| s % width != 0) {
            return Err(KernelError::InvalidView(format!(
                "offset {} / strides {:?} not aligned to {}-byte {:?} elements",
                offset, strides, width, dtype
            )));
        }
        let view = Self {
            buffer,
            offset,
            dtype,
            shape,
            strides,
        };
        let end = view.checked_end().ok_or_else(|| {
            KernelError::InvalidView(format!(
                "shape {:?} with strides {:?} at offset {} overflows the address space",
                view.shape, view.strides, offset
            ))
        })?;
        if end > buffer.byte_len() {
            return Err(KernelError::InvalidView(format!(
                "view spans bytes {}..{} but buffer holds {}",
                offset,
                end,
                buffer.byte_len()
            )));
        }
        trace!(offset, ?view.shape, ?view.strides, "Created buffer view");
        Ok(view)
    }

    /// Row-major view starting at `offset`.
    pub fn contiguous(
        buffer: &'a DeviceBuffer,
        offset: usize,
        dtype: TensorDtype,
        shape: Vec<usize>,
    ) -> Result<Self> {
        let mut strides = vec![0usize; shape.len()];
        let mut step = Some(dtype.byte_width());
        for (stride, &d) in strides.iter_mut().zip(&shape).rev() {
            let Some(s) = step else {
                return Err(KernelError::InvalidView(format!(
                    "shape {:?} overflows the address space",
                    shape
                )));
            };
            *stride = s;
            step = s.checked_mul(d);
        }
        Self::new(buffer, offset, dtype, shape, strides)
    }

    pub fn buffer(&self) -> &'a DeviceBuffer {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn n_elements(&self) -> usize {
        if self.shape.contains(&0) {
            return 0;
        }
        self.shape.iter().product()
    }

    /// Byte offset of the element at `index` within the buffer.
    pub fn element_offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// One past the last byte touched, or `None` if the arithmetic overflows.
    fn checked_end(&self) -> Option<usize> {
        if self.shape.iter().any(|&d| d == 0) {
            return Some(self.offset);
        }
        self.shape
            .iter()
            .try_fold(1usize, |n, &d| n.checked_mul(d))?;
        self.shape
            .iter()
            .zip(&self.strides)
            .try_fold(self.offset, |end, (&d, &s)| end.checked_add((d - 1).checked_mul(s)?))?
            .checked_add(self.dtype.byte_width())
    }

    /// Bytes touched by the view. Empty for views with a zero-sized dimension.
    pub fn byte_range(&self) -> Range<usize> {
        // Construction guarantees the extent fits inside the buffer.
        let end = self.checked_end().unwrap_or(self.offset);
        self.offset..end
    }

    /// Innermost dimension is densely packed.
    pub fn is_inner_contiguous(&self) -> bool {
        match (self.shape.last(), self.strides.last()) {
            (Some(&d), Some(&s)) => d <= 1 || s == self.dtype.byte_width(),
            _ => true,
        }
    }

    /// Whole view is densely packed in row-major order.
    pub fn is_contiguous(&self) -> bool {
        let width = self.dtype.byte_width();
        let mut expected = width;
        for (&d, &s) in self.shape.iter().zip(&self.strides).rev() {
            if d > 1 && s != expected {
                return false;
            }
            expected *= d;
        }
        true
    }

    /// Whether the trailing dimensions from `axis` on form one dense run.
    pub fn is_contiguous_from(&self, axis: usize) -> bool {
        let width = self.dtype.byte_width();
        let mut expected = width;
        for (&d, &s) in self.shape[axis..].iter().zip(&self.strides[axis..]).rev() {
            if d > 1 && s != expected {
                return false;
            }
            expected *= d;
        }
        true
    }

    /// Whether every element has a byte range of its own.
    ///
    /// Broadcast (stride 0) and interleaved strides make distinct indices
    /// share memory, which output views must not do.
    pub fn is_non_overlapping(&self) -> bool {
        let mut dims: Vec<(usize, usize)> = self
            .shape
            .iter()
            .zip(&self.strides)
            .filter(|(&d, _)| d > 1)
            .map(|(&d, &s)| (d, s))
            .collect();
        dims.sort_by_key(|&(_, s)| s);
        let mut extent = self.dtype.byte_width();
        for (d, s) in dims {
            if s < extent {
                return false;
            }
            extent += s * (d - 1);
        }
        true
    }

    /// Restrict dimension `dim` to `start..start + len`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        if dim >= self.shape.len() || start.checked_add(len).map_or(true, |end| end > self.shape[dim]) {
            return Err(KernelError::InvalidView(format!(
                "narrow({}, {}, {}) outside shape {:?}",
                dim, start, len, self.shape
            )));
        }
        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Self {
            buffer: self.buffer,
            offset: self.offset + start * self.strides[dim],
            dtype: self.dtype,
            shape,
            strides: self.strides.clone(),
        })
    }

    /// Whether the two views touch a common byte of the same buffer.
    pub fn overlaps(&self, other: &DeviceBufferView<'_>) -> bool {
        if !std::ptr::eq(self.buffer, other.buffer) {
            return false;
        }
        let a = self.byte_range();
        let b = other.byte_range();
        !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
    }

    /// Call `f` with the buffer byte offset of every element, in row-major order.
    pub fn for_each_offset<F: FnMut(usize)>(&self, mut f: F) {
        if self.shape.iter().any(|&d| d == 0) {
            return;
        }
        let rank = self.shape.len();
        let mut index = vec![0usize; rank];
        loop {
            f(self.element_offset(&index));
            let mut axis = rank;
            loop {
                if axis == 0 {
                    return;
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }
}
