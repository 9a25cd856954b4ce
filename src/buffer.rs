//! Typed device buffers.
//!
//! A [`TypedBuffer`] is a device buffer handle paired with an element type tag and
//! an element count. It composes the backend's opaque buffer rather than extending
//! it, and reports its byte size as `count * dtype.size()`.

use half::f16;
use tracing::debug;

use crate::backend::{Backend, DeviceEvent, Readback};
use crate::error::{Result, StreamError};

/// Element type of a typed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U32,
    I32,
    U64,
    F16,
    F32,
}

impl ElementType {
    /// Size in bytes of one element.
    pub const fn size(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::F16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 => 8,
        }
    }
}

/// Host element type that can live in a typed buffer.
///
/// Values are stored little-endian, the byte order of every supported device.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: ElementType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $tag:ident) => {
        impl Element for $ty {
            const DTYPE: ElementType = ElementType::$tag;

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_element!(u8, U8);
impl_element!(u32, U32);
impl_element!(i32, I32);
impl_element!(u64, U64);
impl_element!(f16, F16);
impl_element!(f32, F32);

/// Encode a slice of elements into little-endian bytes.
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::DTYPE.size();
    let mut out = vec![0u8; values.len() * size];
    for (value, dst) in values.iter().zip(out.chunks_exact_mut(size)) {
        value.write_le(dst);
    }
    out
}

/// Decode little-endian bytes into elements. Trailing partial elements are an error.
pub fn decode<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let size = T::DTYPE.size();
    if bytes.len() % size != 0 {
        return Err(StreamError::Capacity(format!(
            "{} bytes is not a whole number of {:?} elements",
            bytes.len(),
            T::DTYPE
        )));
    }
    Ok(bytes.chunks_exact(size).map(T::read_le).collect())
}

/// Device buffer with an element type and count.
pub struct TypedBuffer<B: Backend> {
    handle: B::Buffer,
    dtype: ElementType,
    count: usize,
}

impl<B: Backend> Clone for TypedBuffer<B> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            dtype: self.dtype,
            count: self.count,
        }
    }
}

impl<B: Backend> TypedBuffer<B> {
    /// Wrap an existing device buffer.
    pub fn from_handle(handle: B::Buffer, dtype: ElementType, count: usize) -> Self {
        Self {
            handle,
            dtype,
            count,
        }
    }

    /// Allocate room for `count` elements of `dtype` on `device`.
    pub fn allocate(
        backend: &B,
        context: &B::Context,
        device: &B::Device,
        dtype: ElementType,
        count: usize,
    ) -> Result<Self> {
        let bytes = count.checked_mul(dtype.size()).ok_or_else(|| {
            StreamError::Capacity(format!("{} {:?} elements overflow usize", count, dtype))
        })?;
        // Zero-sized device allocations are rejected by real drivers.
        let handle = backend.create_buffer(context, device, bytes.max(1))?;
        debug!(?dtype, count, bytes, "Allocated typed buffer");
        Ok(Self::from_handle(handle, dtype, count))
    }

    pub fn handle(&self) -> &B::Buffer {
        &self.handle
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Byte size: `count * dtype.size()`.
    pub fn bytes(&self) -> usize {
        self.count * self.dtype.size()
    }

    fn check<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(StreamError::Configuration(format!(
                "typed buffer holds {:?}, not {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }

    /// Upload `values` and wait for the transfer to complete.
    pub fn write_from_host<T: Element>(
        &self,
        backend: &B,
        queue: &B::Queue,
        values: &[T],
    ) -> Result<()> {
        self.check::<T>()?;
        if values.len() > self.count {
            return Err(StreamError::Capacity(format!(
                "{} elements do not fit a buffer of {}",
                values.len(),
                self.count
            )));
        }
        backend
            .enqueue_write(queue, &self.handle, encode(values), &[])?
            .wait()
    }

    /// Download every element, waiting for `wait` and the transfer first.
    pub fn read_to_host<T: Element>(
        &self,
        backend: &B,
        queue: &B::Queue,
        wait: &[B::Event],
    ) -> Result<Vec<T>> {
        self.check::<T>()?;
        let (_event, readback) = backend.enqueue_read(queue, &self.handle, self.bytes(), wait)?;
        decode(&readback.take()?)
    }
}

impl<B: Backend> std::fmt::Debug for TypedBuffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedBuffer")
            .field("dtype", &self.dtype)
            .field("count", &self.count)
            .finish()
    }
}
