//! Kernel function contract.
//!
//! A kernel is invoked once per chunk by the scheduler and must return the event of
//! the work it enqueued. Kernels are reenterable: the same value may be launched
//! for many chunks, interleaved across queues and devices, so any state they carry
//! is immutable (`&self`, `Send + Sync`).
//!
//! `byte_offset` is the position of the streamed chunk within its object. The device
//! buffer always holds that chunk starting at index 0.

use crate::backend::Backend;
use crate::error::Result;

/// Kernel over one chunk of one object.
pub trait UnaryKernel<B: Backend>: Send + Sync {
    /// Symbolic name used by the measurement sink.
    fn name(&self) -> &str {
        "kernel"
    }

    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size: usize,
        buffer: &B::Buffer,
    ) -> Result<B::Event>;
}

/// Kernel over a pair of chunks, one from each operand.
///
/// `byte_offset` refers to the streamed operand's chunk.
pub trait BinaryKernel<B: Backend>: Send + Sync {
    fn name(&self) -> &str {
        "kernel"
    }

    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &B::Buffer,
        buffer2: &B::Buffer,
    ) -> Result<B::Event>;
}

impl<B, F> UnaryKernel<B> for F
where
    B: Backend,
    F: Fn(&B::Queue, usize, usize, &B::Buffer) -> Result<B::Event> + Send + Sync,
{
    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size: usize,
        buffer: &B::Buffer,
    ) -> Result<B::Event> {
        self(queue, byte_offset, size, buffer)
    }
}

impl<B, F> BinaryKernel<B> for F
where
    B: Backend,
    F: Fn(&B::Queue, usize, usize, usize, &B::Buffer, &B::Buffer) -> Result<B::Event>
        + Send
        + Sync,
{
    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &B::Buffer,
        buffer2: &B::Buffer,
    ) -> Result<B::Event> {
        self(queue, byte_offset, size1, size2, buffer1, buffer2)
    }
}

/// Attach a name to a closure kernel.
#[derive(Debug, Clone)]
pub struct Named<F> {
    name: String,
    kernel: F,
}

impl<F> Named<F> {
    pub fn new(name: impl Into<String>, kernel: F) -> Self {
        Self {
            name: name.into(),
            kernel,
        }
    }
}

impl<B, F> UnaryKernel<B> for Named<F>
where
    B: Backend,
    F: UnaryKernel<B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size: usize,
        buffer: &B::Buffer,
    ) -> Result<B::Event> {
        self.kernel.launch(queue, byte_offset, size, buffer)
    }
}

impl<B, F> BinaryKernel<B> for Named<F>
where
    B: Backend,
    F: BinaryKernel<B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        queue: &B::Queue,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &B::Buffer,
        buffer2: &B::Buffer,
    ) -> Result<B::Event> {
        self.kernel
            .launch(queue, byte_offset, size1, size2, buffer1, buffer2)
    }
}

/// Launch geometry of a device kernel (one dimension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Global work size. `None` derives it from the chunk size.
    pub global: Option<usize>,
    /// Work-group size. `None` lets the driver choose.
    pub local: Option<usize>,
}

impl LaunchConfig {
    pub const fn new(global: usize, local: usize) -> Self {
        Self {
            global: Some(global),
            local: Some(local),
        }
    }

    /// Global size for a chunk of `size` bytes holding `elem_size`-byte elements,
    /// rounded up to a multiple of the local size.
    pub fn global_for(&self, size: usize, elem_size: usize) -> usize {
        let global = self
            .global
            .unwrap_or_else(|| size.div_ceil(elem_size.max(1)));
        match self.local {
            Some(local) if local > 0 => global.div_ceil(local) * local,
            _ => global,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            global: None,
            local: None,
        }
    }
}
