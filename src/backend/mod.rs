//! Accelerator backend trait and event abstraction.
//!
//! Defines the [`Backend`] trait with the handful of asynchronous operations the
//! buffer cache and the scheduler need: buffer allocation, host/device transfers,
//! markers and queue draining. Every operation returns a [`DeviceEvent`] that can be
//! used in the wait list of later submissions.

pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Handle to an in-flight or completed asynchronous device operation.
pub trait DeviceEvent: Clone + Send + Sync + fmt::Debug + 'static {
    /// Block until the operation has finished. Returns the device-reported
    /// failure if the operation (or anything in its wait list) failed.
    fn wait(&self) -> Result<()>;

    /// Non-blocking completion check (finished successfully or with error).
    fn is_complete(&self) -> bool;

    /// Device execution time, when the backend records it.
    fn elapsed(&self) -> Option<Duration> {
        None
    }
}

/// Pending device→host read. `take` blocks until the bytes are on the host.
pub trait Readback: Send + 'static {
    fn take(self) -> Result<Vec<u8>>;
}

/// Compute accelerator backend.
///
/// Queues are in-order: a command starts only after every earlier command on the
/// same queue and every event in its wait list has completed.
pub trait Backend: Send + Sync + 'static {
    type Context: Clone + Send + Sync;
    type Device: Clone + PartialEq + fmt::Debug + Send + Sync;
    type Queue: Clone + Send + Sync;
    type Buffer: Clone + Send + Sync;
    type Event: DeviceEvent;
    type Readback: Readback;

    /// Short backend identifier used in logs.
    fn name(&self) -> &'static str;

    /// Total device memory in bytes.
    fn device_memory(&self, device: &Self::Device) -> Result<usize>;

    /// Device memory not yet allocated. Backends that cannot query free memory
    /// report the total.
    fn available_memory(&self, device: &Self::Device) -> Result<usize> {
        self.device_memory(device)
    }

    fn create_queue(&self, context: &Self::Context, device: &Self::Device) -> Result<Self::Queue>;

    /// Allocate `bytes` of device memory.
    fn create_buffer(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        bytes: usize,
    ) -> Result<Self::Buffer>;

    /// Asynchronously copy `data` into the start of `buffer`.
    fn enqueue_write(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        data: Vec<u8>,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Asynchronously copy the first `len` bytes of `buffer` back to the host.
    fn enqueue_read(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        len: usize,
        wait: &[Self::Event],
    ) -> Result<(Self::Event, Self::Readback)>;

    /// Enqueue a no-op that completes once every event in `wait` has completed.
    /// Later commands on `queue` are held back behind it.
    fn enqueue_marker(&self, queue: &Self::Queue, wait: &[Self::Event]) -> Result<Self::Event>;

    /// Block until every command submitted to `queue` has completed.
    fn finish(&self, queue: &Self::Queue) -> Result<()>;
}

/// Wait on every event, returning the first failure after all have been awaited.
pub fn wait_all<E: DeviceEvent>(events: &[E]) -> Result<()> {
    let mut first_err = None;
    for event in events {
        if let Err(e) = event.wait() {
            if first_err.is_none() {
                first_err = Some(e);
            } else {
                warn!(error = %e, "additional device fault while draining events");
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
