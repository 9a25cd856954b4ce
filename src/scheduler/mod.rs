//! Device schedulers.
//!
//! A scheduler owns the command queues of its devices and the buffer cache. Kernel
//! jobs are recorded by the `enqueue*` calls and submitted by [`DeviceScheduler::run`];
//! each call's [`SubmissionFuture`] resolves once its commands are on the queues.
//!
//! Two variants share one submission engine:
//! - [`SingleDeviceScheduler`]: one device, barriers are device-side markers.
//! - [`MultiDeviceScheduler`]: several devices with an explicit
//!   [`DistributionPolicy`]; barriers wait on the host.
//!
//! Kernels touching one object always run in submission order, so a kernel sees
//! the chunks of an object in increasing offset order. Between devices this costs
//! a host wait per device switch; [`DistributionPolicy::Pinned`] avoids it.

mod engine;
mod future;
mod multi;
mod single;

pub use future::SubmissionFuture;
pub use multi::MultiDeviceScheduler;
pub use single::SingleDeviceScheduler;

pub use crate::config::{DistributionPolicy, PairingPolicy, SchedulerConfig};

use std::sync::Arc;

use crate::backend::Backend;
use crate::cache::{BufferCache, ObjectId};
use crate::error::{Result, StreamError};
use crate::kernel::{BinaryKernel, UnaryKernel};
use crate::measurement::Recorder;

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Missing a device or the buffer cache.
    Created,
    /// At least one device and a cache are registered.
    Configured,
    /// Work has been enqueued.
    Running,
}

/// Resolved chunk pairing of a binary job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPlan {
    Zip,
    /// Stream the first operand; the second is a single resident chunk.
    StreamFirst,
    /// Stream the second operand; the first is a single resident chunk.
    StreamSecond,
}

/// Decide how the chunks of two operands are paired.
pub fn resolve_pairing(policy: PairingPolicy, first: usize, second: usize) -> Result<PairPlan> {
    let resident_fits = |resident: usize, role: &str| {
        if resident <= 1 {
            Ok(())
        } else {
            Err(StreamError::Capacity(format!(
                "{} operand has {} chunks; a resident operand must fit one slot",
                role, resident
            )))
        }
    };
    match policy {
        PairingPolicy::Zip if first == second => Ok(PairPlan::Zip),
        PairingPolicy::Zip => Err(StreamError::Configuration(format!(
            "zip pairing needs equal chunk counts, got {} and {}",
            first, second
        ))),
        PairingPolicy::StreamFirst => {
            resident_fits(second, "second").map(|_| PairPlan::StreamFirst)
        }
        PairingPolicy::StreamSecond => {
            resident_fits(first, "first").map(|_| PairPlan::StreamSecond)
        }
        PairingPolicy::Auto if first == second => Ok(PairPlan::Zip),
        PairingPolicy::Auto if first > second => {
            resident_fits(second, "second").map(|_| PairPlan::StreamFirst)
        }
        PairingPolicy::Auto => resident_fits(first, "first").map(|_| PairPlan::StreamSecond),
    }
}

/// Scheduler interface shared by the single- and multi-device variants.
///
/// The `*_dyn` methods keep the trait object safe; the generic conveniences wrap
/// them for concrete kernels.
pub trait DeviceScheduler<B: Backend> {
    fn state(&self) -> SchedulerState;

    /// Attach the buffer cache. Exactly one cache per scheduler.
    fn add_buffer_cache(&mut self, cache: BufferCache<B>) -> Result<()>;

    /// Register a device and create its queues. The cache must hold a pool for
    /// the device by the time work is run.
    fn add_device(&mut self, context: B::Context, device: B::Device) -> Result<()>;

    fn cache(&self) -> Option<&BufferCache<B>>;

    fn cache_mut(&mut self) -> Option<&mut BufferCache<B>>;

    /// Queues of registered device `index`.
    fn queues(&self, index: usize) -> Option<&[B::Queue]>;

    fn enqueue_unary_dyn(
        &mut self,
        kernel: Arc<dyn UnaryKernel<B>>,
        object: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>>;

    fn enqueue_binary_dyn(
        &mut self,
        kernel: Arc<dyn BinaryKernel<B>>,
        first: ObjectId,
        second: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>>;

    /// Work enqueued after the barrier starts only once all work enqueued before
    /// it has completed, on every device.
    fn enqueue_barrier(&mut self) -> Result<()>;

    /// Submit everything enqueued since the last run. Does not wait for devices.
    fn run(&mut self) -> Result<()>;

    /// Run, wait for every submitted event and flush the cache's write-backs.
    fn finish(&mut self) -> Result<()>;

    /// Run `kernel` over every chunk of `object`.
    fn enqueue<K>(&mut self, kernel: K, object: ObjectId) -> Result<SubmissionFuture<B::Event>>
    where
        K: UnaryKernel<B> + 'static,
        Self: Sized,
    {
        self.enqueue_unary_dyn(Arc::new(kernel), object, None)
    }

    fn enqueue_with<K>(
        &mut self,
        kernel: K,
        object: ObjectId,
        recorder: &Recorder<B::Event>,
    ) -> Result<SubmissionFuture<B::Event>>
    where
        K: UnaryKernel<B> + 'static,
        Self: Sized,
    {
        self.enqueue_unary_dyn(Arc::new(kernel), object, Some(recorder.clone()))
    }

    /// Run `kernel` over chunk pairs of `first` and `second`.
    fn enqueue_binary<K>(
        &mut self,
        kernel: K,
        first: ObjectId,
        second: ObjectId,
    ) -> Result<SubmissionFuture<B::Event>>
    where
        K: BinaryKernel<B> + 'static,
        Self: Sized,
    {
        self.enqueue_binary_dyn(Arc::new(kernel), first, second, None)
    }

    fn enqueue_binary_with<K>(
        &mut self,
        kernel: K,
        first: ObjectId,
        second: ObjectId,
        recorder: &Recorder<B::Event>,
    ) -> Result<SubmissionFuture<B::Event>>
    where
        K: BinaryKernel<B> + 'static,
        Self: Sized,
    {
        self.enqueue_binary_dyn(Arc::new(kernel), first, second, Some(recorder.clone()))
    }
}
