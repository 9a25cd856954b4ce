//! Scheduler spreading chunks over several devices.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::cache::{BufferCache, ObjectId};
use crate::config::{DistributionPolicy, SchedulerConfig};
use crate::error::Result;
use crate::kernel::{BinaryKernel, UnaryKernel};
use crate::measurement::Recorder;

use super::engine::Engine;
use super::{DeviceScheduler, SchedulerState, SubmissionFuture};

/// Distributes the chunks of every job across its devices according to an
/// explicit [`DistributionPolicy`].
///
/// Chunks of one object still run in offset order: when consecutive chunks
/// land on different devices, `run` blocks the host until the earlier kernel
/// completes. Only `Pinned` keeps a job free of such waits. A barrier with more
/// than one device blocks the host in `run` until everything before it has
/// completed.
pub struct MultiDeviceScheduler<B: Backend> {
    engine: Engine<B>,
}

impl<B: Backend> MultiDeviceScheduler<B> {
    pub fn new(
        backend: Arc<B>,
        config: SchedulerConfig,
        distribution: DistributionPolicy,
    ) -> Result<Self> {
        debug!(
            backend = backend.name(),
            ?distribution,
            "Created multi-device scheduler"
        );
        Ok(Self {
            engine: Engine::new(backend, config, distribution)?,
        })
    }

    pub fn distribution(&self) -> DistributionPolicy {
        self.engine.distribution()
    }

    pub fn device_count(&self) -> usize {
        self.engine.device_count()
    }

    pub fn device(&self, index: usize) -> Option<&B::Device> {
        self.engine.device(index)
    }

    pub fn is_poisoned(&self) -> bool {
        self.engine.is_poisoned()
    }
}

impl<B: Backend> DeviceScheduler<B> for MultiDeviceScheduler<B> {
    fn state(&self) -> SchedulerState {
        self.engine.state()
    }

    fn add_buffer_cache(&mut self, cache: BufferCache<B>) -> Result<()> {
        self.engine.set_cache(cache)
    }

    fn add_device(&mut self, context: B::Context, device: B::Device) -> Result<()> {
        self.engine.add_lane(&context, device)
    }

    fn cache(&self) -> Option<&BufferCache<B>> {
        self.engine.cache()
    }

    fn cache_mut(&mut self) -> Option<&mut BufferCache<B>> {
        self.engine.cache_mut()
    }

    fn queues(&self, index: usize) -> Option<&[B::Queue]> {
        self.engine.queues(index)
    }

    fn enqueue_unary_dyn(
        &mut self,
        kernel: Arc<dyn UnaryKernel<B>>,
        object: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>> {
        self.engine.push_unary(kernel, object, recorder)
    }

    fn enqueue_binary_dyn(
        &mut self,
        kernel: Arc<dyn BinaryKernel<B>>,
        first: ObjectId,
        second: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>> {
        self.engine.push_binary(kernel, first, second, recorder)
    }

    fn enqueue_barrier(&mut self) -> Result<()> {
        self.engine.push_barrier()
    }

    fn run(&mut self) -> Result<()> {
        self.engine.run()
    }

    fn finish(&mut self) -> Result<()> {
        self.engine.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{
        host_devices, HostBackend, HostBuffer, HostContext, HostDevice, HostEvent, HostKernel,
        HostQueue,
    };
    use crate::backend::wait_all;
    use crate::cache::AccessMode;
    use crate::config::{CacheConfig, PairingPolicy};
    use crate::error::StreamError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SLOT: usize = 32;

    fn setup(
        slots: &[usize],
        distribution: DistributionPolicy,
    ) -> (MultiDeviceScheduler<HostBackend>, Vec<HostDevice>) {
        setup_with(slots, SchedulerConfig::default(), distribution)
    }

    fn setup_with(
        slots: &[usize],
        config: SchedulerConfig,
        distribution: DistributionPolicy,
    ) -> (MultiDeviceScheduler<HostBackend>, Vec<HostDevice>) {
        let backend = Arc::new(HostBackend::new());
        let devices = host_devices(slots.len(), 1 << 14);
        let mut cache =
            BufferCache::new(Arc::clone(&backend), CacheConfig::with_buffer_size(SLOT)).unwrap();
        let mut scheduler = MultiDeviceScheduler::new(backend, config, distribution).unwrap();
        for (device, &n) in devices.iter().zip(slots) {
            cache.add_device(HostContext, device.clone(), n * SLOT).unwrap();
            scheduler.add_device(HostContext, device.clone()).unwrap();
        }
        scheduler.add_buffer_cache(cache).unwrap();
        (scheduler, devices)
    }

    /// Kernel recording which device buffer served each chunk offset.
    fn tracer(
        log: Arc<Mutex<Vec<(usize, String)>>>,
    ) -> impl Fn(&HostQueue, usize, usize, &HostBuffer) -> Result<HostEvent> + Send + Sync {
        move |queue: &HostQueue, offset: usize, _size: usize, _buf: &HostBuffer| {
            let log = Arc::clone(&log);
            let name = queue.device().name().to_string();
            queue.enqueue_task(&[], move || {
                log.lock().unwrap().push((offset / SLOT, name));
                Ok(())
            })
        }
    }

    /// Kernel logging `(job, chunk)` when it executes. Kernels on `slow` sleep
    /// first, so an unordered launch shows up as an out-of-order log.
    fn staggered(
        log: Arc<Mutex<Vec<(usize, usize)>>>,
        job: usize,
        slow: String,
    ) -> impl Fn(&HostQueue, usize, usize, &HostBuffer) -> Result<HostEvent> + Send + Sync {
        move |queue: &HostQueue, offset: usize, _size: usize, _buf: &HostBuffer| {
            let log = Arc::clone(&log);
            let delay = if queue.device().name() == slow.as_str() { 5 } else { 0 };
            queue.enqueue_task(&[], move || {
                std::thread::sleep(std::time::Duration::from_millis(delay));
                log.lock().unwrap().push((job, offset / SLOT));
                Ok(())
            })
        }
    }

    fn chunks_per_device(log: &[(usize, String)], device: &HostDevice) -> usize {
        log.iter().filter(|(_, d)| d == device.name()).count()
    }

    #[test]
    fn test_round_robin_distribution() {
        let (mut scheduler, devices) = setup(&[2, 2], DistributionPolicy::RoundRobin);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 8 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let future = scheduler.enqueue(tracer(Arc::clone(&log)), id).unwrap();
        scheduler.run().unwrap();
        wait_all(&future.wait().unwrap()).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        for (chunk, device) in log.iter() {
            assert_eq!(device, devices[chunk % 2].name());
        }
    }

    #[test]
    fn test_pinned_distribution() {
        let (mut scheduler, devices) = setup(&[2, 2], DistributionPolicy::Pinned { device: 1 });
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 5 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let future = scheduler.enqueue(tracer(Arc::clone(&log)), id).unwrap();
        scheduler.run().unwrap();
        wait_all(&future.wait().unwrap()).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(chunks_per_device(&log, &devices[1]), 5);
        // Running state across chunks stays ordered on one device.
        let order: Vec<usize> = log.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_pinned_to_missing_device() {
        let (mut scheduler, _devices) = setup(&[1, 1], DistributionPolicy::Pinned { device: 4 });
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; SLOT], AccessMode::ReadOnly)
            .unwrap();
        let future = scheduler.enqueue(HostKernel::new("noop", |_, _| Ok(())), id).unwrap();
        assert!(matches!(scheduler.run(), Err(StreamError::Configuration(_))));
        assert!(matches!(future.wait(), Err(StreamError::Configuration(_))));
        assert!(!scheduler.is_poisoned());
    }

    #[test]
    fn test_capacity_weighted_distribution() {
        let (mut scheduler, devices) = setup(&[3, 1], DistributionPolicy::CapacityWeighted);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 12 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let future = scheduler.enqueue(tracer(Arc::clone(&log)), id).unwrap();
        scheduler.run().unwrap();
        wait_all(&future.wait().unwrap()).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(chunks_per_device(&log, &devices[0]), 9);
        assert_eq!(chunks_per_device(&log, &devices[1]), 3);
    }

    #[test]
    fn test_writes_land_from_every_device() {
        let (mut scheduler, _devices) = setup(&[2, 2, 2], DistributionPolicy::RoundRobin);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 9 * SLOT + 1], AccessMode::WriteOnly)
            .unwrap();
        fn fill(offset: usize, bytes: &mut [u8]) -> Result<()> {
            let tag = (offset / SLOT) as u8 + 1;
            bytes.fill(tag);
            Ok(())
        }
        scheduler.enqueue(HostKernel::new("fill", fill), id).unwrap();
        scheduler.finish().unwrap();
        let data = scheduler.cache_mut().unwrap().read_object(id).unwrap();
        for (i, &b) in data.iter().enumerate() {
            assert_eq!(b, (i / SLOT) as u8 + 1);
        }
    }

    #[test]
    fn test_host_barrier_across_devices() {
        let (mut scheduler, _devices) = setup(&[2, 2], DistributionPolicy::RoundRobin);
        let cache = scheduler.cache_mut().unwrap();
        let a = cache.add_object(vec![0; 6 * SLOT], AccessMode::ReadOnly).unwrap();
        let b = cache.add_object(vec![0; 6 * SLOT], AccessMode::ReadOnly).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let phase1 = move |queue: &HostQueue, _o: usize, _s: usize, _b: &HostBuffer| {
            let counter = Arc::clone(&counter);
            queue.enqueue_task(&[], move || {
                std::thread::sleep(std::time::Duration::from_millis(2));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (counter, log) = (Arc::clone(&done), Arc::clone(&seen));
        let phase2 = move |queue: &HostQueue, _o: usize, _s: usize, _b: &HostBuffer| {
            let (counter, log) = (Arc::clone(&counter), Arc::clone(&log));
            queue.enqueue_task(&[], move || {
                log.lock().unwrap().push(counter.load(Ordering::SeqCst));
                Ok(())
            })
        };
        scheduler.enqueue(phase1, a).unwrap();
        scheduler.enqueue_barrier().unwrap();
        scheduler.enqueue(phase2, b).unwrap();
        scheduler.finish().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|&n| n == 6), "observed {:?}", seen);
    }

    #[test]
    fn test_chunks_execute_in_offset_order_across_devices() {
        let (mut scheduler, devices) = setup(&[2, 2], DistributionPolicy::RoundRobin);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 6 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = devices[0].name().to_string();
        scheduler.enqueue(staggered(Arc::clone(&log), 0, slow), id).unwrap();
        scheduler.finish().unwrap();
        let order: Vec<usize> = log.lock().unwrap().iter().map(|&(_, c)| c).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_jobs_on_one_object_stay_in_order() {
        let (mut scheduler, devices) = setup(&[2, 2], DistributionPolicy::RoundRobin);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 4 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        // The first job ends on device 1, the second starts on device 0.
        let slow = devices[1].name().to_string();
        scheduler.enqueue(staggered(Arc::clone(&log), 0, slow.clone()), id).unwrap();
        scheduler.enqueue(staggered(Arc::clone(&log), 1, slow), id).unwrap();
        scheduler.finish().unwrap();
        let expected: Vec<(usize, usize)> =
            (0..2).flat_map(|job| (0..4).map(move |c| (job, c))).collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_binary_job_needs_two_slots_per_device() {
        let noop = |queue: &HostQueue,
                    _offset: usize,
                    _size1: usize,
                    _size2: usize,
                    _a: &HostBuffer,
                    _b: &HostBuffer| queue.enqueue_task(&[], || Ok(()));

        let (mut scheduler, _devices) = setup(&[2, 1], DistributionPolicy::RoundRobin);
        let cache = scheduler.cache_mut().unwrap();
        let a = cache.add_object(vec![0; 2 * SLOT], AccessMode::ReadOnly).unwrap();
        let b = cache.add_object(vec![0; 2 * SLOT], AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            scheduler.enqueue_binary(noop, a, b),
            Err(StreamError::Capacity(_))
        ));
        assert!(!scheduler.is_poisoned());

        // Pinned to the roomy device, the small pool is never used.
        let (mut scheduler, _devices) = setup(&[2, 1], DistributionPolicy::Pinned { device: 0 });
        let cache = scheduler.cache_mut().unwrap();
        let a = cache.add_object(vec![0; 2 * SLOT], AccessMode::ReadOnly).unwrap();
        let b = cache.add_object(vec![0; 2 * SLOT], AccessMode::ReadOnly).unwrap();
        scheduler.enqueue_binary(noop, a, b).unwrap();
        scheduler.finish().unwrap();
    }

    #[test]
    fn test_writable_resident_operand_stays_on_one_device() {
        let config = SchedulerConfig {
            pairing: PairingPolicy::StreamFirst,
            ..SchedulerConfig::default()
        };
        let (mut scheduler, _devices) =
            setup_with(&[2, 2], config, DistributionPolicy::RoundRobin);
        let cache = scheduler.cache_mut().unwrap();
        let rows = cache
            .add_object((0..4 * SLOT).map(|i| (i % 7) as u8).collect(), AccessMode::ReadOnly)
            .unwrap();
        let total = cache.add_zeroed(8, AccessMode::ReadWrite).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let accumulate = move |queue: &HostQueue,
                               _offset: usize,
                               size1: usize,
                               _size2: usize,
                               a: &HostBuffer,
                               b: &HostBuffer| {
            let (a, b, log) = (a.clone(), b.clone(), Arc::clone(&log));
            let name = queue.device().name().to_string();
            queue.enqueue_task(&[], move || {
                let add: u64 = a.with_bytes(|a| a[..size1].iter().map(|&x| x as u64).sum());
                b.with_bytes_mut(|b| {
                    let mut acc = [0u8; 8];
                    acc.copy_from_slice(&b[..8]);
                    b[..8].copy_from_slice(&(u64::from_le_bytes(acc) + add).to_le_bytes());
                });
                log.lock().unwrap().push(name);
                Ok(())
            })
        };
        scheduler.enqueue_binary(accumulate, rows, total).unwrap();
        scheduler.finish().unwrap();

        let expected: u64 = (0..4 * SLOT).map(|i| (i % 7) as u64).sum();
        let bytes = scheduler.cache_mut().unwrap().read_object(total).unwrap();
        let mut acc = [0u8; 8];
        acc.copy_from_slice(&bytes[..8]);
        assert_eq!(u64::from_le_bytes(acc), expected);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|d| d == &seen[0]), "devices {:?}", seen);
    }
}
