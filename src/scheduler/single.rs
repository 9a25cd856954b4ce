//! Scheduler for exactly one device.

use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::cache::{BufferCache, ObjectId};
use crate::config::{DistributionPolicy, SchedulerConfig};
use crate::error::{Result, StreamError};
use crate::kernel::{BinaryKernel, UnaryKernel};
use crate::measurement::Recorder;

use super::engine::Engine;
use super::{DeviceScheduler, SchedulerState, SubmissionFuture};

/// Drives one device through `queues_per_device` in-order queues. Barriers are
/// markers on every queue, so the host never blocks on them.
pub struct SingleDeviceScheduler<B: Backend> {
    engine: Engine<B>,
}

impl<B: Backend> SingleDeviceScheduler<B> {
    pub fn new(backend: Arc<B>, config: SchedulerConfig) -> Result<Self> {
        debug!(
            backend = backend.name(),
            queues = config.queues_per_device,
            "Created single-device scheduler"
        );
        Ok(Self {
            engine: Engine::new(backend, config, DistributionPolicy::Pinned { device: 0 })?,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.engine.config()
    }

    /// Whether an earlier submission failure made the scheduler unusable.
    pub fn is_poisoned(&self) -> bool {
        self.engine.is_poisoned()
    }

    pub fn device(&self) -> Option<&B::Device> {
        self.engine.device(0)
    }

    /// Jobs enqueued but not yet run, barriers included.
    pub fn pending_jobs(&self) -> usize {
        self.engine.pending_jobs()
    }
}

impl<B: Backend> DeviceScheduler<B> for SingleDeviceScheduler<B> {
    fn state(&self) -> SchedulerState {
        self.engine.state()
    }

    fn add_buffer_cache(&mut self, cache: BufferCache<B>) -> Result<()> {
        self.engine.set_cache(cache)
    }

    fn add_device(&mut self, context: B::Context, device: B::Device) -> Result<()> {
        if self.engine.device_count() > 0 {
            return Err(StreamError::Configuration(
                "single-device scheduler already has a device".to_string(),
            ));
        }
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
        HostBackend, HostBuffer, HostContext, HostDevice, HostKernel, HostQueue,
    };
    use crate::backend::wait_all;
    use crate::cache::AccessMode;
    use crate::config::{CacheConfig, PairingPolicy};
    use crate::measurement::DataPointKind;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SLOT: usize = 64;

    fn setup(slots: usize) -> (SingleDeviceScheduler<HostBackend>, HostDevice) {
        setup_with(slots, SchedulerConfig::default())
    }

    fn setup_with(
        slots: usize,
        config: SchedulerConfig,
    ) -> (SingleDeviceScheduler<HostBackend>, HostDevice) {
        let backend = Arc::new(HostBackend::new());
        let device = HostDevice::new("sched", 1 << 16);
        let mut cache =
            BufferCache::new(Arc::clone(&backend), CacheConfig::with_buffer_size(SLOT)).unwrap();
        cache
            .add_device(HostContext, device.clone(), slots * SLOT)
            .unwrap();
        let mut scheduler = SingleDeviceScheduler::new(backend, config).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Created);
        scheduler.add_device(HostContext, device.clone()).unwrap();
        scheduler.add_buffer_cache(cache).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Configured);
        (scheduler, device)
    }

    fn increment(_offset: usize, bytes: &mut [u8]) -> Result<()> {
        bytes.iter_mut().for_each(|b| *b = b.wrapping_add(1));
        Ok(())
    }

    fn zero(_offset: usize, bytes: &mut [u8]) -> Result<()> {
        bytes.fill(0);
        Ok(())
    }

    #[test]
    fn test_unary_read_write_object() {
        let (mut scheduler, _device) = setup(2);
        let cache = scheduler.cache_mut().unwrap();
        let id = cache.add_object(vec![1; 10 * SLOT + 5], AccessMode::ReadWrite).unwrap();

        let future = scheduler
            .enqueue(HostKernel::new("increment", increment), id)
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(!future.is_ready());
        scheduler.run().unwrap();

        let events = future.wait().unwrap();
        // Upload, kernel and write-back per chunk.
        assert_eq!(events.len(), 11 * 3);
        wait_all(&events).unwrap();

        let data = scheduler.cache_mut().unwrap().read_object(id).unwrap();
        assert!(data.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_read_only_object_is_not_written_back() {
        let (mut scheduler, _device) = setup(2);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![9; 3 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let future = scheduler.enqueue(HostKernel::new("zero", zero), id).unwrap();
        scheduler.run().unwrap();
        let events = future.wait().unwrap();
        assert_eq!(events.len(), 3 * 2);
        scheduler.finish().unwrap();
        let data = scheduler.cache_mut().unwrap().read_object(id).unwrap();
        assert!(data.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_offsets_are_strictly_increasing() {
        let (mut scheduler, _device) = setup(2);
        let len = 7 * SLOT + 3;
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; len], AccessMode::ReadOnly)
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let kernel = move |queue: &HostQueue, offset: usize, size: usize, _buf: &HostBuffer| {
            let log = Arc::clone(&log);
            queue.enqueue_task(&[], move || {
                log.lock().unwrap().push((offset, size));
                Ok(())
            })
        };
        let future = scheduler.enqueue(kernel, id).unwrap();
        scheduler.run().unwrap();
        wait_all(&future.wait().unwrap()).unwrap();

        let seen = seen.lock().unwrap();
        let mut expected = 0;
        for &(offset, size) in seen.iter() {
            assert_eq!(offset, expected);
            expected += size;
        }
        assert_eq!(expected, len);
    }

    #[test]
    fn test_bounded_occupancy() {
        let (mut scheduler, _device) = setup(3);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 50 * SLOT], AccessMode::ReadWrite)
            .unwrap();
        let future = scheduler.enqueue(HostKernel::new("zero", zero), id).unwrap();
        scheduler.run().unwrap();
        wait_all(&future.wait().unwrap()).unwrap();
        let stats = scheduler.cache().unwrap().stats();
        assert!(stats.peak_occupied_bytes <= 3 * SLOT);
        assert_eq!(stats.misses, 50);
        assert_eq!(stats.evictions, 47);
    }

    #[test]
    fn test_enqueue_errors_are_synchronous() {
        let backend = Arc::new(HostBackend::new());
        let mut scheduler =
            SingleDeviceScheduler::new(Arc::clone(&backend), SchedulerConfig::default()).unwrap();
        let id = ObjectId::new(1).unwrap();
        assert!(matches!(
            scheduler.enqueue(HostKernel::new("zero", zero), id),
            Err(StreamError::Configuration(_))
        ));

        let (mut scheduler, device) = setup(1);
        assert!(matches!(
            scheduler.enqueue(HostKernel::new("zero", zero), id),
            Err(StreamError::UnknownObject(_))
        ));
        assert!(matches!(
            scheduler.add_device(HostContext, device),
            Err(StreamError::Configuration(_))
        ));
        let other = BufferCache::new(backend, CacheConfig::default()).unwrap();
        assert!(matches!(
            scheduler.add_buffer_cache(other),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_device_without_pool() {
        let backend = Arc::new(HostBackend::new());
        let cache = BufferCache::new(Arc::clone(&backend), CacheConfig::with_buffer_size(SLOT))
            .unwrap();
        let mut scheduler =
            SingleDeviceScheduler::new(backend, SchedulerConfig::default()).unwrap();
        scheduler.add_buffer_cache(cache).unwrap();
        scheduler
            .add_device(HostContext, HostDevice::new("no-pool", 1 << 12))
            .unwrap();
        // No pool means no object can be registered either.
        assert!(matches!(
            scheduler.cache_mut().unwrap().add_object(vec![0; 4], AccessMode::ReadOnly),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_barrier_orders_phases() {
        let (mut scheduler, _device) = setup(2);
        let cache = scheduler.cache_mut().unwrap();
        let a = cache.add_object(vec![0; 4 * SLOT], AccessMode::ReadOnly).unwrap();
        let b = cache.add_object(vec![0; 4 * SLOT], AccessMode::ReadOnly).unwrap();

        let total = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let sum = Arc::clone(&total);
        let phase1 = move |queue: &HostQueue, _o: usize, size: usize, _b: &HostBuffer| {
            let sum = Arc::clone(&sum);
            queue.enqueue_task(&[], move || {
                std::thread::sleep(std::time::Duration::from_millis(2));
                sum.fetch_add(size, Ordering::SeqCst);
                Ok(())
            })
        };
        let (sum, seen) = (Arc::clone(&total), Arc::clone(&observed));
        let phase2 = move |queue: &HostQueue, _o: usize, _s: usize, _b: &HostBuffer| {
            let (sum, seen) = (Arc::clone(&sum), Arc::clone(&seen));
            queue.enqueue_task(&[], move || {
                seen.lock().unwrap().push(sum.load(Ordering::SeqCst));
                Ok(())
            })
        };

        let f1 = scheduler.enqueue(phase1, a).unwrap();
        scheduler.enqueue_barrier().unwrap();
        scheduler.enqueue_barrier().unwrap();
        let f2 = scheduler.enqueue(phase2, b).unwrap();
        // Two jobs and one coalesced barrier.
        assert_eq!(scheduler.pending_jobs(), 3);
        scheduler.run().unwrap();
        wait_all(&f1.wait().unwrap()).unwrap();
        wait_all(&f2.wait().unwrap()).unwrap();

        let seen = observed.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|&v| v == 4 * SLOT), "observed {:?}", seen);
    }

    #[test]
    fn test_binary_job_rejected_on_single_slot_pool() {
        let (mut scheduler, _device) = setup(1);
        let cache = scheduler.cache_mut().unwrap();
        let a = cache.add_object(vec![1; SLOT], AccessMode::ReadWrite).unwrap();
        let b = cache.add_object(vec![2; SLOT], AccessMode::ReadOnly).unwrap();
        let noop = |queue: &HostQueue,
                    _offset: usize,
                    _size1: usize,
                    _size2: usize,
                    _a: &HostBuffer,
                    _b: &HostBuffer| queue.enqueue_task(&[], || Ok(()));
        assert!(matches!(
            scheduler.enqueue_binary(noop, a, b),
            Err(StreamError::Capacity(_))
        ));
        assert_eq!(scheduler.pending_jobs(), 0);

        // Unary jobs only ever hold one slot.
        scheduler.enqueue(HostKernel::new("increment", increment), a).unwrap();
        scheduler.finish().unwrap();
        let data = scheduler.cache_mut().unwrap().read_object(a).unwrap();
        assert!(data.iter().all(|&x| x == 2));
    }

    #[test]
    fn test_barrier_on_empty_set_is_noop() {
        let (mut scheduler, _device) = setup(1);
        scheduler.enqueue_barrier().unwrap();
        assert_eq!(scheduler.pending_jobs(), 0);
        scheduler.run().unwrap();
    }

    #[test]
    fn test_binary_stream_with_resident_operand() {
        let (mut scheduler, _device) = setup(3);
        let cache = scheduler.cache_mut().unwrap();
        let streamed = cache.add_object(vec![1; 6 * SLOT], AccessMode::ReadWrite).unwrap();
        let resident = cache.add_object(vec![5; 8], AccessMode::ReadOnly).unwrap();

        let kernel = |queue: &HostQueue,
                      _offset: usize,
                      size1: usize,
                      size2: usize,
                      a: &HostBuffer,
                      b: &HostBuffer| {
            let (a, b) = (a.clone(), b.clone());
            queue.enqueue_task(&[], move || {
                let add = b.with_bytes(|b| b[..size2].iter().map(|&x| x as u32).sum::<u32>());
                a.with_bytes_mut(|a| a[..size1].iter_mut().for_each(|x| *x += add as u8));
                Ok(())
            })
        };
        let future = scheduler.enqueue_binary(kernel, streamed, resident).unwrap();
        scheduler.run().unwrap();
        let events = future.wait().unwrap();
        // One resident upload, then upload, kernel and write-back per streamed chunk.
        assert_eq!(events.len(), 1 + 6 * 3);
        wait_all(&events).unwrap();
        assert_eq!(scheduler.cache().unwrap().stats().misses, 7);

        let data = scheduler.cache_mut().unwrap().read_object(streamed).unwrap();
        assert!(data.iter().all(|&b| b == 41));
    }

    #[test]
    fn test_binary_zip() {
        let config = SchedulerConfig {
            pairing: PairingPolicy::Zip,
            ..SchedulerConfig::default()
        };
        let (mut scheduler, _device) = setup_with(4, config);
        let cache = scheduler.cache_mut().unwrap();
        let out = cache.add_zeroed(3 * SLOT, AccessMode::WriteOnly).unwrap();
        let input = cache
            .add_object((0..3 * SLOT).map(|i| i as u8).collect(), AccessMode::ReadOnly)
            .unwrap();
        let small = cache.add_zeroed(SLOT, AccessMode::ReadOnly).unwrap();

        let copy = |queue: &HostQueue,
                    _offset: usize,
                    size1: usize,
                    _size2: usize,
                    dst: &HostBuffer,
                    src: &HostBuffer| {
            let (dst, src) = (dst.clone(), src.clone());
            queue.enqueue_task(&[], move || {
                let bytes = src.snapshot();
                dst.with_bytes_mut(|d| d[..size1].copy_from_slice(&bytes[..size1]));
                Ok(())
            })
        };
        assert!(matches!(
            scheduler.enqueue_binary(copy, out, small),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            scheduler.enqueue_binary(copy, out, out),
            Err(StreamError::Configuration(_))
        ));
        let future = scheduler.enqueue_binary(copy, out, input).unwrap();
        scheduler.finish().unwrap();
        let events = future.wait().unwrap();
        assert_eq!(events.len(), 3 * 4);
        let data = scheduler.cache_mut().unwrap().read_object(out).unwrap().to_vec();
        assert_eq!(data, (0..3 * SLOT).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_resident_chunk_is_reused_across_jobs() {
        let (mut scheduler, _device) = setup(2);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; SLOT], AccessMode::ReadWrite)
            .unwrap();
        for _ in 0..5 {
            scheduler
                .enqueue(HostKernel::new("increment", increment), id)
                .unwrap();
        }
        scheduler.run().unwrap();
        let data = scheduler.cache_mut().unwrap().read_object(id).unwrap();
        assert!(data.iter().all(|&b| b == 5));
        let stats = scheduler.cache().unwrap().stats();
        assert_eq!((stats.misses, stats.hits), (1, 4));
    }

    #[test]
    fn test_recorder_collects_events() {
        let (mut scheduler, _device) = setup(2);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 4 * SLOT], AccessMode::ReadWrite)
            .unwrap();
        let recorder = Recorder::new();
        let future = scheduler
            .enqueue_with(HostKernel::new("zero", zero), id, &recorder)
            .unwrap();
        scheduler.run().unwrap();
        future.wait().unwrap();
        assert_eq!(recorder.count(DataPointKind::HostToDevice), 4);
        assert_eq!(recorder.count(DataPointKind::Kernel), 4);
        assert_eq!(recorder.count(DataPointKind::DeviceToHost), 4);
        let rows = recorder.report().unwrap();
        assert!(rows.iter().all(|r| r.name == "zero" && r.duration_us.is_some()));
    }

    #[test]
    fn test_submission_rejection_poisons_scheduler() {
        let (mut scheduler, _device) = setup(2);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; 2 * SLOT], AccessMode::ReadOnly)
            .unwrap();
        let f1 = scheduler.enqueue(HostKernel::new("zero", zero), id).unwrap();
        let f2 = scheduler.enqueue(HostKernel::new("zero", zero), id).unwrap();
        for queue in scheduler.queues(0).unwrap() {
            queue.set_reject_submissions(true);
        }
        assert!(matches!(scheduler.run(), Err(StreamError::Submission(_))));
        assert!(matches!(f1.wait(), Err(StreamError::Submission(_))));
        assert!(matches!(f2.wait(), Err(StreamError::Configuration(_))));
        assert!(scheduler.is_poisoned());
        assert!(matches!(
            scheduler.enqueue(HostKernel::new("zero", zero), id),
            Err(StreamError::Submission(_))
        ));
        for queue in scheduler.queues(0).unwrap() {
            queue.set_reject_submissions(false);
        }
    }

    #[test]
    fn test_device_fault_surfaces_through_events() {
        let (mut scheduler, _device) = setup(2);
        let id = scheduler
            .cache_mut()
            .unwrap()
            .add_object(vec![0; SLOT], AccessMode::ReadOnly)
            .unwrap();
        let failing = |queue: &HostQueue, _o: usize, _s: usize, _b: &HostBuffer| {
            queue.enqueue_task(&[], || Err(StreamError::Device("kernel trapped".into())))
        };
        let future = scheduler.enqueue(failing, id).unwrap();
        scheduler.run().unwrap();
        let events = future.wait().unwrap();
        assert!(matches!(wait_all(&events), Err(StreamError::Device(_))));
    }

    #[test]
    fn test_drop_waits_for_outstanding_work() {
        let done = Arc::new(AtomicU32::new(0));
        {
            let (mut scheduler, _device) = setup(2);
            let id = scheduler
                .cache_mut()
                .unwrap()
                .add_object(vec![0; 8 * SLOT], AccessMode::ReadWrite)
                .unwrap();
            let counter = Arc::clone(&done);
            let slow = move |queue: &HostQueue, _o: usize, _s: usize, _b: &HostBuffer| {
                let counter = Arc::clone(&counter);
                queue.enqueue_task(&[], move || {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            };
            // Future intentionally never fetched.
            let _unfetched = scheduler.enqueue(slow, id).unwrap();
            scheduler.run().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }
}
