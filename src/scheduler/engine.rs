//! Submission engine shared by the scheduler variants.
//!
//! Enqueue calls only record jobs. [`Engine::run`] walks the recorded jobs in FIFO
//! order and, per chunk: picks a device and one of its queues, acquires a slot from
//! the cache (uploading on a miss), orders the kernel after whatever it depends on,
//! launches it and enqueues the write-back. Chunks of one job alternate between the
//! device's queues so the upload of chunk `i + 1` overlaps the kernel of chunk `i`.
//!
//! Kernels touching one object run in submission order, across jobs too. The
//! previous kernel on another queue of the same device is awaited through a
//! marker; on another device the host waits for it before launching.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backend::{wait_all, Backend, DeviceEvent};
use crate::cache::{Acquired, BufferCache, Chunk, ObjectId};
use crate::config::{DistributionPolicy, SchedulerConfig};
use crate::error::{Result, StreamError};
use crate::kernel::{BinaryKernel, UnaryKernel};
use crate::measurement::{DataPointKind, Recorder};

use super::future::{promise, Promise, SubmissionFuture};
use super::{resolve_pairing, PairPlan, SchedulerState};

pub(crate) enum Job<B: Backend> {
    Unary {
        kernel: Arc<dyn UnaryKernel<B>>,
        object: ObjectId,
        recorder: Option<Recorder<B::Event>>,
        promise: Promise<B::Event>,
    },
    Binary {
        kernel: Arc<dyn BinaryKernel<B>>,
        first: ObjectId,
        second: ObjectId,
        plan: PairPlan,
        recorder: Option<Recorder<B::Event>>,
        promise: Promise<B::Event>,
    },
    Barrier,
}

/// Queues of one registered device.
struct Lane<B: Backend> {
    device: B::Device,
    queues: Vec<B::Queue>,
    next_queue: usize,
    /// Index of the device's slot pool in the cache.
    pool: Option<usize>,
}

/// Slots a binary job holds at once on a device.
pub(crate) const BINARY_SLOTS: usize = 2;

/// Last kernel submitted for an object, with the lane and queue it went to.
#[derive(Clone)]
struct Link<E> {
    lane: usize,
    queue: usize,
    event: E,
}

pub(crate) struct Engine<B: Backend> {
    backend: Arc<B>,
    config: SchedulerConfig,
    distribution: DistributionPolicy,
    cache: Option<BufferCache<B>>,
    lanes: Vec<Lane<B>>,
    pending: Vec<Job<B>>,
    /// Events submitted since the last barrier.
    epoch: Vec<B::Event>,
    /// Every submitted event not yet known to be complete.
    outstanding: Vec<B::Event>,
    /// Smooth weighted round-robin state for capacity-weighted distribution.
    credit: Vec<i64>,
    tails: HashMap<ObjectId, Link<B::Event>>,
    started: bool,
    poisoned: bool,
}

impl<B: Backend> Engine<B> {
    pub fn new(
        backend: Arc<B>,
        config: SchedulerConfig,
        distribution: DistributionPolicy,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            distribution,
            cache: None,
            lanes: Vec::new(),
            pending: Vec::new(),
            epoch: Vec::new(),
            outstanding: Vec::new(),
            credit: Vec::new(),
            tails: HashMap::new(),
            started: false,
            poisoned: false,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn distribution(&self) -> DistributionPolicy {
        self.distribution
    }

    pub fn state(&self) -> SchedulerState {
        if self.started {
            SchedulerState::Running
        } else if self.cache.is_some() && !self.lanes.is_empty() {
            SchedulerState::Configured
        } else {
            SchedulerState::Created
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn set_cache(&mut self, cache: BufferCache<B>) -> Result<()> {
        if self.cache.is_some() {
            return Err(StreamError::Configuration(
                "scheduler already has a buffer cache".to_string(),
            ));
        }
        self.cache = Some(cache);
        for lane in &mut self.lanes {
            lane.pool = None;
        }
        Ok(())
    }

    pub fn cache(&self) -> Option<&BufferCache<B>> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut BufferCache<B>> {
        self.cache.as_mut()
    }

    fn cache_ref(&self) -> Result<&BufferCache<B>> {
        self.cache
            .as_ref()
            .ok_or_else(|| StreamError::Configuration("no buffer cache attached".to_string()))
    }

    fn cache_mut_ref(&mut self) -> Result<&mut BufferCache<B>> {
        self.cache
            .as_mut()
            .ok_or_else(|| StreamError::Configuration("no buffer cache attached".to_string()))
    }

    pub fn device_count(&self) -> usize {
        self.lanes.len()
    }

    /// Register `device` and create its queues.
    pub fn add_lane(&mut self, context: &B::Context, device: B::Device) -> Result<()> {
        if self.lanes.iter().any(|l| l.device == device) {
            return Err(StreamError::Configuration(format!(
                "device {:?} is already registered",
                device
            )));
        }
        let queues = (0..self.config.queues_per_device)
            .map(|_| self.backend.create_queue(context, &device))
            .collect::<Result<Vec<_>>>()?;
        info!(
            backend = self.backend.name(),
            device = ?device,
            queues = queues.len(),
            "Registered scheduler device"
        );
        self.lanes.push(Lane {
            device,
            queues,
            next_queue: 0,
            pool: None,
        });
        Ok(())
    }

    pub fn queues(&self, lane: usize) -> Option<&[B::Queue]> {
        self.lanes.get(lane).map(|l| l.queues.as_slice())
    }

    pub fn device(&self, lane: usize) -> Option<&B::Device> {
        self.lanes.get(lane).map(|l| &l.device)
    }

    fn ready(&self) -> Result<&BufferCache<B>> {
        if self.poisoned {
            return Err(StreamError::Submission(
                "scheduler is unusable after a failed submission".to_string(),
            ));
        }
        if self.lanes.is_empty() {
            return Err(StreamError::Configuration(
                "no device registered with the scheduler".to_string(),
            ));
        }
        self.cache_ref()
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    pub fn push_unary(
        &mut self,
        kernel: Arc<dyn UnaryKernel<B>>,
        object: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>> {
        self.ready()?.object_info(object)?;
        let (promise, future) = promise();
        trace!(object = %object, kernel = kernel.name(), "Enqueued unary job");
        self.pending.push(Job::Unary {
            kernel,
            object,
            recorder,
            promise,
        });
        self.started = true;
        Ok(future)
    }

    pub fn push_binary(
        &mut self,
        kernel: Arc<dyn BinaryKernel<B>>,
        first: ObjectId,
        second: ObjectId,
        recorder: Option<Recorder<B::Event>>,
    ) -> Result<SubmissionFuture<B::Event>> {
        let cache = self.ready()?;
        let a = cache.object_info(first)?;
        let b = cache.object_info(second)?;
        if first == second {
            return Err(StreamError::Configuration(format!(
                "object {} cannot be both operands of a binary kernel",
                first
            )));
        }
        let plan = resolve_pairing(self.config.pairing, a.chunk_count, b.chunk_count)?;
        self.check_binary_slots()?;
        let (promise, future) = promise();
        trace!(
            first = %first,
            second = %second,
            ?plan,
            kernel = kernel.name(),
            "Enqueued binary job"
        );
        self.pending.push(Job::Binary {
            kernel,
            first,
            second,
            plan,
            recorder,
            promise,
        });
        self.started = true;
        Ok(future)
    }

    /// Every pool a binary job may land on must hold both operands at once.
    fn check_binary_slots(&self) -> Result<()> {
        let cache = self.cache_ref()?;
        let lanes: Vec<usize> = match self.distribution {
            DistributionPolicy::Pinned { device } if self.lanes.len() > 1 => {
                // An out-of-range device is reported by `run`.
                if device < self.lanes.len() {
                    vec![device]
                } else {
                    Vec::new()
                }
            }
            _ => (0..self.lanes.len()).collect(),
        };
        for lane in lanes {
            let device = &self.lanes[lane].device;
            let Some(pool) = cache.device_index(device) else {
                continue;
            };
            let slots = cache.slot_count_at(pool);
            if slots < BINARY_SLOTS {
                return Err(StreamError::Capacity(format!(
                    "binary kernels need {} slots but device {:?} has {}",
                    BINARY_SLOTS, device, slots
                )));
            }
        }
        Ok(())
    }

    /// Record a barrier. Consecutive barriers collapse into one; a barrier with
    /// nothing before it is dropped.
    pub fn push_barrier(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(StreamError::Submission(
                "scheduler is unusable after a failed submission".to_string(),
            ));
        }
        let nothing_before = self.pending.is_empty() && self.epoch.is_empty();
        if nothing_before || matches!(self.pending.last(), Some(Job::Barrier)) {
            return Ok(());
        }
        self.pending.push(Job::Barrier);
        Ok(())
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Submit every recorded job. Does not wait for device execution.
    pub fn run(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ready()?;
        self.bind_pools()?;
        self.started = true;
        self.outstanding.retain(|e| !e.is_complete());
        self.tails.retain(|_, link| !link.event.is_complete());

        let jobs = std::mem::take(&mut self.pending);
        debug!(jobs = jobs.len(), "Submitting jobs");
        for job in jobs {
            match job {
                Job::Barrier => {
                    if let Err(e) = self.barrier() {
                        return Err(self.fail(e));
                    }
                }
                Job::Unary {
                    kernel,
                    object,
                    recorder,
                    promise,
                } => {
                    let outcome = self.run_unary(kernel.as_ref(), object, recorder.as_ref());
                    self.settle(outcome, promise)?;
                }
                Job::Binary {
                    kernel,
                    first,
                    second,
                    plan,
                    recorder,
                    promise,
                } => {
                    let outcome = match plan {
                        PairPlan::Zip => {
                            self.run_zip(kernel.as_ref(), first, second, recorder.as_ref())
                        }
                        PairPlan::StreamFirst => self.run_streamed(
                            kernel.as_ref(),
                            first,
                            second,
                            false,
                            recorder.as_ref(),
                        ),
                        PairPlan::StreamSecond => self.run_streamed(
                            kernel.as_ref(),
                            first,
                            second,
                            true,
                            recorder.as_ref(),
                        ),
                    };
                    self.settle(outcome, promise)?;
                }
            }
        }
        Ok(())
    }

    /// Hand a job's outcome to its future. On failure the remaining jobs are
    /// discarded and their futures break.
    fn settle(
        &mut self,
        outcome: Result<Vec<B::Event>>,
        promise: Promise<B::Event>,
    ) -> Result<()> {
        match outcome {
            Ok(events) => {
                promise.fulfil(Ok(events));
                Ok(())
            }
            Err(e) => {
                promise.fulfil(Err(e.duplicate()));
                Err(self.fail(e))
            }
        }
    }

    fn fail(&mut self, e: StreamError) -> StreamError {
        if !e.is_recoverable() {
            self.poisoned = true;
        }
        warn!(error = %e, poisoned = self.poisoned, "Submission failed");
        e
    }

    fn bind_pools(&mut self) -> Result<()> {
        let cache = self.cache_ref()?;
        let pools = self
            .lanes
            .iter()
            .map(|lane| {
                cache.device_index(&lane.device).ok_or_else(|| {
                    StreamError::Configuration(format!(
                        "device {:?} has no pool in the buffer cache",
                        lane.device
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        for (lane, pool) in self.lanes.iter_mut().zip(pools) {
            lane.pool = Some(pool);
        }
        Ok(())
    }

    /// Wait for everything submitted and flush the cache.
    pub fn finish(&mut self) -> Result<()> {
        self.run()?;
        let outstanding = std::mem::take(&mut self.outstanding);
        wait_all(&outstanding)?;
        for lane in &self.lanes {
            for queue in &lane.queues {
                self.backend.finish(queue)?;
            }
        }
        self.epoch.clear();
        self.tails.clear();
        if let Some(cache) = self.cache.as_mut() {
            cache.flush()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    fn place(&mut self, chunk: usize) -> Result<usize> {
        let n = self.lanes.len();
        if n == 1 {
            return Ok(0);
        }
        match self.distribution {
            DistributionPolicy::RoundRobin => Ok(chunk % n),
            DistributionPolicy::Pinned { device } if device < n => Ok(device),
            DistributionPolicy::Pinned { device } => Err(StreamError::Configuration(format!(
                "pinned device {} but only {} registered",
                device, n
            ))),
            DistributionPolicy::CapacityWeighted => {
                let cache = self.cache_ref()?;
                let weights: Vec<i64> = self
                    .lanes
                    .iter()
                    .map(|l| l.pool.map_or(0, |p| cache.slot_count_at(p)) as i64)
                    .collect();
                self.credit.resize(n, 0);
                Ok(smooth_weighted_pick(&mut self.credit, &weights))
            }
        }
    }

    fn next_queue(&mut self, lane: usize) -> (usize, B::Queue) {
        let lane = &mut self.lanes[lane];
        let index = lane.next_queue;
        lane.next_queue = (index + 1) % lane.queues.len();
        (index, lane.queues[index].clone())
    }

    /// Predecessor links of a job touching `objects`.
    fn tails_of(&self, objects: &[ObjectId]) -> Vec<Link<B::Event>> {
        objects
            .iter()
            .filter_map(|id| self.tails.get(id).cloned())
            .collect()
    }

    fn link(&mut self, objects: &[ObjectId], link: &Link<B::Event>) {
        for &id in objects {
            self.tails.insert(id, link.clone());
        }
    }

    /// Order the next kernel on `(lane, queue)` after `after`. Kernels on another
    /// device are waited for here; kernels on another queue of the same device
    /// are returned for the marker.
    fn follow(
        &self,
        after: &[Link<B::Event>],
        lane: usize,
        queue: usize,
    ) -> Result<Vec<B::Event>> {
        let mut same_device = Vec::new();
        let mut other_device = Vec::new();
        for link in after.iter().filter(|l| !l.event.is_complete()) {
            if link.lane != lane {
                other_device.push(link.event.clone());
            } else if link.queue != queue {
                same_device.push(link.event.clone());
            }
        }
        if !other_device.is_empty() {
            trace!(events = other_device.len(), lane, "Host wait on previous chunk");
            wait_all(&other_device)?;
        }
        Ok(same_device)
    }

    fn pool(&self, lane: usize) -> Result<usize> {
        self.lanes[lane].pool.ok_or_else(|| {
            StreamError::Configuration(format!(
                "device {:?} is not bound to a pool",
                self.lanes[lane].device
            ))
        })
    }

    fn track(&mut self, event: &B::Event) {
        self.epoch.push(event.clone());
        self.outstanding.push(event.clone());
    }

    // -----------------------------------------------------------------------
    // Barriers
    // -----------------------------------------------------------------------

    /// With one device every queue gets a marker on the epoch's events; with
    /// several devices the host waits, since queues of different devices cannot
    /// wait on each other's events.
    fn barrier(&mut self) -> Result<()> {
        self.epoch.retain(|e| !e.is_complete());
        if self.epoch.is_empty() {
            return Ok(());
        }
        let epoch = std::mem::take(&mut self.epoch);
        if self.lanes.len() == 1 {
            let queues = self.lanes[0].queues.clone();
            for queue in &queues {
                let marker = self.backend.enqueue_marker(queue, &epoch)?;
                self.outstanding.push(marker);
            }
            debug!(events = epoch.len(), queues = queues.len(), "Barrier markers enqueued");
        } else {
            debug!(events = epoch.len(), "Barrier host wait");
            wait_all(&epoch)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unary jobs
    // -----------------------------------------------------------------------

    fn run_unary(
        &mut self,
        kernel: &dyn UnaryKernel<B>,
        object: ObjectId,
        recorder: Option<&Recorder<B::Event>>,
    ) -> Result<Vec<B::Event>> {
        let chunks = self.cache_ref()?.chunks(object)?.to_vec();
        let mut events = Vec::with_capacity(chunks.len() * 2);
        let mut after = self.tails_of(&[object]);
        for chunk in &chunks {
            let lane = self.place(chunk.index)?;
            let pool = self.pool(lane)?;
            let (q, queue) = self.next_queue(lane);
            let acquired = self
                .cache_mut_ref()?
                .acquire(pool, &queue, object, chunk.index)?;
            let step = match self.follow(&after, lane, q) {
                Ok(previous) => self.unary_chunk(
                    kernel,
                    &queue,
                    pool,
                    chunk,
                    &acquired,
                    previous,
                    recorder,
                    &mut events,
                ),
                Err(e) => Err(e),
            };
            self.cache_mut_ref()?.release(pool, acquired.slot);
            let link = Link {
                lane,
                queue: q,
                event: step?,
            };
            self.link(&[object], &link);
            after = vec![link];
        }
        trace!(
            object = %object,
            chunks = chunks.len(),
            events = events.len(),
            "Unary job submitted"
        );
        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn unary_chunk(
        &mut self,
        kernel: &dyn UnaryKernel<B>,
        queue: &B::Queue,
        pool: usize,
        chunk: &Chunk,
        acquired: &Acquired<B>,
        previous: Vec<B::Event>,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<B::Event> {
        let mut wait = acquired.wait.clone();
        wait.extend(previous);
        if let Some(transfer) = &acquired.transfer {
            self.note_transfer(transfer, kernel.name(), acquired.len, recorder, events);
        }
        self.order_after(queue, pool, &[acquired.slot], &wait)?;

        let event = kernel.launch(queue, chunk.offset, chunk.len, &acquired.buffer)?;
        self.note_kernel(&event, pool, &[acquired.slot], kernel.name(), recorder, events);
        self.write_back(
            queue,
            pool,
            acquired.slot,
            &event,
            kernel.name(),
            acquired.len,
            recorder,
            events,
        )?;
        Ok(event)
    }

    // -----------------------------------------------------------------------
    // Binary jobs
    // -----------------------------------------------------------------------

    /// Pair chunk `i` of `first` with chunk `i` of `second`.
    fn run_zip(
        &mut self,
        kernel: &dyn BinaryKernel<B>,
        first: ObjectId,
        second: ObjectId,
        recorder: Option<&Recorder<B::Event>>,
    ) -> Result<Vec<B::Event>> {
        let cache = self.cache_ref()?;
        let chunks: Vec<(Chunk, Chunk)> = cache
            .chunks(first)?
            .iter()
            .copied()
            .zip(cache.chunks(second)?.iter().copied())
            .collect();
        let mut events = Vec::with_capacity(chunks.len() * 3);
        let mut after = self.tails_of(&[first, second]);
        for (a_chunk, b_chunk) in &chunks {
            let lane = self.place(a_chunk.index)?;
            let pool = self.pool(lane)?;
            let (q, queue) = self.next_queue(lane);
            let cache = self.cache_mut_ref()?;
            let a = cache.acquire(pool, &queue, first, a_chunk.index)?;
            let b = match cache.acquire(pool, &queue, second, b_chunk.index) {
                Ok(b) => b,
                Err(e) => {
                    cache.release(pool, a.slot);
                    return Err(e);
                }
            };
            let step = match self.follow(&after, lane, q) {
                Ok(previous) => self.binary_chunk(
                    kernel,
                    &queue,
                    pool,
                    a_chunk.offset,
                    &a,
                    &b,
                    previous,
                    recorder,
                    &mut events,
                ),
                Err(e) => Err(e),
            };
            let cache = self.cache_mut_ref()?;
            cache.release(pool, a.slot);
            cache.release(pool, b.slot);
            let link = Link {
                lane,
                queue: q,
                event: step?,
            };
            self.link(&[first, second], &link);
            after = vec![link];
        }
        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn binary_chunk(
        &mut self,
        kernel: &dyn BinaryKernel<B>,
        queue: &B::Queue,
        pool: usize,
        offset: usize,
        a: &Acquired<B>,
        b: &Acquired<B>,
        previous: Vec<B::Event>,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<B::Event> {
        let mut wait = a.wait.clone();
        wait.extend(b.wait.iter().cloned());
        wait.extend(previous);
        for side in [a, b] {
            if let Some(transfer) = &side.transfer {
                self.note_transfer(transfer, kernel.name(), side.len, recorder, events);
            }
        }
        self.order_after(queue, pool, &[a.slot, b.slot], &wait)?;

        let event = kernel.launch(queue, offset, a.len, b.len, &a.buffer, &b.buffer)?;
        self.note_kernel(&event, pool, &[a.slot, b.slot], kernel.name(), recorder, events);
        for side in [a, b] {
            self.write_back(
                queue,
                pool,
                side.slot,
                &event,
                kernel.name(),
                side.len,
                recorder,
                events,
            )?;
        }
        Ok(event)
    }

    /// Stream one operand chunk by chunk while the other (a single chunk) stays
    /// resident and pinned on every device it is used on. The resident operand's
    /// write-back is enqueued once, after its last kernel on each device. A
    /// resident operand that writes back lives on one device only, so every
    /// chunk of such a job goes to that device.
    fn run_streamed(
        &mut self,
        kernel: &dyn BinaryKernel<B>,
        first: ObjectId,
        second: ObjectId,
        stream_second: bool,
        recorder: Option<&Recorder<B::Event>>,
    ) -> Result<Vec<B::Event>> {
        let (streamed, resident) = if stream_second {
            (second, first)
        } else {
            (first, second)
        };
        let cache = self.cache_ref()?;
        let chunks = cache.chunks(streamed)?.to_vec();
        if cache.chunks(resident)?.is_empty() {
            return Ok(Vec::new());
        }

        let n = self.lanes.len();
        let mut held: Vec<Option<Acquired<B>>> = (0..n).map(|_| None).collect();
        let mut users: Vec<Vec<B::Event>> = vec![Vec::new(); n];
        let mut events = Vec::with_capacity(chunks.len() * 2 + 2);

        let outcome = self.stream_chunks(
            kernel,
            &chunks,
            streamed,
            resident,
            stream_second,
            &mut held,
            &mut users,
            recorder,
            &mut events,
        );

        let mut closing = Ok(());
        for (lane, slot) in held.into_iter().enumerate() {
            let Some(r) = slot else { continue };
            let pool = self.pool(lane)?;
            if outcome.is_ok() && closing.is_ok() && !users[lane].is_empty() {
                let queue = self.lanes[lane].queues[0].clone();
                let last = users[lane].clone();
                closing = self.resident_write_back(
                    &queue,
                    pool,
                    &r,
                    &last,
                    kernel.name(),
                    recorder,
                    &mut events,
                );
            }
            self.cache_mut_ref()?.release(pool, r.slot);
        }
        outcome?;
        closing?;
        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_chunks(
        &mut self,
        kernel: &dyn BinaryKernel<B>,
        chunks: &[Chunk],
        streamed: ObjectId,
        resident: ObjectId,
        stream_second: bool,
        held: &mut [Option<Acquired<B>>],
        users: &mut [Vec<B::Event>],
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<()> {
        let home = if self.cache_ref()?.object_info(resident)?.mode.writes_back() {
            Some(self.resident_lane(resident)?)
        } else {
            None
        };
        let mut after = self.tails_of(&[streamed, resident]);
        for chunk in chunks {
            let lane = match home {
                Some(lane) => lane,
                None => self.place(chunk.index)?,
            };
            let pool = self.pool(lane)?;
            let (q, queue) = self.next_queue(lane);

            if held[lane].is_none() {
                let r = self.cache_mut_ref()?.acquire(pool, &queue, resident, 0)?;
                if let Some(transfer) = &r.transfer {
                    self.note_transfer(transfer, kernel.name(), r.len, recorder, events);
                }
                held[lane] = Some(r);
            }
            let Some(r) = held[lane].as_ref() else {
                continue;
            };

            let s = self.cache_mut_ref()?.acquire(pool, &queue, streamed, chunk.index)?;
            let step = match self.follow(&after, lane, q) {
                Ok(previous) => self.streamed_chunk(
                    kernel,
                    &queue,
                    pool,
                    chunk,
                    &s,
                    r,
                    stream_second,
                    previous,
                    recorder,
                    events,
                ),
                Err(e) => Err(e),
            };
            self.cache_mut_ref()?.release(pool, s.slot);
            let link = Link {
                lane,
                queue: q,
                event: step?,
            };
            users[lane].push(link.event.clone());
            self.link(&[streamed, resident], &link);
            after = vec![link];
        }
        Ok(())
    }

    /// The lane already holding the resident chunk, else the one chunk 0 is
    /// placed on.
    fn resident_lane(&mut self, resident: ObjectId) -> Result<usize> {
        let cache = self.cache_ref()?;
        let holder = self.lanes.iter().position(|lane| {
            lane.pool
                .is_some_and(|pool| cache.is_resident(pool, resident, 0))
        });
        match holder {
            Some(lane) => Ok(lane),
            None => self.place(0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn streamed_chunk(
        &mut self,
        kernel: &dyn BinaryKernel<B>,
        queue: &B::Queue,
        pool: usize,
        chunk: &Chunk,
        s: &Acquired<B>,
        r: &Acquired<B>,
        stream_second: bool,
        previous: Vec<B::Event>,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<B::Event> {
        let mut wait = s.wait.clone();
        // The resident upload may sit on the other queue.
        wait.extend(
            r.wait
                .iter()
                .chain(r.transfer.iter())
                .filter(|e| !e.is_complete())
                .cloned(),
        );
        wait.extend(previous);
        if let Some(transfer) = &s.transfer {
            self.note_transfer(transfer, kernel.name(), s.len, recorder, events);
        }
        self.order_after(queue, pool, &[s.slot, r.slot], &wait)?;

        let (one, two) = if stream_second { (r, s) } else { (s, r) };
        let event = kernel.launch(
            queue,
            chunk.offset,
            one.len,
            two.len,
            &one.buffer,
            &two.buffer,
        )?;
        self.note_kernel(&event, pool, &[s.slot, r.slot], kernel.name(), recorder, events);
        self.write_back(queue, pool, s.slot, &event, kernel.name(), s.len, recorder, events)?;
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn resident_write_back(
        &mut self,
        queue: &B::Queue,
        pool: usize,
        r: &Acquired<B>,
        after: &[B::Event],
        name: &str,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<()> {
        if let Some(event) = self.cache_mut_ref()?.write_back(pool, r.slot, queue, after)? {
            self.track(&event);
            if let Some(rec) = recorder {
                rec.record_transfer(name, DataPointKind::DeviceToHost, event.clone(), r.len);
            }
            events.push(event);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event bookkeeping
    // -----------------------------------------------------------------------

    /// Enqueue a marker on `queue` when the next command has cross-queue dependencies.
    fn order_after(
        &mut self,
        queue: &B::Queue,
        pool: usize,
        slots: &[usize],
        wait: &[B::Event],
    ) -> Result<()> {
        if wait.is_empty() {
            return Ok(());
        }
        let marker = self.backend.enqueue_marker(queue, wait)?;
        self.track(&marker);
        let cache = self.cache_mut_ref()?;
        for &slot in slots {
            cache.record(pool, slot, marker.clone());
        }
        Ok(())
    }

    fn note_transfer(
        &mut self,
        event: &B::Event,
        name: &str,
        bytes: usize,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) {
        self.track(event);
        if let Some(rec) = recorder {
            rec.record_transfer(name, DataPointKind::HostToDevice, event.clone(), bytes);
        }
        events.push(event.clone());
    }

    fn note_kernel(
        &mut self,
        event: &B::Event,
        pool: usize,
        slots: &[usize],
        name: &str,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) {
        self.track(event);
        if let Some(cache) = self.cache.as_mut() {
            for &slot in slots {
                cache.record(pool, slot, event.clone());
            }
        }
        if let Some(rec) = recorder {
            rec.record(name, DataPointKind::Kernel, event.clone());
        }
        events.push(event.clone());
    }

    #[allow(clippy::too_many_arguments)]
    fn write_back(
        &mut self,
        queue: &B::Queue,
        pool: usize,
        slot: usize,
        kernel: &B::Event,
        name: &str,
        bytes: usize,
        recorder: Option<&Recorder<B::Event>>,
        events: &mut Vec<B::Event>,
    ) -> Result<()> {
        let after = std::slice::from_ref(kernel);
        if let Some(event) = self.cache_mut_ref()?.write_back(pool, slot, queue, after)? {
            self.track(&event);
            if let Some(rec) = recorder {
                rec.record_transfer(name, DataPointKind::DeviceToHost, event.clone(), bytes);
            }
            events.push(event);
        }
        Ok(())
    }
}

/// Smooth weighted round-robin: every device gains its weight in credit, the
/// richest device is picked and pays the total.
pub(crate) fn smooth_weighted_pick(credit: &mut [i64], weights: &[i64]) -> usize {
    let total: i64 = weights.iter().sum();
    for (c, w) in credit.iter_mut().zip(weights) {
        *c += w;
    }
    // Ties go to the lowest index.
    let best = credit
        .iter()
        .enumerate()
        .max_by_key(|&(i, &c)| (c, std::cmp::Reverse(i)))
        .map_or(0, |(i, _)| i);
    credit[best] -= total;
    best
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(jobs = self.pending.len(), "Discarding unsubmitted jobs");
        }
        if let Err(e) = wait_all(&self.outstanding) {
            warn!(error = %e, "device fault while draining scheduler");
        }
        for lane in &self.lanes {
            for queue in &lane.queues {
                if let Err(e) = self.backend.finish(queue) {
                    warn!(device = ?lane.device, error = %e, "could not drain queue");
                }
            }
        }
    }
}
