//! Host backend: a simulated accelerator running on CPU worker threads.
//!
//! Every [`HostQueue`] owns one worker thread that executes commands in submission
//! order, honouring each command's wait list. Device memory is plain host memory,
//! accounted against the [`HostDevice`] budget so pool sizing behaves like a real
//! device. No unsafe code.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Result, StreamError};
use crate::kernel::UnaryKernel;

use super::{Backend, DeviceEvent, Readback};

/// Default memory of a host device (1 GiB).
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Lock a mutex, recovering the data if a worker panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Devices and context
// ---------------------------------------------------------------------------

/// Host backend marker type.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        debug!("Initialized HostBackend");
        Self
    }
}

/// Host context. Carries no state; present so the host backend has the same
/// {context, device, queue} shape as real accelerators.
#[derive(Debug, Default, Clone)]
pub struct HostContext;

struct DeviceInner {
    id: u64,
    name: String,
    memory: usize,
    allocated: AtomicUsize,
}

/// A simulated accelerator with a fixed memory budget.
#[derive(Clone)]
pub struct HostDevice {
    inner: Arc<DeviceInner>,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, memory: usize) -> Self {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        debug!(id, %name, memory, "Created host device");
        Self {
            inner: Arc::new(DeviceInner {
                id,
                name,
                memory,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn memory(&self) -> usize {
        self.inner.memory
    }

    /// Bytes currently allocated on this device.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let inner = &self.inner;
        inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= inner.memory)
            })
            .map(|_| ())
            .map_err(|used| {
                StreamError::ResourceExhaustion(format!(
                    "device '{}' cannot allocate {} bytes ({} of {} in use)",
                    inner.name, bytes, used, inner.memory
                ))
            })
    }
}

impl PartialEq for HostDevice {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for HostDevice {}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("memory", &self.inner.memory)
            .finish()
    }
}

/// Enumerate `count` identical host devices named `host:<index>`.
pub fn host_devices(count: usize, memory: usize) -> Vec<HostDevice> {
    (0..count)
        .map(|i| HostDevice::new(format!("host:{}", i), memory))
        .collect()
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

struct Memory {
    bytes: Mutex<Vec<u8>>,
    device: HostDevice,
}

impl Drop for Memory {
    fn drop(&mut self) {
        let len = lock(&self.bytes).len();
        self.device
            .inner
            .allocated
            .fetch_sub(len, Ordering::AcqRel);
    }
}

/// Device buffer of the host backend. Clones share the same memory.
#[derive(Clone)]
pub struct HostBuffer {
    memory: Arc<Memory>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        lock(&self.memory.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the buffer contents. Only call from inside a queued task
    /// (or after the relevant events completed) to observe device-ordered data.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.memory.bytes))
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.memory.bytes))
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.with_bytes(|b| b.to_vec())
    }

    pub fn same_memory(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostBuffer({} bytes)", self.len())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Queued,
    Running,
    Complete,
    Failed(String),
}

#[derive(Debug)]
struct EventState {
    status: Status,
    started: Option<Instant>,
    ended: Option<Instant>,
}

#[derive(Debug)]
struct EventCell {
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion handle for a host command.
#[derive(Debug, Clone)]
pub struct HostEvent {
    cell: Arc<EventCell>,
}

impl HostEvent {
    fn queued() -> Self {
        Self {
            cell: Arc::new(EventCell {
                state: Mutex::new(EventState {
                    status: Status::Queued,
                    started: None,
                    ended: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete.
    pub fn completed() -> Self {
        let event = Self::queued();
        event.start();
        event.finish(Ok(()));
        event
    }

    fn start(&self) {
        let mut state = lock(&self.cell.state);
        state.status = Status::Running;
        state.started = Some(Instant::now());
    }

    fn finish(&self, outcome: Result<()>) {
        let mut state = lock(&self.cell.state);
        state.status = match outcome {
            Ok(()) => Status::Complete,
            Err(e) => Status::Failed(e.to_string()),
        };
        state.ended = Some(Instant::now());
        self.cell.done.notify_all();
    }

    /// Whether the command failed. `None` while it is still pending.
    pub fn failed(&self) -> Option<bool> {
        match &lock(&self.cell.state).status {
            Status::Complete => Some(false),
            Status::Failed(_) => Some(true),
            _ => None,
        }
    }
}

impl DeviceEvent for HostEvent {
    fn wait(&self) -> Result<()> {
        let mut state = lock(&self.cell.state);
        loop {
            match &state.status {
                Status::Complete => return Ok(()),
                Status::Failed(msg) => return Err(StreamError::Device(msg.clone())),
                _ => {
                    state = self
                        .cell
                        .done
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn is_complete(&self) -> bool {
        matches!(
            lock(&self.cell.state).status,
            Status::Complete | Status::Failed(_)
        )
    }

    fn elapsed(&self) -> Option<Duration> {
        let state = lock(&self.cell.state);
        match (state.started, state.ended) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }
}

/// Read-back handle of the host backend.
pub struct HostReadback {
    event: HostEvent,
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Readback for HostReadback {
    fn take(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        lock(&self.data).take().ok_or_else(|| {
            StreamError::Device("read-back completed without producing data".to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

struct Command {
    wait: Vec<HostEvent>,
    event: HostEvent,
    work: Work,
}

struct QueueInner {
    device: HostDevice,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    reject: AtomicBool,
    submitted: AtomicU64,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is already queued.
        lock(&self.sender).take();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                warn!(device = %self.device.name(), "host queue worker panicked");
            }
        }
    }
}

/// In-order command queue backed by a worker thread.
#[derive(Clone)]
pub struct HostQueue {
    inner: Arc<QueueInner>,
}

impl HostQueue {
    fn spawn(device: &HostDevice) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let name = format!("devstream-{}", device.name());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                for cmd in rx {
                    let blocked = cmd.wait.iter().find_map(|e| e.wait().err());
                    cmd.event.start();
                    let outcome = match blocked {
                        Some(e) => Err(StreamError::Device(format!(
                            "wait list failed: {}",
                            e
                        ))),
                        None => (cmd.work)(),
                    };
                    cmd.event.finish(outcome);
                }
            })
            .map_err(|e| {
                StreamError::ResourceExhaustion(format!("cannot spawn queue worker: {}", e))
            })?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                device: device.clone(),
                sender: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                reject: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
            }),
        })
    }

    pub fn device(&self) -> &HostDevice {
        &self.inner.device
    }

    /// Number of commands accepted by this queue.
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Make every subsequent submission fail synchronously. Used to exercise
    /// submission-error paths.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.inner.reject.store(reject, Ordering::Release);
    }

    /// Submit a host task that runs on the queue's worker after `wait` completes.
    ///
    /// This is how host kernels are launched: the closure is the device-side body.
    pub fn enqueue_task<F>(&self, wait: &[HostEvent], work: F) -> Result<HostEvent>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.inner.reject.load(Ordering::Acquire) {
            return Err(StreamError::Submission(format!(
                "queue on '{}' rejected the command",
                self.inner.device.name()
            )));
        }
        let event = HostEvent::queued();
        let cmd = Command {
            wait: wait.to_vec(),
            event: event.clone(),
            work: Box::new(work),
        };
        let sender = lock(&self.inner.sender);
        let tx = sender
            .as_ref()
            .ok_or_else(|| StreamError::Submission("queue has been shut down".to_string()))?;
        tx.send(cmd)
            .map_err(|_| StreamError::Submission("queue worker has exited".to_string()))?;
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(device = %self.inner.device.name(), waits = wait.len(), "host command queued");
        Ok(event)
    }
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostQueue({})", self.inner.device.name())
    }
}

// ---------------------------------------------------------------------------
// Backend implementation
// ---------------------------------------------------------------------------

impl Backend for HostBackend {
    type Context = HostContext;
    type Device = HostDevice;
    type Queue = HostQueue;
    type Buffer = HostBuffer;
    type Event = HostEvent;
    type Readback = HostReadback;

    fn name(&self) -> &'static str {
        "host"
    }

    fn device_memory(&self, device: &HostDevice) -> Result<usize> {
        Ok(device.memory())
    }

    fn available_memory(&self, device: &HostDevice) -> Result<usize> {
        Ok(device.memory().saturating_sub(device.allocated()))
    }

    fn create_queue(&self, _context: &HostContext, device: &HostDevice) -> Result<HostQueue> {
        HostQueue::spawn(device)
    }

    fn create_buffer(
        &self,
        _context: &HostContext,
        device: &HostDevice,
        bytes: usize,
    ) -> Result<HostBuffer> {
        device.reserve(bytes)?;
        trace!(device = %device.name(), bytes, "host buffer allocated");
        Ok(HostBuffer {
            memory: Arc::new(Memory {
                bytes: Mutex::new(vec![0u8; bytes]),
                device: device.clone(),
            }),
        })
    }

    fn enqueue_write(
        &self,
        queue: &HostQueue,
        buffer: &HostBuffer,
        data: Vec<u8>,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        if data.len() > buffer.len() {
            return Err(StreamError::Capacity(format!(
                "write of {} bytes into {} byte buffer",
                data.len(),
                buffer.len()
            )));
        }
        let target = buffer.clone();
        queue.enqueue_task(wait, move || {
            target.with_bytes_mut(|bytes| bytes[..data.len()].copy_from_slice(&data));
            Ok(())
        })
    }

    fn enqueue_read(
        &self,
        queue: &HostQueue,
        buffer: &HostBuffer,
        len: usize,
        wait: &[HostEvent],
    ) -> Result<(HostEvent, HostReadback)> {
        if len > buffer.len() {
            return Err(StreamError::Capacity(format!(
                "read of {} bytes from {} byte buffer",
                len,
                buffer.len()
            )));
        }
        let source = buffer.clone();
        let data = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&data);
        let event = queue.enqueue_task(wait, move || {
            let bytes = source.with_bytes(|b| b[..len].to_vec());
            *lock(&slot) = Some(bytes);
            Ok(())
        })?;
        Ok((
            event.clone(),
            HostReadback { event, data },
        ))
    }

    fn enqueue_marker(&self, queue: &HostQueue, wait: &[HostEvent]) -> Result<HostEvent> {
        queue.enqueue_task(wait, || Ok(()))
    }

    fn finish(&self, queue: &HostQueue) -> Result<()> {
        // In-order queue: an empty marker completes after everything before it.
        let marker = queue.enqueue_task(&[], || Ok(()))?;
        marker.wait()
    }
}

// ---------------------------------------------------------------------------
// HostKernel -- explicit value type for simple host kernels
// ---------------------------------------------------------------------------

/// Device-side body of a host kernel: `(byte_offset, chunk_bytes)`.
pub type HostFn = fn(usize, &mut [u8]) -> Result<()>;

/// A named host kernel over a single chunk.
///
/// Holds no mutable state, so the same value can be launched for any number of
/// chunks on any number of queues.
#[derive(Debug, Clone, Copy)]
pub struct HostKernel {
    name: &'static str,
    body: HostFn,
}

impl HostKernel {
    pub const fn new(name: &'static str, body: HostFn) -> Self {
        Self { name, body }
    }
}

impl UnaryKernel<HostBackend> for HostKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn launch(
        &self,
        queue: &HostQueue,
        offset: usize,
        size: usize,
        buffer: &HostBuffer,
    ) -> Result<HostEvent> {
        let body = self.body;
        let buffer = buffer.clone();
        queue.enqueue_task(&[], move || buffer.with_bytes_mut(|b| body(offset, &mut b[..size])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn setup() -> (HostBackend, HostContext, HostDevice, HostQueue) {
        let backend = HostBackend::new();
        let device = HostDevice::new("test", 1 << 20);
        let queue = backend.create_queue(&HostContext, &device).unwrap();
        (backend, HostContext, device, queue)
    }

    #[test]
    fn test_device_identity() {
        let a = HostDevice::new("a", 1024);
        let b = HostDevice::new("a", 1024);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_allocation_is_accounted() {
        let (backend, ctx, device, _queue) = setup();
        let buf = backend.create_buffer(&ctx, &device, 4096).unwrap();
        assert_eq!(device.allocated(), 4096);
        drop(buf);
        assert_eq!(device.allocated(), 0);
    }

    #[test]
    fn test_available_memory_tracks_allocations() {
        let (backend, ctx, device, _queue) = setup();
        assert_eq!(backend.available_memory(&device).unwrap(), 1 << 20);
        let buf = backend.create_buffer(&ctx, &device, 1 << 18).unwrap();
        assert_eq!(backend.available_memory(&device).unwrap(), 3 << 18);
        assert_eq!(backend.device_memory(&device).unwrap(), 1 << 20);
        drop(buf);
        assert_eq!(backend.available_memory(&device).unwrap(), 1 << 20);
    }

    #[test]
    fn test_allocation_past_memory_fails() {
        let (backend, ctx, device, _queue) = setup();
        let _a = backend.create_buffer(&ctx, &device, 1 << 19).unwrap();
        let _b = backend.create_buffer(&ctx, &device, 1 << 19).unwrap();
        match backend.create_buffer(&ctx, &device, 1) {
            Err(StreamError::ResourceExhaustion(msg)) => assert!(msg.contains("test")),
            other => panic!("Expected ResourceExhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_write_then_read() {
        let (backend, ctx, device, queue) = setup();
        let buf = backend.create_buffer(&ctx, &device, 8).unwrap();
        let write = backend
            .enqueue_write(&queue, &buf, vec![1, 2, 3, 4], &[])
            .unwrap();
        let (read, readback) = backend.enqueue_read(&queue, &buf, 6, &[write]).unwrap();
        assert_eq!(readback.take().unwrap(), vec![1, 2, 3, 4, 0, 0]);
        assert!(read.is_complete());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let (backend, ctx, device, queue) = setup();
        let buf = backend.create_buffer(&ctx, &device, 2).unwrap();
        let result = backend.enqueue_write(&queue, &buf, vec![0; 3], &[]);
        assert!(matches!(result, Err(StreamError::Capacity(_))));
    }

    #[test]
    fn test_queue_is_in_order() {
        let (_backend, _ctx, _device, queue) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..16 {
            let log = Arc::clone(&log);
            last = Some(
                queue
                    .enqueue_task(&[], move || {
                        log.lock().unwrap().push(i);
                        Ok(())
                    })
                    .unwrap(),
            );
        }
        last.unwrap().wait().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_cross_queue_wait_list() {
        let (backend, ctx, device, q0) = setup();
        let q1 = backend.create_queue(&ctx, &device).unwrap();
        let value = Arc::new(AtomicU32::new(0));

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = Arc::clone(&gate);
        let v = Arc::clone(&value);
        let first = q0
            .enqueue_task(&[], move || {
                let (open, cv) = &*g;
                let mut open = open.lock().unwrap();
                while !*open {
                    open = cv.wait(open).unwrap();
                }
                v.store(7, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let v = Arc::clone(&value);
        let observed = Arc::new(AtomicU32::new(0));
        let o = Arc::clone(&observed);
        let second = q1
            .enqueue_task(&[first], move || {
                o.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(!second.is_complete());
        {
            let (open, cv) = &*gate;
            *open.lock().unwrap() = true;
            cv.notify_all();
        }
        second.wait().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_failure_propagates_through_wait_list() {
        let (backend, _ctx, _device, queue) = setup();
        let bad = queue
            .enqueue_task(&[], || Err(StreamError::Device("boom".into())))
            .unwrap();
        let dependent = backend.enqueue_marker(&queue, &[bad.clone()]).unwrap();
        assert!(matches!(bad.wait(), Err(StreamError::Device(_))));
        match dependent.wait() {
            Err(StreamError::Device(msg)) => assert!(msg.contains("boom"), "Error: {}", msg),
            other => panic!("Expected Device error, got {:?}", other),
        }
        assert_eq!(bad.failed(), Some(true));
    }

    #[test]
    fn test_rejecting_queue() {
        let (backend, _ctx, _device, queue) = setup();
        queue.set_reject_submissions(true);
        assert!(matches!(
            backend.enqueue_marker(&queue, &[]),
            Err(StreamError::Submission(_))
        ));
        queue.set_reject_submissions(false);
        assert!(backend.enqueue_marker(&queue, &[]).is_ok());
    }

    #[test]
    fn test_finish_drains_queue() {
        let (backend, _ctx, _device, queue) = setup();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            queue
                .enqueue_task(&[], move || {
                    std::thread::sleep(Duration::from_millis(1));
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        backend.finish(&queue).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(queue.submitted(), 9);
    }

    #[test]
    fn test_completed_event_has_elapsed() {
        let event = HostEvent::completed();
        assert!(event.is_complete());
        assert!(event.elapsed().is_some());
        assert_eq!(event.failed(), Some(false));
    }

    #[test]
    fn test_host_kernel_launch() {
        fn fill(offset: usize, bytes: &mut [u8]) -> Result<()> {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = (offset + i) as u8;
            }
            Ok(())
        }
        let (backend, ctx, device, queue) = setup();
        let buf = backend.create_buffer(&ctx, &device, 4).unwrap();
        let kernel = HostKernel::new("fill", fill);
        assert_eq!(UnaryKernel::<HostBackend>::name(&kernel), "fill");
        kernel.launch(&queue, 10, 3, &buf).unwrap().wait().unwrap();
        assert_eq!(buf.snapshot(), vec![10, 11, 12, 0]);
    }
}
