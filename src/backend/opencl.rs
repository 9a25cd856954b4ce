//! OpenCL backend.
//!
//! Wraps `opencl3` so the cache and the scheduler can drive real accelerators.
//! Queues are created with profiling enabled so recorded events report device
//! execution time.

use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ALL};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_event, cl_uint, CL_NON_BLOCKING};
use tracing::{debug, info};

use super::{Backend, DeviceEvent, Readback};
use crate::error::{Result, StreamError};
use crate::kernel::{BinaryKernel, LaunchConfig, UnaryKernel};

const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
const CL_OUT_OF_RESOURCES: i32 = -5;
const CL_OUT_OF_HOST_MEMORY: i32 = -6;

fn exhausted(e: &ClError) -> bool {
    matches!(
        e.0,
        CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_RESOURCES | CL_OUT_OF_HOST_MEMORY
    )
}

fn submission(what: &str, e: ClError) -> StreamError {
    if exhausted(&e) {
        StreamError::ResourceExhaustion(format!("{}: {:?}", what, e))
    } else {
        StreamError::Submission(format!("{}: {:?}", what, e))
    }
}

fn device_fault(what: &str, e: ClError) -> StreamError {
    StreamError::Device(format!("{}: {:?}", what, e))
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct OpenClDevice {
    device: Device,
}

impl OpenClDevice {
    pub fn cl_device(&self) -> &Device {
        &self.device
    }

    pub fn info(&self) -> String {
        let name = self.device.name().unwrap_or_else(|_| "Unknown".into());
        let vendor = self.device.vendor().unwrap_or_else(|_| "Unknown".into());
        format!("{} ({})", name, vendor)
    }
}

impl PartialEq for OpenClDevice {
    fn eq(&self, other: &Self) -> bool {
        self.device.id() == other.device.id()
    }
}

impl fmt::Debug for OpenClDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenClDevice({})", self.info())
    }
}

/// Device memory buffer. Writes need exclusive access to the `opencl3` handle.
#[derive(Clone)]
pub struct OpenClBuffer {
    buffer: Arc<Mutex<Buffer<u8>>>,
    size: usize,
}

impl OpenClBuffer {
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Buffer<u8>>> {
        self.buffer
            .lock()
            .map_err(|_| StreamError::Device("buffer lock poisoned".to_string()))
    }
}

/// Event plus whatever host memory the command reads from.
#[derive(Clone)]
pub struct OpenClEvent {
    event: Arc<Event>,
    _staging: Option<Arc<Vec<u8>>>,
}

impl OpenClEvent {
    fn new(event: Event) -> Self {
        Self {
            event: Arc::new(event),
            _staging: None,
        }
    }

    fn raw(&self) -> cl_event {
        self.event.get()
    }
}

impl fmt::Debug for OpenClEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenClEvent({:p})", self.raw())
    }
}

impl DeviceEvent for OpenClEvent {
    fn wait(&self) -> Result<()> {
        self.event
            .wait()
            .map_err(|e| device_fault("waiting on event", e))?;
        match self.event.command_execution_status() {
            Ok(status) if status.0 < 0 => Err(StreamError::Device(format!(
                "command failed with status {}",
                status.0
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(device_fault("querying event status", e)),
        }
    }

    fn is_complete(&self) -> bool {
        // CL_COMPLETE is 0, errors are negative.
        matches!(self.event.command_execution_status(), Ok(s) if s.0 <= 0)
    }

    fn elapsed(&self) -> Option<Duration> {
        let start = self.event.profiling_command_start().ok()?;
        let end = self.event.profiling_command_end().ok()?;
        Some(Duration::from_nanos(end.saturating_sub(start)))
    }
}

pub struct OpenClReadback {
    event: OpenClEvent,
    data: Vec<u8>,
}

impl Readback for OpenClReadback {
    fn take(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        Ok(self.data)
    }
}

// OpenCL handles are thread safe; the raw ids inside are plain handles.
unsafe impl Send for OpenClDevice {}
unsafe impl Sync for OpenClDevice {}
unsafe impl Send for OpenClBuffer {}
unsafe impl Sync for OpenClBuffer {}
unsafe impl Send for OpenClEvent {}
unsafe impl Sync for OpenClEvent {}
unsafe impl Send for OpenClReadback {}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct OpenClBackend;

/// Everything needed to register one OpenCL device with the cache and a scheduler.
pub struct OpenedDevice {
    pub context: Arc<Context>,
    pub device: OpenClDevice,
}

impl OpenClBackend {
    pub fn new() -> Self {
        Self
    }

    /// Devices of every platform, grouped by platform name.
    pub fn enumerate() -> Result<Vec<(String, Vec<OpenClDevice>)>> {
        let platforms =
            get_platforms().map_err(|e| StreamError::Configuration(format!("{:?}", e)))?;
        platforms
            .iter()
            .map(|p| {
                let name = p.name().unwrap_or_else(|_| "Unknown".into());
                let devices = p
                    .get_devices(CL_DEVICE_TYPE_ALL)
                    .map_err(|e| StreamError::Configuration(format!("{:?}", e)))?
                    .into_iter()
                    .map(|id| OpenClDevice {
                        device: Device::new(id),
                    })
                    .collect();
                Ok((name, devices))
            })
            .collect()
    }

    /// Open device `device` of platform `platform` with its own context.
    pub fn acquire(platform: usize, device: usize) -> Result<OpenedDevice> {
        let platforms = Self::enumerate()?;
        let (name, devices) = platforms.get(platform).ok_or_else(|| {
            StreamError::Configuration(format!(
                "platform index {} out of range (found {})",
                platform,
                platforms.len()
            ))
        })?;
        let device = *devices.get(device).ok_or_else(|| {
            StreamError::Configuration(format!(
                "device index {} out of range on {} (found {})",
                device,
                name,
                devices.len()
            ))
        })?;
        let context = Context::from_device(device.cl_device())
            .map_err(|e| StreamError::Configuration(format!("creating context: {:?}", e)))?;
        info!(platform = %name, device = %device.info(), "Opened OpenCL device");
        Ok(OpenedDevice {
            context: Arc::new(context),
            device,
        })
    }

    /// Compile `source` for `context`.
    pub fn build_program(context: &Context, source: &str, options: &str) -> Result<Program> {
        Program::create_and_build_from_source(context, source, options)
            .map_err(|log| StreamError::Configuration(format!("program build failed:\n{}", log)))
    }

    /// Look up kernel `name` in a built program with default launch geometry.
    pub fn create_kernel(program: &Program, name: &str) -> Result<OpenClKernel> {
        OpenClKernel::new(program, name, LaunchConfig::default())
    }
}

fn wait_list(wait: &[OpenClEvent]) -> Vec<cl_event> {
    wait.iter().map(OpenClEvent::raw).collect()
}

impl Backend for OpenClBackend {
    type Context = Arc<Context>;
    type Device = OpenClDevice;
    type Queue = Arc<CommandQueue>;
    type Buffer = OpenClBuffer;
    type Event = OpenClEvent;
    type Readback = OpenClReadback;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn device_memory(&self, device: &OpenClDevice) -> Result<usize> {
        let bytes = device
            .cl_device()
            .global_mem_size()
            .map_err(|e| StreamError::Configuration(format!("{:?}", e)))?;
        Ok(usize::try_from(bytes).unwrap_or(usize::MAX))
    }

    #[allow(deprecated)]
    fn create_queue(&self, context: &Arc<Context>, device: &OpenClDevice) -> Result<Self::Queue> {
        let queue = CommandQueue::create_default(context, CL_QUEUE_PROFILING_ENABLE)
            .map_err(|e| submission("creating queue", e))?;
        debug!(device = ?device, "Created OpenCL queue");
        Ok(Arc::new(queue))
    }

    fn create_buffer(
        &self,
        context: &Arc<Context>,
        _device: &OpenClDevice,
        bytes: usize,
    ) -> Result<OpenClBuffer> {
        let buffer = unsafe {
            Buffer::<u8>::create(context, CL_MEM_READ_WRITE, bytes, ptr::null_mut())
                .map_err(|e| submission("allocating buffer", e))?
        };
        Ok(OpenClBuffer {
            buffer: Arc::new(Mutex::new(buffer)),
            size: bytes,
        })
    }

    fn enqueue_write(
        &self,
        queue: &Self::Queue,
        buffer: &OpenClBuffer,
        data: Vec<u8>,
        wait: &[OpenClEvent],
    ) -> Result<OpenClEvent> {
        if data.len() > buffer.size {
            return Err(StreamError::Capacity(format!(
                "write of {} bytes into a {}-byte buffer",
                data.len(),
                buffer.size
            )));
        }
        let data = Arc::new(data);
        let ids = wait_list(wait);
        let mut guard = buffer.lock()?;
        let event = unsafe {
            queue
                .enqueue_write_buffer(&mut guard, CL_NON_BLOCKING, 0, data.as_slice(), &ids)
                .map_err(|e| submission("enqueueing write", e))?
        };
        Ok(OpenClEvent {
            event: Arc::new(event),
            _staging: Some(data),
        })
    }

    fn enqueue_read(
        &self,
        queue: &Self::Queue,
        buffer: &OpenClBuffer,
        len: usize,
        wait: &[OpenClEvent],
    ) -> Result<(OpenClEvent, OpenClReadback)> {
        if len > buffer.size {
            return Err(StreamError::Capacity(format!(
                "read of {} bytes from a {}-byte buffer",
                len, buffer.size
            )));
        }
        let mut data = vec![0u8; len];
        let ids = wait_list(wait);
        let guard = buffer.lock()?;
        let event = unsafe {
            queue
                .enqueue_read_buffer(&guard, CL_NON_BLOCKING, 0, &mut data, &ids)
                .map_err(|e| submission("enqueueing read", e))?
        };
        let event = OpenClEvent::new(event);
        Ok((event.clone(), OpenClReadback { event, data }))
    }

    fn enqueue_marker(&self, queue: &Self::Queue, wait: &[OpenClEvent]) -> Result<OpenClEvent> {
        let ids = wait_list(wait);
        let event = queue
            .enqueue_marker_with_wait_list(&ids)
            .map_err(|e| submission("enqueueing marker", e))?;
        Ok(OpenClEvent::new(event))
    }

    fn finish(&self, queue: &Self::Queue) -> Result<()> {
        queue.finish().map_err(|e| device_fault("finishing queue", e))
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

/// Compiled device kernel launched once per chunk.
///
/// Unary kernels take `(global uchar* buf, uint byte_offset, uint size)`; binary
/// kernels take `(global uchar* a, global uchar* b, uint byte_offset, uint size_a,
/// uint size_b)`. Trailing arguments set through [`OpenClKernel::with_args`] follow.
pub struct OpenClKernel {
    name: String,
    kernel: Mutex<Kernel>,
    launch: LaunchConfig,
    elem_size: usize,
    extra: Vec<cl_uint>,
}

impl OpenClKernel {
    pub fn new(program: &Program, name: &str, launch: LaunchConfig) -> Result<Self> {
        let kernel = Kernel::create(program, name).map_err(|e| {
            StreamError::Configuration(format!("creating kernel '{}': {:?}", name, e))
        })?;
        Ok(Self {
            name: name.to_string(),
            kernel: Mutex::new(kernel),
            launch,
            elem_size: 1,
            extra: Vec::new(),
        })
    }

    /// Element size used to derive the global work size from the chunk size.
    pub fn with_element_size(mut self, elem_size: usize) -> Self {
        self.elem_size = elem_size;
        self
    }

    pub fn with_args(mut self, args: &[cl_uint]) -> Self {
        self.extra = args.to_vec();
        self
    }

    fn enqueue(
        &self,
        queue: &CommandQueue,
        buffers: &[&OpenClBuffer],
        offset: usize,
        sizes: &[usize],
        global: usize,
    ) -> Result<OpenClEvent> {
        let kernel = self
            .kernel
            .lock()
            .map_err(|_| StreamError::Device("kernel lock poisoned".to_string()))?;
        let guards = buffers
            .iter()
            .map(|b| b.lock())
            .collect::<Result<Vec<_>>>()?;
        let offset = offset as cl_uint;
        let sizes: Vec<cl_uint> = sizes.iter().map(|&s| s as cl_uint).collect();
        let event = unsafe {
            let mut exec = ExecuteKernel::new(&kernel);
            for guard in &guards {
                exec.set_arg(&**guard);
            }
            exec.set_arg(&offset);
            for size in &sizes {
                exec.set_arg(size);
            }
            for arg in &self.extra {
                exec.set_arg(arg);
            }
            exec.set_global_work_size(global);
            if let Some(local) = self.launch.local {
                exec.set_local_work_size(local);
            }
            exec.enqueue_nd_range(queue)
                .map_err(|e| submission(&format!("launching '{}'", self.name), e))?
        };
        Ok(OpenClEvent::new(event))
    }
}

impl UnaryKernel<OpenClBackend> for OpenClKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        queue: &Arc<CommandQueue>,
        byte_offset: usize,
        size: usize,
        buffer: &OpenClBuffer,
    ) -> Result<OpenClEvent> {
        let global = self.launch.global_for(size, self.elem_size);
        self.enqueue(queue, &[buffer], byte_offset, &[size], global)
    }
}

impl BinaryKernel<OpenClBackend> for OpenClKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        queue: &Arc<CommandQueue>,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &OpenClBuffer,
        buffer2: &OpenClBuffer,
    ) -> Result<OpenClEvent> {
        let global = self.launch.global_for(size1, self.elem_size);
        self.enqueue(queue, &[buffer1, buffer2], byte_offset, &[size1, size2], global)
    }
}
