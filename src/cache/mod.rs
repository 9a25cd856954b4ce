//! Buffer cache: host objects sliced into chunks that stream through a bounded
//! pool of device buffers.
//!
//! The cache owns the host bytes of every registered object. Each registered device
//! gets a pool of `pool_size / buffer_size` slots allocated up front; a chunk is at
//! most `buffer_size` bytes, so the bytes occupied on a device never exceed its
//! pool size no matter how large the objects are.
//!
//! Slot assignment is driven by the scheduler through [`BufferCache::acquire`]. When
//! no slot is free the least recently used unpinned slot is drained: the host blocks
//! on every event issued against it (transfer, kernels, write-backs) and applies its
//! write-backs to host memory before the slot is refilled.

mod pool;

pub use pool::SlotStatus;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::backend::{Backend, Readback};
use crate::buffer::{decode, encode, Element};
use crate::config::CacheConfig;
use crate::error::{Result, StreamError};

use pool::{DevicePool, Occupant, SlotState, WriteBack};

// ---------------------------------------------------------------------------
// Objects and chunks
// ---------------------------------------------------------------------------

/// Identifier of a registered host object. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(NonZeroU32);

impl ObjectId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ObjectId)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for ObjectId {
    type Error = StreamError;

    fn try_from(raw: u32) -> Result<Self> {
        ObjectId::new(raw).ok_or(StreamError::NullObject)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How kernels access an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Whether device results are copied back into host memory.
    pub fn writes_back(&self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Contiguous byte range `[offset, offset + len)` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Split `len` bytes into `ceil(len / buffer_size)` chunks in increasing offset order.
pub fn partition(len: usize, buffer_size: usize) -> Vec<Chunk> {
    if buffer_size == 0 {
        return Vec::new();
    }
    (0..len.div_ceil(buffer_size))
        .map(|index| {
            let offset = index * buffer_size;
            Chunk {
                index,
                offset,
                len: buffer_size.min(len - offset),
            }
        })
        .collect()
}

struct HostObject {
    data: Vec<u8>,
    mode: AccessMode,
    chunks: Vec<Chunk>,
}

/// Metadata of a registered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub len: usize,
    pub mode: AccessMode,
    pub chunk_count: usize,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Chunk requests served by a resident copy.
    pub hits: u64,
    /// Chunk requests that needed a host-to-device transfer.
    pub misses: u64,
    /// Occupied slots drained to make room.
    pub evictions: u64,
    /// Device-to-host copies enqueued.
    pub write_backs: u64,
    pub occupied_bytes: usize,
    pub peak_occupied_bytes: usize,
}

/// Slot handed to the scheduler for one chunk.
pub(crate) struct Acquired<B: Backend> {
    pub slot: usize,
    pub buffer: B::Buffer,
    pub len: usize,
    /// Host-to-device transfer, `None` when the chunk was already resident.
    pub transfer: Option<B::Event>,
    /// Unfinished events of a resident chunk that new work must follow.
    pub wait: Vec<B::Event>,
}

// ---------------------------------------------------------------------------
// BufferCache
// ---------------------------------------------------------------------------

pub struct BufferCache<B: Backend> {
    backend: Arc<B>,
    buffer_size: usize,
    pools: Vec<DevicePool<B>>,
    objects: HashMap<ObjectId, HostObject>,
    next_id: u32,
    clock: u64,
    stats: CacheStats,
}

impl<B: Backend> BufferCache<B> {
    pub fn new(backend: Arc<B>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        debug!(backend = backend.name(), buffer_size = config.buffer_size, "Created buffer cache");
        Ok(Self {
            backend,
            buffer_size: config.buffer_size,
            pools: Vec::new(),
            objects: HashMap::new(),
            next_id: 1,
            clock: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Capacity of one pool slot, and the maximum chunk length.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Allocate the slot pool of `device`: `pool_size / buffer_size` slots.
    pub fn add_device(
        &mut self,
        context: B::Context,
        device: B::Device,
        pool_size: usize,
    ) -> Result<()> {
        if self.device_index(&device).is_some() {
            return Err(StreamError::Configuration(format!(
                "device {:?} already has a pool",
                device
            )));
        }
        let available = self.backend.available_memory(&device)?;
        if pool_size > available {
            return Err(StreamError::Capacity(format!(
                "pool of {} bytes exceeds the {} bytes available on the device",
                pool_size, available
            )));
        }
        let slot_count = pool_size / self.buffer_size;
        if slot_count == 0 {
            return Err(StreamError::Capacity(format!(
                "pool of {} bytes holds no {} byte slot",
                pool_size, self.buffer_size
            )));
        }
        let pool = DevicePool::<B>::allocate(
            &*self.backend,
            context,
            device,
            pool_size,
            self.buffer_size,
            slot_count,
        )?;
        info!(
            device = ?pool.device,
            pool_size,
            slots = slot_count,
            buffer_size = self.buffer_size,
            "Registered device pool"
        );
        self.pools.push(pool);
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.pools.len()
    }

    pub fn device_index(&self, device: &B::Device) -> Option<usize> {
        self.pools.iter().position(|p| &p.device == device)
    }

    pub fn device(&self, index: usize) -> Option<&B::Device> {
        self.pools.get(index).map(|p| &p.device)
    }

    pub fn context(&self, index: usize) -> Option<&B::Context> {
        self.pools.get(index).map(|p| &p.context)
    }

    pub fn pool_size(&self, device: &B::Device) -> Option<usize> {
        self.device_index(device).map(|i| self.pools[i].pool_size)
    }

    pub fn slot_count(&self, device: &B::Device) -> Option<usize> {
        self.device_index(device).map(|i| self.pools[i].len())
    }

    pub(crate) fn slot_count_at(&self, index: usize) -> usize {
        self.pools.get(index).map_or(0, |p| p.len())
    }

    /// Status of every slot of device `index`.
    pub fn slot_status(&self, index: usize) -> Vec<SlotStatus> {
        self.pools
            .get(index)
            .map(|p| p.slots.iter().map(|s| s.status()).collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Register host bytes. The cache takes ownership; read them back with
    /// [`read_object`](Self::read_object).
    pub fn add_object(&mut self, data: Vec<u8>, mode: AccessMode) -> Result<ObjectId> {
        if self.pools.is_empty() {
            return Err(StreamError::Configuration(
                "no device registered with the cache".to_string(),
            ));
        }
        let id = ObjectId::try_from(self.next_id).map_err(|_| {
            StreamError::Capacity("object id space exhausted".to_string())
        })?;
        self.next_id = self.next_id.checked_add(1).unwrap_or(0);
        let chunks = partition(data.len(), self.buffer_size);
        debug!(object = %id, len = data.len(), ?mode, chunks = chunks.len(), "Registered object");
        self.objects.insert(id, HostObject { data, mode, chunks });
        Ok(id)
    }

    /// Register a typed slice.
    pub fn add_typed<T: Element>(&mut self, values: &[T], mode: AccessMode) -> Result<ObjectId> {
        self.add_object(encode(values), mode)
    }

    /// Register `len` zero bytes, typically as a kernel output.
    pub fn add_zeroed(&mut self, len: usize, mode: AccessMode) -> Result<ObjectId> {
        self.add_object(vec![0u8; len], mode)
    }

    fn object(&self, id: ObjectId) -> Result<&HostObject> {
        self.objects.get(&id).ok_or(StreamError::UnknownObject(id))
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn object_info(&self, id: ObjectId) -> Result<ObjectInfo> {
        let object = self.object(id)?;
        Ok(ObjectInfo {
            len: object.data.len(),
            mode: object.mode,
            chunk_count: object.chunks.len(),
        })
    }

    /// Chunks of `id` in increasing offset order.
    pub fn chunks(&self, id: ObjectId) -> Result<&[Chunk]> {
        Ok(&self.object(id)?.chunks)
    }

    /// Index of the chunk containing byte `offset`.
    pub fn chunk_index(&self, id: ObjectId, offset: usize) -> Result<usize> {
        let object = self.object(id)?;
        if offset >= object.data.len() {
            return Err(StreamError::Capacity(format!(
                "offset {} is outside object {} of {} bytes",
                offset,
                id,
                object.data.len()
            )));
        }
        Ok(offset / self.buffer_size)
    }

    /// Byte offset of chunk `index`.
    pub fn chunk_offset(&self, id: ObjectId, index: usize) -> Result<usize> {
        self.object(id)?
            .chunks
            .get(index)
            .map(|c| c.offset)
            .ok_or_else(|| {
                StreamError::Capacity(format!("object {} has no chunk {}", id, index))
            })
    }

    /// Devices holding the chunk that contains byte `offset`.
    pub fn where_is(&self, id: ObjectId, offset: usize) -> Result<Vec<B::Device>> {
        let chunk = self.chunk_index(id, offset)?;
        Ok(self
            .pools
            .iter()
            .filter(|p| p.find(id, chunk).is_some())
            .map(|p| p.device.clone())
            .collect())
    }

    /// Wait for device work on `id`, apply its write-backs and return the host bytes.
    pub fn read_object(&mut self, id: ObjectId) -> Result<&[u8]> {
        self.object(id)?;
        self.settle_where(|o| o == id)?;
        Ok(&self.object(id)?.data)
    }

    pub fn read_typed<T: Element>(&mut self, id: ObjectId) -> Result<Vec<T>> {
        decode(self.read_object(id)?)
    }

    /// Overwrite host bytes of `id` starting at `offset`. Resident copies of the
    /// affected chunks are drained and dropped so the next use uploads fresh data.
    pub fn write_object(&mut self, id: ObjectId, offset: usize, bytes: &[u8]) -> Result<()> {
        let object = self.object(id)?;
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= object.data.len())
            .ok_or_else(|| {
                StreamError::Capacity(format!(
                    "write of {} bytes at {} overruns object {} of {} bytes",
                    bytes.len(),
                    offset,
                    id,
                    object.data.len()
                ))
            })?;
        if bytes.is_empty() {
            return Ok(());
        }
        let first = offset / self.buffer_size;
        let last = (end - 1) / self.buffer_size;
        self.evict_where(|o, chunk| o == id && (first..=last).contains(&chunk))?;
        if let Some(object) = self.objects.get_mut(&id) {
            object.data[offset..end].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Drain and forget `id`, returning its final host bytes.
    pub fn release_object(&mut self, id: ObjectId) -> Result<Vec<u8>> {
        self.object(id)?;
        self.evict_where(|o, _| o == id)?;
        let object = self.objects.remove(&id).ok_or(StreamError::UnknownObject(id))?;
        debug!(object = %id, "Released object");
        Ok(object.data)
    }

    /// Wait for all device work and apply every pending write-back. Chunks stay
    /// resident.
    pub fn flush(&mut self) -> Result<()> {
        self.settle_where(|_| true)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    // -----------------------------------------------------------------------
    // Scheduler interface
    // -----------------------------------------------------------------------

    /// Make chunk `chunk` of `id` resident on device `dev` and pin its slot.
    ///
    /// A resident chunk is reused without a transfer. Otherwise a free slot is
    /// taken in round-robin order, or the least recently used unpinned slot is
    /// drained (blocking), and the chunk is uploaded on `queue`.
    pub(crate) fn acquire(
        &mut self,
        dev: usize,
        queue: &B::Queue,
        id: ObjectId,
        chunk: usize,
    ) -> Result<Acquired<B>> {
        let object = self.object(id)?;
        let Chunk { offset, len, .. } = *object.chunks.get(chunk).ok_or_else(|| {
            StreamError::Capacity(format!("object {} has no chunk {}", id, chunk))
        })?;
        let mode = object.mode;
        if dev >= self.pools.len() {
            return Err(StreamError::Configuration(format!(
                "device index {} has no pool",
                dev
            )));
        }
        self.clock += 1;
        let now = self.clock;

        if let Some(index) = self.pools[dev].find(id, chunk) {
            let slot = &mut self.pools[dev].slots[index];
            slot.pins += 1;
            slot.last_used = now;
            let wait = slot.occupant_mut().map(|o| o.incomplete()).unwrap_or_default();
            self.stats.hits += 1;
            trace!(object = %id, chunk, slot = index, waits = wait.len(), "Chunk resident");
            return Ok(Acquired {
                slot: index,
                buffer: slot.buffer.clone(),
                len,
                transfer: None,
                wait,
            });
        }

        self.stats.misses += 1;
        if mode.writes_back() {
            // A writable chunk lives on one device at a time; pull results home first.
            let others: Vec<usize> = (0..self.pools.len()).filter(|&d| d != dev).collect();
            for other in others {
                if let Some(index) = self.pools[other].find(id, chunk) {
                    self.evict_slot(other, index)?;
                }
            }
        }

        let index = match self.pools[dev].next_free() {
            Some(index) => index,
            None => {
                let index = self.pools[dev].victim().ok_or_else(|| {
                    StreamError::Capacity(format!(
                        "all {} slots of device {:?} are pinned",
                        self.pools[dev].len(),
                        self.pools[dev].device
                    ))
                })?;
                self.stats.evictions += 1;
                self.evict_slot(dev, index)?;
                index
            }
        };

        let data = self.object(id)?.data[offset..offset + len].to_vec();
        let slot = &mut self.pools[dev].slots[index];
        let transfer = self.backend.enqueue_write(queue, &slot.buffer, data, &[])?;
        slot.state = SlotState::Occupied(Occupant {
            object: id,
            chunk,
            len,
            pending: vec![transfer.clone()],
            write_backs: Vec::new(),
        });
        slot.pins = 1;
        slot.last_used = now;
        let buffer = slot.buffer.clone();
        self.note_occupancy();
        trace!(object = %id, chunk, slot = index, bytes = len, "Chunk uploaded");
        Ok(Acquired {
            slot: index,
            buffer,
            len,
            transfer: Some(transfer),
            wait: Vec::new(),
        })
    }

    /// Record an event issued against a pinned slot.
    pub(crate) fn record(&mut self, dev: usize, slot: usize, event: B::Event) {
        if let Some(occupant) = self
            .pools
            .get_mut(dev)
            .and_then(|p| p.slots.get_mut(slot))
            .and_then(|s| s.occupant_mut())
        {
            occupant.push_event(event);
        }
    }

    /// Enqueue the device-to-host copy of a slot's chunk after `wait`, if the
    /// object's mode requires one.
    pub(crate) fn write_back(
        &mut self,
        dev: usize,
        slot: usize,
        queue: &B::Queue,
        wait: &[B::Event],
    ) -> Result<Option<B::Event>> {
        let Self {
            backend,
            pools,
            objects,
            stats,
            ..
        } = self;
        let Some(pool_slot) = pools.get_mut(dev).and_then(|p| p.slots.get_mut(slot)) else {
            return Ok(None);
        };
        let buffer = pool_slot.buffer.clone();
        let Some(occupant) = pool_slot.occupant_mut() else {
            return Ok(None);
        };
        let Some(object) = objects.get(&occupant.object) else {
            return Ok(None);
        };
        if !object.mode.writes_back() {
            return Ok(None);
        }
        let offset = object.chunks[occupant.chunk].offset;
        let (event, readback) = backend.enqueue_read(queue, &buffer, occupant.len, wait)?;
        occupant.push_event(event.clone());
        occupant.write_backs.push(WriteBack { offset, readback });
        stats.write_backs += 1;
        Ok(Some(event))
    }

    /// Unpin a slot acquired with [`acquire`](Self::acquire).
    pub(crate) fn release(&mut self, dev: usize, slot: usize) {
        if let Some(s) = self.pools.get_mut(dev).and_then(|p| p.slots.get_mut(slot)) {
            s.pins = s.pins.saturating_sub(1);
        }
    }

    /// Whether chunk `chunk` of `id` is resident on device `dev`.
    pub fn is_resident(&self, dev: usize, id: ObjectId, chunk: usize) -> bool {
        self.pools
            .get(dev)
            .is_some_and(|p| p.find(id, chunk).is_some())
    }

    // -----------------------------------------------------------------------
    // Draining
    // -----------------------------------------------------------------------

    /// Drain slot `index` of device `dev`, apply its write-backs and free it.
    fn evict_slot(&mut self, dev: usize, index: usize) -> Result<()> {
        let slot = &mut self.pools[dev].slots[index];
        if slot.pins > 0 {
            return Err(StreamError::Capacity(format!(
                "slot {} of device {:?} is in use",
                index, self.pools[dev].device
            )));
        }
        let drained = slot.drain()?;
        self.note_occupancy();
        if let Some((object, write_backs)) = drained {
            apply_write_backs::<B>(&mut self.objects, object, write_backs)?;
        }
        Ok(())
    }

    fn evict_where(&mut self, wanted: impl Fn(ObjectId, usize) -> bool) -> Result<()> {
        for dev in 0..self.pools.len() {
            for index in 0..self.pools[dev].len() {
                let hit = match &self.pools[dev].slots[index].state {
                    SlotState::Occupied(o) => wanted(o.object, o.chunk),
                    _ => false,
                };
                if hit {
                    self.evict_slot(dev, index)?;
                }
            }
        }
        Ok(())
    }

    fn settle_where(&mut self, wanted: impl Fn(ObjectId) -> bool) -> Result<()> {
        let Self { pools, objects, .. } = self;
        for pool in pools.iter_mut() {
            for slot in pool.slots.iter_mut() {
                let hit = matches!(&slot.state, SlotState::Occupied(o) if wanted(o.object));
                if !hit {
                    continue;
                }
                if let Some((object, write_backs)) = slot.settle()? {
                    apply_write_backs::<B>(objects, object, write_backs)?;
                }
            }
        }
        Ok(())
    }

    fn note_occupancy(&mut self) {
        let occupied: usize = self.pools.iter().map(|p| p.occupied_bytes()).sum();
        self.stats.occupied_bytes = occupied;
        self.stats.peak_occupied_bytes = self.stats.peak_occupied_bytes.max(occupied);
    }

    /// Bytes currently occupied on device `index`.
    pub fn occupied_bytes(&self, index: usize) -> usize {
        self.pools.get(index).map_or(0, |p| p.occupied_bytes())
    }
}

fn apply_write_backs<B: Backend>(
    objects: &mut HashMap<ObjectId, HostObject>,
    id: ObjectId,
    write_backs: Vec<WriteBack<B>>,
) -> Result<()> {
    for wb in write_backs {
        let bytes = wb.readback.take()?;
        // Released objects have nowhere to land.
        if let Some(object) = objects.get_mut(&id) {
            object.data[wb.offset..wb.offset + bytes.len()].copy_from_slice(&bytes);
        }
    }
    Ok(())
}

impl<B: Backend> fmt::Debug for BufferCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("buffer_size", &self.buffer_size)
            .field("pools", &self.pools)
            .field("objects", &self.objects.len())
            .field("stats", &self.stats)
            .finish()
    }
}
