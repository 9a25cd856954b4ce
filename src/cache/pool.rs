//! Per-device pool of fixed-size device buffers.
//!
//! All slots are allocated when the device is registered with the cache. A slot
//! is handed out by index and carries the bookkeeping for whatever chunk currently
//! occupies it: the events still in flight against its buffer and the pending
//! device-to-host copies that have to land in host memory before the slot is
//! reused.
//!
//! Victims are picked by recency of use, not of filling: a cache hit restamps
//! the slot, so a chunk reused by every job (a resident operand, say) outlives
//! chunks streamed past once after it was uploaded.

use std::fmt;

use tracing::{trace, warn};

use crate::backend::{wait_all, Backend, DeviceEvent};
use crate::error::Result;

use super::ObjectId;

/// Device-to-host copy of a chunk that has not been applied to host memory yet.
pub(crate) struct WriteBack<B: Backend> {
    /// Byte offset of the chunk within its object.
    pub offset: usize,
    pub readback: B::Readback,
}

/// Chunk held by an occupied slot.
pub(crate) struct Occupant<B: Backend> {
    pub object: ObjectId,
    pub chunk: usize,
    pub len: usize,
    /// Every event issued against the slot since it was filled.
    pub pending: Vec<B::Event>,
    pub write_backs: Vec<WriteBack<B>>,
}

impl<B: Backend> Occupant<B> {
    /// Add an event, dropping events that have already completed.
    pub fn push_event(&mut self, event: B::Event) {
        self.pending.retain(|e| !e.is_complete());
        self.pending.push(event);
    }

    /// Events that may still be running.
    pub fn incomplete(&self) -> Vec<B::Event> {
        self.pending
            .iter()
            .filter(|e| !e.is_complete())
            .cloned()
            .collect()
    }
}

pub(crate) enum SlotState<B: Backend> {
    Free,
    Occupied(Occupant<B>),
    /// Waiting for the previous occupant's events before the slot is reused.
    Draining,
}

/// Observable state of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Occupied { object: ObjectId, chunk: usize },
    Draining,
}

pub(crate) struct PoolSlot<B: Backend> {
    pub buffer: B::Buffer,
    pub state: SlotState<B>,
    /// Number of in-progress jobs using the slot. Pinned slots are never evicted.
    pub pins: usize,
    /// Sequence number of the last time the slot was filled or reused.
    pub last_used: u64,
}

impl<B: Backend> PoolSlot<B> {
    pub fn status(&self) -> SlotStatus {
        match &self.state {
            SlotState::Free => SlotStatus::Free,
            SlotState::Occupied(o) => SlotStatus::Occupied {
                object: o.object,
                chunk: o.chunk,
            },
            SlotState::Draining => SlotStatus::Draining,
        }
    }

    pub fn holds(&self, object: ObjectId, chunk: usize) -> bool {
        matches!(&self.state, SlotState::Occupied(o) if o.object == object && o.chunk == chunk)
    }

    pub fn occupant_mut(&mut self) -> Option<&mut Occupant<B>> {
        match &mut self.state {
            SlotState::Occupied(o) => Some(o),
            _ => None,
        }
    }

    pub fn occupied_len(&self) -> usize {
        match &self.state {
            SlotState::Occupied(o) => o.len,
            _ => 0,
        }
    }

    /// Wait for every event of the current occupant and hand back its write-backs.
    ///
    /// The slot is `Draining` while waiting and `Free` afterwards. On a device
    /// fault the slot is still freed; its write-backs are discarded.
    pub fn drain(&mut self) -> Result<Option<(ObjectId, Vec<WriteBack<B>>)>> {
        let occupant = match std::mem::replace(&mut self.state, SlotState::Draining) {
            SlotState::Occupied(o) => o,
            other => {
                self.state = other;
                return Ok(None);
            }
        };
        trace!(
            object = %occupant.object,
            chunk = occupant.chunk,
            pending = occupant.pending.len(),
            "Draining slot"
        );
        let outcome = wait_all(&occupant.pending);
        self.state = SlotState::Free;
        outcome?;
        Ok(Some((occupant.object, occupant.write_backs)))
    }

    /// Wait for the occupant's events without evicting it. Returns the
    /// write-backs collected so far.
    pub fn settle(&mut self) -> Result<Option<(ObjectId, Vec<WriteBack<B>>)>> {
        match &mut self.state {
            SlotState::Occupied(o) => {
                let pending = std::mem::take(&mut o.pending);
                wait_all(&pending)?;
                Ok(Some((o.object, std::mem::take(&mut o.write_backs))))
            }
            _ => Ok(None),
        }
    }
}

/// Slot pool of one registered device.
pub(crate) struct DevicePool<B: Backend> {
    pub context: B::Context,
    pub device: B::Device,
    pub pool_size: usize,
    pub slots: Vec<PoolSlot<B>>,
    /// Round-robin cursor over free slots.
    cursor: usize,
}

impl<B: Backend> DevicePool<B> {
    /// Allocate `slot_count` buffers of `buffer_size` bytes on `device`.
    pub fn allocate(
        backend: &B,
        context: B::Context,
        device: B::Device,
        pool_size: usize,
        buffer_size: usize,
        slot_count: usize,
    ) -> Result<Self> {
        let slots = (0..slot_count)
            .map(|_| {
                Ok(PoolSlot {
                    buffer: backend.create_buffer(&context, &device, buffer_size)?,
                    state: SlotState::Free,
                    pins: 0,
                    last_used: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            context,
            device,
            pool_size,
            slots,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slot currently holding `chunk` of `object`.
    pub fn find(&self, object: ObjectId, chunk: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.holds(object, chunk))
    }

    /// Next free slot in round-robin order.
    pub fn next_free(&mut self) -> Option<usize> {
        let n = self.slots.len();
        let found = (0..n)
            .map(|i| (self.cursor + i) % n)
            .find(|&i| matches!(self.slots[i].state, SlotState::Free))?;
        self.cursor = (found + 1) % n;
        Some(found)
    }

    /// Least recently used unpinned slot.
    pub fn victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pins == 0)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
    }

    pub fn occupied_bytes(&self) -> usize {
        self.slots.iter().map(|s| s.occupied_len()).sum()
    }
}

impl<B: Backend> Drop for DevicePool<B> {
    fn drop(&mut self) {
        // Buffers must outlive every command that references them.
        for slot in &self.slots {
            if let SlotState::Occupied(o) = &slot.state {
                if let Err(e) = wait_all(&o.pending) {
                    warn!(device = ?self.device, error = %e, "device fault while releasing pool");
                }
            }
        }
    }
}

impl<B: Backend> fmt::Debug for DevicePool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("device", &self.device)
            .field("pool_size", &self.pool_size)
            .field("slots", &self.slots.len())
            .finish()
    }
}
