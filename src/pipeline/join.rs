//! Nested-loop equi-join in three scheduler phases.
//!
//! Table A is streamed chunk by chunk against table B, which stays resident in
//! one slot. A is split into groups of `group_len` rows; every group gets its own
//! range of the output so groups can be materialized independently:
//!
//! 1. Count: matches per group into a device-side `counts` buffer.
//! 2. Prefix sum (after a barrier): exclusive sum of the counts into the
//!    `offsets` object. Its last entry is the output size.
//! 3. Materialize: once the host has read the output size, re-stream A and write
//!    every `(a_index, b_index)` pair at `offsets[group] + running count`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::backend::host::{
    HostBackend, HostBuffer, HostContext, HostDevice, HostEvent, HostQueue, DEFAULT_DEVICE_MEMORY,
};
use crate::backend::Backend;
use crate::buffer::{decode, encode, Element, ElementType, TypedBuffer};
use crate::cache::{AccessMode, BufferCache, CacheStats};
use crate::config::{CacheConfig, PairingPolicy, SchedulerConfig};
use crate::error::{Result, StreamError};
use crate::kernel::{BinaryKernel, UnaryKernel};
use crate::measurement::{Measurement, Recorder};
use crate::scheduler::{DeviceScheduler, SingleDeviceScheduler};

use super::prefix_sum::exclusive_prefix_sum;

const ROW: usize = std::mem::size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinConfig {
    /// Slot capacity in bytes; must hold a whole number of groups.
    pub buffer_size: usize,
    /// Rows of A per output group.
    pub group_len: usize,
    /// Slots in the device pool.
    pub slots: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            group_len: 256,
            slots: 8,
        }
    }
}

impl JoinConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_len == 0 {
            return Err(StreamError::Configuration("group_len must be nonzero".to_string()));
        }
        if self.buffer_size == 0 || self.buffer_size % (self.group_len * ROW) != 0 {
            return Err(StreamError::Configuration(format!(
                "buffer_size {} is not a multiple of a {}-row group",
                self.buffer_size, self.group_len
            )));
        }
        if self.slots < 2 {
            return Err(StreamError::Capacity(
                "the join needs a resident slot and a streaming slot".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutput {
    /// Matching `(a_index, b_index)` pairs, ordered by A then B.
    pub pairs: Vec<(u32, u32)>,
    /// Output offset of every group plus the total as the final entry.
    pub offsets: Vec<u32>,
    pub stats: CacheStats,
    pub measurements: Vec<Measurement>,
}

/// Runs the join on a simulated host device.
pub struct NestedLoopJoin {
    config: JoinConfig,
    backend: Arc<HostBackend>,
    device: HostDevice,
}

impl NestedLoopJoin {
    pub fn new(config: JoinConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend: Arc::new(HostBackend::new()),
            device: HostDevice::new("join", DEFAULT_DEVICE_MEMORY),
        })
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    fn scheduler(&self) -> Result<SingleDeviceScheduler<HostBackend>> {
        let cache_config = CacheConfig::with_buffer_size(self.config.buffer_size);
        let mut cache = BufferCache::new(Arc::clone(&self.backend), cache_config)?;
        let pool_size = self.config.slots * self.config.buffer_size;
        cache.add_device(HostContext, self.device.clone(), pool_size)?;

        let config = SchedulerConfig {
            pairing: PairingPolicy::StreamFirst,
            ..SchedulerConfig::default()
        };
        let mut scheduler = SingleDeviceScheduler::new(Arc::clone(&self.backend), config)?;
        scheduler.add_device(HostContext, self.device.clone())?;
        scheduler.add_buffer_cache(cache)?;
        Ok(scheduler)
    }

    fn zeroed(&self, queue: &HostQueue, count: usize) -> Result<TypedBuffer<HostBackend>> {
        let buffer = TypedBuffer::allocate(
            &*self.backend,
            &HostContext,
            &self.device,
            ElementType::U32,
            count,
        )?;
        buffer.write_from_host(&*self.backend, queue, &vec![0u32; count])?;
        Ok(buffer)
    }

    pub fn run(&self, a: &[u32], b: &[u32]) -> Result<JoinOutput> {
        let groups = a.len().div_ceil(self.config.group_len);
        let mut scheduler = self.scheduler()?;
        let io = self.backend.create_queue(&HostContext, &self.device)?;
        let recorder = Recorder::new();

        let cache = scheduler
            .cache_mut()
            .ok_or_else(|| StreamError::Configuration("scheduler lost its cache".to_string()))?;
        let table_a = cache.add_typed(a, AccessMode::ReadOnly)?;
        let table_b = cache.add_typed(b, AccessMode::ReadOnly)?;
        let offsets = cache.add_zeroed((groups + 1) * ROW, AccessMode::WriteOnly)?;

        let counts = self.zeroed(&io, groups)?;
        let carry = self.zeroed(&io, 1)?;
        let count = CountMatches {
            counts: counts.clone(),
            group_len: self.config.group_len,
        };
        let scan = ScanCounts {
            counts,
            carry,
            groups,
        };
        scheduler.enqueue_binary_with(count, table_a, table_b, &recorder)?;
        scheduler.enqueue_barrier()?;
        scheduler.enqueue_with(scan, offsets, &recorder)?;
        scheduler.run()?;

        let offsets = scheduler
            .cache_mut()
            .ok_or_else(|| StreamError::Configuration("scheduler lost its cache".to_string()))?
            .read_typed::<u32>(offsets)?;
        let total = offsets.last().copied().unwrap_or(0) as usize;
        debug!(groups, total, "Join output sized");

        let mut pairs = Vec::with_capacity(total);
        if total > 0 {
            let table = self.zeroed(&io, offsets.len())?;
            table.write_from_host(&*self.backend, &io, &offsets)?;
            let out = self.zeroed(&io, total * 2)?;
            let materialize = Materialize {
                offsets: table,
                out: out.clone(),
                group_len: self.config.group_len,
            };
            scheduler.enqueue_binary_with(materialize, table_a, table_b, &recorder)?;
            scheduler.finish()?;
            let flat = out.read_to_host::<u32>(&*self.backend, &io, &[])?;
            pairs.extend(flat.chunks_exact(2).map(|p| (p[0], p[1])));
        } else {
            scheduler.finish()?;
        }

        let stats = scheduler.cache().map(|c| c.stats()).unwrap_or_default();
        info!(
            rows_a = a.len(),
            rows_b = b.len(),
            pairs = pairs.len(),
            misses = stats.misses,
            "Join complete"
        );
        Ok(JoinOutput {
            pairs,
            offsets,
            stats,
            measurements: recorder.report()?,
        })
    }
}

/// Host reference: every `(i, j)` with `a[i] == b[j]`, ordered by `i` then `j`.
pub fn brute_force_join(a: &[u32], b: &[u32]) -> Vec<(u32, u32)> {
    a.iter()
        .enumerate()
        .flat_map(|(i, x)| {
            b.iter()
                .enumerate()
                .filter(move |(_, y)| *y == x)
                .map(move |(j, _)| (i as u32, j as u32))
        })
        .collect()
}

fn rows(buffer: &HostBuffer, size: usize) -> Result<Vec<u32>> {
    buffer.with_bytes(|bytes| decode::<u32>(&bytes[..size]))
}

/// Phase 1: matches of each group of the streamed A chunk against all of B.
struct CountMatches {
    counts: TypedBuffer<HostBackend>,
    group_len: usize,
}

impl BinaryKernel<HostBackend> for CountMatches {
    fn name(&self) -> &str {
        "join_count"
    }

    fn launch(
        &self,
        queue: &HostQueue,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &HostBuffer,
        buffer2: &HostBuffer,
    ) -> Result<HostEvent> {
        let (a, b) = (buffer1.clone(), buffer2.clone());
        let counts = self.counts.handle().clone();
        let group_len = self.group_len;
        queue.enqueue_task(&[], move || {
            let a = rows(&a, size1)?;
            let b = rows(&b, size2)?;
            let first = byte_offset / ROW / group_len;
            let local: Vec<u32> = a
                .chunks(group_len)
                .map(|group| {
                    group
                        .iter()
                        .map(|x| b.iter().filter(|&y| y == x).count() as u32)
                        .sum()
                })
                .collect();
            counts.with_bytes_mut(|bytes| {
                let at = first * ROW;
                bytes[at..at + local.len() * ROW].copy_from_slice(&encode(&local));
            });
            Ok(())
        })
    }
}

/// Phase 2: exclusive scan of the counts, one offsets chunk at a time. The
/// running carry lives in a one-element device buffer so consecutive chunks
/// continue where the previous one stopped.
struct ScanCounts {
    counts: TypedBuffer<HostBackend>,
    carry: TypedBuffer<HostBackend>,
    groups: usize,
}

impl UnaryKernel<HostBackend> for ScanCounts {
    fn name(&self) -> &str {
        "join_scan"
    }

    fn launch(
        &self,
        queue: &HostQueue,
        byte_offset: usize,
        size: usize,
        buffer: &HostBuffer,
    ) -> Result<HostEvent> {
        let out = buffer.clone();
        let counts = self.counts.handle().clone();
        let carry = self.carry.handle().clone();
        let groups = self.groups;
        queue.enqueue_task(&[], move || {
            let start = byte_offset / ROW;
            let end = start + size / ROW;
            // The slot past the last group receives the grand total.
            let values: Vec<u32> = counts.with_bytes(|bytes| {
                (start..end)
                    .map(|g| {
                        if g < groups {
                            u32::read_le(&bytes[g * ROW..(g + 1) * ROW])
                        } else {
                            0
                        }
                    })
                    .collect()
            });
            let (mut sums, total) = exclusive_prefix_sum(&values);
            let base = carry.with_bytes(|bytes| u32::read_le(&bytes[..ROW]));
            for sum in &mut sums {
                *sum = sum.wrapping_add(base);
            }
            out.with_bytes_mut(|bytes| bytes[..size].copy_from_slice(&encode(&sums)));
            carry.with_bytes_mut(|bytes| {
                bytes[..ROW].copy_from_slice(&base.wrapping_add(total).to_le_bytes())
            });
            Ok(())
        })
    }
}

/// Phase 3: write the pairs of each group into its output range.
struct Materialize {
    offsets: TypedBuffer<HostBackend>,
    out: TypedBuffer<HostBackend>,
    group_len: usize,
}

impl BinaryKernel<HostBackend> for Materialize {
    fn name(&self) -> &str {
        "join_materialize"
    }

    fn launch(
        &self,
        queue: &HostQueue,
        byte_offset: usize,
        size1: usize,
        size2: usize,
        buffer1: &HostBuffer,
        buffer2: &HostBuffer,
    ) -> Result<HostEvent> {
        let (a, b) = (buffer1.clone(), buffer2.clone());
        let offsets = self.offsets.handle().clone();
        let out = self.out.handle().clone();
        let group_len = self.group_len;
        queue.enqueue_task(&[], move || {
            let a = rows(&a, size1)?;
            let b = rows(&b, size2)?;
            let first_row = byte_offset / ROW;
            let first_group = first_row / group_len;
            let group_count = a.len().div_ceil(group_len);
            let starts = offsets.with_bytes(|bytes| {
                decode::<u32>(&bytes[first_group * ROW..(first_group + group_count) * ROW])
            })?;

            let mut written = Vec::new();
            for (g, group) in a.chunks(group_len).enumerate() {
                let mut pos = starts[g] as usize;
                for (k, x) in group.iter().enumerate() {
                    let i = (first_row + g * group_len + k) as u32;
                    for (j, _) in b.iter().enumerate().filter(|(_, y)| *y == x) {
                        written.push((pos, [i, j as u32]));
                        pos += 1;
                    }
                }
            }
            out.with_bytes_mut(|bytes| {
                for (pos, pair) in &written {
                    let at = pos * 2 * ROW;
                    bytes[at..at + 2 * ROW].copy_from_slice(&encode(pair));
                }
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Deterministic values in `0..=8`.
    fn table_a(n: usize) -> Vec<u32> {
        let mut state = 0x2545_f491u32;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state % 9
            })
            .collect()
    }

    fn config() -> JoinConfig {
        JoinConfig {
            buffer_size: 32,
            group_len: 4,
            slots: 4,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let misaligned = JoinConfig {
            buffer_size: 24,
            ..config()
        };
        assert!(matches!(misaligned.validate(), Err(StreamError::Configuration(_))));
        let cramped = JoinConfig {
            slots: 1,
            ..config()
        };
        assert!(matches!(cramped.validate(), Err(StreamError::Capacity(_))));
    }

    #[test]
    fn test_brute_force_join() {
        let pairs = brute_force_join(&[1, 2, 1], &[1, 3, 1]);
        assert_eq!(pairs, vec![(0, 0), (0, 2), (2, 0), (2, 2)]);
    }

    #[test]
    fn test_join_matches_reference() {
        let a = table_a(64);
        let b = vec![0, 3, 1, 0, 1, 2, 3, 4];
        let join = NestedLoopJoin::new(config()).unwrap();
        let output = join.run(&a, &b).unwrap();

        let expected = brute_force_join(&a, &b);
        let got: BTreeSet<_> = output.pairs.iter().copied().collect();
        assert_eq!(got, expected.iter().copied().collect::<BTreeSet<_>>());
        assert_eq!(output.pairs.len(), expected.len());
        assert_eq!(*output.offsets.last().unwrap() as usize, expected.len());

        // Every group's pairs sit inside its own offset range.
        for (pos, &(i, _)) in output.pairs.iter().enumerate() {
            let g = i as usize / 4;
            let range = output.offsets[g] as usize..output.offsets[g + 1] as usize;
            assert!(range.contains(&pos), "pair {} of row {} outside {:?}", pos, i, range);
        }
        assert_eq!(output.pairs, expected);
    }

    #[test]
    fn test_join_partial_last_group() {
        let a = table_a(19);
        let b = vec![5, 7, 5];
        let output = NestedLoopJoin::new(config()).unwrap().run(&a, &b).unwrap();
        assert_eq!(output.offsets.len(), 19usize.div_ceil(4) + 1);
        assert_eq!(output.pairs, brute_force_join(&a, &b));
    }

    #[test]
    fn test_join_without_matches() {
        let output = NestedLoopJoin::new(config())
            .unwrap()
            .run(&[1, 2, 3, 4, 5], &[9])
            .unwrap();
        assert!(output.pairs.is_empty());
        assert_eq!(output.offsets, vec![0, 0, 0]);
    }

    #[test]
    fn test_resident_table_must_fit_one_slot() {
        let b: Vec<u32> = (0..16).collect();
        let err = NestedLoopJoin::new(config()).unwrap().run(&[1, 2], &b);
        assert!(matches!(err, Err(StreamError::Capacity(_))));
    }

    #[test]
    fn test_measurements_cover_every_phase() {
        let a = table_a(32);
        let output = NestedLoopJoin::new(config())
            .unwrap()
            .run(&a, &[0, 1, 2])
            .unwrap();
        let kernels: BTreeSet<&str> = output
            .measurements
            .iter()
            .filter(|m| m.kind == "Kernel")
            .map(|m| m.name.as_str())
            .collect();
        assert!(kernels.contains("join_count"));
        assert!(kernels.contains("join_scan"));
        assert!(kernels.contains("join_materialize"));
    }
}
