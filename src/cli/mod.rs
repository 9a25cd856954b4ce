//! Shared CLI utilities for the devstream binaries.

pub mod backend;

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;
use tracing::info;

use crate::config::DistributionPolicy;
use crate::error::{Result, StreamError};

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Bytes to stream. A mapped file stays mapped; every run copies what it
/// hands to the cache out of it and verifies against it.
#[derive(Debug)]
pub enum Input {
    Mapped(Mmap),
    Generated(Vec<u8>),
}

impl Deref for Input {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Input::Mapped(map) => map,
            Input::Generated(bytes) => bytes,
        }
    }
}

/// Load the bytes to stream: a memory-mapped file, or `synthetic` bytes of a
/// repeating ramp when no file is given.
pub fn load_input(file: Option<&Path>, synthetic: usize) -> Result<Input> {
    let Some(path) = file else {
        return Ok(Input::Generated(
            (0..synthetic).map(|i| (i % 251) as u8).collect(),
        ));
    };
    let file = File::open(path).map_err(|e| {
        StreamError::Configuration(format!("failed to open '{}': {}", path.display(), e))
    })?;
    // Zero-length files cannot be mapped.
    if file.metadata()?.len() == 0 {
        return Ok(Input::Generated(Vec::new()));
    }
    // SAFETY: the map is only read, and the file is not expected to change
    // while the binary runs.
    let map = unsafe { Mmap::map(&file)? };
    info!(path = %path.display(), bytes = map.len(), "Mapped input file");
    Ok(Input::Mapped(map))
}

/// Parse a distribution policy: `round-robin`, `capacity` or `pinned:N`.
pub fn parse_distribution(text: &str) -> std::result::Result<DistributionPolicy, String> {
    match text.trim() {
        "round-robin" | "round_robin" => Ok(DistributionPolicy::RoundRobin),
        "capacity" | "capacity-weighted" => Ok(DistributionPolicy::CapacityWeighted),
        other => {
            let index = other
                .strip_prefix("pinned:")
                .ok_or_else(|| format!("unknown distribution policy '{}'", other))?;
            let device = index
                .parse()
                .map_err(|_| format!("'{}' is not a device index", index))?;
            Ok(DistributionPolicy::Pinned { device })
        }
    }
}

/// Parse a byte size such as `4096`, `64K`, `16M` or `1G` (binary multiples).
pub fn parse_size(text: &str) -> std::result::Result<usize, String> {
    let text = text.trim();
    let (digits, shift) = match text.char_indices().last() {
        Some((i, 'k' | 'K')) => (&text[..i], 10),
        Some((i, 'm' | 'M')) => (&text[..i], 20),
        Some((i, 'g' | 'G')) => (&text[..i], 30),
        _ => (text, 0),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| format!("'{}' is not a byte size", text))?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| format!("'{}' overflows", text))
}
