//! Cache and scheduler configuration.
//!
//! Both configs deserialize from JSON with every field optional, so a config file
//! only needs to name what it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StreamError};

/// Default pool slot capacity (16 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 << 20;

/// Default number of command queues per device (double buffering).
pub const DEFAULT_QUEUES_PER_DEVICE: usize = 2;

/// Buffer cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Capacity in bytes of one pool slot. Every device uses the same value so
    /// objects partition identically everywhere.
    pub buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(StreamError::Capacity(
                "buffer_size must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

/// How chunks are spread across the devices of a multi-device scheduler.
///
/// There is no default: a multi-device scheduler is always built with an
/// explicit policy. Chunks of one object run in offset order under every
/// policy; when consecutive chunks land on different devices the host waits
/// for the earlier kernel before launching the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DistributionPolicy {
    /// Chunk `i` of a job goes to device `i mod n`.
    RoundRobin,
    /// Every chunk goes to one device, so chunks never wait across devices.
    Pinned { device: usize },
    /// Devices receive chunks in proportion to their pool slot count.
    CapacityWeighted,
}

/// How chunks of the two operands of a binary job are paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Chunk `i` with chunk `i`. Both operands must have the same chunk count.
    Zip,
    /// Stream the first operand; the second stays resident.
    StreamFirst,
    /// Stream the second operand; the first stays resident.
    StreamSecond,
    /// Zip equal chunk counts, otherwise stream the operand with more chunks.
    #[default]
    Auto,
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub queues_per_device: usize,
    pub pairing: PairingPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queues_per_device: DEFAULT_QUEUES_PER_DEVICE,
            pairing: PairingPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queues_per_device == 0 {
            return Err(StreamError::Configuration(
                "queues_per_device must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Combined configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    /// Policy for multi-device runs. Absent unless the file names one.
    pub distribution: Option<DistributionPolicy>,
}

impl StreamConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(text)?;
        config.cache.validate()?;
        config.scheduler.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!(path = %path.display(), buffer_size = config.cache.buffer_size, "Loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.cache.buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.scheduler.queues_per_device, 2);
        assert_eq!(config.distribution, None);
        assert_eq!(config.scheduler.pairing, PairingPolicy::Auto);
    }

    #[test]
    fn test_partial_json() {
        let config = StreamConfig::from_json_str(
            r#"{"distribution": {"policy": "pinned", "device": 1}, "scheduler": {"pairing": "stream_first"}}"#,
        )
        .unwrap();
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.distribution, Some(DistributionPolicy::Pinned { device: 1 }));
        assert_eq!(config.scheduler.pairing, PairingPolicy::StreamFirst);
        assert_eq!(config.scheduler.queues_per_device, 2);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            StreamConfig::from_json_str(r#"{"cache": {"buffer_size": 0}}"#),
            Err(StreamError::Capacity(_))
        ));
        assert!(matches!(
            StreamConfig::from_json_str(r#"{"scheduler": {"queues_per_device": 0}}"#),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            StreamConfig::from_json_str(r#"{"cache": {"slots": 3}}"#),
            Err(StreamError::Json(_))
        ));
    }

    #[test]
    fn test_distribution_is_not_a_scheduler_field() {
        let nested = r#"{"scheduler": {"distribution": {"policy": "round_robin"}}}"#;
        assert!(matches!(
            StreamConfig::from_json_str(nested),
            Err(StreamError::Json(_))
        ));
        let config =
            StreamConfig::from_json_str(r#"{"distribution": {"policy": "capacity_weighted"}}"#)
                .unwrap();
        assert_eq!(config.distribution, Some(DistributionPolicy::CapacityWeighted));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache": {{"buffer_size": 4096}}}}"#).unwrap();
        let config = StreamConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache.buffer_size, 4096);
    }

    #[test]
    fn test_missing_file() {
        let result = StreamConfig::from_file(Path::new("/nonexistent/devstream.json"));
        assert!(matches!(result, Err(StreamError::Io(_))));
    }
}
