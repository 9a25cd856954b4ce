pub mod backend;
pub mod buffer;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod kernel;
pub mod measurement;
pub mod pipeline;
pub mod scheduler;

pub use buffer::{Element, ElementType, TypedBuffer};
pub use cache::{AccessMode, BufferCache, ObjectId};
pub use config::{CacheConfig, SchedulerConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use kernel::{BinaryKernel, LaunchConfig, UnaryKernel};
pub use scheduler::{DeviceScheduler, MultiDeviceScheduler, SingleDeviceScheduler};
