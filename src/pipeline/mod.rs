//! Multi-phase pipelines composed from scheduler jobs.
//!
//! [`join::NestedLoopJoin`] chains a count phase, a barrier, a prefix-sum phase
//! and a materialize phase whose output size is only known on the host after
//! the prefix sum has drained.

pub mod join;
pub mod prefix_sum;

pub use join::{brute_force_join, JoinConfig, JoinOutput, NestedLoopJoin};
pub use prefix_sum::exclusive_prefix_sum;
