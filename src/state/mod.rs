//! Operation state tracking for durable executions.
//!
//! The submodules split the concern the way the data flows: [`mode`] tracks
//! the replay/execution flip, [`recorded`] wraps persisted-record lookups,
//! [`queue`] holds the write-batching primitives, and [`manager`] ties them
//! together behind the per-invocation [`CheckpointManager`].

mod manager;
mod mode;
mod queue;
mod recorded;

pub use manager::CheckpointManager;
pub use mode::ExecutionMode;
pub use queue::WriteHandle;
pub use recorded::RecordedResult;

#[cfg(test)]
mod tests;
