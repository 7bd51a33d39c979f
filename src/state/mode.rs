//! Replay/execution mode tracking for durable executions.
//!
//! This module provides the [`ExecutionMode`] enum for tracking whether the
//! invocation is replaying previously checkpointed operations or executing
//! new ones. The flip from Replay to Execution is one-way: once the first
//! not-yet-recorded operation is encountered, everything after it executes
//! for real.

/// Execution mode indicating whether we're replaying or executing new operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Currently replaying previously checkpointed operations
    Replay = 0,
    /// Executing new operations (past the replay point)
    Execution = 1,
}

impl ExecutionMode {
    /// Returns true if currently in replay mode.
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay)
    }

    /// Returns true if executing new operations.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution)
    }
}

impl From<u8> for ExecutionMode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Replay,
            _ => Self::Execution,
        }
    }
}

impl From<ExecutionMode> for u8 {
    fn from(mode: ExecutionMode) -> Self {
        mode as u8
    }
}
