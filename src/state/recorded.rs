//! Result type for persisted-record queries.
//!
//! This module provides the [`RecordedResult`] type for querying the status
//! of previously checkpointed operations during replay.

use crate::error::ErrorObject;
use crate::operation::{Operation, OperationKind, OperationStatus};

/// Result of looking up a persisted operation record.
///
/// Wraps the record (if any) behind accessors so mode resolution never
/// reaches into the manager's internal structures.
#[derive(Debug, Clone)]
pub struct RecordedResult {
    /// The operation record if it exists in the persisted state
    operation: Option<Operation>,
}

impl RecordedResult {
    /// Creates a new RecordedResult with the given record.
    pub fn new(operation: Option<Operation>) -> Self {
        Self { operation }
    }

    /// Creates an empty RecordedResult (no record exists).
    pub fn empty() -> Self {
        Self { operation: None }
    }

    /// Returns true if a record exists for this operation.
    pub fn is_existent(&self) -> bool {
        self.operation.is_some()
    }

    /// Returns true if the operation succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.status == OperationStatus::Succeeded)
            .unwrap_or(false)
    }

    /// Returns true if the operation failed.
    pub fn is_failed(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.status == OperationStatus::Failed)
            .unwrap_or(false)
    }

    /// Returns true if the operation is waiting for a scheduled retry.
    pub fn is_retrying(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.status == OperationStatus::Retrying)
            .unwrap_or(false)
    }

    /// Returns true if the operation is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.status.is_terminal())
            .unwrap_or(false)
    }

    /// Returns the recorded status, if the record exists.
    pub fn status(&self) -> Option<OperationStatus> {
        self.operation.as_ref().map(|op| op.status)
    }

    /// Returns the recorded operation kind, if the record exists.
    pub fn kind(&self) -> Option<OperationKind> {
        self.operation.as_ref().map(|op| op.kind)
    }

    /// Returns the serialized result if the operation succeeded with a
    /// trustworthy payload. A truncated result is withheld so replay
    /// re-executes instead of trusting a partial value.
    pub fn result(&self) -> Option<&str> {
        self.operation
            .as_ref()
            .filter(|op| !op.result_truncated)
            .and_then(|op| op.result.as_deref())
    }

    /// Returns true if the recorded result payload was truncated.
    pub fn is_result_truncated(&self) -> bool {
        self.operation
            .as_ref()
            .map(|op| op.result_truncated)
            .unwrap_or(false)
    }

    /// Returns the error if the operation failed.
    pub fn error(&self) -> Option<&ErrorObject> {
        self.operation.as_ref().and_then(|op| op.error.as_ref())
    }

    /// Returns the recorded attempt counter (0-indexed).
    pub fn attempt(&self) -> Option<u32> {
        self.operation.as_ref().and_then(|op| op.attempt)
    }

    /// Returns the scheduled retry/wait deadline, ms since epoch.
    pub fn next_attempt_ms(&self) -> Option<u64> {
        self.operation.as_ref().and_then(|op| op.next_attempt_ms)
    }

    /// Returns a reference to the underlying record.
    pub fn operation(&self) -> Option<&Operation> {
        self.operation.as_ref()
    }

    /// Consumes self and returns the underlying record.
    pub fn into_operation(self) -> Option<Operation> {
        self.operation
    }
}
