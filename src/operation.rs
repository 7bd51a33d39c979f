//! Operation types for the durable execution engine.
//!
//! This module defines the unit of checkpointed work: the persisted
//! [`Operation`] record, the [`OperationUpdate`] sent to the store, and the
//! in-memory [`LifecycleState`] tracked by the checkpoint manager. The
//! persisted shape uses hashed operation ids; all in-memory bookkeeping uses
//! the hierarchical form.

use serde::{Deserialize, Serialize};

use crate::error::ErrorObject;
use crate::types::{HashedOperationId, OperationId};

/// Represents a checkpointed operation as the store records it.
///
/// Operations are the fundamental unit of state in durable executions.
/// Each operation has a unique hashed ID and tracks its kind, status, and
/// result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Hashed identifier for this operation
    #[serde(rename = "OperationId")]
    pub operation_id: HashedOperationId,

    /// The kind of operation (Step, Wait, etc.)
    #[serde(rename = "OperationKind")]
    pub kind: OperationKind,

    /// Current status of the operation
    #[serde(rename = "Status")]
    pub status: OperationStatus,

    /// Serialized result if the operation succeeded
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error details if the operation failed
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Parent operation ID for nested operations
    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<HashedOperationId>,

    /// Optional human-readable name for the operation
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Milliseconds since epoch when the operation started
    #[serde(rename = "StartTimestamp", skip_serializing_if = "Option::is_none")]
    pub start_timestamp_ms: Option<u64>,

    /// Scheduled retry or wait deadline, milliseconds since epoch
    #[serde(rename = "NextAttemptTimestamp", skip_serializing_if = "Option::is_none")]
    pub next_attempt_ms: Option<u64>,

    /// Attempt counter for retried operations (0-indexed)
    #[serde(rename = "Attempt", skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// True if the result payload was dropped for exceeding the size
    /// threshold; replay must re-execute rather than trust it.
    #[serde(rename = "ResultTruncated", default, skip_serializing_if = "std::ops::Not::not")]
    pub result_truncated: bool,
}

impl Operation {
    /// Creates a new Operation record with the given hashed ID and kind.
    pub fn new(operation_id: HashedOperationId, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Started,
            result: None,
            error: None,
            parent_id: None,
            name: None,
            start_timestamp_ms: None,
            next_attempt_ms: None,
            attempt: None,
            result_truncated: false,
        }
    }

    /// Sets the parent ID for this operation.
    pub fn with_parent_id(mut self, parent_id: HashedOperationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the name for this operation.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns true if the operation has reached a terminal store status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the operation succeeded.
    pub fn is_succeeded(&self) -> bool {
        matches!(self.status, OperationStatus::Succeeded)
    }

    /// Returns true if the operation failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, OperationStatus::Failed)
    }
}

/// The kind of operation in a durable execution.
///
/// Metadata specific to one kind (a wait's deadline, a fan-out item's index)
/// lives on the operation record itself; the lifecycle manager switches on
/// this tag explicitly rather than dispatching through trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// The root execution context
    Execution,
    /// A step operation (unit of side-effecting work)
    Step,
    /// A timed pause
    Wait,
    /// A nested child context (sub-workflow)
    ChildContext,
    /// The container operation of a fan-out (map/parallel) run
    FanOut,
    /// One item of a fan-out (map/parallel) run
    FanOutItem,
    /// An operation waiting on an external callback signal
    Callback,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "Execution"),
            Self::Step => write!(f, "Step"),
            Self::Wait => write!(f, "Wait"),
            Self::ChildContext => write!(f, "ChildContext"),
            Self::FanOut => write!(f, "FanOut"),
            Self::FanOutItem => write!(f, "FanOutItem"),
            Self::Callback => write!(f, "Callback"),
        }
    }
}

/// The status of an operation as the store records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Operation has started but not completed
    Started,
    /// Operation is waiting for a scheduled retry attempt
    Retrying,
    /// Operation completed successfully
    Succeeded,
    /// Operation failed with an error
    Failed,
}

impl OperationStatus {
    /// Returns true if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Retrying => write!(f, "Retrying"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// In-memory lifecycle state of an operation within one invocation.
///
/// `IdleNotAwaited -> IdleAwaited` once the caller depends on the result;
/// `Executing -> Completed` on settlement, or `RetryWaiting -> Executing`
/// when a retry timer fires. An operation that never leaves
/// `IdleNotAwaited` can be abandoned on suspension without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, no caller depends on the result yet
    IdleNotAwaited,
    /// A caller depends on the result
    IdleAwaited,
    /// Work is in progress in this invocation
    Executing,
    /// Waiting for a scheduled retry attempt
    RetryWaiting,
    /// Terminal: the operation settled
    Completed,
}

impl LifecycleState {
    /// Returns true if the operation is idle (no work running).
    pub fn is_idle(&self) -> bool {
        !matches!(self, Self::Executing)
    }

    /// Returns true if this is the terminal lifecycle state.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Metadata required the first time an operation is registered.
///
/// `mark_state` fails with a usage error when the operation is unknown and
/// no metadata was supplied.
#[derive(Debug, Clone)]
pub struct StateMetadata {
    /// The kind of the new operation
    pub kind: OperationKind,
    /// Scheduled end for wait operations, milliseconds since epoch
    pub scheduled_end_ms: Option<u64>,
}

impl StateMetadata {
    /// Creates metadata for a new operation of the given kind.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            scheduled_end_ms: None,
        }
    }

    /// Sets the scheduled end timestamp.
    pub fn with_scheduled_end(mut self, scheduled_end_ms: u64) -> Self {
        self.scheduled_end_ms = Some(scheduled_end_ms);
        self
    }
}

/// Action to perform on an operation during checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationAction {
    /// Start a new operation
    Start,
    /// Mark operation as succeeded
    Succeed,
    /// Mark operation as failed
    Fail,
    /// Schedule a future retry attempt
    Retry,
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Succeed => write!(f, "Succeed"),
            Self::Fail => write!(f, "Fail"),
            Self::Retry => write!(f, "Retry"),
        }
    }
}

/// A partial update to be checkpointed for an operation.
///
/// Updates are built with the hierarchical id and hashed only when the
/// serialized batch is assembled, so the queue and pruning logic can walk
/// parent chains.
#[derive(Debug, Clone)]
pub struct OperationUpdate {
    /// Hierarchical identifier of the operation
    pub operation_id: OperationId,

    /// The action to perform
    pub action: OperationAction,

    /// The kind of operation
    pub kind: OperationKind,

    /// Serialized result payload if succeeding
    pub payload: Option<String>,

    /// Error details if failing
    pub error: Option<ErrorObject>,

    /// Hierarchical id of the parent operation
    pub parent_id: Option<OperationId>,

    /// Optional human-readable name
    pub name: Option<String>,

    /// Scheduled wait deadline or next retry attempt, ms since epoch
    pub next_attempt_ms: Option<u64>,

    /// Attempt counter for Retry actions
    pub attempt: Option<u32>,

    /// True if the payload was dropped for exceeding the size threshold
    pub payload_truncated: bool,
}

impl OperationUpdate {
    /// Creates a new OperationUpdate to start an operation.
    pub fn start(operation_id: OperationId, kind: OperationKind) -> Self {
        Self {
            operation_id,
            action: OperationAction::Start,
            kind,
            payload: None,
            error: None,
            parent_id: None,
            name: None,
            next_attempt_ms: None,
            attempt: None,
            payload_truncated: false,
        }
    }

    /// Creates a new OperationUpdate to mark an operation as succeeded.
    pub fn succeed(operation_id: OperationId, kind: OperationKind, payload: Option<String>) -> Self {
        Self {
            operation_id,
            action: OperationAction::Succeed,
            kind,
            payload,
            error: None,
            parent_id: None,
            name: None,
            next_attempt_ms: None,
            attempt: None,
            payload_truncated: false,
        }
    }

    /// Creates a new OperationUpdate to mark an operation as failed.
    pub fn fail(operation_id: OperationId, kind: OperationKind, error: ErrorObject) -> Self {
        Self {
            operation_id,
            action: OperationAction::Fail,
            kind,
            payload: None,
            error: Some(error),
            parent_id: None,
            name: None,
            next_attempt_ms: None,
            attempt: None,
            payload_truncated: false,
        }
    }

    /// Creates a new OperationUpdate scheduling a retry attempt.
    pub fn retry(
        operation_id: OperationId,
        kind: OperationKind,
        attempt: u32,
        next_attempt_ms: u64,
    ) -> Self {
        Self {
            operation_id,
            action: OperationAction::Retry,
            kind,
            payload: None,
            error: None,
            parent_id: None,
            name: None,
            next_attempt_ms: Some(next_attempt_ms),
            attempt: Some(attempt),
            payload_truncated: false,
        }
    }

    /// Sets the parent ID for this operation update.
    pub fn with_parent_id(mut self, parent_id: OperationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Sets the name for this operation update.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the scheduled end timestamp (wait deadlines).
    pub fn with_next_attempt(mut self, next_attempt_ms: u64) -> Self {
        self.next_attempt_ms = Some(next_attempt_ms);
        self
    }

    /// Returns true if this update carries a terminal action.
    pub fn is_completion(&self) -> bool {
        matches!(self.action, OperationAction::Succeed | OperationAction::Fail)
    }

    /// Converts into the wire shape with hashed identifiers.
    pub fn into_wire(self) -> WireOperationUpdate {
        WireOperationUpdate {
            operation_id: self.operation_id.hashed(),
            action: self.action,
            kind: self.kind,
            payload: self.payload,
            error: self.error,
            parent_id: self.parent_id.map(|p| p.hashed()),
            name: self.name,
            next_attempt_ms: self.next_attempt_ms,
            attempt: self.attempt,
            payload_truncated: self.payload_truncated,
        }
    }
}

/// The wire form of an [`OperationUpdate`], with hashed identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOperationUpdate {
    /// Hashed identifier of the operation
    #[serde(rename = "OperationId")]
    pub operation_id: HashedOperationId,

    /// The action to perform
    #[serde(rename = "Action")]
    pub action: OperationAction,

    /// The kind of operation
    #[serde(rename = "OperationKind")]
    pub kind: OperationKind,

    /// Serialized result payload if succeeding
    #[serde(rename = "Payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Error details if failing
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    /// Hashed parent operation id
    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<HashedOperationId>,

    /// Optional human-readable name
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Scheduled wait deadline or next retry attempt, ms since epoch
    #[serde(rename = "NextAttemptTimestamp", skip_serializing_if = "Option::is_none")]
    pub next_attempt_ms: Option<u64>,

    /// Attempt counter for Retry actions
    #[serde(rename = "Attempt", skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// True if the payload was dropped for exceeding the size threshold
    #[serde(rename = "PayloadTruncated", default, skip_serializing_if = "std::ops::Not::not")]
    pub payload_truncated: bool,
}
