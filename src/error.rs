//! Error types for the durable execution engine.
//!
//! The engine distinguishes five failure categories: usage errors (context
//! misuse, always fatal), execution-fatal store errors, invocation-retryable
//! store errors, user code failures (the only category visible to workflow
//! code), and bounded queue-drain timeouts. Infrastructure categories are
//! routed to the termination coordinator and never surface as errors on
//! workflow-visible futures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for the durable execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal workflow error: the execution ends permanently, no host retry.
    #[error("Execution error: {message}")]
    Execution {
        /// Error message describing what went wrong
        message: String,
        /// The reason for termination
        termination_reason: TerminationReason,
    },

    /// Invocation error: this invocation attempt ends, the host retries
    /// the whole invocation with fresh state.
    #[error("Invocation error: {message}")]
    Invocation {
        /// Error message describing what went wrong
        message: String,
        /// The reason for termination
        termination_reason: TerminationReason,
    },

    /// Misuse of the engine API, e.g. nesting operations under the wrong
    /// parent context. Always fatal.
    #[error("Usage error: {message}")]
    Usage {
        /// Error message describing the misuse
        message: String,
    },

    /// Non-deterministic execution error for replay mismatches.
    #[error("Non-deterministic execution: {message}")]
    NonDeterministic {
        /// Error message describing the mismatch
        message: String,
        /// The operation ID where the mismatch occurred
        operation_id: Option<String>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Error message describing the serialization failure
        message: String,
    },

    /// The bounded wait for the checkpoint queue to drain timed out.
    #[error("Checkpoint queue drain timed out after {waited_ms}ms")]
    QueueDrainTimeout {
        /// How long the drain was awaited before giving up
        waited_ms: u64,
    },

    /// Suspend signal: the invocation returns control to the host while
    /// durable state is preserved for a future resumption. Not a failure.
    #[error("Suspend execution")]
    Suspend,

    /// User code error wrapping failures from user-provided closures.
    ///
    /// This is the only error category that workflow code observes as an
    /// ordinary error return from an operation.
    #[error("User code error: {0}")]
    UserCode(ErrorObject),
}

impl EngineError {
    /// Creates a new fatal Execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            termination_reason: TerminationReason::ExecutionError,
        }
    }

    /// Creates a new Invocation error.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation {
            message: message.into(),
            termination_reason: TerminationReason::InvocationError,
        }
    }

    /// Creates a new Usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Creates a new NonDeterministic error for a replay mismatch at the
    /// given operation.
    pub fn non_deterministic(
        message: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self::NonDeterministic {
            message: message.into(),
            operation_id: Some(operation_id.into()),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates a new user code error from an error object.
    pub fn user_code(error: ErrorObject) -> Self {
        Self::UserCode(error)
    }

    /// Returns true if this is a Suspend signal.
    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend)
    }

    /// Returns true if this is a user code failure, the only category that
    /// propagates into workflow code.
    pub fn is_user_code(&self) -> bool {
        matches!(self, Self::UserCode(_))
    }
}

/// Reason carried by a termination request.
///
/// The first three variants are the prioritized suspend reasons chosen by
/// the checkpoint manager when every operation has gone idle; the rest
/// describe failure terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TerminationReason {
    /// An operation is waiting for a scheduled retry attempt
    RetryPending,
    /// An awaited wait operation has not reached its scheduled end
    WaitPending,
    /// An awaited callback has not been delivered yet
    CallbackPending,
    /// Unhandled error in user code
    #[default]
    UnhandledError,
    /// This invocation attempt failed; the host should re-invoke
    InvocationError,
    /// The execution failed permanently
    ExecutionError,
    /// A checkpoint write was rejected with a non-retryable error
    CheckpointFailed,
    /// Non-deterministic execution detected during replay
    NonDeterministicExecution,
    /// The engine API was misused
    UsageError,
    /// The workflow function returned successfully
    Completed,
}

impl TerminationReason {
    /// Suspend priority: lower wins. Only meaningful for the pending
    /// variants; failure reasons preempt the cooldown entirely.
    pub fn suspend_priority(&self) -> u8 {
        match self {
            Self::RetryPending => 0,
            Self::WaitPending => 1,
            Self::CallbackPending => 2,
            _ => u8::MAX,
        }
    }
}

/// Error object in the persisted/wire shape.
///
/// Any user failure is normalized into this shape before checkpointing:
/// a typed error keeps its type name and message, anything else is
/// stringified into the message with a generic type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type/name
    #[serde(rename = "ErrorType")]
    pub error_type: String,
    /// The error message
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    /// Optional stack trace
    #[serde(rename = "StackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    /// Normalizes an arbitrary displayable value into an error object.
    pub fn from_message(message: impl std::fmt::Display) -> Self {
        Self::new("Error", message.to_string())
    }

    /// Creates a new ErrorObject with a stack trace.
    pub fn with_stack_trace(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Some(stack_trace.into()),
        }
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl From<&EngineError> for ErrorObject {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::Execution { message, .. } => ErrorObject::new("ExecutionError", message),
            EngineError::Invocation { message, .. } => ErrorObject::new("InvocationError", message),
            EngineError::Usage { message } => ErrorObject::new("UsageError", message),
            EngineError::NonDeterministic { message, .. } => {
                ErrorObject::new("NonDeterministicExecutionError", message)
            }
            EngineError::SerDes { message } => ErrorObject::new("SerDesError", message),
            EngineError::QueueDrainTimeout { waited_ms } => ErrorObject::new(
                "QueueDrainTimeout",
                format!("checkpoint queue drain timed out after {}ms", waited_ms),
            ),
            EngineError::Suspend => ErrorObject::new("SuspendExecution", "Execution suspended"),
            EngineError::UserCode(obj) => obj.clone(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for EngineError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::UserCode(ErrorObject::from_message(error))
    }
}
