//! Checkpoint store interface for the durable execution engine.
//!
//! This module defines the [`CheckpointStore`] trait abstracting the backend
//! that durably records operation state, the request/response wire types, and
//! the classification of store failures into the engine's error taxonomy.
//! The network transport behind the trait is an external collaborator; the
//! only implementation shipped here is [`MockCheckpointStore`] for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TerminationReason;
use crate::operation::{Operation, WireOperationUpdate};
use crate::types::{CheckpointToken, ExecutionId, HashedOperationId};

/// An error returned by the checkpoint store.
#[derive(Debug, Clone)]
pub struct StoreError {
    /// Transport status code, if one was received
    pub status: Option<u16>,
    /// Error name reported by the store (e.g. "InvalidParameterValueException")
    pub name: Option<String>,
    /// Human-readable error message
    pub message: String,
}

impl StoreError {
    /// Creates a store error with a status code and error name.
    pub fn new(status: u16, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            name: Some(name.into()),
            message: message.into(),
        }
    }

    /// Creates an unclassified transport error with no status code.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            name: None,
            message: message.into(),
        }
    }

    /// Returns true for a throttling response eligible for in-flush retry.
    pub fn is_throttle(&self) -> bool {
        self.status == Some(429)
            || self
                .name
                .as_deref()
                .is_some_and(|n| n.contains("ThrottlingException"))
    }

    /// Returns true for the invalid/expired checkpoint token rejection.
    ///
    /// The store reports this as a 400 InvalidParameterValueException, but
    /// it means the whole invocation should be retried with fresh state,
    /// not that the workflow is broken.
    pub fn is_invalid_token(&self) -> bool {
        self.status == Some(400)
            && self
                .name
                .as_deref()
                .is_some_and(|n| n.contains("InvalidParameterValueException"))
            && self.message.to_lowercase().contains("invalid checkpoint token")
    }

    /// Classifies this error into the engine's failure taxonomy.
    ///
    /// 4xx responses are fatal to the workflow, except throttling (429) and
    /// the invalid-token 400, which are retryable at the invocation layer.
    /// 5xx and unclassified transport errors are also invocation-retryable.
    pub fn classify(&self) -> StoreErrorClass {
        if self.is_throttle() || self.is_invalid_token() {
            return StoreErrorClass::InvocationRetryable;
        }
        match self.status {
            Some(code) if (400..500).contains(&code) => StoreErrorClass::ExecutionFatal,
            _ => StoreErrorClass::InvocationRetryable,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, self.name.as_deref()) {
            (Some(status), Some(name)) => {
                write!(f, "store error {} {}: {}", status, name, self.message)
            }
            (Some(status), None) => write!(f, "store error {}: {}", status, self.message),
            _ => write!(f, "store transport error: {}", self.message),
        }
    }
}

impl std::error::Error for StoreError {}

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorClass {
    /// The workflow terminates permanently.
    ExecutionFatal,
    /// This invocation attempt ends; the host retries with fresh state.
    InvocationRetryable,
}

impl StoreErrorClass {
    /// Maps the classification to the termination reason it produces.
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            Self::ExecutionFatal => TerminationReason::CheckpointFailed,
            Self::InvocationRetryable => TerminationReason::InvocationError,
        }
    }
}

/// A batch of operation updates sent to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequest {
    /// The execution these updates belong to
    #[serde(rename = "ExecutionId")]
    pub execution_id: ExecutionId,

    /// The updates, in invocation order
    #[serde(rename = "Updates")]
    pub updates: Vec<WireOperationUpdate>,
}

/// Response from a checkpoint call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointResponse {
    /// The fresh token to use for the next checkpoint
    #[serde(rename = "CheckpointToken")]
    pub checkpoint_token: CheckpointToken,

    /// Optionally piggy-backed refreshed operation state. Acknowledged
    /// store state supersedes the local cache for these ids.
    #[serde(rename = "NewState", skip_serializing_if = "Option::is_none", default)]
    pub new_state: Option<StateSnapshot>,
}

impl CheckpointResponse {
    /// Creates a response carrying only a fresh token.
    pub fn new(checkpoint_token: impl Into<CheckpointToken>) -> Self {
        Self {
            checkpoint_token: checkpoint_token.into(),
            new_state: None,
        }
    }
}

/// One page of persisted execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The persisted operation records
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,

    /// Token for the next page of results, if any
    #[serde(rename = "NextPageToken", skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl StateSnapshot {
    /// Finds an operation record by its hashed id.
    pub fn find_operation(&self, operation_id: &HashedOperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.operation_id == operation_id)
    }
}

/// Trait for communicating with the checkpoint store.
///
/// Implementations own the transport; the engine guarantees it never issues
/// more than one `checkpoint` call at a time.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieves one page of persisted execution state.
    ///
    /// Pass the page token from the previous response to continue; `None`
    /// starts from the beginning.
    async fn get_state(
        &self,
        token: &CheckpointToken,
        page_token: Option<&str>,
    ) -> Result<StateSnapshot, StoreError>;

    /// Writes a batch of operation updates.
    ///
    /// Returns a fresh checkpoint token which must replace `token` before
    /// the next write.
    async fn checkpoint(
        &self,
        token: &CheckpointToken,
        request: CheckpointRequest,
    ) -> Result<CheckpointResponse, StoreError>;
}

/// Type alias for a shared CheckpointStore.
pub type SharedCheckpointStore = std::sync::Arc<dyn CheckpointStore>;

/// A mock checkpoint store for tests.
///
/// Responses are consumed in FIFO order; when the queue is empty a
/// successful default is returned. Every checkpoint request is recorded
/// for later inspection, along with the token it was presented with and
/// the highest number of simultaneously in-flight calls observed.
#[derive(Default)]
pub struct MockCheckpointStore {
    checkpoint_responses: Mutex<Vec<Result<CheckpointResponse, StoreError>>>,
    get_state_responses: Mutex<Vec<Result<StateSnapshot, StoreError>>>,
    recorded_requests: Mutex<Vec<(CheckpointToken, CheckpointRequest)>>,
    latency: Option<Duration>,
    token_counter: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockCheckpointStore {
    /// Creates a mock store that acknowledges everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a checkpoint response.
    pub fn with_checkpoint_response(self, response: Result<CheckpointResponse, StoreError>) -> Self {
        {
            let mut responses = self.checkpoint_responses.lock().unwrap();
            responses.push(response);
        }
        self
    }

    /// Queues a get_state response.
    pub fn with_get_state_response(self, response: Result<StateSnapshot, StoreError>) -> Self {
        {
            let mut responses = self.get_state_responses.lock().unwrap();
            responses.push(response);
        }
        self
    }

    /// Adds an artificial delay to every call, widening the window in which
    /// overlapping writes would be observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns every recorded checkpoint request with its token.
    pub fn recorded_requests(&self) -> Vec<(CheckpointToken, CheckpointRequest)> {
        self.recorded_requests.lock().unwrap().clone()
    }

    /// Returns the total number of checkpoint calls received.
    pub fn checkpoint_calls(&self) -> usize {
        self.recorded_requests.lock().unwrap().len()
    }

    /// Returns the highest number of simultaneously in-flight checkpoint
    /// calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MockCheckpointStore {
    async fn get_state(
        &self,
        _token: &CheckpointToken,
        _page_token: Option<&str>,
    ) -> Result<StateSnapshot, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut responses = self.get_state_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(StateSnapshot {
                operations: Vec::new(),
                next_page_token: None,
            })
        } else {
            responses.remove(0)
        }
    }

    async fn checkpoint(
        &self,
        token: &CheckpointToken,
        request: CheckpointRequest,
    ) -> Result<CheckpointResponse, StoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.recorded_requests
            .lock()
            .unwrap()
            .push((token.clone(), request));

        let response = {
            let mut responses = self.checkpoint_responses.lock().unwrap();
            if responses.is_empty() {
                let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
                Ok(CheckpointResponse::new(format!("mock-token-{}", n)))
            } else {
                responses.remove(0)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}
