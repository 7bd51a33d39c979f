//! # Durable Execution Engine
//!
//! This crate is the execution engine for durable workflows: long-running,
//! crash-recoverable programs that run on stateless compute. Every
//! side-effecting operation is checkpointed to an external store, so a
//! workflow can be interrupted at any point, re-invoked on a fresh host,
//! and resume exactly where it left off.
//!
//! ## Overview
//!
//! A durable workflow is an ordinary async Rust function built from durable
//! operations: [`step`] for units of side-effecting work, [`wait`] for
//! timed pauses, [`callback`] for external signals, [`child_context`] for
//! isolated sub-workflows, and [`fan_out`] for bounded-concurrency
//! processing of collections. Each operation gets a deterministic
//! hierarchical id from its position in the workflow; the id is the
//! replay key.
//!
//! On a fresh invocation the engine hydrates previously persisted
//! operation records from the [`CheckpointStore`] and starts in replay
//! mode: operations with a recorded terminal result return it instantly
//! without re-executing. The first operation with no record flips the
//! engine into execution mode and work proceeds live from there. When
//! every live operation is idle (waiting on a timer, a retry, or a
//! callback), the engine suspends the invocation entirely and hands
//! control back to the host, to be re-invoked when the awaited event
//! is due.
//!
//! ### Key Properties
//!
//! - **Checkpoint batching**: state updates queue locally and flush to the
//!   store in size-bounded batches, with at most one write in flight.
//! - **Replay**: recorded results are synthesized without re-running user
//!   code; replay-aware logging suppresses duplicate log output.
//! - **Suspension**: an invocation with only pending timers or callbacks
//!   terminates promptly instead of burning compute, with the most
//!   urgent pending reason reported to the host.
//! - **Retry policies**: steps retry with configurable geometric backoff,
//!   surviving host restarts mid-backoff via persisted attempt counters.
//! - **Fan-out**: collections process in parallel under a concurrency
//!   bound, with completion policies (minimum successes, tolerated
//!   failures) that can conclude a run before every item settles.
//!
//! ## Getting Started
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use durable_engine::{
//!     step, wait, EngineConfig, EngineError, ErrorObject, OperationContext,
//!     CheckpointManager, RetryPolicy, TerminationCoordinator,
//! };
//!
//! async fn process_order(order_id: String) -> Result<String, EngineError> {
//!     // Charge the card. Checkpointed: never re-runs on replay.
//!     let payment_id: String = step("charge-card", RetryPolicy::default(), move || {
//!         let order_id = order_id.clone();
//!         async move {
//!             charge(&order_id).await.map_err(|e| ErrorObject::from_message(e.to_string()))
//!         }
//!     })?
//!     .await?;
//!
//!     // Give the warehouse a day. The invocation suspends instead of
//!     // sleeping; a later invocation resumes past this point.
//!     wait(Duration::from_secs(24 * 60 * 60))?.await?;
//!
//!     Ok(payment_id)
//! }
//!
//! async fn invoke(manager: Arc<CheckpointManager>) -> Result<String, EngineError> {
//!     manager.hydrate().await?;
//!     OperationContext::root(manager)
//!         .scope(process_order("order-17".into()))
//!         .await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Operations and the two-phase protocol
//!
//! Constructing a durable operation registers it and begins its work
//! immediately; the returned [`DurableFuture`] settles when the work
//! completes and its result is durably acknowledged. Awaiting the future
//! is the second phase: it marks the caller's dependency on the result,
//! which is what makes the operation eligible to suspend the invocation
//! when it goes idle. A future that is never awaited still runs its work
//! and checkpoints its result.
//!
//! Operations must be awaited in the context that created them. Moving a
//! future into a different child context and awaiting it there is a
//! usage error that terminates the execution, because the operation's id
//! would no longer be reproducible on replay.
//!
//! ### Steps
//!
//! A [`step`] runs a closure producing a serializable result and
//! checkpoints the outcome. Failures retry per the [`RetryPolicy`], with
//! the attempt counter persisted so backoff schedules survive restarts:
//!
//! ```rust,ignore
//! let receipt: Receipt = step("send-invoice", RetryPolicy::with_max_attempts(5), || async {
//!     send_invoice().await.map_err(ErrorObject::from)
//! })?
//! .await?;
//! ```
//!
//! ### Waits
//!
//! A [`wait`] records its absolute deadline on first execution, so a
//! replayed invocation sleeps only the remaining time (or none at all):
//!
//! ```rust,ignore
//! wait(Duration::from_secs(300))?.await?;
//! ```
//!
//! ### Callbacks
//!
//! A [`callback`] settles when an external system writes a terminal
//! result for its operation id into the store. Until then it is an idle
//! operation and a candidate reason for suspending the invocation:
//!
//! ```rust,ignore
//! let approval: Approval = callback()?.await?;
//! ```
//!
//! ### Child contexts
//!
//! [`child_context`] runs a block of workflow logic as one composite
//! operation with its own id namespace. Once the block completes, its
//! terminal record stands in for the whole subtree on replay:
//!
//! ```rust,ignore
//! let summary: Summary = child_context(|| async {
//!     let a = step("fetch-a", RetryPolicy::none(), || async { .. })?.await?;
//!     let b = step("fetch-b", RetryPolicy::none(), || async { .. })?.await?;
//!     Ok(Summary { a, b })
//! })?
//! .await?;
//! ```
//!
//! ### Fan-out
//!
//! [`fan_out`] processes a collection in parallel, each item a durable
//! operation of its own. Concurrency is bounded and completion is
//! governed by a policy; a run can conclude before every item settles:
//!
//! ```rust,ignore
//! use durable_engine::{fan_out, CompletionConfig, FanOutConfig};
//!
//! let config = FanOutConfig::with_max_concurrency(5)
//!     .with_completion(CompletionConfig::tolerated_failure_count(2));
//! let batch = fan_out(order_ids, config, |index, order_id| async move {
//!     ship(&order_id).await.map_err(ErrorObject::from)
//! })
//! .await?;
//!
//! for receipt in batch.succeeded() {
//!     println!("shipped: {receipt:?}");
//! }
//! ```
//!
//! ### Completion Policies
//!
//! ```rust
//! use durable_engine::CompletionConfig;
//!
//! // Conclude as soon as one item succeeds
//! let first = CompletionConfig::first_successful();
//!
//! // Fail fast on the first failure, succeed when all complete (default)
//! let strict = CompletionConfig::all_completed();
//!
//! // Require at least 3 successes
//! let quorum = CompletionConfig::min_successful(3);
//!
//! // Absorb up to 10% item failures
//! let lenient = CompletionConfig::tolerated_failure_percentage(0.1);
//! ```
//!
//! ## Error Handling
//!
//! [`EngineError`] separates the failure domains:
//!
//! - **UserCode**: the workflow's own failures, carried as an
//!   [`ErrorObject`] and visible to workflow code for handling.
//! - **Execution**: infrastructure failures that terminate the execution
//!   without a host-level retry (a permanently rejected checkpoint).
//! - **Invocation**: infrastructure failures where re-invoking may
//!   succeed (store throttling, transient 5xx, an expired token).
//! - **Usage**: the workflow violated the engine's contract (awaiting a
//!   future in a foreign scope, calling an operation outside any scope).
//! - **NonDeterministic**: replay observed a different operation than the
//!   recorded one.
//! - **Suspend**: not a failure; the signal that the invocation should
//!   return control to the host.
//!
//! Termination is coordinated through the [`TerminationCoordinator`]: the
//! first classified failure or suspend decision wins, and every party
//! observing the terminating flag stops checkpointing.
//!
//! ## Logging
//!
//! The engine logs through the `tracing` crate. Workflow-level logging
//! can use [`ReplayAwareLogger`], which suppresses output while the
//! engine is replaying so resumed invocations do not duplicate the log
//! lines of their predecessors:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use durable_engine::{ReplayAwareLogger, TracingLogger};
//!
//! let logger = ReplayAwareLogger::new(Arc::new(TracingLogger));
//! ```
//!
//! ## Custom Serialization
//!
//! Results serialize as JSON by default via [`JsonSerDes`]. Implement the
//! [`SerDes`] trait to use a different encoding for a result type.
//!
//! ## Thread Safety
//!
//! The engine is built for Tokio. [`CheckpointManager`] is shared behind
//! an `Arc` across every operation driver; operation id generation uses
//! atomic counters; the ambient [`OperationContext`] propagates through
//! task-local storage so nested operations need no explicit handle.
//!
//! ## Module Organization
//!
//! - [`concurrency`]: fan-out execution, batch results, completion policies
//! - [`config`]: engine, retry, and fan-out configuration
//! - [`context`]: ambient operation scope, id generation, logging
//! - [`error`]: error taxonomy and termination reasons
//! - [`future`]: the durable operations and the two-phase future
//! - [`operation`]: operation records, lifecycle states, update builders
//! - [`serdes`]: result serialization
//! - [`state`]: the checkpoint manager - batching, replay, suspension
//! - [`store`]: the checkpoint store trait, wire types, test double
//! - [`termination`]: invocation termination coordination
//! - [`types`]: identifier newtypes

pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod future;
pub mod operation;
pub mod serdes;
pub mod state;
pub mod store;
pub mod termination;
pub mod types;

// Re-export main types at crate root
pub use concurrency::{
    fan_out, BatchItem, BatchItemStatus, BatchResult, CompletionReason, FanOutSummary,
};
pub use config::{CompletionConfig, EngineConfig, FanOutConfig, RetryPolicy};
pub use context::{
    LogInfo, LogLevel, Logger, OperationContext, ReplayAwareLogger, TracingLogger,
};
pub use error::{EngineError, ErrorObject, TerminationReason};
pub use future::{callback, child_context, step, wait, DurableFuture};
pub use operation::{
    LifecycleState, Operation, OperationAction, OperationKind, OperationStatus, OperationUpdate,
    StateMetadata, WireOperationUpdate,
};
pub use serdes::{JsonSerDes, SerDes, SerDesContext, SerDesError};
pub use state::{CheckpointManager, ExecutionMode, RecordedResult, WriteHandle};
pub use store::{
    CheckpointRequest, CheckpointResponse, CheckpointStore, MockCheckpointStore,
    SharedCheckpointStore, StateSnapshot, StoreError, StoreErrorClass,
};
pub use termination::{CleanupAction, TerminationCoordinator, TerminationDetails};
pub use types::{CheckpointToken, ExecutionId, HashedOperationId, OperationId};
