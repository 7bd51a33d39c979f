//! Ambient operation context and replay-aware logging.
//!
//! Every workflow body runs inside a task-local [`OperationContext`] that
//! carries the enclosing operation id, the per-invocation checkpoint
//! manager, and the deterministic child ordinal counter. Child ids are
//! assigned by position: the Nth operation created inside a scope gets the
//! same id on every invocation, which is what lets replay match live
//! operations to persisted records without user-supplied keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::state::CheckpointManager;
use crate::types::OperationId;

tokio::task_local! {
    static CONTEXT: OperationContext;
}

/// The ambient context of one workflow scope.
///
/// Cloning is cheap; clones share the child counter, so ids stay unique
/// even when a scope hands its context to spawned work.
#[derive(Clone)]
pub struct OperationContext {
    operation_id: OperationId,
    manager: Arc<CheckpointManager>,
    child_counter: Arc<AtomicU64>,
}

impl OperationContext {
    /// Creates the root context for an invocation.
    pub fn root(manager: Arc<CheckpointManager>) -> Self {
        Self::for_operation(manager, OperationId::root())
    }

    /// Creates a context scoped to the given operation.
    pub fn for_operation(manager: Arc<CheckpointManager>, operation_id: OperationId) -> Self {
        Self {
            operation_id,
            manager,
            // child ordinals are 1-based
            child_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The operation enclosing this scope.
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// The checkpoint manager for this invocation.
    pub fn manager(&self) -> &Arc<CheckpointManager> {
        &self.manager
    }

    /// Allocates the next deterministic child id in this scope.
    pub fn next_child_id(&self) -> OperationId {
        let ordinal = self.child_counter.fetch_add(1, Ordering::SeqCst);
        self.operation_id.child(ordinal)
    }

    /// Advances the child counter without creating operations.
    ///
    /// Used when replay reconstructs a fan-out that persisted fewer items
    /// than the live run would produce: the remaining ids are consumed so
    /// operations created afterwards keep their positions.
    pub fn skip_child_ids(&self, count: u64) {
        self.child_counter.fetch_add(count, Ordering::SeqCst);
    }

    /// Creates a nested context rooted at a child operation.
    pub fn child_scope(&self, child_id: OperationId) -> Self {
        Self::for_operation(Arc::clone(&self.manager), child_id)
    }

    /// Runs a future with this context installed as the ambient context.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CONTEXT.scope(self, fut).await
    }

    /// Returns the ambient context.
    ///
    /// Fails with a usage error outside any workflow scope: engine entry
    /// points must not be called from foreign tasks.
    pub fn current() -> Result<Self, EngineError> {
        CONTEXT
            .try_with(Self::clone)
            .map_err(|_| EngineError::usage("no ambient operation context; engine entry points must run inside a workflow scope"))
    }

    /// Returns the ambient context if one is installed.
    pub fn try_current() -> Option<Self> {
        CONTEXT.try_with(Self::clone).ok()
    }

    /// Verifies that the ambient scope is the one an operation handle was
    /// created in.
    ///
    /// Awaiting a handle from a different scope would break deterministic
    /// id assignment, so it is rejected as a usage error.
    pub fn ensure_same_scope(expected: &OperationId) -> Result<(), EngineError> {
        let current = Self::current()?;
        if current.operation_id() != expected {
            return Err(EngineError::usage(format!(
                "operation handle created in scope {} awaited in scope {}",
                expected,
                current.operation_id()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_id", &self.operation_id)
            .field(
                "next_child",
                &self.child_counter.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// Severity of a workflow log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One workflow log entry.
#[derive(Debug, Clone)]
pub struct LogInfo {
    /// Severity of the entry
    pub level: LogLevel,
    /// The rendered message
    pub message: String,
    /// The operation the entry was emitted from, if inside a scope
    pub operation_id: Option<OperationId>,
}

impl LogInfo {
    /// Creates a log entry, capturing the ambient operation id if present.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            operation_id: OperationContext::try_current().map(|c| c.operation_id().clone()),
        }
    }
}

/// Sink for workflow-visible log entries.
pub trait Logger: Send + Sync {
    fn log(&self, info: &LogInfo);
}

/// Logger backed by the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, info: &LogInfo) {
        let operation_id = info
            .operation_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or("-");
        match info.level {
            LogLevel::Debug => tracing::debug!(operation_id, "{}", info.message),
            LogLevel::Info => tracing::info!(operation_id, "{}", info.message),
            LogLevel::Warn => tracing::warn!(operation_id, "{}", info.message),
            LogLevel::Error => tracing::error!(operation_id, "{}", info.message),
        }
    }
}

/// Logger that suppresses entries emitted while replaying.
///
/// A replayed workflow body runs the same code paths it ran live; without
/// suppression every crash-recovery cycle would duplicate all prior log
/// output. Entries emitted outside any workflow scope always pass through.
pub struct ReplayAwareLogger {
    inner: Arc<dyn Logger>,
}

impl ReplayAwareLogger {
    /// Wraps a logger with replay suppression.
    pub fn new(inner: Arc<dyn Logger>) -> Self {
        Self { inner }
    }
}

impl Logger for ReplayAwareLogger {
    fn log(&self, info: &LogInfo) {
        if let Some(context) = OperationContext::try_current() {
            if context.manager().is_replay() {
                return;
            }
        }
        self.inner.log(info);
    }
}
