//! Termination coordination for the durable execution engine.
//!
//! A [`TerminationCoordinator`] is created once per invocation and resolves
//! exactly once. `terminate` is idempotent: only the first call has effect.
//! It synchronously flags the invocation as terminating (so the checkpoint
//! manager can park new writes instead of flooding doomed work), runs an
//! optional best-effort cleanup action, then resolves the shared signal.
//! Any number of listeners can await the same signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{EngineError, TerminationReason};

/// Details carried by the termination signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationDetails {
    /// Why the invocation must stop
    pub reason: TerminationReason,
    /// Optional human-readable message
    pub message: Option<String>,
}

impl TerminationDetails {
    /// Creates termination details with just a reason.
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            message: None,
        }
    }

    /// Creates termination details with a reason and message.
    pub fn with_message(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: Some(message.into()),
        }
    }
}

/// Optional cleanup action run before the signal resolves. Failures are
/// swallowed; the invocation is ending regardless.
pub type CleanupAction = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;

/// Broadcast, single-resolution signal that the host invocation must stop.
pub struct TerminationCoordinator {
    tx: watch::Sender<Option<TerminationDetails>>,
    claimed: AtomicBool,
    terminating: Arc<AtomicBool>,
}

impl TerminationCoordinator {
    /// Creates a coordinator with an unresolved signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            claimed: AtomicBool::new(false),
            terminating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the shared terminating flag.
    ///
    /// The checkpoint manager holds a clone and checks it before accepting
    /// new writes or forced flushes; the flag is raised synchronously by
    /// the first `terminate` call, before any cleanup runs.
    pub fn terminating_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminating)
    }

    /// Returns true once termination has been triggered.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Returns the resolved details, if the signal has resolved.
    pub fn details(&self) -> Option<TerminationDetails> {
        self.tx.borrow().clone()
    }

    /// Triggers termination. Idempotent: only the first call has effect.
    pub async fn terminate(&self, details: TerminationDetails) {
        self.terminate_with_cleanup(details, None).await;
    }

    /// Triggers termination, running an optional cleanup action first.
    ///
    /// The terminating flag is raised before the first await so that no
    /// new checkpoint work slips in while cleanup runs.
    pub async fn terminate_with_cleanup(
        &self,
        details: TerminationDetails,
        cleanup: Option<CleanupAction>,
    ) {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(reason = ?details.reason, "termination already triggered, ignoring");
            return;
        }
        self.terminating.store(true, Ordering::SeqCst);

        if let Some(cleanup) = cleanup {
            if let Err(error) = cleanup.await {
                tracing::warn!(%error, "termination cleanup failed");
            }
        }

        tracing::debug!(reason = ?details.reason, "resolving termination signal");
        // send_replace stores the value even when no receiver is currently
        // subscribed; send would discard it and lose the signal
        self.tx.send_replace(Some(details));
    }

    /// Waits for the termination signal and returns its details.
    ///
    /// Resolves immediately if termination already happened.
    pub async fn await_termination(&self) -> TerminationDetails {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(details) = rx.borrow_and_update().clone() {
                return details;
            }
            // Sender lives as long as self, so changed() cannot fail while
            // we hold &self.
            if rx.changed().await.is_err() {
                unreachable!("termination sender dropped while borrowed");
            }
        }
    }
}

impl Default for TerminationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TerminationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationCoordinator")
            .field("terminating", &self.is_terminating())
            .field("details", &self.details())
            .finish()
    }
}
