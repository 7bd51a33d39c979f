//! Operation lifecycle and checkpoint management.
//!
//! The [`CheckpointManager`] owns all operation state for one invocation:
//! the lifecycle table, the write-batching queue, the persisted-state cache,
//! and the decision of when to ask the termination coordinator to suspend
//! the invocation. One manager is constructed per invocation and injected
//! into every component that needs it; there is no global instance.
//!
//! The queue, the operation table, and the pending-completions set are
//! mutated only here. Other components read operation state through the
//! accessor methods.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use crate::config::EngineConfig;
use crate::error::{EngineError, TerminationReason};
use crate::operation::{
    LifecycleState, Operation, OperationAction, OperationKind, OperationUpdate, StateMetadata,
};
use crate::state::mode::ExecutionMode;
use crate::state::queue::{is_pruned, next_batch, sort_batch, QueuedWrite, WriteHandle};
use crate::state::recorded::RecordedResult;
use crate::store::{CheckpointRequest, SharedCheckpointStore, StoreError};
use crate::termination::{TerminationCoordinator, TerminationDetails};
use crate::types::{now_ms, CheckpointToken, ExecutionId, HashedOperationId, OperationId};

/// Base delay for throttling retries inside the flush loop.
const THROTTLE_BASE_DELAY_MS: u64 = 100;
/// Cap for the exponential throttling backoff.
const THROTTLE_MAX_DELAY_MS: u64 = 2_000;

/// An operation tracked in the in-memory lifecycle table.
#[derive(Debug, Clone)]
struct TrackedOperation {
    kind: OperationKind,
    state: LifecycleState,
    scheduled_end_ms: Option<u64>,
    attempt: u32,
}

/// State mutated only under the manager's lock.
struct ManagerInner {
    operations: HashMap<OperationId, TrackedOperation>,
    queue: VecDeque<QueuedWrite>,
    /// Completion writes queued or in flight but not yet acknowledged,
    /// keyed by operation with the enqueue sequence of the completion.
    pending_completions: HashMap<OperationId, u64>,
    /// Operations whose terminal write the store has acknowledged.
    finished: HashSet<OperationId>,
    /// True while the flush task owns the store connection. Enforces the
    /// at-most-one-in-flight write invariant.
    flushing: bool,
}

/// The operation lifecycle and checkpoint manager for one invocation.
pub struct CheckpointManager {
    execution_id: ExecutionId,
    config: EngineConfig,
    store: SharedCheckpointStore,
    coordinator: Arc<TerminationCoordinator>,
    terminating: Arc<AtomicBool>,
    mode: AtomicU8,
    token: RwLock<CheckpointToken>,
    /// Persisted operation records, hydrated from the store and updated as
    /// writes are acknowledged. Acknowledged store state supersedes local
    /// entries for the same id.
    store_state: RwLock<HashMap<HashedOperationId, Operation>>,
    inner: Mutex<ManagerInner>,
    status_watchers: Mutex<HashMap<OperationId, Arc<Notify>>>,
    retry_timers: Mutex<HashMap<OperationId, Arc<Notify>>>,
    /// Bumped on every state change; a scheduled suspend decision commits
    /// only if the epoch is unchanged after the cooldown.
    suspend_epoch: AtomicU64,
    seq: AtomicU64,
    drain_notify: Notify,
}

impl CheckpointManager {
    /// Creates a manager for one invocation.
    pub fn new(
        execution_id: ExecutionId,
        initial_token: CheckpointToken,
        store: SharedCheckpointStore,
        coordinator: Arc<TerminationCoordinator>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let terminating = coordinator.terminating_flag();
        Arc::new(Self {
            execution_id,
            config,
            store,
            coordinator,
            terminating,
            mode: AtomicU8::new(ExecutionMode::Replay as u8),
            token: RwLock::new(initial_token),
            store_state: RwLock::new(HashMap::new()),
            inner: Mutex::new(ManagerInner {
                operations: HashMap::new(),
                queue: VecDeque::new(),
                pending_completions: HashMap::new(),
                finished: HashSet::new(),
                flushing: false,
            }),
            status_watchers: Mutex::new(HashMap::new()),
            retry_timers: Mutex::new(HashMap::new()),
            suspend_epoch: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            drain_notify: Notify::new(),
        })
    }

    /// The execution this manager belongs to.
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// The termination coordinator for this invocation.
    pub fn coordinator(&self) -> &Arc<TerminationCoordinator> {
        &self.coordinator
    }

    /// The engine configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The current checkpoint token.
    pub async fn checkpoint_token(&self) -> CheckpointToken {
        self.token.read().await.clone()
    }

    // ---- mode resolution ----

    /// The current replay/execution mode.
    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::from(self.mode.load(Ordering::SeqCst))
    }

    /// Returns true while replaying previously recorded operations.
    pub fn is_replay(&self) -> bool {
        self.mode().is_replay()
    }

    /// Records that an operation entry point was reached.
    ///
    /// If we are replaying and no persisted record exists for the
    /// operation, we have run past the replay frontier: the mode flips to
    /// Execution for everything from here on. The flip is one-way.
    pub async fn observe(&self, operation_id: &OperationId) {
        if !self.is_replay() {
            return;
        }
        let exists = self
            .store_state
            .read()
            .await
            .contains_key(&operation_id.hashed());
        if !exists {
            tracing::debug!(operation_id = %operation_id, "replay frontier reached, switching to execution mode");
            self.mode
                .store(ExecutionMode::Execution as u8, Ordering::SeqCst);
        }
    }

    /// Looks up the persisted record for an operation.
    pub async fn recorded_result(&self, operation_id: &OperationId) -> RecordedResult {
        let state = self.store_state.read().await;
        RecordedResult::new(state.get(&operation_id.hashed()).cloned())
    }

    // ---- hydration ----

    /// Loads the persisted operation map from the store, following page
    /// tokens until exhausted.
    ///
    /// Leaves the mode at Replay when any record was loaded; an execution
    /// with no history starts directly in Execution mode. Restores retry
    /// metadata for non-terminal records so retry semantics survive
    /// re-invocation.
    pub async fn hydrate(&self) -> Result<(), EngineError> {
        let token = self.checkpoint_token().await;
        let mut page_token: Option<String> = None;
        let mut loaded = 0usize;

        loop {
            let snapshot = match self
                .get_state_with_retry(&token, page_token.as_deref())
                .await
            {
                Ok(snapshot) => snapshot,
                Err(error) => return Err(self.fail_from_store_error(error).await),
            };

            loaded += snapshot.operations.len();
            {
                let mut state = self.store_state.write().await;
                for operation in snapshot.operations {
                    state.insert(operation.operation_id.clone(), operation);
                }
            }

            match snapshot.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        if loaded == 0 {
            self.mode
                .store(ExecutionMode::Execution as u8, Ordering::SeqCst);
        }
        tracing::debug!(operations = loaded, mode = ?self.mode(), "hydrated execution state");
        Ok(())
    }

    async fn get_state_with_retry(
        &self,
        token: &CheckpointToken,
        page_token: Option<&str>,
    ) -> Result<crate::store::StateSnapshot, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.store.get_state(token, page_token).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) if error.is_throttle() && attempt + 1 < self.config.max_throttle_retries => {
                    let delay = throttle_delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay, "state load throttled, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    // ---- lifecycle table ----

    /// Creates or updates an operation's lifecycle state.
    ///
    /// Metadata is mandatory on first creation and rejected knowledge-free
    /// updates fail with a usage error. Every call cancels any scheduled
    /// suspend decision and schedules a fresh evaluation.
    pub fn mark_state(
        self: &Arc<Self>,
        operation_id: &OperationId,
        state: LifecycleState,
        metadata: Option<StateMetadata>,
    ) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match inner.operations.get_mut(operation_id) {
                Some(tracked) => {
                    tracked.state = state;
                    if let Some(metadata) = metadata {
                        tracked.scheduled_end_ms = metadata.scheduled_end_ms.or(tracked.scheduled_end_ms);
                    }
                }
                None => {
                    let metadata = metadata.ok_or_else(|| {
                        EngineError::usage(format!(
                            "operation {} is unknown and no metadata was provided",
                            operation_id
                        ))
                    })?;
                    inner.operations.insert(
                        operation_id.clone(),
                        TrackedOperation {
                            kind: metadata.kind,
                            state,
                            scheduled_end_ms: metadata.scheduled_end_ms,
                            attempt: 0,
                        },
                    );
                }
            }
        }

        if state == LifecycleState::Completed {
            self.notify_status_change(operation_id);
        }
        self.bump_suspend_epoch();
        self.schedule_suspend_evaluation();
        Ok(())
    }

    /// Transitions an operation from `IdleNotAwaited` to `IdleAwaited`.
    pub fn mark_awaited(self: &Arc<Self>, operation_id: &OperationId) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let tracked = inner.operations.get_mut(operation_id).ok_or_else(|| {
                EngineError::usage(format!("cannot await unknown operation {}", operation_id))
            })?;
            if tracked.state == LifecycleState::IdleNotAwaited {
                tracked.state = LifecycleState::IdleAwaited;
            }
        }
        self.bump_suspend_epoch();
        self.schedule_suspend_evaluation();
        Ok(())
    }

    /// Returns the current lifecycle state of an operation.
    pub fn lifecycle_state(&self, operation_id: &OperationId) -> Option<LifecycleState> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.operations.get(operation_id).map(|t| t.state)
    }

    /// Restores the attempt counter for an operation resuming a retry.
    pub fn restore_attempt(&self, operation_id: &OperationId, attempt: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tracked) = inner.operations.get_mut(operation_id) {
            tracked.attempt = attempt;
        }
    }

    /// Returns the attempt counter for an operation.
    pub fn attempt(&self, operation_id: &OperationId) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .operations
            .get(operation_id)
            .map(|t| t.attempt)
            .unwrap_or(0)
    }

    /// Waits until the retry timer for an operation is fired.
    ///
    /// Fails with a usage error unless the operation is in `RetryWaiting`.
    pub async fn wait_for_retry_timer(&self, operation_id: &OperationId) -> Result<(), EngineError> {
        match self.lifecycle_state(operation_id) {
            Some(LifecycleState::RetryWaiting) => {}
            other => {
                return Err(EngineError::usage(format!(
                    "wait_for_retry_timer requires RetryWaiting, operation {} is {:?}",
                    operation_id, other
                )))
            }
        }
        let notify = self.retry_timer_notify(operation_id);
        notify.notified().await;
        Ok(())
    }

    /// Fires the retry timer for an operation.
    pub fn fire_retry_timer(&self, operation_id: &OperationId) {
        self.retry_timer_notify(operation_id).notify_one();
    }

    /// Waits until the operation's store status changes.
    ///
    /// Fails with a usage error unless the operation is `IdleAwaited`.
    pub async fn wait_for_status_change(&self, operation_id: &OperationId) -> Result<(), EngineError> {
        match self.lifecycle_state(operation_id) {
            Some(LifecycleState::IdleAwaited) => {}
            other => {
                return Err(EngineError::usage(format!(
                    "wait_for_status_change requires IdleAwaited, operation {} is {:?}",
                    operation_id, other
                )))
            }
        }
        let notify = self.status_notify(operation_id);
        notify.notified().await;
        Ok(())
    }

    fn status_notify(&self, operation_id: &OperationId) -> Arc<Notify> {
        let mut watchers = self.status_watchers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            watchers
                .entry(operation_id.clone())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn retry_timer_notify(&self, operation_id: &OperationId) -> Arc<Notify> {
        let mut timers = self.retry_timers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            timers
                .entry(operation_id.clone())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn notify_status_change(&self, operation_id: &OperationId) {
        self.status_notify(operation_id).notify_one();
    }

    /// Waits for any change to the operation's persisted record, without
    /// the lifecycle guard. Drivers re-check the record after each wake.
    pub(crate) async fn record_changed(&self, operation_id: &OperationId) {
        self.status_notify(operation_id).notified().await;
    }

    // ---- checkpoint queue ----

    /// Enqueues a checkpoint write and returns a handle resolving once that
    /// specific write round-trips.
    ///
    /// While terminating, returns a handle that never resolves: the
    /// invocation is ending and new work is moot. Payloads above the
    /// truncation threshold are dropped from the update and flagged so
    /// replay re-executes instead of trusting a partial value.
    pub fn checkpoint(self: &Arc<Self>, mut update: OperationUpdate) -> WriteHandle {
        if self.terminating.load(Ordering::SeqCst) {
            return WriteHandle::never();
        }

        if let Some(payload) = &update.payload {
            if payload.len() > self.config.payload_truncation_threshold {
                tracing::debug!(
                    operation_id = %update.operation_id,
                    payload_bytes = payload.len(),
                    "payload exceeds truncation threshold, dropping from checkpoint"
                );
                update.payload = None;
                update.payload_truncated = true;
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (write, handle) = QueuedWrite::new(seq, update);
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if write.update.is_completion() {
                inner
                    .pending_completions
                    .insert(write.update.operation_id.clone(), seq);
            }
            inner.queue.push_back(write);
        }

        self.bump_suspend_epoch();
        self.ensure_flush();
        handle
    }

    /// Flushes the queue and waits for it to drain.
    ///
    /// With an empty queue this still performs one empty write, which
    /// rotates the token and piggy-backs fresh store state. While
    /// terminating the call never resolves. A drain that exceeds the
    /// configured timeout clears the queue and fails locally.
    pub async fn force_checkpoint(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.terminating.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        // The empty write holds the flushing flag like any other flush, so a
        // concurrent checkpoint() cannot start a second store write while it
        // is in flight.
        let idle = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.queue.is_empty() && !inner.flushing {
                inner.flushing = true;
                true
            } else {
                false
            }
        };
        if idle {
            let sent = self.send_batch(Vec::new()).await;
            {
                let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                inner.flushing = false;
            }
            self.drain_notify.notify_waiters();
            return match sent {
                Ok(()) => {
                    // writes enqueued while the empty write was in flight
                    self.ensure_flush();
                    Ok(())
                }
                Err(error) => Err(self.fail_from_store_error(error).await),
            };
        }

        self.ensure_flush();
        let waited = self.config.queue_drain_timeout;
        let drained = tokio::time::timeout(waited, async {
            loop {
                {
                    let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    if inner.queue.is_empty() && !inner.flushing {
                        return;
                    }
                }
                self.drain_notify.notified().await;
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                inner.queue.clear();
                tracing::warn!("checkpoint queue drain timed out, clearing queue");
                Err(EngineError::QueueDrainTimeout {
                    waited_ms: waited.as_millis() as u64,
                })
            }
        }
    }

    /// Number of writes currently queued (excluding the in-flight batch).
    pub fn queued_writes(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.queue.len()
    }

    fn ensure_flush(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.flushing || inner.queue.is_empty() {
                return;
            }
            inner.flushing = true;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_flush().await });
    }

    /// Drains the queue batch by batch. Only one instance runs at a time,
    /// which is what guarantees at most one in-flight store write.
    async fn run_flush(self: Arc<Self>) {
        loop {
            let batch = {
                let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                Self::prune_queue(&mut inner);
                let batch = next_batch(&mut inner.queue, self.config.max_batch_size_bytes);
                if batch.is_empty() {
                    inner.flushing = false;
                    None
                } else {
                    Some(sort_batch(batch))
                }
            };

            let Some(batch) = batch else {
                self.drain_notify.notify_waiters();
                self.schedule_suspend_evaluation();
                return;
            };

            if let Err(error) = self.send_batch(batch).await {
                {
                    let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    inner.queue.clear();
                    inner.flushing = false;
                }
                self.drain_notify.notify_waiters();
                let _ = self.fail_from_store_error(error).await;
                return;
            }
        }
    }

    /// Drops queued writes whose ancestor subtree already concluded. Their
    /// completion senders are dropped without firing, so the corresponding
    /// handles never resolve.
    fn prune_queue(inner: &mut ManagerInner) {
        let finished = inner.finished.clone();
        let pending = inner.pending_completions.clone();
        inner.queue.retain(|write| {
            let pruned = is_pruned(
                write,
                |id| finished.contains(id),
                |id| pending.get(id).copied(),
            );
            if pruned {
                tracing::debug!(
                    operation_id = %write.update.operation_id,
                    "dropping checkpoint write, ancestor already concluded"
                );
            }
            !pruned
        });
    }

    /// Sends one batch, retrying throttles with capped exponential backoff.
    /// On acknowledgement rotates the token, updates the persisted-state
    /// cache, resolves the write handles, and wakes status watchers.
    async fn send_batch(&self, mut batch: Vec<QueuedWrite>) -> Result<(), StoreError> {
        let updates: Vec<_> = batch
            .iter()
            .map(|write| write.update.clone().into_wire())
            .collect();
        let request = CheckpointRequest {
            execution_id: self.execution_id.clone(),
            updates,
        };

        let mut attempt = 0u32;
        let response = loop {
            let token = self.token.read().await.clone();
            match self.store.checkpoint(&token, request.clone()).await {
                Ok(response) => break response,
                Err(error) if error.is_throttle() && attempt + 1 < self.config.max_throttle_retries => {
                    let delay = throttle_delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay, "checkpoint throttled, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        };

        *self.token.write().await = response.checkpoint_token;

        let mut superseded: HashSet<HashedOperationId> = HashSet::new();
        {
            let mut state = self.store_state.write().await;
            for write in &batch {
                apply_update_to_cache(&mut state, &write.update);
            }
            // Acknowledged store state supersedes the local cache.
            if let Some(new_state) = response.new_state {
                for operation in new_state.operations {
                    superseded.insert(operation.operation_id.clone());
                    state.insert(operation.operation_id.clone(), operation);
                }
            }
        }

        {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for write in &batch {
                if write.update.is_completion() {
                    inner.pending_completions.remove(&write.update.operation_id);
                    inner.finished.insert(write.update.operation_id.clone());
                }
            }
        }

        for write in &mut batch {
            write.resolve();
            self.notify_status_change(&write.update.operation_id);
        }

        // Piggy-backed records can settle operations resolved externally
        // (callbacks, child executions); wake their watchers too.
        if !superseded.is_empty() {
            let watchers = self
                .status_watchers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (id, notify) in watchers.iter() {
                if superseded.contains(&id.hashed()) {
                    notify.notify_one();
                }
            }
        }

        Ok(())
    }

    /// Classifies a store failure, invokes the termination coordinator with
    /// the classified reason, and returns the matching engine error.
    ///
    /// Promises for queued writes are abandoned, not rejected: the
    /// invocation is ending regardless, so workflow-visible futures stay
    /// unsettled.
    async fn fail_from_store_error(&self, error: StoreError) -> EngineError {
        let class = error.classify();
        let reason = class.termination_reason();
        tracing::warn!(%error, ?class, "checkpoint store failure");
        self.coordinator
            .terminate(TerminationDetails::with_message(reason, error.to_string()))
            .await;
        match class {
            crate::store::StoreErrorClass::ExecutionFatal => EngineError::Execution {
                message: error.to_string(),
                termination_reason: reason,
            },
            crate::store::StoreErrorClass::InvocationRetryable => EngineError::Invocation {
                message: error.to_string(),
                termination_reason: reason,
            },
        }
    }

    // ---- centralized suspend decision ----

    fn bump_suspend_epoch(&self) {
        self.suspend_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Schedules a suspend evaluation after the cooldown window.
    ///
    /// Several operations going idle within one window collapse into a
    /// single, correctly-prioritized decision; any state change before the
    /// cooldown elapses cancels the scheduled evaluation.
    pub fn schedule_suspend_evaluation(self: &Arc<Self>) {
        let epoch = self.suspend_epoch.load(Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.suspend_cooldown).await;
            this.commit_suspend(epoch).await;
        });
    }

    async fn commit_suspend(&self, epoch: u64) {
        if self.suspend_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.terminating.load(Ordering::SeqCst) {
            return;
        }

        let reason = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !inner.queue.is_empty() || inner.flushing {
                return;
            }
            if inner
                .operations
                .values()
                .any(|t| t.state == LifecycleState::Executing)
            {
                return;
            }
            Self::pick_suspend_reason(&inner)
        };

        let Some(reason) = reason else { return };
        tracing::debug!(?reason, "all operations idle, requesting suspension");
        self.coordinator
            .terminate(TerminationDetails::new(reason))
            .await;
    }

    /// Picks the highest-priority pending reason: a scheduled retry
    /// outranks an awaited wait, which outranks an awaited callback.
    fn pick_suspend_reason(inner: &ManagerInner) -> Option<TerminationReason> {
        let mut best: Option<TerminationReason> = None;
        for tracked in inner.operations.values() {
            let candidate = match tracked.state {
                LifecycleState::RetryWaiting => Some(TerminationReason::RetryPending),
                LifecycleState::IdleAwaited => match tracked.kind {
                    OperationKind::Wait => Some(TerminationReason::WaitPending),
                    OperationKind::Callback => Some(TerminationReason::CallbackPending),
                    _ => None,
                },
                _ => None,
            };
            if let Some(candidate) = candidate {
                let better = best
                    .map(|b| candidate.suspend_priority() < b.suspend_priority())
                    .unwrap_or(true);
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Scheduled end for a wait operation, if known.
    pub fn scheduled_end_ms(&self, operation_id: &OperationId) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .operations
            .get(operation_id)
            .and_then(|t| t.scheduled_end_ms)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("CheckpointManager")
            .field("execution_id", &self.execution_id)
            .field("mode", &self.mode())
            .field("operations", &inner.operations.len())
            .field("queued", &inner.queue.len())
            .field("flushing", &inner.flushing)
            .finish()
    }
}

/// Applies an acknowledged update to the persisted-state cache.
fn apply_update_to_cache(
    state: &mut HashMap<HashedOperationId, Operation>,
    update: &OperationUpdate,
) {
    let hashed = update.operation_id.hashed();
    let entry = state
        .entry(hashed.clone())
        .or_insert_with(|| {
            let mut op = Operation::new(hashed, update.kind);
            op.parent_id = update.parent_id.as_ref().map(|p| p.hashed());
            op.name = update.name.clone();
            op.start_timestamp_ms = Some(now_ms());
            op
        });

    match update.action {
        OperationAction::Start => {
            entry.status = crate::operation::OperationStatus::Started;
            entry.next_attempt_ms = update.next_attempt_ms;
        }
        OperationAction::Succeed => {
            entry.status = crate::operation::OperationStatus::Succeeded;
            entry.result = update.payload.clone();
            entry.result_truncated = update.payload_truncated;
        }
        OperationAction::Fail => {
            entry.status = crate::operation::OperationStatus::Failed;
            entry.error = update.error.clone();
        }
        OperationAction::Retry => {
            entry.status = crate::operation::OperationStatus::Retrying;
            entry.attempt = update.attempt;
            entry.next_attempt_ms = update.next_attempt_ms;
        }
    }
}

fn throttle_delay(attempt: u32) -> u64 {
    (THROTTLE_BASE_DELAY_MS << attempt.min(16)).min(THROTTLE_MAX_DELAY_MS)
}
