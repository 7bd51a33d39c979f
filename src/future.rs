//! Durable operation handles and their drivers.
//!
//! Every durable operation runs in two phases. Phase one happens at
//! construction: the operation is registered with the checkpoint manager,
//! its `Start` update is queued if it has never run, and its driver task is
//! spawned. Phase two happens when the returned [`DurableFuture`] is first
//! awaited: the operation is marked as awaited (which feeds the suspend
//! decision) and the caller parks on the settlement channel. A handle that
//! is never awaited triggers no phase-two effects; its work still runs, but
//! nothing depends on the result.
//!
//! Infrastructure failures never settle these handles. When a checkpoint
//! write is classified for termination the driver is abandoned and the
//! handle stays pending; only user-code failures and payload codec errors
//! surface as `Err` to workflow code.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::RetryPolicy;
use crate::context::OperationContext;
use crate::error::{EngineError, ErrorObject, TerminationReason};
use crate::operation::{LifecycleState, OperationKind, OperationUpdate, StateMetadata};
use crate::serdes::{JsonSerDes, SerDes, SerDesContext};
use crate::state::CheckpointManager;
use crate::termination::TerminationDetails;
use crate::types::{now_ms, OperationId};

/// Handle to a durable operation.
///
/// Settles with the operation's result on first await. Dropping the handle
/// without awaiting it abandons the result, not the work.
pub struct DurableFuture<T> {
    operation_id: OperationId,
    created_in: OperationId,
    manager: Arc<CheckpointManager>,
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> DurableFuture<T> {
    fn new(
        operation_id: OperationId,
        created_in: OperationId,
        manager: Arc<CheckpointManager>,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Self {
        Self {
            operation_id,
            created_in,
            manager,
            rx,
        }
    }

    /// The deterministic id of the underlying operation.
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }
}

impl<T> std::fmt::Debug for DurableFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFuture")
            .field("operation_id", &self.operation_id)
            .finish()
    }
}

impl<T: Send + 'static> IntoFuture for DurableFuture<T> {
    type Output = Result<T, EngineError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            if let Err(error) = OperationContext::ensure_same_scope(&self.created_in) {
                self.manager
                    .coordinator()
                    .terminate(TerminationDetails::with_message(
                        TerminationReason::UsageError,
                        error.to_string(),
                    ))
                    .await;
                return Err(error);
            }
            self.manager.mark_awaited(&self.operation_id)?;
            match self.rx.await {
                Ok(result) => result,
                // the driver was abandoned; the invocation is ending and
                // this handle must stay unsettled
                Err(_) => std::future::pending().await,
            }
        })
    }
}

/// Routes a driver outcome to the settlement channel.
///
/// User-code and codec failures settle the handle; usage errors terminate
/// the invocation; everything else was already routed to the coordinator by
/// the manager, so the sender is dropped and the handle stays pending.
async fn settle<T>(
    manager: &Arc<CheckpointManager>,
    tx: oneshot::Sender<Result<T, EngineError>>,
    result: Result<T, EngineError>,
) {
    match result {
        Ok(value) => {
            let _ = tx.send(Ok(value));
        }
        Err(error) if error.is_user_code() || matches!(error, EngineError::SerDes { .. }) => {
            let _ = tx.send(Err(error));
        }
        Err(EngineError::Usage { message }) => {
            manager
                .coordinator()
                .terminate(TerminationDetails::with_message(
                    TerminationReason::UsageError,
                    message,
                ))
                .await;
        }
        Err(error) => {
            tracing::debug!(%error, "abandoning operation driver");
        }
    }
}

fn serdes_context(manager: &CheckpointManager, operation_id: &OperationId) -> SerDesContext {
    SerDesContext::new(operation_id.clone(), manager.execution_id().clone())
}

fn deserialize_recorded<T>(
    manager: &CheckpointManager,
    operation_id: &OperationId,
    recorded: &crate::state::RecordedResult,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned,
{
    let serdes = JsonSerDes::<T>::new();
    let context = serdes_context(manager, operation_id);
    // a unit-returning operation may have persisted no payload at all
    let data = recorded.result().unwrap_or("null");
    serdes
        .deserialize(data, &context)
        .map_err(|e| EngineError::serdes(e.to_string()))
}

/// Fails the invocation when a recorded operation's kind does not match the
/// kind being constructed at the same position. Workflow code changed
/// between the recorded run and this one; replaying further would attribute
/// old results to the wrong operations.
pub(crate) async fn check_recorded_kind(
    manager: &Arc<CheckpointManager>,
    operation_id: &OperationId,
    recorded: &crate::state::RecordedResult,
    expected: OperationKind,
) -> Result<(), EngineError> {
    match recorded.kind() {
        Some(kind) if kind != expected => {
            let message = format!(
                "operation {operation_id} was recorded as {kind} but is now constructed as {expected}"
            );
            manager
                .coordinator()
                .terminate(TerminationDetails::with_message(
                    TerminationReason::NonDeterministicExecution,
                    message.clone(),
                ))
                .await;
            Err(EngineError::non_deterministic(message, operation_id.as_str()))
        }
        _ => Ok(()),
    }
}

fn schedule_retry_timer(manager: &Arc<CheckpointManager>, operation_id: &OperationId, delay: Duration) {
    let manager = Arc::clone(manager);
    let operation_id = operation_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        manager.fire_retry_timer(&operation_id);
    });
}

/// Runs a durable step: a unit of side-effecting work checkpointed with
/// at-most-once-per-recovery semantics.
///
/// On replay a recorded result is synthesized without re-running the body.
/// A failing body is retried per the policy; retry state is checkpointed so
/// attempts survive suspension and re-invocation.
pub fn step<T, F, Fut>(
    name: impl Into<String>,
    policy: RetryPolicy,
    body: F,
) -> Result<DurableFuture<T>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    let context = OperationContext::current()?;
    let manager = Arc::clone(context.manager());
    let parent = context.operation_id().clone();
    let operation_id = context.next_child_id();
    let name = name.into();

    manager.mark_state(
        &operation_id,
        LifecycleState::IdleNotAwaited,
        Some(StateMetadata::new(OperationKind::Step)),
    )?;

    let (tx, rx) = oneshot::channel();
    {
        let manager = Arc::clone(&manager);
        let operation_id = operation_id.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            let result = drive_step(&manager, &operation_id, &parent, name, policy, body).await;
            settle(&manager, tx, result).await;
        });
    }

    Ok(DurableFuture::new(operation_id, parent, manager, rx))
}

async fn drive_step<T, F, Fut>(
    manager: &Arc<CheckpointManager>,
    operation_id: &OperationId,
    parent: &OperationId,
    name: String,
    policy: RetryPolicy,
    body: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    manager.observe(operation_id).await;
    let recorded = manager.recorded_result(operation_id).await;
    check_recorded_kind(manager, operation_id, &recorded, OperationKind::Step).await?;

    if recorded.is_succeeded() && !recorded.is_result_truncated() {
        manager.mark_state(operation_id, LifecycleState::Completed, None)?;
        return deserialize_recorded(manager, operation_id, &recorded);
    }
    if recorded.is_failed() {
        manager.mark_state(operation_id, LifecycleState::Completed, None)?;
        let error = recorded
            .error()
            .cloned()
            .unwrap_or_else(|| ErrorObject::from_message("step failed"));
        return Err(EngineError::user_code(error));
    }

    let serdes = JsonSerDes::<T>::new();
    let serdes_ctx = serdes_context(manager, operation_id);
    let mut attempt = recorded.attempt().unwrap_or(0);

    if !recorded.is_existent() {
        let start = OperationUpdate::start(operation_id.clone(), OperationKind::Step)
            .with_parent_id(parent.clone())
            .with_name(name);
        // start write rides along with later updates; nothing waits on it
        let _ = manager.checkpoint(start);
    } else {
        // resuming: a Started or Retrying record survives from a previous
        // invocation
        manager.restore_attempt(operation_id, attempt);
        if recorded.is_retrying() {
            let now = now_ms();
            let deadline = recorded.next_attempt_ms().unwrap_or(now);
            if deadline > now {
                manager.mark_state(operation_id, LifecycleState::RetryWaiting, None)?;
                schedule_retry_timer(
                    manager,
                    operation_id,
                    Duration::from_millis(deadline - now),
                );
                manager.wait_for_retry_timer(operation_id).await?;
            }
        }
    }

    loop {
        manager.mark_state(operation_id, LifecycleState::Executing, None)?;
        match body().await {
            Ok(value) => {
                let payload = serdes
                    .serialize(&value, &serdes_ctx)
                    .map_err(|e| EngineError::serdes(e.to_string()))?;
                let handle = manager.checkpoint(OperationUpdate::succeed(
                    operation_id.clone(),
                    OperationKind::Step,
                    Some(payload),
                ));
                handle.acknowledged().await;
                manager.mark_state(operation_id, LifecycleState::Completed, None)?;
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if attempt < policy.max_attempts {
                    let delay = policy.delay_for(attempt - 1);
                    let _ = manager.checkpoint(OperationUpdate::retry(
                        operation_id.clone(),
                        OperationKind::Step,
                        attempt,
                        now_ms() + delay.as_millis() as u64,
                    ));
                    manager.mark_state(operation_id, LifecycleState::RetryWaiting, None)?;
                    schedule_retry_timer(manager, operation_id, delay);
                    manager.wait_for_retry_timer(operation_id).await?;
                } else {
                    let handle = manager.checkpoint(OperationUpdate::fail(
                        operation_id.clone(),
                        OperationKind::Step,
                        error.clone(),
                    ));
                    handle.acknowledged().await;
                    manager.mark_state(operation_id, LifecycleState::Completed, None)?;
                    return Err(EngineError::user_code(error));
                }
            }
        }
    }
}

/// Runs a durable timed pause.
///
/// The deadline is checkpointed with the `Start` update, so a suspension and
/// later re-invocation resumes the remaining time rather than restarting it.
pub fn wait(duration: Duration) -> Result<DurableFuture<()>, EngineError> {
    let context = OperationContext::current()?;
    let manager = Arc::clone(context.manager());
    let parent = context.operation_id().clone();
    let operation_id = context.next_child_id();

    manager.mark_state(
        &operation_id,
        LifecycleState::IdleNotAwaited,
        Some(
            StateMetadata::new(OperationKind::Wait)
                .with_scheduled_end(now_ms() + duration.as_millis() as u64),
        ),
    )?;

    let (tx, rx) = oneshot::channel();
    {
        let manager = Arc::clone(&manager);
        let operation_id = operation_id.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            let result = drive_wait(&manager, &operation_id, &parent, duration).await;
            settle(&manager, tx, result).await;
        });
    }

    Ok(DurableFuture::new(operation_id, parent, manager, rx))
}

async fn drive_wait(
    manager: &Arc<CheckpointManager>,
    operation_id: &OperationId,
    parent: &OperationId,
    duration: Duration,
) -> Result<(), EngineError> {
    manager.observe(operation_id).await;
    let recorded = manager.recorded_result(operation_id).await;
    check_recorded_kind(manager, operation_id, &recorded, OperationKind::Wait).await?;

    if recorded.is_succeeded() {
        manager.mark_state(operation_id, LifecycleState::Completed, None)?;
        return Ok(());
    }

    let now = now_ms();
    let deadline = if recorded.is_existent() {
        recorded.next_attempt_ms().unwrap_or(now)
    } else {
        let deadline = now + duration.as_millis() as u64;
        let _ = manager.checkpoint(
            OperationUpdate::start(operation_id.clone(), OperationKind::Wait)
                .with_parent_id(parent.clone())
                .with_next_attempt(deadline),
        );
        deadline
    };

    if deadline > now {
        tokio::time::sleep(Duration::from_millis(deadline - now)).await;
    }

    let handle = manager.checkpoint(OperationUpdate::succeed(
        operation_id.clone(),
        OperationKind::Wait,
        None,
    ));
    handle.acknowledged().await;
    manager.mark_state(operation_id, LifecycleState::Completed, None)?;
    Ok(())
}

/// Registers a durable callback: an operation settled by an external
/// resolver writing its terminal status to the store.
///
/// The handle settles once the terminal record reaches this invocation,
/// either piggy-backed on a checkpoint acknowledgement or through hydration
/// after a re-invocation.
pub fn callback<T>() -> Result<DurableFuture<T>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let context = OperationContext::current()?;
    let manager = Arc::clone(context.manager());
    let parent = context.operation_id().clone();
    let operation_id = context.next_child_id();

    manager.mark_state(
        &operation_id,
        LifecycleState::IdleNotAwaited,
        Some(StateMetadata::new(OperationKind::Callback)),
    )?;

    let (tx, rx) = oneshot::channel();
    {
        let manager = Arc::clone(&manager);
        let operation_id = operation_id.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            let result = drive_callback(&manager, &operation_id, &parent).await;
            settle(&manager, tx, result).await;
        });
    }

    Ok(DurableFuture::new(operation_id, parent, manager, rx))
}

async fn drive_callback<T>(
    manager: &Arc<CheckpointManager>,
    operation_id: &OperationId,
    parent: &OperationId,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    manager.observe(operation_id).await;
    let mut started = false;

    loop {
        let recorded = manager.recorded_result(operation_id).await;
        check_recorded_kind(manager, operation_id, &recorded, OperationKind::Callback).await?;
        if recorded.is_succeeded() {
            manager.mark_state(operation_id, LifecycleState::Completed, None)?;
            return deserialize_recorded(manager, operation_id, &recorded);
        }
        if recorded.is_failed() {
            manager.mark_state(operation_id, LifecycleState::Completed, None)?;
            let error = recorded
                .error()
                .cloned()
                .unwrap_or_else(|| ErrorObject::from_message("callback failed"));
            return Err(EngineError::user_code(error));
        }

        if !recorded.is_existent() && !started {
            let _ = manager.checkpoint(
                OperationUpdate::start(operation_id.clone(), OperationKind::Callback)
                    .with_parent_id(parent.clone()),
            );
            started = true;
        }

        manager.record_changed(operation_id).await;
    }
}

/// Runs a nested durable scope.
///
/// The body executes inside its own operation context, so operations it
/// creates are numbered under the child id. A terminal record replays the
/// whole subtree as one value; a non-terminal record re-runs the body and
/// lets each inner operation replay individually.
pub fn child_context<T, F, Fut>(body: F) -> Result<DurableFuture<T>, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    let context = OperationContext::current()?;
    let manager = Arc::clone(context.manager());
    let parent = context.operation_id().clone();
    let operation_id = context.next_child_id();

    manager.mark_state(
        &operation_id,
        LifecycleState::IdleNotAwaited,
        Some(StateMetadata::new(OperationKind::ChildContext)),
    )?;

    let (tx, rx) = oneshot::channel();
    {
        let manager = Arc::clone(&manager);
        let operation_id = operation_id.clone();
        let parent = parent.clone();
        let nested = context.child_scope(operation_id.clone());
        tokio::spawn(async move {
            let result =
                drive_child_context(&manager, &operation_id, &parent, nested, body).await;
            settle(&manager, tx, result).await;
        });
    }

    Ok(DurableFuture::new(operation_id, parent, manager, rx))
}

async fn drive_child_context<T, F, Fut>(
    manager: &Arc<CheckpointManager>,
    operation_id: &OperationId,
    parent: &OperationId,
    nested: OperationContext,
    body: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    manager.observe(operation_id).await;
    let recorded = manager.recorded_result(operation_id).await;
    check_recorded_kind(manager, operation_id, &recorded, OperationKind::ChildContext).await?;

    if recorded.is_succeeded() && !recorded.is_result_truncated() {
        manager.mark_state(operation_id, LifecycleState::Completed, None)?;
        return deserialize_recorded(manager, operation_id, &recorded);
    }
    if recorded.is_failed() {
        manager.mark_state(operation_id, LifecycleState::Completed, None)?;
        let error = recorded
            .error()
            .cloned()
            .unwrap_or_else(|| ErrorObject::from_message("child context failed"));
        return Err(EngineError::user_code(error));
    }

    if !recorded.is_existent() {
        let _ = manager.checkpoint(
            OperationUpdate::start(operation_id.clone(), OperationKind::ChildContext)
                .with_parent_id(parent.clone()),
        );
    }
    manager.mark_state(operation_id, LifecycleState::Executing, None)?;

    // the closure runs inside the nested scope so inner operations see it
    let result = nested.scope(async move { body().await }).await;

    match result {
        Ok(value) => {
            let serdes = JsonSerDes::<T>::new();
            let payload = serdes
                .serialize(&value, &serdes_context(manager, operation_id))
                .map_err(|e| EngineError::serdes(e.to_string()))?;
            let handle = manager.checkpoint(OperationUpdate::succeed(
                operation_id.clone(),
                OperationKind::ChildContext,
                Some(payload),
            ));
            handle.acknowledged().await;
            manager.mark_state(operation_id, LifecycleState::Completed, None)?;
            Ok(value)
        }
        Err(EngineError::UserCode(error)) => {
            let handle = manager.checkpoint(OperationUpdate::fail(
                operation_id.clone(),
                OperationKind::ChildContext,
                error.clone(),
            ));
            handle.acknowledged().await;
            manager.mark_state(operation_id, LifecycleState::Completed, None)?;
            Err(EngineError::user_code(error))
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::config::EngineConfig;
    use crate::operation::{Operation, OperationAction, OperationStatus};
    use crate::store::{
        CheckpointResponse, MockCheckpointStore, SharedCheckpointStore, StateSnapshot,
    };
    use crate::termination::TerminationCoordinator;
    use crate::types::{CheckpointToken, ExecutionId};

    /// Cooldown long enough that in-process timers win over suspension.
    fn slow_suspend_config() -> EngineConfig {
        EngineConfig {
            suspend_cooldown: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn build(
        store: MockCheckpointStore,
        config: EngineConfig,
    ) -> (
        Arc<CheckpointManager>,
        Arc<MockCheckpointStore>,
        Arc<TerminationCoordinator>,
    ) {
        let store = Arc::new(store);
        let coordinator = Arc::new(TerminationCoordinator::new());
        let manager = CheckpointManager::new(
            ExecutionId::new_unchecked("exec-fut"),
            CheckpointToken::from("token-0"),
            Arc::clone(&store) as SharedCheckpointStore,
            Arc::clone(&coordinator),
            config,
        );
        (manager, store, coordinator)
    }

    fn succeeded_record(id: &str, result: &str) -> Operation {
        let mut op = Operation::new(OperationId::from(id).hashed(), OperationKind::Step);
        op.status = OperationStatus::Succeeded;
        op.result = Some(result.to_string());
        op
    }

    #[tokio::test]
    async fn test_step_executes_and_checkpoints() {
        let (manager, store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let value = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = step("double", RetryPolicy::none(), || async { Ok(21 * 2) })
                    .unwrap();
                handle.await
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let updates: Vec<_> = store
            .recorded_requests()
            .into_iter()
            .flat_map(|(_, r)| r.updates)
            .collect();
        assert!(updates
            .iter()
            .any(|u| u.action == OperationAction::Start && u.name.as_deref() == Some("double")));
        assert!(updates
            .iter()
            .any(|u| u.action == OperationAction::Succeed && u.payload.as_deref() == Some("42")));
    }

    #[tokio::test]
    async fn test_step_replays_recorded_success_without_store_calls() {
        let store = MockCheckpointStore::new().with_get_state_response(Ok(StateSnapshot {
            operations: vec![succeeded_record("1-1", "\"cached\"")],
            next_page_token: None,
        }));
        let (manager, store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let value: String = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = step("fetch", RetryPolicy::none(), || async {
                    Ok("fresh".to_string())
                })
                .unwrap();
                handle.await
            })
            .await
            .unwrap();

        // recorded value wins; the body never ran and nothing was written
        assert_eq!(value, "cached");
        assert_eq!(store.checkpoint_calls(), 0);
        assert!(manager.is_replay());
    }

    #[tokio::test]
    async fn test_step_replays_recorded_failure() {
        let mut record = succeeded_record("1-1", "");
        record.status = OperationStatus::Failed;
        record.result = None;
        record.error = Some(ErrorObject::new("PaymentDeclined", "card expired"));
        let store = MockCheckpointStore::new().with_get_state_response(Ok(StateSnapshot {
            operations: vec![record],
            next_page_token: None,
        }));
        let (manager, _store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let result: Result<i32, _> = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = step("charge", RetryPolicy::none(), || async { Ok(1) }).unwrap();
                handle.await
            })
            .await;

        match result.unwrap_err() {
            EngineError::UserCode(error) => assert_eq!(error.error_type, "PaymentDeclined"),
            other => panic!("expected user code error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_step_retries_until_success() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (manager, store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let policy = RetryPolicy::with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(20));

        let value = OperationContext::root(Arc::clone(&manager))
            .scope(async move {
                let handle = step("flaky", policy, move || {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ErrorObject::new("Transient", "not yet"))
                        } else {
                            Ok(7)
                        }
                    }
                })
                .unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let updates: Vec<_> = store
            .recorded_requests()
            .into_iter()
            .flat_map(|(_, r)| r.updates)
            .collect();
        assert_eq!(
            updates
                .iter()
                .filter(|u| u.action == OperationAction::Retry)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_step_exhausted_retries_fail() {
        let (manager, store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let policy = RetryPolicy::with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(10));

        let result: Result<i32, _> = OperationContext::root(Arc::clone(&manager))
            .scope(async move {
                let handle = step("doomed", policy, || async {
                    Err(ErrorObject::new("Broken", "always fails"))
                })
                .unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await;

        match result.unwrap_err() {
            EngineError::UserCode(error) => assert_eq!(error.error_type, "Broken"),
            other => panic!("expected user code error, got {:?}", other),
        }
        let updates: Vec<_> = store
            .recorded_requests()
            .into_iter()
            .flat_map(|(_, r)| r.updates)
            .collect();
        assert!(updates.iter().any(|u| u.action == OperationAction::Fail));
    }

    #[tokio::test]
    async fn test_never_awaited_handle_has_no_phase_two_effects() {
        let (manager, _store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let operation_id = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = step("fire-and-forget", RetryPolicy::none(), || async { Ok(1) })
                    .unwrap();
                handle.operation_id().clone()
            })
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // the work ran eagerly and completed, but it was never awaited
        let state = manager.lifecycle_state(&operation_id);
        assert_ne!(state, Some(LifecycleState::IdleAwaited));
        assert_eq!(state, Some(LifecycleState::Completed));
    }

    #[tokio::test]
    async fn test_await_from_foreign_scope_is_usage_error() {
        let (manager, _store, coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let root = OperationContext::root(Arc::clone(&manager));
        let handle = root
            .clone()
            .scope(async { step("orphan", RetryPolicy::none(), || async { Ok(1) }).unwrap() })
            .await;

        // hand the handle to a different scope
        let foreign = root.child_scope(OperationId::from("1-9"));
        let result = foreign.scope(async { handle.await }).await;

        assert!(matches!(result.unwrap_err(), EngineError::Usage { .. }));
        let details = coordinator.await_termination().await;
        assert_eq!(details.reason, TerminationReason::UsageError);
    }

    #[tokio::test]
    async fn test_recorded_kind_mismatch_terminates_as_non_deterministic() {
        // the recorded run had a wait at this position; the code now has a step
        let record = Operation::new(OperationId::from("1-1").hashed(), OperationKind::Wait);
        let store = MockCheckpointStore::new().with_get_state_response(Ok(StateSnapshot {
            operations: vec![record],
            next_page_token: None,
        }));
        let (manager, _store, coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = step("renamed", RetryPolicy::none(), || async { Ok(1) }).unwrap();
                // the handle is abandoned, never settled
                let settled = timeout(Duration::from_millis(200), handle.into_future()).await;
                assert!(settled.is_err());
            })
            .await;

        let details = coordinator.await_termination().await;
        assert_eq!(details.reason, TerminationReason::NonDeterministicExecution);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_duration() {
        let (manager, store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let started = std::time::Instant::now();
        OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = wait(Duration::from_millis(50)).unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        let updates: Vec<_> = store
            .recorded_requests()
            .into_iter()
            .flat_map(|(_, r)| r.updates)
            .collect();
        let start = updates
            .iter()
            .find(|u| u.action == OperationAction::Start)
            .unwrap();
        assert!(start.next_attempt_ms.is_some());
        assert!(updates.iter().any(|u| u.action == OperationAction::Succeed));
    }

    #[tokio::test]
    async fn test_wait_with_elapsed_recorded_deadline_resolves_immediately() {
        let mut record = Operation::new(OperationId::from("1-1").hashed(), OperationKind::Wait);
        record.status = OperationStatus::Started;
        record.next_attempt_ms = Some(1); // long past
        let store = MockCheckpointStore::new().with_get_state_response(Ok(StateSnapshot {
            operations: vec![record],
            next_page_token: None,
        }));
        let (manager, _store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let started = std::time::Instant::now();
        OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = wait(Duration::from_secs(3600)).unwrap();
                timeout(Duration::from_secs(2), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        // the recorded deadline already passed, so no new hour-long sleep
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_callback_settles_from_piggy_backed_state() {
        let mut resolved = Operation::new(OperationId::from("1-1").hashed(), OperationKind::Callback);
        resolved.status = OperationStatus::Succeeded;
        resolved.result = Some("\"delivered\"".to_string());

        // the Start write's acknowledgement piggy-backs the resolved record
        let response = CheckpointResponse {
            checkpoint_token: CheckpointToken::from("token-1"),
            new_state: Some(StateSnapshot {
                operations: vec![resolved],
                next_page_token: None,
            }),
        };
        let store = MockCheckpointStore::new().with_checkpoint_response(Ok(response));
        let (manager, _store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let value: String = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = callback::<String>().unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(value, "delivered");
    }

    #[tokio::test]
    async fn test_callback_delivers_structured_payload() {
        #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Approval {
            approver: String,
            granted: bool,
        }

        let mut resolved = Operation::new(OperationId::from("1-1").hashed(), OperationKind::Callback);
        resolved.status = OperationStatus::Succeeded;
        resolved.result = Some(r#"{"approver":"lee","granted":true}"#.to_string());
        let response = CheckpointResponse {
            checkpoint_token: CheckpointToken::from("token-1"),
            new_state: Some(StateSnapshot {
                operations: vec![resolved],
                next_page_token: None,
            }),
        };
        let store = MockCheckpointStore::new().with_checkpoint_response(Ok(response));
        let (manager, _store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let approval: Approval = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = callback::<Approval>().unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(
            approval,
            Approval {
                approver: "lee".to_string(),
                granted: true,
            }
        );
    }

    #[tokio::test]
    async fn test_child_context_runs_nested_operations() {
        let (manager, store, _coordinator) = build(MockCheckpointStore::new(), slow_suspend_config());
        manager.hydrate().await.unwrap();

        let value: i32 = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = child_context(|| async {
                    let inner = step("inner", RetryPolicy::none(), || async { Ok(5) })?;
                    let five: i32 = inner.await?;
                    Ok(five * 2)
                })
                .unwrap();
                timeout(Duration::from_secs(3), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(value, 10);

        let updates: Vec<_> = store
            .recorded_requests()
            .into_iter()
            .flat_map(|(_, r)| r.updates)
            .collect();
        // the inner step is numbered under the child context
        let inner_hashed = OperationId::from("1-1-1").hashed();
        assert!(updates.iter().any(|u| u.operation_id == inner_hashed));
        let child_hashed = OperationId::from("1-1").hashed();
        assert!(updates
            .iter()
            .any(|u| u.operation_id == child_hashed && u.action == OperationAction::Succeed));
    }

    #[tokio::test]
    async fn test_child_context_replays_terminal_record_without_running_body() {
        let mut record =
            Operation::new(OperationId::from("1-1").hashed(), OperationKind::ChildContext);
        record.status = OperationStatus::Succeeded;
        record.result = Some("99".to_string());
        let store = MockCheckpointStore::new().with_get_state_response(Ok(StateSnapshot {
            operations: vec![record],
            next_page_token: None,
        }));
        let (manager, store, _coordinator) = build(store, slow_suspend_config());
        manager.hydrate().await.unwrap();

        let value: i32 = OperationContext::root(Arc::clone(&manager))
            .scope(async {
                let handle = child_context(|| async {
                    panic!("body must not run during terminal replay")
                })
                .unwrap();
                timeout(Duration::from_secs(2), handle.into_future())
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(value, 99);
        assert_eq!(store.checkpoint_calls(), 0);
    }
}
