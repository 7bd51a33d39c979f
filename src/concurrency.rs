//! Fan-out execution with bounded concurrency and completion policies.
//!
//! [`fan_out`] runs a body over a collection of items, each item a durable
//! operation of its own with steps and waits nested under it. Concurrency
//! is bounded by a semaphore; completion is governed by the
//! [`CompletionConfig`] policy, evaluated after every item settlement so a
//! run can conclude before all items finish. The container operation
//! persists a [`FanOutSummary`], which replay parses to re-derive how many
//! item children to reconstruct; ids for items beyond that count are
//! consumed without creating operations, keeping later sibling ids stable.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};

use crate::config::{CompletionConfig, FanOutConfig};
use crate::context::OperationContext;
use crate::error::{EngineError, ErrorObject};
use crate::operation::{LifecycleState, OperationKind, OperationUpdate, StateMetadata};
use crate::serdes::{JsonSerDes, SerDes, SerDesContext};
use crate::state::CheckpointManager;
use crate::types::OperationId;

/// Why a fan-out run concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionReason {
    /// Every item settled within the failure tolerance.
    AllCompleted,
    /// The configured minimum of successful items was reached.
    MinSuccessfulReached,
    /// More items failed than the policy tolerates.
    FailureToleranceExceeded,
}

/// Status of one fan-out item in the batch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchItemStatus {
    /// Still in flight when the run concluded.
    Started,
    /// Settled successfully.
    Succeeded,
    /// Settled with a failure.
    Failed,
}

/// One item of a fan-out result.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    /// Position in the input collection
    pub index: usize,
    /// Settlement status when the run concluded
    pub status: BatchItemStatus,
    /// The item's result if it succeeded
    pub result: Option<T>,
    /// The item's error if it failed
    pub error: Option<ErrorObject>,
}

impl<T> BatchItem<T> {
    fn started(index: usize) -> Self {
        Self {
            index,
            status: BatchItemStatus::Started,
            result: None,
            error: None,
        }
    }
}

/// The outcome of a fan-out run, items dense and ordered by index.
///
/// Items still in flight when the run concluded early stay `Started`; their
/// operations keep running and checkpointing in the background.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    /// Per-item outcomes, ordered by index
    pub items: Vec<BatchItem<T>>,
    /// Why the run concluded
    pub completion_reason: CompletionReason,
    successful: bool,
}

impl<T> BatchResult<T> {
    /// True if the run met its completion policy.
    ///
    /// Distinct from the completion reason: a run whose items all settled
    /// without reaching a configured `min_successful` concludes as
    /// `AllCompleted` but is not successful.
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Results of the items that succeeded, in index order.
    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|item| item.result.as_ref())
    }

    /// Items that failed, in index order.
    pub fn failed(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items
            .iter()
            .filter(|item| item.status == BatchItemStatus::Failed)
    }

    /// Number of items that settled successfully.
    pub fn success_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == BatchItemStatus::Succeeded)
            .count()
    }

    /// Number of items that settled with a failure.
    pub fn failure_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == BatchItemStatus::Failed)
            .count()
    }

    /// Number of items still in flight when the run concluded.
    pub fn started_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == BatchItemStatus::Started)
            .count()
    }
}

/// Summary persisted as the fan-out container's terminal payload.
///
/// Replay parses this to re-derive how many item children existed; counts
/// refer to settled items at the moment the run concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutSummary {
    /// The fan-out flavor ("Map")
    #[serde(rename = "Kind")]
    pub kind: String,
    /// Number of item operations created before the run concluded
    #[serde(rename = "TotalCount")]
    pub total_count: usize,
    /// Items that had succeeded when the run concluded
    #[serde(rename = "SuccessCount")]
    pub success_count: usize,
    /// Items that had failed when the run concluded
    #[serde(rename = "FailureCount")]
    pub failure_count: usize,
    /// Why the run concluded
    #[serde(rename = "CompletionReason")]
    pub completion_reason: CompletionReason,
}

/// Evaluates the completion policy after a settlement.
///
/// Returns the concluding reason and whether the run counts as successful,
/// or `None` to keep waiting. With no policy configured the run fails fast
/// on the first failure and succeeds only when every item completes.
pub(crate) fn evaluate_completion(
    total: usize,
    success: usize,
    failure: usize,
    config: &CompletionConfig,
) -> Option<(CompletionReason, bool)> {
    if let Some(min) = config.min_successful {
        if success + failure == total {
            // every item settled: the minimum was either met on this final
            // settlement (not strictly earlier) or never reached at all
            return Some((CompletionReason::AllCompleted, success >= min));
        }
        if success >= min {
            return Some((CompletionReason::MinSuccessfulReached, true));
        }
        if failure > total.saturating_sub(min) {
            return Some((CompletionReason::FailureToleranceExceeded, false));
        }
        return None;
    }

    let tolerated = {
        let by_count = config.tolerated_failure_count;
        let by_percentage = config
            .tolerated_failure_percentage
            .map(|p| (p * total as f64).floor() as usize);
        match (by_count, by_percentage) {
            (None, None) => 0,
            (Some(c), None) => c,
            (None, Some(p)) => p,
            (Some(c), Some(p)) => c.max(p),
        }
    };

    if failure > tolerated {
        return Some((CompletionReason::FailureToleranceExceeded, false));
    }
    if success + failure == total {
        return Some((CompletionReason::AllCompleted, true));
    }
    None
}

/// Runs `body` over `items` as durable fan-out operations.
///
/// Each item runs in its own nested scope with a deterministic id under the
/// container operation, so operations created inside `body` are durable
/// too. The returned result is dense and index-ordered regardless of
/// settlement order.
pub async fn fan_out<I, T, F, Fut>(
    items: Vec<I>,
    config: FanOutConfig,
    body: F,
) -> Result<BatchResult<T>, EngineError>
where
    I: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    let context = OperationContext::current()?;
    let manager = Arc::clone(context.manager());
    let parent = context.operation_id().clone();
    let fan_id = context.next_child_id();

    manager.mark_state(
        &fan_id,
        LifecycleState::Executing,
        Some(StateMetadata::new(OperationKind::FanOut)),
    )?;

    manager.observe(&fan_id).await;
    let recorded = manager.recorded_result(&fan_id).await;
    crate::future::check_recorded_kind(&manager, &fan_id, &recorded, OperationKind::FanOut)
        .await?;
    let fan_ctx = context.child_scope(fan_id.clone());
    let body = Arc::new(body);

    if recorded.is_terminal() {
        if let Some(summary) = recorded_summary(&recorded) {
            let successful = recorded.is_succeeded();
            return replay_fan_out(&manager, &fan_id, fan_ctx, items, summary, successful, body)
                .await;
        }
        // unparseable summary: fall back to a live run
        tracing::warn!(operation_id = %fan_id, "fan-out summary unreadable, re-running live");
    }

    if !recorded.is_existent() {
        let _ = manager.checkpoint(
            OperationUpdate::start(fan_id.clone(), OperationKind::FanOut)
                .with_parent_id(parent),
        );
    }

    let total = items.len();
    let (tx, rx) = mpsc::unbounded_channel();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.unwrap_or(total.max(1))));

    for (index, item) in items.into_iter().enumerate() {
        let item_id = fan_ctx.next_child_id();
        spawn_item(
            &manager,
            &fan_id,
            item_id,
            index,
            item,
            Arc::clone(&body),
            Arc::clone(&semaphore),
            tx.clone(),
            &fan_ctx,
        )?;
    }
    drop(tx);

    let result = collect(total, rx, &config.completion).await;
    conclude(&manager, &fan_id, &result).await?;
    Ok(result)
}

fn recorded_summary(recorded: &crate::state::RecordedResult) -> Option<FanOutSummary> {
    if recorded.is_succeeded() {
        serde_json::from_str(recorded.result()?).ok()
    } else {
        // a failed run keeps its summary in the error message
        serde_json::from_str(&recorded.error()?.error_message).ok()
    }
}

/// Reconstructs a concluded fan-out from its persisted summary.
///
/// Only the first `total_count` item children existed in the recorded run;
/// they are driven normally (replaying or resuming each). The ids of the
/// remaining live items are consumed without creating operations so that
/// operations after the fan-out keep their positions.
async fn replay_fan_out<I, T, F, Fut>(
    manager: &Arc<CheckpointManager>,
    fan_id: &OperationId,
    fan_ctx: OperationContext,
    items: Vec<I>,
    summary: FanOutSummary,
    successful: bool,
    body: Arc<F>,
) -> Result<BatchResult<T>, EngineError>
where
    I: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    let live_total = items.len();
    let target = summary.total_count.min(live_total);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let semaphore = Arc::new(Semaphore::new(target.max(1)));

    let mut consumed = 0usize;
    for (index, item) in items.into_iter().enumerate().take(target) {
        let item_id = fan_ctx.next_child_id();
        consumed += 1;
        spawn_item(
            manager,
            fan_id,
            item_id,
            index,
            item,
            Arc::clone(&body),
            Arc::clone(&semaphore),
            tx.clone(),
            &fan_ctx,
        )?;
    }
    drop(tx);
    fan_ctx.skip_child_ids((live_total - consumed) as u64);

    // Drain every settlement unconditionally: the run already concluded in
    // the recorded invocation, so no policy can cut reconstruction short,
    // and each recorded item's result or error must be recovered.
    let mut items: Vec<BatchItem<T>> = (0..target).map(BatchItem::started).collect();
    while let Some((index, outcome)) = rx.recv().await {
        match outcome {
            Ok(value) => {
                items[index].status = BatchItemStatus::Succeeded;
                items[index].result = Some(value);
            }
            Err(error) => {
                items[index].status = BatchItemStatus::Failed;
                items[index].error = Some(error);
            }
        }
    }

    manager.mark_state(fan_id, LifecycleState::Completed, None)?;
    Ok(BatchResult {
        items,
        completion_reason: summary.completion_reason,
        successful,
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_item<I, T, F, Fut>(
    manager: &Arc<CheckpointManager>,
    fan_id: &OperationId,
    item_id: OperationId,
    index: usize,
    item: I,
    body: Arc<F>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<(usize, Result<T, ErrorObject>)>,
    fan_ctx: &OperationContext,
) -> Result<(), EngineError>
where
    I: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    manager.mark_state(
        &item_id,
        LifecycleState::IdleAwaited,
        Some(StateMetadata::new(OperationKind::FanOutItem)),
    )?;

    let manager = Arc::clone(manager);
    let fan_id = fan_id.clone();
    let item_scope = fan_ctx.child_scope(item_id.clone());
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };
        match drive_item(&manager, &fan_id, &item_id, index, item, body, item_scope).await {
            Ok(outcome) => {
                let _ = tx.send((index, outcome));
            }
            Err(error) => {
                // infrastructure failure: the settlement never arrives
                tracing::debug!(operation_id = %item_id, %error, "abandoning fan-out item");
            }
        }
    });
    Ok(())
}

async fn drive_item<I, T, F, Fut>(
    manager: &Arc<CheckpointManager>,
    fan_id: &OperationId,
    item_id: &OperationId,
    index: usize,
    item: I,
    body: Arc<F>,
    item_scope: OperationContext,
) -> Result<Result<T, ErrorObject>, EngineError>
where
    I: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(usize, I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, ErrorObject>> + Send + 'static,
{
    manager.observe(item_id).await;
    let recorded = manager.recorded_result(item_id).await;
    crate::future::check_recorded_kind(manager, item_id, &recorded, OperationKind::FanOutItem)
        .await?;
    let serdes = JsonSerDes::<T>::new();
    let serdes_ctx = SerDesContext::new(item_id.clone(), manager.execution_id().clone());

    if recorded.is_succeeded() && !recorded.is_result_truncated() {
        manager.mark_state(item_id, LifecycleState::Completed, None)?;
        let data = recorded.result().unwrap_or("null");
        let value = serdes
            .deserialize(data, &serdes_ctx)
            .map_err(|e| EngineError::serdes(e.to_string()))?;
        return Ok(Ok(value));
    }
    if recorded.is_failed() {
        manager.mark_state(item_id, LifecycleState::Completed, None)?;
        let error = recorded
            .error()
            .cloned()
            .unwrap_or_else(|| ErrorObject::from_message("fan-out item failed"));
        return Ok(Err(error));
    }

    if !recorded.is_existent() {
        let _ = manager.checkpoint(
            OperationUpdate::start(item_id.clone(), OperationKind::FanOutItem)
                .with_parent_id(fan_id.clone()),
        );
    }
    manager.mark_state(item_id, LifecycleState::Executing, None)?;

    let outcome = item_scope.scope(async move { body(index, item).await }).await;

    match outcome {
        Ok(value) => {
            let payload = serdes
                .serialize(&value, &serdes_ctx)
                .map_err(|e| EngineError::serdes(e.to_string()))?;
            let handle = manager.checkpoint(OperationUpdate::succeed(
                item_id.clone(),
                OperationKind::FanOutItem,
                Some(payload),
            ));
            handle.acknowledged().await;
            manager.mark_state(item_id, LifecycleState::Completed, None)?;
            Ok(Ok(value))
        }
        Err(error) => {
            let handle = manager.checkpoint(OperationUpdate::fail(
                item_id.clone(),
                OperationKind::FanOutItem,
                error.clone(),
            ));
            handle.acknowledged().await;
            manager.mark_state(item_id, LifecycleState::Completed, None)?;
            Ok(Err(error))
        }
    }
}

/// Receives settlements until the policy concludes the run or every item
/// has settled.
async fn collect<T>(
    total: usize,
    mut rx: mpsc::UnboundedReceiver<(usize, Result<T, ErrorObject>)>,
    policy: &CompletionConfig,
) -> BatchResult<T> {
    let mut items: Vec<BatchItem<T>> = (0..total).map(BatchItem::started).collect();
    let mut success = 0usize;
    let mut failure = 0usize;

    if let Some((reason, successful)) = evaluate_completion(total, success, failure, policy) {
        return BatchResult {
            items,
            completion_reason: reason,
            successful,
        };
    }

    loop {
        match rx.recv().await {
            Some((index, Ok(value))) => {
                items[index].status = BatchItemStatus::Succeeded;
                items[index].result = Some(value);
                success += 1;
            }
            Some((index, Err(error))) => {
                items[index].status = BatchItemStatus::Failed;
                items[index].error = Some(error);
                failure += 1;
            }
            // every driver was abandoned; the run can never conclude on
            // policy, report what settled
            None => {
                return BatchResult {
                    items,
                    completion_reason: CompletionReason::FailureToleranceExceeded,
                    successful: false,
                }
            }
        }

        if let Some((reason, successful)) = evaluate_completion(total, success, failure, policy) {
            return BatchResult {
                items,
                completion_reason: reason,
                successful,
            };
        }
    }
}

/// Persists the container's terminal record carrying the summary.
async fn conclude<T>(
    manager: &Arc<CheckpointManager>,
    fan_id: &OperationId,
    result: &BatchResult<T>,
) -> Result<(), EngineError> {
    let summary = FanOutSummary {
        kind: "Map".to_string(),
        total_count: result.items.len(),
        success_count: result.success_count(),
        failure_count: result.failure_count(),
        completion_reason: result.completion_reason,
    };
    let payload = serde_json::to_string(&summary)?;

    let update = if result.is_successful() {
        OperationUpdate::succeed(fan_id.clone(), OperationKind::FanOut, Some(payload))
    } else {
        let error_type = match result.completion_reason {
            // all settled but the configured minimum was never reached
            CompletionReason::AllCompleted => "MinSuccessfulNotReached",
            _ => "FailureToleranceExceeded",
        };
        OperationUpdate::fail(
            fan_id.clone(),
            OperationKind::FanOut,
            ErrorObject::new(error_type, payload),
        )
    };

    let handle = manager.checkpoint(update);
    handle.acknowledged().await;
    manager.mark_state(fan_id, LifecycleState::Completed, None)?;
    Ok(())
}
