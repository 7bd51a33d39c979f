//! Tests for the checkpoint manager's queue, flush, and lifecycle behavior.

use std::time::Duration;

use tokio::time::timeout;

use super::{manager_with_config, manager_with_store};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorObject, TerminationReason};
use crate::operation::{LifecycleState, OperationKind, OperationUpdate, StateMetadata};
use crate::store::{MockCheckpointStore, StoreError};
use crate::termination::TerminationDetails;
use crate::types::OperationId;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const NEVER_TIMEOUT: Duration = Duration::from_millis(100);

fn start_update(id: &str) -> OperationUpdate {
    OperationUpdate::start(OperationId::from(id), OperationKind::Step)
}

fn succeed_update(id: &str, kind: OperationKind) -> OperationUpdate {
    OperationUpdate::succeed(OperationId::from(id), kind, Some("\"ok\"".to_string()))
}

#[tokio::test]
async fn test_checkpoint_write_acknowledged_and_token_rotated() {
    let (manager, store, _coordinator) = manager_with_store(MockCheckpointStore::new());

    let handle = manager.checkpoint(start_update("1-1"));
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    let handle = manager.checkpoint(succeed_update("1-1", OperationKind::Step));
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    let recorded = store.recorded_requests();
    assert_eq!(recorded.len(), 2);
    // first call carries the initial token, second the rotated one
    assert_eq!(recorded[0].0.as_str(), "token-0");
    assert_eq!(recorded[1].0.as_str(), "mock-token-0");
    assert_eq!(manager.checkpoint_token().await.as_str(), "mock-token-1");
}

#[tokio::test]
async fn test_mark_state_unknown_without_metadata_is_usage_error() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());

    let err = manager
        .mark_state(&OperationId::from("1-9"), LifecycleState::Executing, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::Usage { .. }));
}

#[tokio::test]
async fn test_mark_state_creates_and_updates() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let id = OperationId::from("1-1");

    manager
        .mark_state(
            &id,
            LifecycleState::IdleNotAwaited,
            Some(StateMetadata::new(OperationKind::Step)),
        )
        .unwrap();
    assert_eq!(
        manager.lifecycle_state(&id),
        Some(LifecycleState::IdleNotAwaited)
    );

    manager.mark_awaited(&id).unwrap();
    assert_eq!(manager.lifecycle_state(&id), Some(LifecycleState::IdleAwaited));

    manager
        .mark_state(&id, LifecycleState::Executing, None)
        .unwrap();
    assert_eq!(manager.lifecycle_state(&id), Some(LifecycleState::Executing));
}

#[tokio::test]
async fn test_mark_awaited_unknown_is_usage_error() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let err = manager.mark_awaited(&OperationId::from("1-7")).unwrap_err();
    assert!(matches!(err, EngineError::Usage { .. }));
}

#[tokio::test]
async fn test_at_most_one_in_flight_write() {
    let (manager, store, _coordinator) =
        manager_with_store(MockCheckpointStore::new().with_latency(Duration::from_millis(20)));

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(manager.checkpoint(start_update(&format!("1-{}", i + 1))));
    }
    for handle in handles {
        timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();
    }

    assert!(store.checkpoint_calls() >= 1);
    assert_eq!(store.max_in_flight(), 1);
}

#[tokio::test]
async fn test_oversized_payload_truncated() {
    let config = EngineConfig {
        payload_truncation_threshold: 16,
        ..Default::default()
    };
    let (manager, store, _coordinator) = manager_with_config(MockCheckpointStore::new(), config);

    let update = OperationUpdate::succeed(
        OperationId::from("1-1"),
        OperationKind::Step,
        Some("x".repeat(100)),
    );
    let handle = manager.checkpoint(update);
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    let recorded = store.recorded_requests();
    assert_eq!(recorded.len(), 1);
    let wire = &recorded[0].1.updates[0];
    assert!(wire.payload.is_none());
    assert!(wire.payload_truncated);
}

#[tokio::test]
async fn test_fatal_store_error_terminates_and_abandons_handle() {
    let store = MockCheckpointStore::new().with_checkpoint_response(Err(StoreError::new(
        400,
        "ValidationException",
        "malformed update",
    )));
    let (manager, _store, coordinator) = manager_with_store(store);

    let handle = manager.checkpoint(start_update("1-1"));

    let details = timeout(ACK_TIMEOUT, coordinator.await_termination())
        .await
        .unwrap();
    assert_eq!(details.reason, TerminationReason::CheckpointFailed);

    // the write's promise is abandoned, not rejected
    assert!(timeout(NEVER_TIMEOUT, handle.acknowledged()).await.is_err());
}

#[tokio::test]
async fn test_invalid_token_error_is_invocation_retryable() {
    let store = MockCheckpointStore::new().with_checkpoint_response(Err(StoreError::new(
        400,
        "InvalidParameterValueException",
        "Invalid Checkpoint Token: expired",
    )));
    let (manager, _store, coordinator) = manager_with_store(store);

    let handle = manager.checkpoint(start_update("1-1"));

    let details = timeout(ACK_TIMEOUT, coordinator.await_termination())
        .await
        .unwrap();
    assert_eq!(details.reason, TerminationReason::InvocationError);
    assert!(timeout(NEVER_TIMEOUT, handle.acknowledged()).await.is_err());
}

#[tokio::test]
async fn test_checkpoint_while_terminating_never_resolves() {
    let (manager, store, coordinator) = manager_with_store(MockCheckpointStore::new());
    coordinator
        .terminate(TerminationDetails::new(TerminationReason::ExecutionError))
        .await;

    let handle = manager.checkpoint(start_update("1-1"));
    assert!(timeout(NEVER_TIMEOUT, handle.acknowledged()).await.is_err());
    assert_eq!(store.checkpoint_calls(), 0);
}

#[tokio::test]
async fn test_descendant_write_pruned_after_ancestor_concluded() {
    let (manager, store, _coordinator) = manager_with_store(MockCheckpointStore::new());

    let parent_done = manager.checkpoint(succeed_update("1-1", OperationKind::ChildContext));
    timeout(ACK_TIMEOUT, parent_done.acknowledged())
        .await
        .unwrap();

    // the subtree already concluded, so this write is dropped and its
    // handle never resolves
    let orphan = manager.checkpoint(start_update("1-1-1"));
    assert!(timeout(NEVER_TIMEOUT, orphan.acknowledged()).await.is_err());
    assert_eq!(store.checkpoint_calls(), 1);
}

#[tokio::test]
async fn test_force_checkpoint_with_empty_queue_sends_empty_write() {
    let (manager, store, _coordinator) = manager_with_store(MockCheckpointStore::new());

    manager.force_checkpoint().await.unwrap();

    let recorded = store.recorded_requests();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].1.updates.is_empty());
    // even an empty write rotates the token
    assert_eq!(manager.checkpoint_token().await.as_str(), "mock-token-0");
}

#[tokio::test]
async fn test_force_checkpoint_empty_write_keeps_single_write_in_flight() {
    // a write enqueued while the empty write is in flight must wait for it
    let store = MockCheckpointStore::new().with_latency(Duration::from_millis(80));
    let (manager, store, _coordinator) = manager_with_store(store);

    let forced = {
        let manager = std::sync::Arc::clone(&manager);
        tokio::spawn(async move { manager.force_checkpoint().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let handle = manager.checkpoint(start_update("1-1"));
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();
    forced.await.unwrap().unwrap();

    assert_eq!(store.max_in_flight(), 1);
    assert_eq!(store.checkpoint_calls(), 2);
    // the queued write saw the token the empty write rotated in
    let recorded = store.recorded_requests();
    assert_eq!(recorded[1].0.as_str(), "mock-token-0");
}

#[tokio::test]
async fn test_force_checkpoint_drain_timeout() {
    let config = EngineConfig {
        queue_drain_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let store = MockCheckpointStore::new().with_latency(Duration::from_secs(5));
    let (manager, _store, _coordinator) = manager_with_config(store, config);

    let _handle = manager.checkpoint(start_update("1-1"));
    let err = manager.force_checkpoint().await.unwrap_err();
    assert!(matches!(err, EngineError::QueueDrainTimeout { .. }));
    assert_eq!(manager.queued_writes(), 0);
}

#[tokio::test]
async fn test_throttled_write_retried_in_flush() {
    let store = MockCheckpointStore::new().with_checkpoint_response(Err(StoreError::new(
        429,
        "ThrottlingException",
        "slow down",
    )));
    let (manager, store, coordinator) = manager_with_store(store);

    let handle = manager.checkpoint(start_update("1-1"));
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    assert_eq!(store.checkpoint_calls(), 2);
    assert!(!coordinator.is_terminating());
}

#[tokio::test]
async fn test_throttling_exhaustion_terminates() {
    let mut store = MockCheckpointStore::new();
    for _ in 0..5 {
        store = store.with_checkpoint_response(Err(StoreError::new(
            429,
            "ThrottlingException",
            "slow down",
        )));
    }
    let (manager, _store, coordinator) = manager_with_store(store);

    let _handle = manager.checkpoint(start_update("1-1"));
    let details = timeout(Duration::from_secs(10), coordinator.await_termination())
        .await
        .unwrap();
    assert_eq!(details.reason, TerminationReason::InvocationError);
}

#[tokio::test]
async fn test_wait_for_retry_timer_requires_retry_waiting() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let id = OperationId::from("1-1");
    manager
        .mark_state(
            &id,
            LifecycleState::Executing,
            Some(StateMetadata::new(OperationKind::Step)),
        )
        .unwrap();

    let err = manager.wait_for_retry_timer(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Usage { .. }));
}

#[tokio::test]
async fn test_retry_timer_fires_waiter() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let id = OperationId::from("1-1");
    manager
        .mark_state(
            &id,
            LifecycleState::RetryWaiting,
            Some(StateMetadata::new(OperationKind::Step)),
        )
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.wait_for_retry_timer(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.fire_retry_timer(&id);
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_status_change_wakes_waiter_on_ack() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let id = OperationId::from("1-1");
    manager
        .mark_state(
            &id,
            LifecycleState::IdleAwaited,
            Some(StateMetadata::new(OperationKind::Callback)),
        )
        .unwrap();
    // keep another operation executing so the awaited callback does not
    // suspend the invocation mid-test
    manager
        .mark_state(
            &OperationId::from("1-2"),
            LifecycleState::Executing,
            Some(StateMetadata::new(OperationKind::Step)),
        )
        .unwrap();

    let waiter = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move { manager.wait_for_status_change(&id).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let handle = manager.checkpoint(succeed_update("1-1", OperationKind::Callback));
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    timeout(ACK_TIMEOUT, waiter).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_restore_attempt_counter() {
    let (manager, _store, _coordinator) = manager_with_store(MockCheckpointStore::new());
    let id = OperationId::from("1-1");
    manager
        .mark_state(
            &id,
            LifecycleState::RetryWaiting,
            Some(StateMetadata::new(OperationKind::Step)),
        )
        .unwrap();

    assert_eq!(manager.attempt(&id), 0);
    manager.restore_attempt(&id, 3);
    assert_eq!(manager.attempt(&id), 3);
}

#[tokio::test]
async fn test_failed_update_carries_error_object() {
    let (manager, store, _coordinator) = manager_with_store(MockCheckpointStore::new());

    let update = OperationUpdate::fail(
        OperationId::from("1-1"),
        OperationKind::Step,
        ErrorObject::new("PaymentDeclined", "card expired"),
    );
    let handle = manager.checkpoint(update);
    timeout(ACK_TIMEOUT, handle.acknowledged()).await.unwrap();

    let recorded = store.recorded_requests();
    let wire = &recorded[0].1.updates[0];
    assert_eq!(
        wire.error.as_ref().unwrap().error_type.as_str(),
        "PaymentDeclined"
    );
}
