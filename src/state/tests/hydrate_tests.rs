//! Tests for state hydration: pagination, throttling, and failure handling.

use super::manager_with_store;
use crate::error::{EngineError, TerminationReason};
use crate::operation::{Operation, OperationKind, OperationStatus};
use crate::store::{MockCheckpointStore, StateSnapshot, StoreError};
use crate::types::OperationId;

fn record(id: &str) -> Operation {
    let mut op = Operation::new(OperationId::from(id).hashed(), OperationKind::Step);
    op.status = OperationStatus::Succeeded;
    op.result = Some("\"r\"".to_string());
    op
}

#[tokio::test]
async fn test_hydrate_follows_page_tokens() {
    let store = MockCheckpointStore::new()
        .with_get_state_response(Ok(StateSnapshot {
            operations: vec![record("1-1")],
            next_page_token: Some("page-2".to_string()),
        }))
        .with_get_state_response(Ok(StateSnapshot {
            operations: vec![record("1-2")],
            next_page_token: None,
        }));
    let (manager, _store, _coordinator) = manager_with_store(store);

    manager.hydrate().await.unwrap();

    assert!(manager.is_replay());
    assert!(manager
        .recorded_result(&OperationId::from("1-1"))
        .await
        .is_existent());
    assert!(manager
        .recorded_result(&OperationId::from("1-2"))
        .await
        .is_existent());
}

#[tokio::test]
async fn test_hydrate_retries_throttled_page() {
    let store = MockCheckpointStore::new()
        .with_get_state_response(Err(StoreError::new(429, "ThrottlingException", "slow down")))
        .with_get_state_response(Ok(StateSnapshot {
            operations: vec![record("1-1")],
            next_page_token: None,
        }));
    let (manager, _store, coordinator) = manager_with_store(store);

    manager.hydrate().await.unwrap();
    assert!(manager.is_replay());
    assert!(!coordinator.is_terminating());
}

#[tokio::test]
async fn test_hydrate_fatal_error_terminates() {
    let store = MockCheckpointStore::new().with_get_state_response(Err(StoreError::new(
        404,
        "ResourceNotFoundException",
        "no such execution",
    )));
    let (manager, _store, coordinator) = manager_with_store(store);

    let err = manager.hydrate().await.unwrap_err();
    assert!(matches!(err, EngineError::Execution { .. }));

    let details = coordinator.await_termination().await;
    assert_eq!(details.reason, TerminationReason::CheckpointFailed);
}

#[tokio::test]
async fn test_hydrate_server_error_is_invocation_retryable() {
    let store = MockCheckpointStore::new().with_get_state_response(Err(StoreError::new(
        503,
        "ServiceUnavailable",
        "try later",
    )));
    let (manager, _store, coordinator) = manager_with_store(store);

    let err = manager.hydrate().await.unwrap_err();
    assert!(matches!(err, EngineError::Invocation { .. }));

    let details = coordinator.await_termination().await;
    assert_eq!(details.reason, TerminationReason::InvocationError);
}
