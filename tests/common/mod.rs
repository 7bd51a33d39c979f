//! Shared fixtures for integration tests.

#![allow(dead_code)] // each integration test binary uses a subset

use std::sync::Arc;
use std::time::Duration;

use durable_engine::{
    CheckpointManager, EngineConfig, ErrorObject, MockCheckpointStore, Operation, OperationKind,
    OperationStatus, SharedCheckpointStore, StateSnapshot, TerminationCoordinator,
};
use durable_engine::types::{CheckpointToken, ExecutionId, OperationId};

pub const TEST_EXECUTION_ID: &str = "arn:test:execution/integration-1";
pub const TEST_TOKEN: &str = "token-0";

/// Builds an engine against the given store with the default configuration.
///
/// The default 10ms suspend cooldown is live here, so workflows that go
/// fully idle will terminate the invocation with a suspend reason.
pub fn engine(
    store: MockCheckpointStore,
) -> (
    Arc<CheckpointManager>,
    Arc<MockCheckpointStore>,
    Arc<TerminationCoordinator>,
) {
    engine_with_config(store, EngineConfig::default())
}

/// Builds an engine with a cooldown long enough that suspension never
/// interferes with in-process timers during a test.
pub fn engine_no_suspend(
    store: MockCheckpointStore,
) -> (
    Arc<CheckpointManager>,
    Arc<MockCheckpointStore>,
    Arc<TerminationCoordinator>,
) {
    engine_with_config(
        store,
        EngineConfig {
            suspend_cooldown: Duration::from_secs(5),
            ..Default::default()
        },
    )
}

pub fn engine_with_config(
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
        ExecutionId::new_unchecked(TEST_EXECUTION_ID),
        CheckpointToken::from(TEST_TOKEN),
        Arc::clone(&store) as SharedCheckpointStore,
        Arc::clone(&coordinator),
        config,
    );
    (manager, store, coordinator)
}

pub fn snapshot(operations: Vec<Operation>) -> StateSnapshot {
    StateSnapshot {
        operations,
        next_page_token: None,
    }
}

/// A step record that succeeded with the given serialized result.
pub fn completed_step(id: &str, result: &str) -> Operation {
    let mut op = Operation::new(OperationId::from(id).hashed(), OperationKind::Step);
    op.status = OperationStatus::Succeeded;
    op.result = Some(result.to_string());
    op
}

/// A record of the given kind that failed with the given error.
pub fn failed_operation(id: &str, kind: OperationKind, error_type: &str, message: &str) -> Operation {
    let mut op = Operation::new(OperationId::from(id).hashed(), kind);
    op.status = OperationStatus::Failed;
    op.error = Some(ErrorObject::new(error_type, message));
    op
}

/// A non-terminal record of the given kind.
pub fn started_operation(id: &str, kind: OperationKind) -> Operation {
    Operation::new(OperationId::from(id).hashed(), kind)
}

/// A wait record carrying its persisted deadline.
pub fn started_wait(id: &str, deadline_ms: u64) -> Operation {
    let mut op = Operation::new(OperationId::from(id).hashed(), OperationKind::Wait);
    op.next_attempt_ms = Some(deadline_ms);
    op
}
