//! Tests for the state module, split by concern.

mod hydrate_tests;
mod manager_tests;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::state::CheckpointManager;
use crate::store::{MockCheckpointStore, SharedCheckpointStore};
use crate::termination::TerminationCoordinator;
use crate::types::{CheckpointToken, ExecutionId};

/// Builds a manager around a mock store with the default configuration.
fn manager_with_store(
    store: MockCheckpointStore,
) -> (
    Arc<CheckpointManager>,
    Arc<MockCheckpointStore>,
    Arc<TerminationCoordinator>,
) {
    manager_with_config(store, EngineConfig::default())
}

/// Builds a manager around a mock store with a custom configuration.
fn manager_with_config(
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
        ExecutionId::new_unchecked("exec-test"),
        CheckpointToken::from("token-0"),
        Arc::clone(&store) as SharedCheckpointStore,
        Arc::clone(&coordinator),
        config,
    );
    (manager, store, coordinator)
}
