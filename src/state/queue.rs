//! Checkpoint write queue primitives.
//!
//! Queued writes are ephemeral: created on every state-affecting call,
//! consumed by the flush loop, never persisted themselves. This module keeps
//! the batch-assembly rules (byte ceiling, ordering, ancestor pruning) as
//! standalone functions over the queue so they stay unit-testable without a
//! live manager.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::operation::{OperationKind, OperationUpdate};
use crate::types::OperationId;

/// A checkpoint write waiting in the queue.
#[derive(Debug)]
pub struct QueuedWrite {
    /// Monotonic enqueue sequence number
    pub seq: u64,
    /// The partial update to persist
    pub update: OperationUpdate,
    /// Fired once this specific write is acknowledged by the store.
    /// Dropped without firing when the write is pruned or abandoned.
    pub completion: Option<oneshot::Sender<()>>,
    /// Serialized size of the wire form, computed at enqueue time
    pub size_bytes: usize,
}

impl QueuedWrite {
    /// Creates a queued write and the handle that resolves on acknowledgement.
    pub fn new(seq: u64, update: OperationUpdate) -> (Self, WriteHandle) {
        let (tx, rx) = oneshot::channel();
        let size_bytes = estimated_size(&update);
        (
            Self {
                seq,
                update,
                completion: Some(tx),
                size_bytes,
            },
            WriteHandle { rx: Some(rx) },
        )
    }

    /// Fires the completion handle, if any.
    pub fn resolve(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(());
        }
    }
}

/// Handle returned by `checkpoint`, resolving once the write round-trips.
///
/// A handle for a pruned or abandoned write never resolves: the enclosing
/// subtree already concluded (or the invocation is ending), so the caller
/// must not be woken with a result that no longer matters.
#[derive(Debug)]
pub struct WriteHandle {
    rx: Option<oneshot::Receiver<()>>,
}

impl WriteHandle {
    /// A handle that never resolves.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Waits for the write to be acknowledged.
    ///
    /// Pends forever if the write was pruned, abandoned, or created while
    /// terminating.
    pub async fn acknowledged(self) {
        match self.rx {
            Some(rx) => {
                if rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Estimates the serialized size of one update in the batch payload.
pub fn estimated_size(update: &OperationUpdate) -> usize {
    serde_json::to_string(&update.clone().into_wire())
        .map(|s| s.len())
        .unwrap_or(1024)
}

/// Greedily drains the front of the queue into one batch bounded by the
/// byte ceiling, preserving queue order.
///
/// An oversized single update still gets its own batch rather than blocking
/// the queue forever.
pub fn next_batch(queue: &mut VecDeque<QueuedWrite>, max_batch_size_bytes: usize) -> Vec<QueuedWrite> {
    let mut batch = Vec::new();
    let mut batch_bytes = 0usize;

    while let Some(front) = queue.front() {
        if !batch.is_empty() && batch_bytes + front.size_bytes > max_batch_size_bytes {
            break;
        }
        let write = match queue.pop_front() {
            Some(write) => write,
            None => break,
        };
        batch_bytes += write.size_bytes;
        batch.push(write);
    }

    batch
}

/// Orders a drained batch for transmission.
///
/// Queue (invocation) order is preserved, except that a completion update
/// for the root execution operation is moved last so every descendant's
/// write lands before its ancestor's terminal write.
pub fn sort_batch(batch: Vec<QueuedWrite>) -> Vec<QueuedWrite> {
    let (root_completions, rest): (Vec<_>, Vec<_>) = batch.into_iter().partition(|write| {
        write.update.kind == OperationKind::Execution && write.update.is_completion()
    });

    let mut sorted = rest;
    sorted.extend(root_completions);
    sorted
}

/// Returns true if a queued write must be dropped because an ancestor
/// already concluded.
///
/// `finished` answers whether an operation has reached a terminal store
/// status. `completion_seq` returns the enqueue sequence of an ancestor's
/// still-unacknowledged completion write, if one is queued or in flight:
/// a descendant write enqueued after that point would land after its
/// parent's terminal write, so it is moot and dropped.
pub fn is_pruned(
    write: &QueuedWrite,
    finished: impl Fn(&OperationId) -> bool,
    completion_seq: impl Fn(&OperationId) -> Option<u64>,
) -> bool {
    let mut ancestor = write.update.operation_id.parent();
    while let Some(id) = ancestor {
        if finished(&id) {
            return true;
        }
        if let Some(seq) = completion_seq(&id) {
            if seq < write.seq {
                return true;
            }
        }
        ancestor = id.parent();
    }
    false
}
