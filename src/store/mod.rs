//! Storage layer for subtask and parent task records
//!
//! The store is the only state shared between the dispatcher, the workers and
//! the monitor. Every backend must make a write visible to any read issued
//! after the write returns, and must overwrite whole records atomically.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{FanoutError, Result};
use crate::subtask::{ParentTask, Subtask, SubtaskId};

/// Key-value store for subtask and parent task records
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    /// Persist the full record, overwriting any record with the same id
    async fn put(&self, subtask: &Subtask) -> Result<()>;

    /// Persist several records atomically: either all become visible or none
    async fn put_batch(&self, subtasks: &[Subtask]) -> Result<()>;

    /// Look up a record, `None` when absent
    async fn find(&self, id: &str) -> Result<Option<Subtask>>;

    /// All records in creation order
    async fn list(&self) -> Result<Vec<Subtask>>;

    /// Atomically move a pending subtask to `in_progress` for `worker`.
    /// Fails with `AlreadyClaimed` when the record is no longer pending.
    async fn claim(&self, id: &str, worker: &str, now: DateTime<Utc>) -> Result<Subtask>;

    async fn put_parent(&self, parent: &ParentTask) -> Result<()>;

    async fn find_parent(&self, id: &str) -> Result<Option<ParentTask>>;

    /// Get a record or fail with `SubtaskNotFound`
    async fn get(&self, id: &str) -> Result<Subtask> {
        self.find(id)
            .await?
            .ok_or_else(|| FanoutError::SubtaskNotFound(id.to_string()))
    }

    async fn get_parent(&self, id: &str) -> Result<ParentTask> {
        self.find_parent(id)
            .await?
            .ok_or_else(|| FanoutError::ParentNotFound(id.to_string()))
    }

    /// Read the given records in the order of `ids`
    async fn get_many(&self, ids: &[SubtaskId]) -> Result<Vec<Subtask>> {
        let mut subtasks = Vec::with_capacity(ids.len());
        for id in ids {
            subtasks.push(self.get(id).await?);
        }
        Ok(subtasks)
    }

    /// Change feed of written subtask ids, if the backend supports one
    fn subscribe(&self) -> Option<Receiver<SubtaskId>> {
        None
    }

    /// Flush pending writes to durable storage
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Broadcast of subtask ids written to a store.
///
/// Overflow drops the oldest ids; subscribers only use the feed as a wake-up
/// signal and re-read the store afterwards.
pub struct ChangeFeed {
    tx: Sender<SubtaskId>,
    rx: InactiveReceiver<SubtaskId>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            rx: rx.deactivate(),
        }
    }

    pub fn notify(&self, id: &str) {
        // Inactive (no subscriber) is the normal case.
        let _ = self.tx.try_broadcast(id.to_string());
    }

    pub fn subscribe(&self) -> Receiver<SubtaskId> {
        self.rx.activate_cloned()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Map a failed state-machine start into the claim conflict it represents
pub(crate) fn claim_conflict(subtask: &Subtask, err: FanoutError) -> FanoutError {
    match err {
        FanoutError::InvalidTransition { .. } | FanoutError::AlreadyAssigned { .. } => {
            FanoutError::AlreadyClaimed {
                id: subtask.id.clone(),
                status: subtask.status,
            }
        }
        other => other,
    }
}
