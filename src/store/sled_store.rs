//! Sled-backed subtask store
//!
//! Records are stored as JSON in the `subtasks` and `parents` trees. The
//! `order` tree maps a big-endian creation sequence number to a subtask id so
//! that `list` can return records in creation order. Every write is flushed
//! before it returns.

use async_broadcast::Receiver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionResult, TransactionError, TransactionResult};
use sled::{Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::{claim_conflict, ChangeFeed, SubtaskStore};
use crate::errors::{FanoutError, Result};
use crate::subtask::{ParentTask, Subtask, SubtaskId};

const SUBTASKS_TREE: &str = "subtasks";
const PARENTS_TREE: &str = "parents";
const ORDER_TREE: &str = "order";

pub struct SledStore {
    db: sled::Db,
    subtasks: Tree,
    parents: Tree,
    order: Tree,
    feed: ChangeFeed,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| FanoutError::store("open database", e))?;
        info!(path = %path.as_ref().display(), "Opened sled subtask store");
        Self::from_db(db)
    }

    /// Store in a temporary database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FanoutError::store("open temporary database", e))?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| FanoutError::store(format!("open tree {}", name), e))
        };
        Ok(Self {
            subtasks: open_tree(SUBTASKS_TREE)?,
            parents: open_tree(PARENTS_TREE)?,
            order: open_tree(ORDER_TREE)?,
            db,
            feed: ChangeFeed::default(),
        })
    }

    /// Write encoded records together with their order entries in one transaction
    fn write_records(&self, operation: &str, encoded: &[(SubtaskId, Vec<u8>)]) -> Result<()> {
        // Sequence numbers are reserved up front; unused ones leave harmless gaps.
        let seqs = encoded
            .iter()
            .map(|_| self.db.generate_id())
            .collect::<sled::Result<Vec<u64>>>()
            .map_err(|e| FanoutError::store(operation, e))?;

        let outcome: TransactionResult<(), ()> =
            (&self.subtasks, &self.order).transaction(|(subtasks, order)| {
                for ((id, value), seq) in encoded.iter().zip(&seqs) {
                    let previous = subtasks.insert(id.as_bytes(), value.as_slice())?;
                    if previous.is_none() {
                        order.insert(seq.to_be_bytes().to_vec(), id.as_bytes())?;
                    }
                }
                let done: ConflictableTransactionResult<(), ()> = Ok(());
                done
            });
        outcome.map_err(|e| transaction_error(operation, e))
    }

    async fn sync(&self, operation: &str) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FanoutError::store(format!("flush after {}", operation), e))?;
        Ok(())
    }
}

fn transaction_error(operation: &str, err: TransactionError<()>) -> FanoutError {
    match err {
        TransactionError::Storage(e) => FanoutError::store(operation, e),
        TransactionError::Abort(()) => FanoutError::Internal(format!("{} aborted", operation)),
    }
}

fn encode(subtask: &Subtask) -> Result<(SubtaskId, Vec<u8>)> {
    Ok((subtask.id.clone(), serde_json::to_vec(subtask)?))
}

#[async_trait]
impl SubtaskStore for SledStore {
    async fn put(&self, subtask: &Subtask) -> Result<()> {
        self.write_records("put subtask", &[encode(subtask)?])?;
        self.sync("put subtask").await?;
        self.feed.notify(&subtask.id);
        Ok(())
    }

    async fn put_batch(&self, subtasks: &[Subtask]) -> Result<()> {
        let encoded = subtasks.iter().map(encode).collect::<Result<Vec<_>>>()?;
        self.write_records("put subtask batch", &encoded)?;
        self.sync("put subtask batch").await?;
        debug!(count = subtasks.len(), "Staged subtask batch");
        for subtask in subtasks {
            self.feed.notify(&subtask.id);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Subtask>> {
        let raw = self
            .subtasks
            .get(id.as_bytes())
            .map_err(|e| FanoutError::store("get subtask", e))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Subtask>> {
        let mut subtasks = Vec::with_capacity(self.order.len());
        for entry in self.order.iter() {
            let (_, id) = entry.map_err(|e| FanoutError::store("scan order", e))?;
            let id = String::from_utf8_lossy(&id).into_owned();
            if let Some(subtask) = self.find(&id).await? {
                subtasks.push(subtask);
            }
        }
        Ok(subtasks)
    }

    async fn claim(&self, id: &str, worker: &str, now: DateTime<Utc>) -> Result<Subtask> {
        loop {
            let current = self
                .subtasks
                .get(id.as_bytes())
                .map_err(|e| FanoutError::store("get subtask", e))?
                .ok_or_else(|| FanoutError::SubtaskNotFound(id.to_string()))?;
            let mut subtask: Subtask = serde_json::from_slice(&current)?;
            let snapshot = subtask.clone();
            subtask
                .start(worker, now)
                .map_err(|e| claim_conflict(&snapshot, e))?;
            let updated = serde_json::to_vec(&subtask)?;

            let swapped = self
                .subtasks
                .compare_and_swap(id.as_bytes(), Some(&current), Some(updated))
                .map_err(|e| FanoutError::store("claim subtask", e))?;
            match swapped {
                Ok(()) => {
                    self.sync("claim subtask").await?;
                    self.feed.notify(id);
                    return Ok(subtask);
                }
                // Someone wrote in between; re-read and re-check.
                Err(_) => continue,
            }
        }
    }

    async fn put_parent(&self, parent: &ParentTask) -> Result<()> {
        let value = serde_json::to_vec(parent)?;
        self.parents
            .insert(parent.id.as_bytes(), value)
            .map_err(|e| FanoutError::store("put parent", e))?;
        self.sync("put parent").await
    }

    async fn find_parent(&self, id: &str) -> Result<Option<ParentTask>> {
        let raw = self
            .parents
            .get(id.as_bytes())
            .map_err(|e| FanoutError::store("get parent", e))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn subscribe(&self) -> Option<Receiver<SubtaskId>> {
        Some(self.feed.subscribe())
    }

    async fn flush(&self) -> Result<()> {
        self.sync("flush").await
    }
}
