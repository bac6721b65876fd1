use async_broadcast::Receiver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{claim_conflict, ChangeFeed, SubtaskStore};
use crate::errors::{FanoutError, Result};
use crate::subtask::{ParentTask, Subtask, SubtaskId};

/// In-memory store backed by `DashMap`. Cloning shares the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    subtasks: Arc<DashMap<SubtaskId, Subtask>>,
    // creation sequence per id, assigned on first write
    order: Arc<DashMap<SubtaskId, u64>>,
    parents: Arc<DashMap<String, ParentTask>>,
    next_seq: Arc<AtomicU64>,
    feed: Arc<ChangeFeed>,
    // held exclusively while a batch is inserted, shared by every other access
    batch: Arc<RwLock<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    fn insert(&self, subtask: &Subtask) {
        self.order
            .entry(subtask.id.clone())
            .or_insert_with(|| self.next_seq.fetch_add(1, Ordering::SeqCst));
        self.subtasks.insert(subtask.id.clone(), subtask.clone());
    }
}

#[async_trait]
impl SubtaskStore for MemoryStore {
    async fn put(&self, subtask: &Subtask) -> Result<()> {
        {
            let _shared = self.batch.read().await;
            self.insert(subtask);
        }
        self.feed.notify(&subtask.id);
        Ok(())
    }

    async fn put_batch(&self, subtasks: &[Subtask]) -> Result<()> {
        {
            let _exclusive = self.batch.write().await;
            for subtask in subtasks {
                self.insert(subtask);
            }
        }
        for subtask in subtasks {
            self.feed.notify(&subtask.id);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<Subtask>> {
        let _shared = self.batch.read().await;
        Ok(self.subtasks.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Subtask>> {
        let _shared = self.batch.read().await;
        let mut ordered: Vec<(u64, Subtask)> = self
            .subtasks
            .iter()
            .map(|entry| {
                let seq = self.order.get(entry.key()).map(|s| *s).unwrap_or(u64::MAX);
                (seq, entry.value().clone())
            })
            .collect();
        ordered.sort_by_key(|(seq, _)| *seq);
        Ok(ordered.into_iter().map(|(_, subtask)| subtask).collect())
    }

    async fn claim(&self, id: &str, worker: &str, now: DateTime<Utc>) -> Result<Subtask> {
        let claimed = {
            let _shared = self.batch.read().await;
            // The shard write lock makes check-and-set atomic.
            let mut entry = self
                .subtasks
                .get_mut(id)
                .ok_or_else(|| FanoutError::SubtaskNotFound(id.to_string()))?;
            let snapshot = entry.value().clone();
            entry
                .value_mut()
                .start(worker, now)
                .map_err(|e| claim_conflict(&snapshot, e))?;
            entry.value().clone()
        };
        self.feed.notify(id);
        Ok(claimed)
    }

    async fn put_parent(&self, parent: &ParentTask) -> Result<()> {
        self.parents.insert(parent.id.clone(), parent.clone());
        Ok(())
    }

    async fn find_parent(&self, id: &str) -> Result<Option<ParentTask>> {
        Ok(self.parents.get(id).map(|entry| entry.value().clone()))
    }

    fn subscribe(&self) -> Option<Receiver<SubtaskId>> {
        Some(self.feed.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtask::{SubtaskSpec, SubtaskStatus};
    use pretty_assertions::assert_eq;

    fn subtask(id: &str) -> Subtask {
        Subtask::pending(id, "parent", SubtaskSpec::new(id, "desc"), Utc::now())
    }

    #[tokio::test]
    async fn test_put_then_get_returns_equal_record() {
        let store = MemoryStore::new();
        let record = subtask("docs-1");
        store.put(&record).await.unwrap();
        assert_eq!(store.get("docs-1").await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("docs-9").await,
            Err(FanoutError::SubtaskNotFound(id)) if id == "docs-9"
        ));
    }

    #[tokio::test]
    async fn test_list_keeps_creation_order_across_overwrites() {
        let store = MemoryStore::new();
        let ids = ["docs-10", "docs-2", "docs-1"];
        store
            .put_batch(&ids.iter().map(|id| subtask(id)).collect::<Vec<_>>())
            .await
            .unwrap();

        // overwrite the first one; position must not change
        let mut first = store.get("docs-10").await.unwrap();
        first.start("worker-1", Utc::now()).unwrap();
        store.put(&first).await.unwrap();

        let listed: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec!["docs-10", "docs-2", "docs-1"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        store.put(&subtask("docs-1")).await.unwrap();

        let claimed = store.claim("docs-1", "worker-a", Utc::now()).await.unwrap();
        assert_eq!(claimed.status, SubtaskStatus::InProgress);
        assert_eq!(claimed.assigned_worker.as_deref(), Some("worker-a"));

        let err = store.claim("docs-1", "worker-b", Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            FanoutError::AlreadyClaimed { status: SubtaskStatus::InProgress, .. }
        ));
        let stored = store.get("docs-1").await.unwrap();
        assert_eq!(stored.assigned_worker.as_deref(), Some("worker-a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_part_of_a_batch() {
        let store = MemoryStore::new();
        let batches = 50;
        let size = 20;

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for b in 0..batches {
                    let records: Vec<Subtask> =
                        (1..=size).map(|i| subtask(&format!("b{}-{}", b, i))).collect();
                    store.put_batch(&records).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    loop {
                        let listed = store.list().await.unwrap();
                        let mut per_batch = std::collections::HashMap::new();
                        for record in &listed {
                            let batch = record.id.split('-').next().unwrap().to_string();
                            *per_batch.entry(batch).or_insert(0usize) += 1;
                        }
                        for (batch, count) in &per_batch {
                            assert_eq!(*count, size, "batch {} seen partially", batch);
                        }
                        if listed.len() == batches * size {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(store.len(), batches * size);
    }

    #[tokio::test]
    async fn test_change_feed_reports_writes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe().unwrap();
        store.put(&subtask("docs-1")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "docs-1");
    }

    #[tokio::test]
    async fn test_parent_records() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_parent("task-1").await,
            Err(FanoutError::ParentNotFound(_))
        ));
        let parent = ParentTask::new("task-1", "docs", "five-way", "out.md");
        store.put_parent(&parent).await.unwrap();
        assert_eq!(store.get_parent("task-1").await.unwrap(), parent);
    }
}
