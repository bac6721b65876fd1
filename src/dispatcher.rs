//! Dispatcher: decomposition, staging and static assignment
//!
//! Dispatch is a single sequential operation. All subtasks are staged with
//! one atomic batch write before the parent task is updated, so a parent
//! that references subtask ids can always resolve them from the store.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{FanoutError, Result};
use crate::store::SubtaskStore;
use crate::subtask::{ParentStatus, ParentTask, Subtask, SubtaskSpec, SubtaskStatus, WorkerId};

/// Pure function from a parent task to a fixed ordered list of subtasks
pub trait DecompositionPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn decompose(&self, parent: &ParentTask) -> Vec<SubtaskSpec>;
}

/// Policy that always yields the same list
#[derive(Debug, Clone)]
pub struct FixedDecomposition {
    name: String,
    specs: Vec<SubtaskSpec>,
}

impl FixedDecomposition {
    pub fn new(name: impl Into<String>, specs: Vec<SubtaskSpec>) -> Self {
        Self {
            name: name.into(),
            specs,
        }
    }

    /// Convenience constructor from `(title, description)` pairs
    pub fn from_pairs<T: Into<String>, D: Into<String>>(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (T, D)>,
    ) -> Self {
        Self::new(
            name,
            pairs
                .into_iter()
                .map(|(title, description)| SubtaskSpec::new(title, description))
                .collect(),
        )
    }
}

impl DecompositionPolicy for FixedDecomposition {
    fn name(&self) -> &str {
        &self.name
    }

    fn decompose(&self, _parent: &ParentTask) -> Vec<SubtaskSpec> {
        self.specs.clone()
    }
}

/// Decomposition policies by name, resolved from `ParentTask::policy`
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: Arc<DashMap<String, Arc<dyn DecompositionPolicy>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, policy: Arc<dyn DecompositionPolicy>) -> Result<()> {
        let name = policy.name().to_string();
        if self.policies.contains_key(&name) {
            return Err(FanoutError::configuration(format!(
                "Decomposition policy already registered: {}",
                name
            )));
        }
        self.policies.insert(name, policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DecompositionPolicy>> {
        self.policies
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FanoutError::PolicyNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Static worker-to-subtask mapping decided before any worker starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub subtask_id: String,
    pub worker: WorkerId,
}

pub struct Dispatcher {
    store: Arc<dyn SubtaskStore>,
    worker_prefix: String,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn SubtaskStore>) -> Self {
        Self {
            store,
            worker_prefix: "worker".to_string(),
        }
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    /// Resolve the parent's policy through `registry` and dispatch
    pub async fn dispatch_by_ref(
        &self,
        parent: &mut ParentTask,
        registry: &PolicyRegistry,
    ) -> Result<Vec<Subtask>> {
        let policy = registry.get(&parent.policy)?;
        self.dispatch(parent, policy.as_ref()).await
    }

    /// Create, stage and register all subtasks for `parent`.
    ///
    /// On success `parent` is updated in place to `dispatched` with its new
    /// subtask ids. On failure `parent` is left untouched.
    pub async fn dispatch(
        &self,
        parent: &mut ParentTask,
        policy: &dyn DecompositionPolicy,
    ) -> Result<Vec<Subtask>> {
        if parent.is_dispatched() {
            return Err(FanoutError::AlreadyDispatched(parent.id.clone()));
        }
        if let Some(stored) = self.store.find_parent(&parent.id).await? {
            if stored.is_dispatched() {
                return Err(FanoutError::AlreadyDispatched(parent.id.clone()));
            }
        }

        let specs = policy.decompose(parent);
        if specs.is_empty() {
            return Err(FanoutError::configuration(format!(
                "Decomposition policy {} produced no subtasks for {}",
                policy.name(),
                parent.id
            )));
        }

        let now = Utc::now();
        let subtasks: Vec<Subtask> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Subtask::pending(parent.subtask_id(i + 1), &parent.id, spec, now))
            .collect();

        for subtask in &subtasks {
            if let Some(existing) = self.store.find(&subtask.id).await? {
                // Leftovers of an earlier aborted dispatch of this parent may be re-staged.
                if existing.parent_id != parent.id || existing.status != SubtaskStatus::Pending {
                    return Err(FanoutError::configuration(format!(
                        "Subtask id collision: {} already belongs to {} ({})",
                        subtask.id, existing.parent_id, existing.status
                    )));
                }
                debug!(subtask_id = %subtask.id, "Re-staging leftover pending subtask");
            }
        }

        // Staging write: all subtasks or none.
        self.store.put_batch(&subtasks).await?;

        let mut updated = parent.clone();
        updated.status = ParentStatus::Dispatched;
        updated.subtask_ids = subtasks.iter().map(|s| s.id.clone()).collect();
        updated.updated_at = Some(Utc::now());
        if let Err(e) = self.store.put_parent(&updated).await {
            warn!(parent_id = %parent.id, error = %e, "Parent update failed, dispatch not committed");
            return Err(e);
        }
        *parent = updated;

        info!(
            parent_id = %parent.id,
            policy = policy.name(),
            subtask_count = subtasks.len(),
            "Dispatched parent task"
        );
        Ok(subtasks)
    }

    /// Map each subtask to a worker before any worker starts.
    ///
    /// Workers are taken round-robin from `workers`; with an empty list one
    /// worker id `<prefix>-<n>` is generated per subtask.
    pub fn assign(&self, subtasks: &[Subtask], workers: &[WorkerId]) -> Result<Vec<Assignment>> {
        let mut seen = HashSet::new();
        let mut assignments = Vec::with_capacity(subtasks.len());

        for (i, subtask) in subtasks.iter().enumerate() {
            if let Some(worker) = &subtask.assigned_worker {
                return Err(FanoutError::AlreadyAssigned {
                    id: subtask.id.clone(),
                    worker: worker.clone(),
                });
            }
            if subtask.status != SubtaskStatus::Pending {
                return Err(FanoutError::AlreadyClaimed {
                    id: subtask.id.clone(),
                    status: subtask.status,
                });
            }
            if !seen.insert(subtask.id.as_str()) {
                return Err(FanoutError::AlreadyAssigned {
                    id: subtask.id.clone(),
                    worker: assignments
                        .iter()
                        .find(|a: &&Assignment| a.subtask_id == subtask.id)
                        .map(|a| a.worker.clone())
                        .unwrap_or_default(),
                });
            }

            let worker = if workers.is_empty() {
                format!("{}-{}", self.worker_prefix, i + 1)
            } else {
                workers[i % workers.len()].clone()
            };
            assignments.push(Assignment {
                subtask_id: subtask.id.clone(),
                worker,
            });
        }

        debug!(count = assignments.len(), "Assigned subtasks to workers");
        Ok(assignments)
    }
}
