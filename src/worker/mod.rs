//! Worker execution model
//!
//! Every `(subtask, worker)` pair runs as its own tokio task. An attempt
//! claims the subtask (`pending -> in_progress`), runs the unit of work and
//! records the terminal state. Failures of the unit are outcome data and
//! never abort sibling subtasks; only store errors propagate.

pub mod function_unit;
pub mod registry;

pub use function_unit::FnWorkUnit;
pub use registry::WorkUnitRegistry;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Assignment;
use crate::errors::{FanoutError, Result};
use crate::store::SubtaskStore;
use crate::subtask::{Subtask, SubtaskContext, SubtaskId, SubtaskStatus, WorkerId};

/// External unit of work executed once per subtask attempt
#[async_trait]
pub trait WorkUnit: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        "No description provided"
    }

    /// Produce the subtask's result payload, or an error describing the failure
    async fn execute(&self, ctx: SubtaskContext) -> anyhow::Result<String>;
}

/// Runs attempts against one store with one unit of work
#[derive(Clone)]
pub struct WorkerRunner {
    store: Arc<dyn SubtaskStore>,
    unit: Arc<dyn WorkUnit>,
}

impl WorkerRunner {
    pub fn new(store: Arc<dyn SubtaskStore>, unit: Arc<dyn WorkUnit>) -> Self {
        Self { store, unit }
    }

    /// Run one attempt of `subtask_id` as `worker` and return the terminal record
    pub async fn run_attempt(&self, subtask_id: &str, worker: &str) -> Result<Subtask> {
        let mut subtask = self.store.claim(subtask_id, worker, Utc::now()).await?;
        info!(subtask_id = %subtask_id, worker = %worker, unit = self.unit.name(), "Worker started subtask");

        // Run the unit in its own task so a panic is recorded instead of
        // tearing down the attempt.
        let unit = self.unit.clone();
        let ctx = subtask.context(worker);
        let outcome = tokio::spawn(async move { unit.execute(ctx).await }).await;

        let now = Utc::now();
        match outcome {
            Ok(Ok(result)) => {
                subtask.complete(result, now)?;
                info!(subtask_id = %subtask_id, worker = %worker, "Worker completed subtask");
            }
            Ok(Err(e)) => {
                subtask.fail(format!("{:#}", e), now)?;
                warn!(subtask_id = %subtask_id, worker = %worker, error = %e, "Worker failed subtask");
            }
            Err(join_error) => {
                subtask.fail(format!("work unit panicked: {}", join_error), now)?;
                error!(subtask_id = %subtask_id, worker = %worker, "Work unit panicked");
            }
        }

        self.store.put(&subtask).await?;
        Ok(subtask)
    }

    /// Start every assignment concurrently
    pub fn spawn(&self, assignments: Vec<Assignment>) -> ExecutionHandle {
        let handles = assignments
            .into_iter()
            .map(|assignment| {
                let runner = self.clone();
                tokio::spawn(async move {
                    let result = runner
                        .run_attempt(&assignment.subtask_id, &assignment.worker)
                        .await;
                    if let Err(e) = &result {
                        error!(subtask_id = %assignment.subtask_id, error = %e, "Attempt aborted");
                    }
                    result.map(|subtask| vec![subtask])
                })
            })
            .collect();
        ExecutionHandle::new(handles)
    }

    /// Start `workers` that pull from the shared pending set of `subtask_ids`.
    ///
    /// Workers race through the same list; `claim` guarantees that each
    /// subtask is executed by exactly one of them.
    pub fn spawn_pool(&self, subtask_ids: Vec<SubtaskId>, workers: Vec<WorkerId>) -> ExecutionHandle {
        let ids = Arc::new(subtask_ids);
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(offset, worker)| {
                let runner = self.clone();
                let ids = ids.clone();
                tokio::spawn(async move { runner.pull_loop(&ids, offset, &worker).await })
            })
            .collect();
        ExecutionHandle::new(handles)
    }

    async fn pull_loop(&self, ids: &[SubtaskId], offset: usize, worker: &str) -> Result<Vec<Subtask>> {
        let mut finished = Vec::new();
        // Start at a worker-specific offset to spread the first claims.
        for i in 0..ids.len() {
            let id = &ids[(offset + i) % ids.len()];
            let current = self.store.get(id).await?;
            if current.status != SubtaskStatus::Pending {
                continue;
            }
            match self.run_attempt(id, worker).await {
                Ok(subtask) => finished.push(subtask),
                Err(FanoutError::AlreadyClaimed { .. }) => {
                    debug!(subtask_id = %id, worker = %worker, "Lost claim race, moving on");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(finished)
    }
}

/// Join handles of running attempts
pub struct ExecutionHandle {
    running: FuturesUnordered<JoinHandle<Result<Vec<Subtask>>>>,
    finished: Vec<Subtask>,
}

impl ExecutionHandle {
    fn new(handles: Vec<JoinHandle<Result<Vec<Subtask>>>>) -> Self {
        Self {
            running: handles.into_iter().collect(),
            finished: Vec::new(),
        }
    }

    /// Number of attempts not yet collected
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.running.iter().all(|h| h.is_finished())
    }

    /// Resolve with the first structural error of an attempt.
    ///
    /// Successful attempts are collected along the way; when every attempt
    /// succeeded the future never resolves.
    pub async fn failure(&mut self) -> FanoutError {
        while let Some(joined) = self.running.next().await {
            if let Some(e) = self.collect(joined) {
                return e;
            }
        }
        std::future::pending().await
    }

    /// Structural error of an attempt that already finished, without waiting
    pub fn finished_failure(&mut self) -> Option<FanoutError> {
        while let Some(Some(joined)) = self.running.next().now_or_never() {
            if let Some(e) = self.collect(joined) {
                return Some(e);
            }
        }
        None
    }

    fn collect(
        &mut self,
        joined: std::result::Result<Result<Vec<Subtask>>, JoinError>,
    ) -> Option<FanoutError> {
        match joined {
            Ok(Ok(subtasks)) => {
                self.finished.extend(subtasks);
                None
            }
            Ok(Err(e)) if !e.is_structural() => {
                warn!(error = %e, "Attempt skipped");
                None
            }
            Ok(Err(e)) => Some(e),
            Err(e) => Some(FanoutError::Join(e)),
        }
    }

    /// Wait for every attempt; the first structural error wins
    pub async fn join(mut self) -> Result<Vec<Subtask>> {
        while let Some(joined) = self.running.next().await {
            if let Some(e) = self.collect(joined) {
                return Err(e);
            }
        }
        Ok(self.finished)
    }

    /// Let the attempts keep running in the background
    pub fn detach(self) {
        debug!(count = self.running.len(), "Detaching running attempts");
    }
}
