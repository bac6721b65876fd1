//! Coordinator - one fan-out/fan-in run per parent task
//!
//! Drives dispatch, assignment, concurrent execution, completion monitoring
//! and aggregation. Dispatch finishes before any worker starts; the monitor
//! runs alongside the workers and is the only thing the run waits on.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{collect_terminal, AggregatorSink};
use crate::config::FanoutConfig;
use crate::dispatcher::{DecompositionPolicy, Dispatcher, PolicyRegistry};
use crate::errors::{FanoutError, Result};
use crate::monitor::{Monitor, MonitorOutcome, NoopReporter, ProgressReporter, ProgressSnapshot};
use crate::store::{MemoryStore, SledStore, SubtaskStore};
use crate::subtask::{ParentTask, Subtask, SubtaskStatus, WorkerId};
use crate::worker::{WorkUnit, WorkerRunner};

/// Outcome of one coordinator run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// Parent as committed by the dispatcher
    pub parent: ParentTask,
    pub outcome: MonitorOutcome,
    pub snapshot: ProgressSnapshot,
    /// Final read of the subtasks in creation order
    pub subtasks: Vec<Subtask>,
    /// Whether the aggregator sink received the results
    pub aggregated: bool,
    /// Why a finished run was not handed to the sink
    pub aggregation_error: Option<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == MonitorOutcome::Completed
    }

    pub fn completed_count(&self) -> usize {
        self.count(SubtaskStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(SubtaskStatus::Failed)
    }

    fn count(&self, status: SubtaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }
}

pub struct Coordinator {
    store: Arc<dyn SubtaskStore>,
    config: FanoutConfig,
    policies: PolicyRegistry,
    unit: Arc<dyn WorkUnit>,
    reporter: Arc<dyn ProgressReporter>,
    sink: Option<Arc<dyn AggregatorSink>>,
    workers: Vec<WorkerId>,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn store(&self) -> Arc<dyn SubtaskStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Run `parent` to completion or to the monitor deadline.
    ///
    /// Failed subtasks are part of a successful run. On timeout the running
    /// attempts are detached and the report carries the partial state; the
    /// sink is only invoked once every subtask is terminal.
    pub async fn run(&self, mut parent: ParentTask) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("fanout_run", run_id = %run_id, parent_id = %parent.id);
        async move {
            let started = Instant::now();
            let dispatcher =
                Dispatcher::new(self.store.clone()).with_worker_prefix(self.config.worker_prefix.clone());
            let subtasks = dispatcher.dispatch_by_ref(&mut parent, &self.policies).await?;

            let runner = WorkerRunner::new(self.store.clone(), self.unit.clone());
            let mut execution = match self.config.pool_workers {
                Some(size) => {
                    let workers = self.pool(size);
                    info!(workers = workers.len(), subtasks = subtasks.len(), "Starting worker pool");
                    runner.spawn_pool(parent.subtask_ids.clone(), workers)
                }
                None => {
                    let assignments = dispatcher.assign(&subtasks, &self.workers)?;
                    info!(workers = assignments.len(), "Starting one worker per subtask");
                    runner.spawn(assignments)
                }
            };

            // A structural error in any attempt ends the run; the affected
            // subtask would otherwise sit in progress until the deadline.
            let monitor = Monitor::from_config(self.store.clone(), &self.config);
            let watched = tokio::select! {
                biased;
                e = execution.failure() => {
                    error!(error = %e, "Worker transition failed, aborting run");
                    return Err(e);
                }
                watched = monitor.watch(&parent.subtask_ids, self.reporter.as_ref()) => watched?,
            };

            let mut aggregated = false;
            let mut aggregation_error = None;
            let final_subtasks = match &watched.outcome {
                MonitorOutcome::Completed => {
                    execution.join().await?;
                    match collect_terminal(self.store.as_ref(), &parent).await {
                        Ok(ordered) => {
                            if let Some(sink) = &self.sink {
                                sink.accept(&ordered, &parent.output_target).await?;
                                aggregated = true;
                            }
                            ordered
                        }
                        Err(e) if !e.is_structural() => {
                            warn!(error = %e, "Results not aggregated");
                            aggregation_error = Some(e.to_string());
                            self.store.get_many(&parent.subtask_ids).await?
                        }
                        Err(e) => return Err(e),
                    }
                }
                MonitorOutcome::TimedOut { unfinished } => {
                    if let Some(e) = execution.finished_failure() {
                        error!(error = %e, "Worker transition failed before the deadline");
                        return Err(e);
                    }
                    warn!(unfinished = unfinished.len(), "Run timed out, detaching workers");
                    execution.detach();
                    watched.subtasks.clone()
                }
            };

            let report = RunReport {
                run_id: run_id.clone(),
                parent,
                outcome: watched.outcome,
                snapshot: watched.snapshot,
                subtasks: final_subtasks,
                aggregated,
                aggregation_error,
                elapsed: started.elapsed(),
            };
            info!(
                completed = report.completed_count(),
                failed = report.failed_count(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Pool members: the configured worker ids, or `size` generated ones
    fn pool(&self, size: usize) -> Vec<WorkerId> {
        if self.workers.is_empty() {
            (1..=size)
                .map(|i| format!("{}-{}", self.config.worker_prefix, i))
                .collect()
        } else {
            self.workers.iter().take(size).cloned().collect()
        }
    }
}

/// Builder for Coordinator
pub struct CoordinatorBuilder {
    config: FanoutConfig,
    store: Option<Arc<dyn SubtaskStore>>,
    policies: PolicyRegistry,
    pending_policies: Vec<Arc<dyn DecompositionPolicy>>,
    unit: Option<Arc<dyn WorkUnit>>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    sink: Option<Arc<dyn AggregatorSink>>,
    workers: Vec<WorkerId>,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: FanoutConfig::default(),
            store: None,
            policies: PolicyRegistry::new(),
            pending_policies: Vec::new(),
            unit: None,
            reporter: None,
            sink: None,
            workers: Vec::new(),
        }
    }

    pub fn config(mut self, config: FanoutConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of the one derived from `store_path`
    pub fn store(mut self, store: Arc<dyn SubtaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policies(mut self, registry: PolicyRegistry) -> Self {
        self.policies = registry;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn DecompositionPolicy>) -> Self {
        self.pending_policies.push(policy);
        self
    }

    pub fn work_unit(mut self, unit: Arc<dyn WorkUnit>) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AggregatorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Named workers, used round-robin (or as pool members)
    pub fn workers<I, W>(mut self, workers: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: Into<WorkerId>,
    {
        self.workers = workers.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        self.config.validate()?;
        let unit = self
            .unit
            .ok_or_else(|| FanoutError::configuration("Coordinator requires a work unit"))?;
        for policy in self.pending_policies {
            self.policies.register(policy)?;
        }

        let store: Arc<dyn SubtaskStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SledStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        Ok(Coordinator {
            store,
            config: self.config,
            policies: self.policies,
            unit,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(NoopReporter)),
            sink: self.sink,
            workers: self.workers,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::FixedDecomposition;
    use crate::subtask::SubtaskContext;
    use crate::worker::FnWorkUnit;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    fn three_way() -> Arc<dyn DecompositionPolicy> {
        Arc::new(FixedDecomposition::from_pairs(
            "three-way",
            [("A", "first"), ("B", "second"), ("C", "third")],
        ))
    }

    fn echo() -> Arc<dyn WorkUnit> {
        Arc::new(FnWorkUnit::new("echo", |ctx: SubtaskContext| async move {
            Ok(format!("{}: {}", ctx.title, ctx.description))
        }))
    }

    /// Sink that remembers what it was given
    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<(Vec<String>, String)>>,
    }

    #[async_trait]
    impl AggregatorSink for RecordingSink {
        async fn accept(&self, subtasks: &[Subtask], output_target: &str) -> Result<()> {
            let ids = subtasks.iter().map(|s| s.id.clone()).collect();
            self.received.lock().unwrap().push((ids, output_target.to_string()));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_completes_and_aggregates() {
        let sink = Arc::new(RecordingSink::default());
        let coordinator = Coordinator::builder()
            .config(FanoutConfig::development())
            .policy(three_way())
            .work_unit(echo())
            .sink(sink.clone())
            .build()
            .unwrap();

        let report = coordinator
            .run(ParentTask::new("task-1", "abc", "three-way", "out/abc.md"))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert!(report.aggregated);
        assert!(report.aggregation_error.is_none());
        assert_eq!(report.completed_count(), 3);
        assert_eq!(report.subtasks[1].result.as_deref(), Some("B: second"));
        let received = sink.received.lock().unwrap();
        assert_eq!(
            *received,
            vec![(
                vec!["abc-1".to_string(), "abc-2".to_string(), "abc-3".to_string()],
                "out/abc.md".to_string()
            )]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_mode_uses_configured_size() {
        let config = FanoutConfig::builder()
            .poll_interval(Duration::from_millis(20))
            .max_wait(Duration::from_secs(10))
            .worker_prefix("pool")
            .pool_workers(2)
            .build()
            .unwrap();
        let coordinator = Coordinator::builder()
            .config(config)
            .policy(three_way())
            .work_unit(echo())
            .build()
            .unwrap();

        let report = coordinator
            .run(ParentTask::new("task-1", "pool", "three-way", "out.md"))
            .await
            .unwrap();
        assert_eq!(report.completed_count(), 3);
        for subtask in &report.subtasks {
            let worker = subtask.assigned_worker.as_deref().unwrap();
            assert!(worker == "pool-1" || worker == "pool-2", "unexpected worker {}", worker);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_returns_partial_report() {
        let config = FanoutConfig::builder()
            .poll_interval(Duration::from_millis(20))
            .max_wait(Duration::from_millis(100))
            .build()
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let slow = Arc::new(FnWorkUnit::new("slow", |ctx: SubtaskContext| async move {
            if ctx.title == "C" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("done".to_string())
        }));
        let coordinator = Coordinator::builder()
            .config(config)
            .policy(three_way())
            .work_unit(slow)
            .sink(sink.clone())
            .build()
            .unwrap();

        let start = Instant::now();
        let report = coordinator
            .run(ParentTask::new("task-1", "slow", "three-way", "out.md"))
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(
            report.outcome,
            MonitorOutcome::TimedOut {
                unfinished: vec!["slow-3".to_string()]
            }
        );
        assert_eq!(report.completed_count(), 2);
        assert!(!report.aggregated);
        assert!(sink.received.lock().unwrap().is_empty());
    }

    /// Memory store whose writes of finished records fail
    struct LosesResults {
        inner: MemoryStore,
    }

    #[async_trait]
    impl SubtaskStore for LosesResults {
        async fn put(&self, subtask: &Subtask) -> Result<()> {
            if subtask.is_terminal() {
                return Err(FanoutError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk gone",
                )));
            }
            self.inner.put(subtask).await
        }
        async fn put_batch(&self, subtasks: &[Subtask]) -> Result<()> {
            self.inner.put_batch(subtasks).await
        }
        async fn find(&self, id: &str) -> Result<Option<Subtask>> {
            self.inner.find(id).await
        }
        async fn list(&self) -> Result<Vec<Subtask>> {
            self.inner.list().await
        }
        async fn claim(&self, id: &str, worker: &str, now: DateTime<Utc>) -> Result<Subtask> {
            self.inner.claim(id, worker, now).await
        }
        async fn put_parent(&self, parent: &ParentTask) -> Result<()> {
            self.inner.put_parent(parent).await
        }
        async fn find_parent(&self, id: &str) -> Result<Option<ParentTask>> {
            self.inner.find_parent(id).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_failure_in_worker_aborts_run() {
        let config = FanoutConfig::builder()
            .poll_interval(Duration::from_millis(20))
            .max_wait(Duration::from_secs(5))
            .build()
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let coordinator = Coordinator::builder()
            .config(config)
            .store(Arc::new(LosesResults { inner: MemoryStore::new() }))
            .policy(three_way())
            .work_unit(echo())
            .sink(sink.clone())
            .build()
            .unwrap();

        let start = Instant::now();
        let err = coordinator
            .run(ParentTask::new("task-1", "lost", "three-way", "out.md"))
            .await
            .unwrap_err();

        assert!(matches!(err, FanoutError::Io(_)), "got {:?}", err);
        // well before the monitor deadline
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_result_skips_aggregation() {
        let sink = Arc::new(RecordingSink::default());
        let blank_b = Arc::new(FnWorkUnit::new("blank-b", |ctx: SubtaskContext| async move {
            if ctx.title == "B" {
                return Ok(String::new());
            }
            Ok(ctx.title)
        }));
        let coordinator = Coordinator::builder()
            .config(FanoutConfig::development())
            .policy(three_way())
            .work_unit(blank_b)
            .sink(sink.clone())
            .build()
            .unwrap();

        let report = coordinator
            .run(ParentTask::new("task-1", "blank", "three-way", "out.md"))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed_count(), 3);
        assert_eq!(report.subtasks[1].result.as_deref(), Some(""));
        assert!(!report.aggregated);
        let reason = report.aggregation_error.as_deref().unwrap();
        assert!(reason.contains("blank-2"), "reason: {}", reason);
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_requires_work_unit() {
        let err = Coordinator::builder().policy(three_way()).build().err().unwrap();
        assert!(matches!(err, FanoutError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_unknown_policy_fails_before_execution() {
        let coordinator = Coordinator::builder().work_unit(echo()).build().unwrap();
        let err = coordinator
            .run(ParentTask::new("task-1", "x", "nope", "out.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::PolicyNotFound(_)));
        assert!(coordinator.store().list().await.unwrap().is_empty());
    }
}
