//! Completion monitor
//!
//! Re-reads the watched subtasks once per tick until every one is terminal or
//! the deadline passes. The monitor never writes to the store.

pub mod reporter;
pub mod wait;

pub use reporter::{ChannelReporter, NoopReporter, ProgressReporter, ProgressSnapshot, TracingReporter};
pub use wait::{NotifyWait, PollingWait, WaitStrategy};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{FanoutConfig, WaitMode};
use crate::errors::Result;
use crate::store::SubtaskStore;
use crate::subtask::{Subtask, SubtaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Every watched subtask reached a terminal state
    Completed,
    /// The deadline passed; `unfinished` lists the non-terminal subtasks
    TimedOut { unfinished: Vec<SubtaskId> },
}

/// Final state seen by the monitor
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub snapshot: ProgressSnapshot,
    /// Last read of the watched subtasks, in watch order
    pub subtasks: Vec<Subtask>,
}

impl MonitorReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == MonitorOutcome::Completed
    }
}

pub struct Monitor {
    store: Arc<dyn SubtaskStore>,
    poll_interval: Duration,
    max_wait: Duration,
    mode: WaitMode,
}

impl Monitor {
    pub fn new(store: Arc<dyn SubtaskStore>, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            store,
            poll_interval,
            max_wait,
            mode: WaitMode::Polling,
        }
    }

    pub fn from_config(store: Arc<dyn SubtaskStore>, config: &FanoutConfig) -> Self {
        Self::new(store, config.poll_interval, config.max_wait).with_wait_mode(config.wait_strategy)
    }

    pub fn with_wait_mode(mut self, mode: WaitMode) -> Self {
        self.mode = mode;
        self
    }

    fn wait_strategy(&self) -> Box<dyn WaitStrategy> {
        match self.mode {
            WaitMode::Polling => Box::new(PollingWait),
            WaitMode::Notify => match self.store.subscribe() {
                Some(rx) => Box::new(NotifyWait::new(rx)),
                None => {
                    debug!("Store has no change feed, falling back to polling");
                    Box::new(PollingWait)
                }
            },
        }
    }

    /// Watch `ids` with the configured wait strategy
    pub async fn watch(&self, ids: &[SubtaskId], reporter: &dyn ProgressReporter) -> Result<MonitorReport> {
        let mut strategy = self.wait_strategy();
        self.watch_with(ids, reporter, strategy.as_mut()).await
    }

    /// Watch `ids`, waiting between ticks with `strategy`.
    ///
    /// Returns no later than one poll interval after the deadline; the final
    /// sleep is clipped to the time left.
    pub async fn watch_with(
        &self,
        ids: &[SubtaskId],
        reporter: &dyn ProgressReporter,
        strategy: &mut dyn WaitStrategy,
    ) -> Result<MonitorReport> {
        let started = Instant::now();
        let deadline = started + self.max_wait;
        let mut ticks = 0u64;

        loop {
            ticks += 1;
            let subtasks = self.store.get_many(ids).await?;
            let snapshot = ProgressSnapshot::from_subtasks(&subtasks, started.elapsed());
            debug!(
                tick = ticks,
                completed = snapshot.completed,
                failed = snapshot.failed,
                in_progress = snapshot.in_progress,
                "Monitor tick"
            );
            reporter.report(&snapshot);

            if snapshot.is_complete() {
                info!(
                    total = snapshot.total,
                    failed = snapshot.failed,
                    elapsed_ms = snapshot.elapsed.as_millis() as u64,
                    "All subtasks finished"
                );
                return Ok(MonitorReport {
                    outcome: MonitorOutcome::Completed,
                    snapshot,
                    subtasks,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let unfinished: Vec<SubtaskId> = subtasks
                    .iter()
                    .filter(|s| !s.is_terminal())
                    .map(|s| s.id.clone())
                    .collect();
                warn!(
                    unfinished = ?unfinished,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "Monitor deadline passed"
                );
                return Ok(MonitorReport {
                    outcome: MonitorOutcome::TimedOut { unfinished },
                    snapshot,
                    subtasks,
                });
            }

            strategy.wait(self.poll_interval.min(deadline - now)).await;
        }
    }
}
