use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::subtask::{Subtask, SubtaskStatus, WorkerId};

/// Immutable progress view emitted once per monitor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    /// Workers owning the in-progress subtasks
    pub active_workers: Vec<WorkerId>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn from_subtasks(subtasks: &[Subtask], elapsed: Duration) -> Self {
        let mut snapshot = Self {
            total: subtasks.len(),
            completed: 0,
            failed: 0,
            in_progress: 0,
            pending: 0,
            active_workers: Vec::new(),
            elapsed,
        };
        for subtask in subtasks {
            match subtask.status {
                SubtaskStatus::Completed => snapshot.completed += 1,
                SubtaskStatus::Failed => snapshot.failed += 1,
                SubtaskStatus::Pending => snapshot.pending += 1,
                SubtaskStatus::InProgress => {
                    snapshot.in_progress += 1;
                    if let Some(worker) = &subtask.assigned_worker {
                        snapshot.active_workers.push(worker.clone());
                    }
                }
            }
        }
        snapshot
    }

    /// All subtasks reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.completed + self.failed == self.total
    }

    /// Completed share in percent, 0..=100
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed * 100) / self.total).min(100) as u8
    }
}

/// Sink for periodic progress snapshots
pub trait ProgressReporter: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressReporter for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn report(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Logs one structured line per tick
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        info!(
            completed = snapshot.completed,
            failed = snapshot.failed,
            in_progress = snapshot.in_progress,
            pending = snapshot.pending,
            total = snapshot.total,
            active = ?snapshot.active_workers,
            "Progress"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _snapshot: &ProgressSnapshot) {}
}

/// Forwards snapshots to a channel; a closed receiver is ignored
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressSnapshot>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        if self.tx.send(snapshot.clone()).is_err() {
            debug!("Progress receiver dropped");
        }
    }
}
