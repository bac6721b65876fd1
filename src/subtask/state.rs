//! Subtask state machine
//!
//! `pending -> in_progress -> completed | failed`. Terminal states are final
//! and `pending` never jumps straight to a terminal state, so every terminal
//! record carries both `started_at` and `completed_at`.

use chrono::{DateTime, Utc};

use super::model::{Subtask, SubtaskStatus};
use crate::errors::{FanoutError, Result};

const UNKNOWN_FAILURE: &str = "work unit failed without a description";

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        matches!(
            (self, next),
            (SubtaskStatus::Pending, SubtaskStatus::InProgress)
                | (SubtaskStatus::InProgress, SubtaskStatus::Completed)
                | (SubtaskStatus::InProgress, SubtaskStatus::Failed)
        )
    }
}

impl Subtask {
    fn check_transition(&self, next: SubtaskStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(FanoutError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            })
        }
    }

    /// Begin an attempt: `pending -> in_progress`
    pub fn start(&mut self, worker: &str, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(SubtaskStatus::InProgress)?;
        if let Some(existing) = &self.assigned_worker {
            return Err(FanoutError::AlreadyAssigned {
                id: self.id.clone(),
                worker: existing.clone(),
            });
        }
        self.status = SubtaskStatus::InProgress;
        self.assigned_worker = Some(worker.to_string());
        self.started_at = Some(now);
        Ok(())
    }

    /// Finish an attempt successfully: `in_progress -> completed`
    pub fn complete(&mut self, result: String, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(SubtaskStatus::Completed)?;
        self.status = SubtaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(self.clamp_completion(now));
        Ok(())
    }

    /// Finish an attempt with an error: `in_progress -> failed`
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.check_transition(SubtaskStatus::Failed)?;
        let mut error = error.into();
        if error.trim().is_empty() {
            error = UNKNOWN_FAILURE.to_string();
        }
        self.status = SubtaskStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self.completed_at = Some(self.clamp_completion(now));
        Ok(())
    }

    // Clocks are not monotonic across threads; completed_at >= started_at.
    fn clamp_completion(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.started_at {
            Some(started) if started > now => started,
            _ => now,
        }
    }

    /// Verify the record-level invariants of the data model
    pub fn check_invariants(&self) -> Result<()> {
        let started_expected = self.status != SubtaskStatus::Pending;
        if self.started_at.is_some() != started_expected {
            return Err(FanoutError::invariant(
                &self.id,
                format!("started_at presence does not match status {}", self.status),
            ));
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Err(FanoutError::invariant(
                &self.id,
                format!("completed_at presence does not match status {}", self.status),
            ));
        }
        if self.result.is_some() != (self.status == SubtaskStatus::Completed) {
            return Err(FanoutError::invariant(&self.id, "result present iff completed"));
        }
        if self.error.is_some() != (self.status == SubtaskStatus::Failed) {
            return Err(FanoutError::invariant(&self.id, "error present iff failed"));
        }
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            if end < start {
                return Err(FanoutError::invariant(&self.id, "completed_at before started_at"));
            }
        }
        if started_expected && self.assigned_worker.is_none() {
            return Err(FanoutError::invariant(&self.id, "started without an assigned worker"));
        }
        Ok(())
    }
}
