use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::errors::{FanoutError, Result};

pub type SubtaskId = String;
pub type WorkerId = String;

/// Status of a single subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::InProgress => "in_progress",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubtaskStatus::Pending),
            "in_progress" => Ok(SubtaskStatus::InProgress),
            "completed" => Ok(SubtaskStatus::Completed),
            "failed" => Ok(SubtaskStatus::Failed),
            _ => Err(format!("Unknown subtask status: {}", s)),
        }
    }
}

/// One entry produced by a decomposition policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub title: String,
    pub description: String,
}

impl SubtaskSpec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Subtask record, the unit held by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub parent_id: String,
    pub title: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub assigned_worker: Option<WorkerId>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// Create a pending subtask from a decomposition entry
    pub fn pending(
        id: impl Into<SubtaskId>,
        parent_id: impl Into<String>,
        spec: SubtaskSpec,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            title: spec.title,
            description: spec.description,
            status: SubtaskStatus::Pending,
            assigned_worker: None,
            result: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time of the attempt, once terminal
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Context handed to the unit of work for this subtask
    pub fn context(&self, worker: &str) -> SubtaskContext {
        SubtaskContext {
            subtask_id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            worker: worker.to_string(),
        }
    }
}

/// Everything a unit of work gets to see about its subtask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskContext {
    pub subtask_id: SubtaskId,
    pub parent_id: String,
    pub title: String,
    pub description: String,
    pub worker: WorkerId,
}

/// Dispatch status of a parent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentStatus {
    #[default]
    Created,
    Dispatched,
}

/// Parent task definition. Only `status`, `subtask_ids` and `updated_at` are
/// written by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentTask {
    pub id: String,
    /// Prefix for generated subtask ids
    pub kind: String,
    /// Name of the decomposition policy in the policy registry
    pub policy: String,
    pub output_target: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ParentStatus,
    #[serde(default)]
    pub subtask_ids: Vec<SubtaskId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ParentTask {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        policy: impl Into<String>,
        output_target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            policy: policy.into(),
            output_target: output_target.into(),
            description: None,
            status: ParentStatus::Created,
            subtask_ids: Vec::new(),
            updated_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Deterministic id of the subtask at `index` (1-based)
    pub fn subtask_id(&self, index: usize) -> SubtaskId {
        format!("{}-{}", self.kind, index)
    }

    pub fn is_dispatched(&self) -> bool {
        self.status == ParentStatus::Dispatched
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load a parent task definition from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            other => Err(FanoutError::configuration(format!(
                "Unsupported task file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}
