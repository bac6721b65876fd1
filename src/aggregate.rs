//! Result aggregation
//!
//! Combining results into a document is the sink's job; the core only
//! guarantees an ordered read of terminal subtasks.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use crate::errors::{FanoutError, Result};
use crate::store::SubtaskStore;
use crate::subtask::{ParentTask, Subtask, SubtaskStatus};

/// Read the parent's subtasks in creation order, all of them terminal
pub async fn collect_terminal(store: &dyn SubtaskStore, parent: &ParentTask) -> Result<Vec<Subtask>> {
    let subtasks = store.get_many(&parent.subtask_ids).await?;
    for subtask in &subtasks {
        let payload = match subtask.status {
            SubtaskStatus::Completed => subtask.result.as_deref(),
            SubtaskStatus::Failed => subtask.error.as_deref(),
            status => {
                return Err(FanoutError::NotTerminal {
                    id: subtask.id.clone(),
                    status,
                })
            }
        };
        if payload.map_or(true, str::is_empty) {
            return Err(FanoutError::invariant(
                &subtask.id,
                format!("{} subtask carries no payload", subtask.status),
            ));
        }
    }
    Ok(subtasks)
}

/// Consumer of the final, ordered subtask list
#[async_trait]
pub trait AggregatorSink: Send + Sync {
    async fn accept(&self, subtasks: &[Subtask], output_target: &str) -> Result<()>;
}

/// Writes `header`, one section per subtask and `footer` as a markdown file
#[derive(Debug, Clone, Default)]
pub struct MarkdownSink {
    header: String,
    footer: String,
}

impl MarkdownSink {
    pub fn new(header: impl Into<String>, footer: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            footer: footer.into(),
        }
    }

    pub fn render(&self, subtasks: &[Subtask]) -> String {
        let mut doc = String::new();
        if !self.header.is_empty() {
            doc.push_str(self.header.trim_end());
            doc.push_str("\n\n");
        }
        for subtask in subtasks {
            doc.push_str(&format!("## {}\n\n", subtask.title));
            let worker = subtask.assigned_worker.as_deref().unwrap_or("unassigned");
            match subtask.status {
                SubtaskStatus::Completed => {
                    doc.push_str(&format!("_Completed by {}_\n\n", worker));
                    doc.push_str(subtask.result.as_deref().unwrap_or_default().trim_end());
                }
                _ => {
                    doc.push_str(&format!("_Failed ({})_\n\n", worker));
                    doc.push_str(&format!(
                        "> {}",
                        subtask.error.as_deref().unwrap_or_default().trim_end()
                    ));
                }
            }
            doc.push_str("\n\n");
        }
        if !self.footer.is_empty() {
            doc.push_str("---\n\n");
            doc.push_str(self.footer.trim_end());
            doc.push('\n');
        }
        doc
    }
}

#[async_trait]
impl AggregatorSink for MarkdownSink {
    async fn accept(&self, subtasks: &[Subtask], output_target: &str) -> Result<()> {
        let path = Path::new(output_target);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let doc = self.render(subtasks);
        tokio::fs::write(path, doc.as_bytes()).await?;
        info!(output = %output_target, sections = subtasks.len(), bytes = doc.len(), "Wrote combined document");
        Ok(())
    }
}
