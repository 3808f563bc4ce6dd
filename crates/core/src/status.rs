//! Asynchronous task status, visible on the owning business record.

use serde::{Deserialize, Serialize};

/// Status of an asynchronous task (vectorization, analysis, evaluation).
///
/// Lives on the durable business record rather than the log, so it survives
/// log trimming and is visible to synchronous reads (the UI polls it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Enqueued, waiting to be picked up.
    Pending,
    /// A consumer is currently executing the task body.
    Processing,
    /// Task body succeeded and its effect was persisted.
    Completed,
    /// Retries exhausted, or the task could not be enqueued at all.
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
