//! Producer side of the pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use prepline_coord::{CoordResult, CoordStore};
use prepline_core::{truncate_error, SubjectId, TaskStatus};

use crate::message::{TaskKind, TaskMessage};
use crate::status::StatusStore;
use crate::STREAM_MAX_LEN;

/// Appends task messages for one [`TaskKind`] and keeps the subject's
/// status in step.
///
/// Enqueueing never surfaces an error to the caller: the synchronous
/// request that triggered the task has already committed its own work, so a
/// broken coordination store degrades to a failed task status instead of a
/// failed request.
pub struct TaskProducer {
    store: Arc<dyn CoordStore>,
    status: Arc<dyn StatusStore>,
    kind: TaskKind,
}

impl TaskProducer {
    pub fn new(store: Arc<dyn CoordStore>, status: Arc<dyn StatusStore>, kind: TaskKind) -> Self {
        Self {
            store,
            status,
            kind,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Mark the subject pending and append a first-attempt message.
    pub fn enqueue(&self, subject: SubjectId, payload: BTreeMap<String, String>) {
        if let Err(e) = self
            .status
            .set_status(&subject, TaskStatus::Pending, None)
        {
            error!(kind = %self.kind, subject_id = %subject, error = %e, "failed to mark task pending");
        }

        let message = TaskMessage::new(subject, payload);
        match self.publish(&message) {
            Ok(entry_id) => {
                debug!(kind = %self.kind, subject_id = %message.subject_id, %entry_id, "task enqueued");
            }
            Err(e) => {
                error!(kind = %self.kind, subject_id = %message.subject_id, error = %e, "task enqueue failed");
                let reason = truncate_error(&format!("enqueue failed: {e}"));
                if let Err(e) = self.status.set_status(
                    &message.subject_id,
                    TaskStatus::Failed,
                    Some(&reason),
                ) {
                    error!(kind = %self.kind, subject_id = %message.subject_id, error = %e, "failed to record enqueue failure");
                }
            }
        }
    }

    /// Manual retry entry point: start the task over with a fresh payload.
    ///
    /// The caller re-derives the payload (re-fetching the source document,
    /// typically); retry counting restarts at zero.
    pub fn reenqueue(&self, subject: SubjectId, payload: BTreeMap<String, String>) {
        debug!(kind = %self.kind, subject_id = %subject, "manual re-enqueue");
        self.enqueue(subject, payload);
    }

    /// Append an already-built message, trimming the stream approximately to
    /// its retention cap. Used for retries, where the caller handles errors.
    pub(crate) fn publish(&self, message: &TaskMessage) -> CoordResult<String> {
        self.store.stream_add(
            self.kind.stream_key(),
            &message.to_fields(),
            Some(STREAM_MAX_LEN),
        )
    }
}
