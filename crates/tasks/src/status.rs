//! Task status tracking on the durable business record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use prepline_core::{SubjectId, TaskStatus};

/// Durable status store failure.
#[derive(Debug, Error, Clone)]
pub enum StatusError {
    #[error("status store unavailable: {0}")]
    Unavailable(String),
}

/// Status as recorded on a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub status: TaskStatus,
    /// Set only when the status is failed.
    pub error: Option<String>,
}

/// Where task progress is recorded, keyed by the owning business record.
///
/// Backed by the relational database in production. Updates against a
/// subject that no longer exists are silent no-ops, so late or redelivered
/// work for a deleted record never fails on the status write.
pub trait StatusStore: Send + Sync {
    fn set_status(
        &self,
        subject: &SubjectId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StatusError>;

    fn status(&self, subject: &SubjectId) -> Result<Option<StatusRecord>, StatusError>;

    /// Whether the owning record still exists.
    fn exists(&self, subject: &SubjectId) -> Result<bool, StatusError>;
}

impl<S> StatusStore for Arc<S>
where
    S: StatusStore + ?Sized,
{
    fn set_status(
        &self,
        subject: &SubjectId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StatusError> {
        (**self).set_status(subject, status, error)
    }

    fn status(&self, subject: &SubjectId) -> Result<Option<StatusRecord>, StatusError> {
        (**self).status(subject)
    }

    fn exists(&self, subject: &SubjectId) -> Result<bool, StatusError> {
        (**self).exists(subject)
    }
}

/// In-memory [`StatusStore`] for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: Mutex<HashMap<SubjectId, StatusRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subject so status writes against it take effect.
    pub fn register(&self, subject: SubjectId) {
        self.records.lock().unwrap().insert(
            subject,
            StatusRecord {
                status: TaskStatus::Pending,
                error: None,
            },
        );
    }

    /// Simulate deletion of the owning record.
    pub fn remove(&self, subject: &SubjectId) {
        self.records.lock().unwrap().remove(subject);
    }
}

impl StatusStore for InMemoryStatusStore {
    fn set_status(
        &self,
        subject: &SubjectId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StatusError> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(subject) {
            record.status = status;
            record.error = error.map(str::to_string);
        }
        Ok(())
    }

    fn status(&self, subject: &SubjectId) -> Result<Option<StatusRecord>, StatusError> {
        Ok(self.records.lock().unwrap().get(subject).cloned())
    }

    fn exists(&self, subject: &SubjectId) -> Result<bool, StatusError> {
        Ok(self.records.lock().unwrap().contains_key(subject))
    }
}
