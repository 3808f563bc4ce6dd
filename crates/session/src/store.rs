//! Durable session storage.
//!
//! The database keeps the questions as generated plus every answer as it
//! was recorded, so an evicted cache entry can be rebuilt by replay. The
//! evaluation pipeline's status also lives here, on the session row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use prepline_core::{SessionId, SubjectId, TaskStatus};
use prepline_tasks::{StatusError, StatusRecord, StatusStore};

use crate::snapshot::{SessionStatus, SessionStep};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session '{0}' not found")]
    NotFound(SessionId),
}

/// One answer as it was submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAnswer {
    pub step_index: usize,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

/// Durable form of a session: questions as generated, answers as a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub subject_id: Option<SubjectId>,
    pub source_text: String,
    /// Questions without answers; answers live in `answers`.
    pub steps: Vec<SessionStep>,
    pub answers: Vec<RecordedAnswer>,
    pub current_index: usize,
    pub status: SessionStatus,
    /// Progress of the background evaluation, once one was enqueued.
    pub eval_status: Option<TaskStatus>,
    pub eval_error: Option<String>,
}

pub trait SessionStore: Send + Sync {
    fn insert(&self, record: SessionRecord) -> Result<(), SessionStoreError>;

    fn find(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError>;

    /// Append one answer and advance the stored index past it.
    fn record_answer(
        &self,
        session_id: &SessionId,
        answer: RecordedAnswer,
    ) -> Result<(), SessionStoreError>;

    fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError>;

    /// The unfinished session of a subject, newest first if several exist.
    fn find_unfinished(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SessionId>, SessionStoreError>;

    fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError>;
}

impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    fn insert(&self, record: SessionRecord) -> Result<(), SessionStoreError> {
        (**self).insert(record)
    }

    fn find(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError> {
        (**self).find(session_id)
    }

    fn record_answer(
        &self,
        session_id: &SessionId,
        answer: RecordedAnswer,
    ) -> Result<(), SessionStoreError> {
        (**self).record_answer(session_id, answer)
    }

    fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError> {
        (**self).update_status(session_id, status)
    }

    fn find_unfinished(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SessionId>, SessionStoreError> {
        (**self).find_unfinished(subject)
    }

    fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        (**self).delete(session_id)
    }
}

/// In-memory [`SessionStore`] for tests and embedded use.
///
/// Also a [`StatusStore`], with the session id doubling as the task
/// subject, so the evaluation pipeline writes its progress straight onto
/// the session row.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, record: SessionRecord) -> Result<(), SessionStoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    fn find(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, SessionStoreError> {
        Ok(self.records.lock().unwrap().get(session_id).cloned())
    }

    fn record_answer(
        &self,
        session_id: &SessionId,
        answer: RecordedAnswer,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| SessionStoreError::NotFound(session_id.clone()))?;
        record.current_index = record.current_index.max(answer.step_index + 1);
        record.answers.push(answer);
        Ok(())
    }

    fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), SessionStoreError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| SessionStoreError::NotFound(session_id.clone()))?;
        record.status = status;
        Ok(())
    }

    fn find_unfinished(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SessionId>, SessionStoreError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.subject_id.as_ref() == Some(subject) && r.status.is_unfinished())
            .map(|r| r.session_id.clone())
            .next())
    }

    fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        self.records.lock().unwrap().remove(session_id);
        Ok(())
    }
}

impl StatusStore for InMemorySessionStore {
    fn set_status(
        &self,
        subject: &SubjectId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), StatusError> {
        let session_id = SessionId::from(subject.as_str());
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(&session_id) {
            record.eval_status = Some(status);
            record.eval_error = error.map(str::to_string);
            if status == TaskStatus::Completed {
                record.status = SessionStatus::Evaluated;
            }
        }
        Ok(())
    }

    fn status(&self, subject: &SubjectId) -> Result<Option<StatusRecord>, StatusError> {
        let session_id = SessionId::from(subject.as_str());
        let records = self.records.lock().unwrap();
        Ok(records.get(&session_id).and_then(|record| {
            record.eval_status.map(|status| StatusRecord {
                status,
                error: record.eval_error.clone(),
            })
        }))
    }

    fn exists(&self, subject: &SubjectId) -> Result<bool, StatusError> {
        let session_id = SessionId::from(subject.as_str());
        Ok(self.records.lock().unwrap().contains_key(&session_id))
    }
}
