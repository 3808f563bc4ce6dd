//! Session orchestration: cache-first reads, dual writes, evaluation handoff.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use prepline_core::{SessionId, SubjectId};
use prepline_tasks::TaskProducer;

use crate::cache::{SessionCache, SessionCacheError};
use crate::snapshot::{SessionSnapshot, SessionStatus, SessionStep};
use crate::store::{RecordedAnswer, SessionRecord, SessionStore, SessionStoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(SessionId),

    #[error("session '{session_id}' has no step at index {index}")]
    InvalidStep { session_id: SessionId, index: usize },

    #[error("session '{0}' is already completed")]
    AlreadyCompleted(SessionId),

    #[error(transparent)]
    Cache(#[from] SessionCacheError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

/// What the client learns from submitting an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOutcome {
    pub finished: bool,
    pub next_index: usize,
    pub total_steps: usize,
    pub next_step: Option<SessionStep>,
}

/// The session workflow over cache, database and the evaluation pipeline.
///
/// The cache is authoritative while a session lives there; the database
/// write of each mutation is best effort and only logged on failure, since
/// it exists to survive eviction, not to serve reads. Reads that miss the
/// cache rebuild the snapshot from the stored questions and answer log.
pub struct SessionService {
    cache: SessionCache,
    store: Arc<dyn SessionStore>,
    evaluator: TaskProducer,
}

impl SessionService {
    /// `evaluator` must produce evaluate-kind tasks whose status store
    /// writes to the same rows as `store`.
    pub fn new(cache: SessionCache, store: Arc<dyn SessionStore>, evaluator: TaskProducer) -> Self {
        Self {
            cache,
            store,
            evaluator,
        }
    }

    /// Start a session, or resume the subject's unfinished one.
    ///
    /// `force_new` skips the resume lookup and always starts fresh.
    pub fn create(
        &self,
        subject: Option<SubjectId>,
        source_text: impl Into<String>,
        steps: Vec<SessionStep>,
        force_new: bool,
    ) -> Result<SessionSnapshot, SessionError> {
        if !force_new {
            if let Some(subject) = &subject {
                if let Some(existing) = self.find_unfinished(subject)? {
                    info!(session_id = %existing.session_id, subject_id = %subject, "resuming unfinished session");
                    return Ok(existing);
                }
            }
        }

        let snapshot = SessionSnapshot::new(
            SessionId::generate(),
            subject,
            source_text,
            steps,
        );

        let record = SessionRecord {
            session_id: snapshot.session_id.clone(),
            subject_id: snapshot.subject_id.clone(),
            source_text: snapshot.source_text.clone(),
            steps: snapshot.steps.clone(),
            answers: Vec::new(),
            current_index: 0,
            status: SessionStatus::Created,
            eval_status: None,
            eval_error: None,
        };
        if let Err(e) = self.store.insert(record) {
            warn!(session_id = %snapshot.session_id, error = %e, "durable session insert failed");
        }

        self.cache.save(&snapshot)?;
        info!(session_id = %snapshot.session_id, steps = snapshot.steps.len(), "session created");
        Ok(snapshot)
    }

    /// Fetch a session, rebuilding it from the database when evicted.
    pub fn get(&self, session_id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        if let Some(snapshot) = self.cache.get(session_id)? {
            return Ok(snapshot);
        }

        let record = self
            .store
            .find(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        let snapshot = Self::rehydrate(record);

        info!(session_id = %session_id, "session rebuilt from durable store");
        self.cache.save(&snapshot)?;
        Ok(snapshot)
    }

    /// The question the client should answer next.
    ///
    /// Serving the first question moves the session to in-progress.
    pub fn current_step(
        &self,
        session_id: &SessionId,
    ) -> Result<(usize, SessionStep), SessionError> {
        let mut snapshot = self.get(session_id)?;
        if !snapshot.status.is_unfinished() {
            return Err(SessionError::AlreadyCompleted(session_id.clone()));
        }
        let step = snapshot
            .current_step()
            .cloned()
            .ok_or_else(|| SessionError::InvalidStep {
                session_id: session_id.clone(),
                index: snapshot.current_index,
            })?;

        if snapshot.status == SessionStatus::Created {
            snapshot.status = SessionStatus::InProgress;
            self.cache.save(&snapshot)?;
            if let Err(e) = self
                .store
                .update_status(session_id, SessionStatus::InProgress)
            {
                warn!(session_id = %session_id, error = %e, "durable status update failed");
            }
        }

        Ok((snapshot.current_index, step))
    }

    /// Record the answer to the current step and advance.
    ///
    /// Answering the last step completes the session and enqueues its
    /// evaluation.
    pub fn submit_answer(
        &self,
        session_id: &SessionId,
        answer: impl Into<String>,
    ) -> Result<AnswerOutcome, SessionError> {
        let mut snapshot = self.get(session_id)?;
        if !snapshot.status.is_unfinished() {
            return Err(SessionError::AlreadyCompleted(session_id.clone()));
        }
        let index = snapshot.current_index;
        if index >= snapshot.steps.len() {
            return Err(SessionError::InvalidStep {
                session_id: session_id.clone(),
                index,
            });
        }

        let answer = answer.into();
        snapshot.steps[index].answer = Some(answer.clone());
        snapshot.current_index = index + 1;
        let finished = snapshot.is_exhausted();
        snapshot.status = if finished {
            SessionStatus::Completed
        } else {
            SessionStatus::InProgress
        };

        if let Err(e) = self.store.record_answer(
            session_id,
            RecordedAnswer {
                step_index: index,
                answer,
                answered_at: Utc::now(),
            },
        ) {
            warn!(session_id = %session_id, error = %e, "durable answer write failed");
        }
        // Status moves in both stores on every submit, so a session answered
        // straight away (no question fetch first) still rehydrates in
        // progress. The finished path writes its status in finish().
        if !finished {
            if let Err(e) = self.store.update_status(session_id, snapshot.status) {
                warn!(session_id = %session_id, error = %e, "durable status update failed");
            }
        }

        self.cache.save(&snapshot)?;

        if finished {
            self.finish(&snapshot)?;
        }

        Ok(AnswerOutcome {
            finished,
            next_index: snapshot.current_index,
            total_steps: snapshot.steps.len(),
            next_step: snapshot.current_step().cloned(),
        })
    }

    /// Stash a draft answer for the current step without advancing.
    ///
    /// Drafts live only in the cache; submitting promotes them.
    pub fn save_answer(
        &self,
        session_id: &SessionId,
        draft: impl Into<String>,
    ) -> Result<(), SessionError> {
        let mut snapshot = self.get(session_id)?;
        if !snapshot.status.is_unfinished() {
            return Err(SessionError::AlreadyCompleted(session_id.clone()));
        }
        let index = snapshot.current_index;
        let step = snapshot
            .steps
            .get_mut(index)
            .ok_or_else(|| SessionError::InvalidStep {
                session_id: session_id.clone(),
                index,
            })?;
        step.answer = Some(draft.into());
        self.cache.save(&snapshot)?;
        Ok(())
    }

    /// End the session now, before every step is answered.
    pub fn complete(&self, session_id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let mut snapshot = self.get(session_id)?;
        if !snapshot.status.is_unfinished() {
            return Err(SessionError::AlreadyCompleted(session_id.clone()));
        }

        snapshot.status = SessionStatus::Completed;
        self.cache.save(&snapshot)?;
        self.finish(&snapshot)?;
        Ok(snapshot)
    }

    /// The subject's unfinished session, cache index first, database second.
    pub fn find_unfinished(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SessionSnapshot>, SessionError> {
        if let Some(snapshot) = self.cache.find_unfinished(subject)? {
            return Ok(Some(snapshot));
        }

        match self.store.find_unfinished(subject)? {
            Some(session_id) => Ok(Some(self.get(&session_id)?)),
            None => Ok(None),
        }
    }

    /// Remove a session everywhere.
    pub fn delete(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let subject = match self.cache.get(session_id)? {
            Some(snapshot) => snapshot.subject_id,
            None => self
                .store
                .find(session_id)?
                .and_then(|record| record.subject_id),
        };
        self.cache.delete(session_id, subject.as_ref())?;
        self.store.delete(session_id)?;
        Ok(())
    }

    /// Durably mark the session completed and hand it to evaluation.
    fn finish(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        if let Err(e) = self
            .store
            .update_status(&snapshot.session_id, SessionStatus::Completed)
        {
            warn!(session_id = %snapshot.session_id, error = %e, "durable status update failed");
        }

        let mut payload = BTreeMap::new();
        payload.insert(
            "session_id".to_string(),
            snapshot.session_id.to_string(),
        );
        self.evaluator
            .enqueue(SubjectId::from(&snapshot.session_id), payload);
        info!(session_id = %snapshot.session_id, "session completed, evaluation enqueued");
        Ok(())
    }

    /// Rebuild the cached shape from questions plus the answer log.
    fn rehydrate(record: SessionRecord) -> SessionSnapshot {
        let mut steps = record.steps;
        for answer in &record.answers {
            if let Some(step) = steps.get_mut(answer.step_index) {
                step.answer = Some(answer.answer.clone());
            }
        }

        SessionSnapshot {
            session_id: record.session_id,
            subject_id: record.subject_id,
            source_text: record.source_text,
            steps,
            current_index: record.current_index,
            status: record.status,
        }
    }
}
