//! The cached shape of a session.

use serde::{Deserialize, Serialize};

use prepline_core::{SessionId, SubjectId};

/// Lifecycle of an interview session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but no question served yet.
    Created,
    /// At least one question served.
    InProgress,
    /// All answers in; evaluation may still be running.
    Completed,
    /// Evaluation finished.
    Evaluated,
}

impl SessionStatus {
    /// Unfinished sessions are the ones a returning client may resume.
    pub fn is_unfinished(&self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::InProgress)
    }
}

/// One question of a session, with its answer once given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStep {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl SessionStep {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            category: None,
            answer: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Full session state as held in the cache.
///
/// `subject_id` points at the business record the session was started from
/// (a resume, typically); sessions can also run detached. `current_index`
/// is the next unanswered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    pub source_text: String,
    pub steps: Vec<SessionStep>,
    pub current_index: usize,
    pub status: SessionStatus,
}

impl SessionSnapshot {
    pub fn new(
        session_id: SessionId,
        subject_id: Option<SubjectId>,
        source_text: impl Into<String>,
        steps: Vec<SessionStep>,
    ) -> Self {
        Self {
            session_id,
            subject_id,
            source_text: source_text.into(),
            steps,
            current_index: 0,
            status: SessionStatus::Created,
        }
    }

    pub fn current_step(&self) -> Option<&SessionStep> {
        self.steps.get(self.current_index)
    }

    /// Whether `current_index` points past the last step.
    pub fn is_exhausted(&self) -> bool {
        self.current_index >= self.steps.len()
    }
}
