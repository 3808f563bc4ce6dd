//! Session cache keys, TTLs and the subject index.
//!
//! Two key families:
//!
//! - `session:<id>` holds the JSON snapshot, with a sliding TTL refreshed
//!   on every read;
//! - `session:subject:<subject>` maps a business record to its unfinished
//!   session, so a returning client resumes instead of starting over. The
//!   index exists only while the session is unfinished and is self-healed
//!   when found stale.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use prepline_coord::{CoordError, CoordStore};
use prepline_core::{SessionId, SubjectId};

use crate::snapshot::SessionSnapshot;

/// Sliding lifetime of a cached session.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SessionCacheError {
    #[error(transparent)]
    Store(#[from] CoordError),

    #[error("session codec error: {0}")]
    Codec(String),
}

pub struct SessionCache {
    store: Arc<dyn CoordStore>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self {
            store,
            ttl: SESSION_TTL,
        }
    }

    pub fn with_ttl(store: Arc<dyn CoordStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn session_key(session_id: &SessionId) -> String {
        format!("session:{session_id}")
    }

    fn subject_key(subject: &SubjectId) -> String {
        format!("session:subject:{subject}")
    }

    /// Write the snapshot and keep the subject index in step with it:
    /// present while the session is unfinished, gone once it is not.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionCacheError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| SessionCacheError::Codec(e.to_string()))?;
        self.store
            .set(&Self::session_key(&snapshot.session_id), &json, Some(self.ttl))?;

        if let Some(subject) = &snapshot.subject_id {
            let key = Self::subject_key(subject);
            if snapshot.status.is_unfinished() {
                self.store
                    .set(&key, snapshot.session_id.as_str(), Some(self.ttl))?;
            } else {
                self.store.delete(&key)?;
            }
        }
        Ok(())
    }

    /// Fetch a snapshot, sliding its TTL forward on a hit.
    ///
    /// An entry that no longer decodes is dropped and reported as a miss,
    /// so the caller falls through to the durable record instead of
    /// failing on cache corruption.
    pub fn get(&self, session_id: &SessionId) -> Result<Option<SessionSnapshot>, SessionCacheError> {
        let key = Self::session_key(session_id);
        let Some(json) = self.store.get(&key)? else {
            return Ok(None);
        };

        let snapshot: SessionSnapshot = match serde_json::from_str(&json) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "removing undecodable cached session");
                self.store.delete(&key)?;
                return Ok(None);
            }
        };

        if !self.store.expire(&key, self.ttl)? {
            // Expired between read and refresh; the read still stands.
            debug!(session_id = %session_id, "session ttl refresh raced an eviction");
        }
        if let Some(subject) = &snapshot.subject_id {
            if snapshot.status.is_unfinished() {
                let _ = self.store.expire(&Self::subject_key(subject), self.ttl);
            }
        }
        Ok(Some(snapshot))
    }

    /// Resolve a subject to its unfinished session, if any.
    ///
    /// A stale index (pointing at an evicted or finished session) is
    /// deleted on sight and reported as a miss.
    pub fn find_unfinished(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SessionSnapshot>, SessionCacheError> {
        let index_key = Self::subject_key(subject);
        let Some(session_id) = self.store.get(&index_key)? else {
            return Ok(None);
        };

        let session_id = SessionId::from(session_id);
        match self.get(&session_id)? {
            Some(snapshot) if snapshot.status.is_unfinished() => Ok(Some(snapshot)),
            stale => {
                warn!(subject_id = %subject, session_id = %session_id, found = stale.is_some(), "removing stale session index");
                self.store.delete(&index_key)?;
                Ok(None)
            }
        }
    }

    /// Drop a session and, when known, its subject index.
    pub fn delete(
        &self,
        session_id: &SessionId,
        subject: Option<&SubjectId>,
    ) -> Result<(), SessionCacheError> {
        self.store.delete(&Self::session_key(session_id))?;
        if let Some(subject) = subject {
            self.store.delete(&Self::subject_key(subject))?;
        }
        Ok(())
    }
}
