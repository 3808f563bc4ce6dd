//! `prepline-session`: interview session state over cache and database.
//!
//! A live session is served from the coordination store cache with a sliding
//! TTL; every mutation is also written durably so an evicted session can be
//! rebuilt by replaying its recorded answers. The cache is authoritative
//! while present, the database is the recovery source. Finishing a session
//! hands it to the evaluation pipeline as a background task.

pub mod cache;
pub mod service;
pub mod snapshot;
pub mod store;

pub use cache::{SessionCache, SessionCacheError, SESSION_TTL};
pub use service::{AnswerOutcome, SessionError, SessionService};
pub use snapshot::{SessionSnapshot, SessionStatus, SessionStep};
pub use store::{
    InMemorySessionStore, RecordedAnswer, SessionRecord, SessionStoreError, SessionStore,
};
