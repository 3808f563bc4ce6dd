//! The coordination store contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Coordination store failure.
#[derive(Debug, Error, Clone)]
pub enum CoordError {
    /// The store could not be reached at all.
    #[error("coordination store connection error: {0}")]
    Connection(String),

    /// A command reached the store but failed.
    #[error("coordination store command error: {0}")]
    Command(String),

    /// Script evaluation failed (bad script, bad arguments, runtime error).
    #[error("script error: {0}")]
    Script(String),
}

/// A script executed atomically by the store.
///
/// `name` identifies the script to implementations that cache or natively
/// emulate it; `source` is the Lua body sent to a real Redis server.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSpec {
    pub name: &'static str,
    pub source: &'static str,
}

/// One entry read from a log, as a flat string field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned entry id, used for acknowledgment.
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Narrow coordination store interface.
///
/// Everything the task pipeline, rate limiter and session cache need from the
/// shared store: a KV bucket space with TTLs, atomic scripted execution, and
/// an append-only log with consumer groups. All operations are short
/// round trips except [`read_group`](CoordStore::read_group), which blocks up
/// to its timeout.
pub trait CoordStore: Send + Sync {
    // ---- bucket/value space ----

    fn get(&self, key: &str) -> CoordResult<Option<String>>;

    /// Set a value, optionally with a time-to-live.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()>;

    /// Delete a key; returns whether it existed.
    fn delete(&self, key: &str) -> CoordResult<bool>;

    /// Reset the TTL of an existing key; returns whether the key existed.
    fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool>;

    // ---- atomic scripting ----

    /// Evaluate a script atomically with the given keys and arguments.
    fn eval(&self, script: &ScriptSpec, keys: &[String], args: &[String]) -> CoordResult<i64>;

    /// Preload a script server-side (load-and-hash).
    ///
    /// Purely a performance optimization: [`eval`](CoordStore::eval) must work
    /// whether or not this was called. Default is a no-op.
    fn load_script(&self, _script: &ScriptSpec) -> CoordResult<()> {
        Ok(())
    }

    // ---- append-only log with consumer groups ----

    /// Append an entry; `max_len` trims the log approximately to that many
    /// entries (non-strict, oldest first). Returns the assigned entry id.
    fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> CoordResult<String>;

    /// Create a consumer group on a stream, creating the stream if needed.
    /// Idempotent: an already-existing group is success.
    fn create_group(&self, stream: &str, group: &str) -> CoordResult<()>;

    /// Blocking read of never-delivered entries for one group member.
    ///
    /// Returns up to `count` entries, waiting at most `block` for the first
    /// one. An empty vec means the timeout elapsed with nothing to deliver.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CoordResult<Vec<StreamEntry>>;

    /// Acknowledge processed entries; returns how many were still pending.
    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> CoordResult<u64>;

    /// Current number of entries retained in the log.
    fn stream_len(&self, stream: &str) -> CoordResult<u64>;

    /// Number of delivered-but-unacknowledged entries for a group.
    fn pending_count(&self, stream: &str, group: &str) -> CoordResult<u64>;
}

impl<S> CoordStore for Arc<S>
where
    S: CoordStore + ?Sized,
{
    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> CoordResult<bool> {
        (**self).delete(key)
    }

    fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool> {
        (**self).expire(key, ttl)
    }

    fn eval(&self, script: &ScriptSpec, keys: &[String], args: &[String]) -> CoordResult<i64> {
        (**self).eval(script, keys, args)
    }

    fn load_script(&self, script: &ScriptSpec) -> CoordResult<()> {
        (**self).load_script(script)
    }

    fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> CoordResult<String> {
        (**self).stream_add(stream, fields, max_len)
    }

    fn create_group(&self, stream: &str, group: &str) -> CoordResult<()> {
        (**self).create_group(stream, group)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CoordResult<Vec<StreamEntry>> {
        (**self).read_group(stream, group, consumer, count, block)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> CoordResult<u64> {
        (**self).ack(stream, group, ids)
    }

    fn stream_len(&self, stream: &str) -> CoordResult<u64> {
        (**self).stream_len(stream)
    }

    fn pending_count(&self, stream: &str, group: &str) -> CoordResult<u64> {
        (**self).pending_count(stream, group)
    }
}
