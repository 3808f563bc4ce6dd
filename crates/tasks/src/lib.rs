//! `prepline-tasks`: durable asynchronous task pipeline.
//!
//! Producers append task messages to per-kind streams on the coordination
//! store; consumer-group workers pull them, run a task body, and track
//! progress as a [`TaskStatus`](prepline_core::TaskStatus) on the owning
//! business record. Delivery is at-least-once:
//!
//! - a failed body is re-enqueued as a fresh message with `retry_count + 1`,
//!   up to [`MAX_RETRIES`], then marked failed with a truncated error;
//! - the consumed entry is acknowledged unconditionally, so retry state
//!   travels in the message, never in the stream's pending list;
//! - status updates against a deleted record are silent no-ops, which makes
//!   redelivered work for removed subjects harmless.

pub mod consumer;
pub mod message;
pub mod producer;
pub mod status;

pub use consumer::{ConsumerConfig, TaskBody, TaskConsumer, TaskConsumerHandle};
pub use message::{MalformedTask, TaskKind, TaskMessage};
pub use producer::TaskProducer;
pub use status::{InMemoryStatusStore, StatusError, StatusRecord, StatusStore};

/// Retries after the first attempt; the fourth failure is terminal.
pub const MAX_RETRIES: u32 = 3;

/// Entries pulled per read.
pub const BATCH_SIZE: usize = 10;

/// How long a read blocks waiting for work, and how long a consumer backs
/// off after a read error.
pub const BLOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// Approximate retention cap per stream.
pub const STREAM_MAX_LEN: usize = 1000;
