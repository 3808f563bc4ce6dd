//! `prepline-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the task pipeline,
//! the rate limiter and the session layer (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod status;

pub use error::{truncate_error, ERROR_MAX_LEN};
pub use id::{SessionId, SubjectId};
pub use status::TaskStatus;
