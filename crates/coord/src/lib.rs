//! `prepline-coord`: coordination store client.
//!
//! Thin client over a Redis-like coordination store. The interface is
//! deliberately narrow (see [`CoordStore`]): bucket get/set/delete with TTL,
//! atomic script evaluation, and append-only log primitives with
//! consumer-group semantics. Anything offering that contract could back it;
//! two implementations ship here:
//!
//! - [`InMemoryCoordStore`]: always available; single-process store used in
//!   tests and embedded deployments. Scripts run as registered Rust closures
//!   under the store lock, which gives the same atomicity Redis gives Lua.
//! - `RedisCoordStore`: behind the `redis` cargo feature; wraps the `redis`
//!   crate (XADD/XREADGROUP/XACK, SET PX, EVALSHA with EVAL fallback).

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

pub use memory::{InMemoryCoordStore, NativeScript, ScriptKv};
#[cfg(feature = "redis")]
pub use redis_store::RedisCoordStore;
pub use store::{CoordError, CoordResult, CoordStore, ScriptSpec, StreamEntry};
