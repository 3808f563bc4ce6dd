//! `prepline-ratelimit`: distributed token bucket rate limiting.
//!
//! Every guarded operation owns a set of buckets on the coordination store,
//! one per limited dimension (global, per client address, per user). A
//! single atomic script checks and debits all dimensions of a request
//! together, so a denial by any one of them spends nothing anywhere. Nodes
//! share no limiter state beyond the store, which makes the decision
//! consistent across a fleet.

pub mod limiter;
pub mod script;

pub use limiter::{Dimension, RateLimitError, RateLimitPolicy, RateLimiter, RequestContext};
pub use script::{install_native, TOKEN_BUCKET};
