//! The rate limiter front end: key construction, policy, guard helpers.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use prepline_coord::CoordStore;

use crate::script::TOKEN_BUCKET;

/// Identity attached to an incoming request, as far as limiting cares.
///
/// Missing pieces fall back to fixed placeholder identities, so unauthenticated
/// or proxy-mangled traffic shares one bucket per dimension instead of
/// escaping limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
}

impl RequestContext {
    /// A context with no identity at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn ip_or_default(&self) -> &str {
        self.client_ip.as_deref().unwrap_or("unknown")
    }

    fn user_or_default(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

/// What a bucket is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    /// One bucket for the whole deployment.
    Global,
    /// One bucket per client address.
    Ip,
    /// One bucket per authenticated user.
    User,
}

/// Limit applied to one guarded operation.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Dimensions checked together; taking from all buckets or none.
    pub dimensions: Vec<Dimension>,
    /// Bucket size, and also the sustained per-window rate.
    pub capacity: u32,
    pub window: Duration,
    /// Reserved for a future blocking acquire. Only zero (fail fast) is
    /// honored today.
    pub timeout: Duration,
}

impl RateLimitPolicy {
    pub fn new(dimensions: Vec<Dimension>, capacity: u32, window: Duration) -> Self {
        Self {
            dimensions,
            capacity,
            window,
            timeout: Duration::ZERO,
        }
    }

    /// Single global bucket.
    pub fn global(capacity: u32, window: Duration) -> Self {
        Self::new(vec![Dimension::Global], capacity, window)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The request exceeded at least one bucket. Retryable by the client.
    #[error("rate limit exceeded for operation '{operation}'")]
    Exceeded { operation: String },

    /// The limiter could not reach a decision; treated as a denial.
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),
}

/// Distributed rate limiter over the coordination store.
pub struct RateLimiter {
    store: Arc<dyn CoordStore>,
}

impl RateLimiter {
    /// Preloads the token bucket script; a failed preload is only a lost
    /// optimization since evaluation falls back to sending the source.
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        if let Err(e) = store.load_script(&TOKEN_BUCKET) {
            warn!(error = %e, "token bucket script preload failed");
        }
        Self { store }
    }

    /// Check and consume one permit per dimension of the policy.
    ///
    /// `operation` names the guarded method, e.g. `InterviewService:start`.
    /// The braces in the generated keys make every dimension of one
    /// operation hash to the same cluster slot, which keeps the multi-key
    /// script valid under cluster deployments.
    pub fn check(
        &self,
        operation: &str,
        policy: &RateLimitPolicy,
        ctx: &RequestContext,
    ) -> Result<(), RateLimitError> {
        if policy.dimensions.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = policy
            .dimensions
            .iter()
            .map(|dim| self.key_for(operation, *dim, ctx))
            .collect();
        let args = vec![
            chrono::Utc::now().timestamp_millis().to_string(),
            "1".to_string(),
            (policy.window.as_millis() as u64).to_string(),
            policy.capacity.to_string(),
        ];

        match self.store.eval(&TOKEN_BUCKET, &keys, &args) {
            Ok(granted) if granted != 0 => Ok(()),
            Ok(_) => {
                debug!(operation, "rate limit exceeded");
                Err(RateLimitError::Exceeded {
                    operation: operation.to_string(),
                })
            }
            Err(e) => {
                error!(operation, error = %e, "rate limit check failed");
                Err(RateLimitError::Unavailable(e.to_string()))
            }
        }
    }

    /// Run `body` if the request is within limits, otherwise return the
    /// denial.
    pub fn guard<T>(
        &self,
        operation: &str,
        policy: &RateLimitPolicy,
        ctx: &RequestContext,
        body: impl FnOnce() -> T,
    ) -> Result<T, RateLimitError> {
        self.check(operation, policy, ctx)?;
        Ok(body())
    }

    /// Like [`guard`](RateLimiter::guard), but a denial first gets a chance
    /// at a degraded answer.
    ///
    /// A successful fallback replaces the denial; a failed fallback is
    /// logged and the original denial stands.
    pub fn guard_with_fallback<T>(
        &self,
        operation: &str,
        policy: &RateLimitPolicy,
        ctx: &RequestContext,
        body: impl FnOnce() -> T,
        fallback: impl FnOnce() -> Result<T, Box<dyn Error + Send + Sync>>,
    ) -> Result<T, RateLimitError> {
        match self.check(operation, policy, ctx) {
            Ok(()) => Ok(body()),
            Err(denied) => match fallback() {
                Ok(value) => {
                    debug!(operation, "rate limit fallback served");
                    Ok(value)
                }
                Err(e) => {
                    error!(operation, error = %e, "rate limit fallback failed");
                    Err(denied)
                }
            },
        }
    }

    fn key_for(&self, operation: &str, dimension: Dimension, ctx: &RequestContext) -> String {
        match dimension {
            Dimension::Global => format!("ratelimit:{{{operation}}}:global"),
            Dimension::Ip => format!("ratelimit:{{{operation}}}:ip:{}", ctx.ip_or_default()),
            Dimension::User => {
                format!("ratelimit:{{{operation}}}:user:{}", ctx.user_or_default())
            }
        }
    }
}
