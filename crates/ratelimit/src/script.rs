//! The token bucket script.
//!
//! One evaluation covers every key of a request atomically: all buckets are
//! checked after refill, and tokens are taken from all of them or from none.
//! The caller supplies the clock (`ARGV[1]`), which keeps the decision
//! independent of server time and makes the script a pure function of its
//! arguments and the stored bucket state.
//!
//! Per key the bucket is a hash of `tokens` (fractional) and `ts` (ms of the
//! last refill). A missing hash is a full bucket. Expiry is set to twice the
//! window so idle buckets clean themselves up without ever expiring while
//! they still constrain anything.

use prepline_coord::{InMemoryCoordStore, ScriptKv, ScriptSpec};

use std::time::Duration;

/// KEYS: one per limited dimension.
/// ARGV: `[now_ms, requested, window_ms, capacity]`.
/// Returns 1 when every bucket granted, 0 when denied (no state written).
pub const TOKEN_BUCKET: ScriptSpec = ScriptSpec {
    name: "token_bucket",
    source: r#"
local now = tonumber(ARGV[1])
local requested = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local capacity = tonumber(ARGV[4])

if window_ms == nil or window_ms <= 0 then
    return redis.error_reply('window_ms must be positive')
end

local refilled = {}
for i = 1, #KEYS do
    local bucket = redis.call('HMGET', KEYS[i], 'tokens', 'ts')
    local tokens = tonumber(bucket[1])
    local ts = tonumber(bucket[2])
    if tokens == nil or ts == nil then
        tokens = capacity
        ts = now
    end
    local elapsed = now - ts
    if elapsed < 0 then
        elapsed = 0
    end
    tokens = tokens + elapsed * capacity / window_ms
    if tokens > capacity then
        tokens = capacity
    end
    if tokens < requested then
        return 0
    end
    refilled[i] = tokens
end

for i = 1, #KEYS do
    redis.call('HSET', KEYS[i], 'tokens', refilled[i] - requested, 'ts', now)
    redis.call('PEXPIRE', KEYS[i], window_ms * 2)
end
return 1
"#,
};

fn parse_bucket(raw: Option<String>) -> Option<(f64, u64)> {
    let raw = raw?;
    let mut parts = raw.split_whitespace();
    let tokens = parts.next()?.parse::<f64>().ok()?;
    let ts = parts.next()?.parse::<u64>().ok()?;
    Some((tokens, ts))
}

/// Register the Rust twin of [`TOKEN_BUCKET`] on an in-memory store.
///
/// Bucket state is a plain `"{tokens} {ts}"` value instead of a hash; the
/// observable grant/deny behavior is identical.
pub fn install_native(store: &InMemoryCoordStore) {
    store.register_native(TOKEN_BUCKET.name, |kv, keys, args| {
        let parse = |idx: usize, name: &str| -> Result<f64, String> {
            args.get(idx)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| format!("bad argument '{name}'"))
        };
        let now = parse(0, "now_ms")?;
        let requested = parse(1, "requested")?;
        let window_ms = parse(2, "window_ms")?;
        let capacity = parse(3, "capacity")?;
        if window_ms <= 0.0 {
            return Err("window_ms must be positive".to_string());
        }

        let mut refilled = Vec::with_capacity(keys.len());
        for key in keys {
            let (tokens, ts) = parse_bucket(kv.get(key)).unwrap_or((capacity, now as u64));
            let elapsed = (now - ts as f64).max(0.0);
            let tokens = (tokens + elapsed * capacity / window_ms).min(capacity);
            if tokens < requested {
                return Ok(0);
            }
            refilled.push(tokens);
        }

        let expiry = Duration::from_millis((window_ms * 2.0) as u64);
        for (key, tokens) in keys.iter().zip(refilled) {
            kv.set(
                key,
                format!("{} {}", tokens - requested, now as u64),
                Some(expiry),
            );
        }
        Ok(1)
    });
}
