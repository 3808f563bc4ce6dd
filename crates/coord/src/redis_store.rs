//! Redis-backed coordination store (behind the `redis` cargo feature).
//!
//! Values map to plain GET/SET with PX expiry, scripts run through EVALSHA
//! with automatic EVAL fallback, and the log operations map onto Redis
//! Streams (XADD/XGROUP/XREADGROUP/XACK).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::store::{CoordError, CoordResult, CoordStore, ScriptSpec, StreamEntry};

#[derive(Clone)]
pub struct RedisCoordStore {
    client: Arc<redis::Client>,
    scripts: Arc<Mutex<HashMap<&'static str, redis::Script>>>,
}

impl RedisCoordStore {
    /// Connect to a Redis server, e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> CoordResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CoordError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            scripts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn conn(&self) -> CoordResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| CoordError::Connection(e.to_string()))
    }

    fn script_for(&self, spec: &ScriptSpec) -> redis::Script {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .entry(spec.name)
            .or_insert_with(|| redis::Script::new(spec.source))
            .clone()
    }

    /// Parse the XREADGROUP reply shape:
    /// `[[stream_name, [[entry_id, [field, value, ...]], ...]], ...]`
    fn parse_read_reply(reply: redis::Value) -> CoordResult<Vec<StreamEntry>> {
        let streams = match reply {
            redis::Value::Nil => return Ok(Vec::new()),
            redis::Value::Bulk(streams) => streams,
            other => {
                return Err(CoordError::Command(format!(
                    "unexpected XREADGROUP reply: {other:?}"
                )));
            }
        };

        let mut out = Vec::new();
        for stream in streams {
            let redis::Value::Bulk(pair) = stream else {
                continue;
            };
            // pair = [stream_name, entries]
            let Some(redis::Value::Bulk(entries)) = pair.into_iter().nth(1) else {
                continue;
            };
            for entry in entries {
                if let Some(parsed) = Self::parse_entry(entry) {
                    out.push(parsed);
                }
            }
        }
        Ok(out)
    }

    /// Parse one entry: `[entry_id, [field, value, ...]]`.
    fn parse_entry(entry: redis::Value) -> Option<StreamEntry> {
        let redis::Value::Bulk(parts) = entry else {
            return None;
        };
        let mut parts = parts.into_iter();

        let id = match parts.next()? {
            redis::Value::Data(data) => String::from_utf8_lossy(&data).into_owned(),
            _ => return None,
        };

        let redis::Value::Bulk(flat) = parts.next()? else {
            return None;
        };
        let mut fields = HashMap::new();
        for chunk in flat.chunks(2) {
            if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                fields.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }

        Some(StreamEntry { id, fields })
    }
}

impl CoordStore for RedisCoordStore {
    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("GET failed: {e}")))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: String = cmd
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("SET failed: {e}")))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("DEL failed: {e}")))?;
        Ok(removed > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool> {
        let mut conn = self.conn()?;
        let updated: u64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("PEXPIRE failed: {e}")))?;
        Ok(updated == 1)
    }

    fn eval(&self, script: &ScriptSpec, keys: &[String], args: &[String]) -> CoordResult<i64> {
        let mut conn = self.conn()?;
        let script = self.script_for(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        // invoke() retries with EVAL if the server does not know the hash yet
        invocation
            .invoke(&mut conn)
            .map_err(|e| CoordError::Script(e.to_string()))
    }

    fn load_script(&self, spec: &ScriptSpec) -> CoordResult<()> {
        let mut conn = self.conn()?;
        let script = self.script_for(spec);
        let sha = script
            .prepare_invoke()
            .load(&mut conn)
            .map_err(|e| CoordError::Script(format!("SCRIPT LOAD failed: {e}")))?;
        debug!(script = spec.name, %sha, "script preloaded");
        Ok(())
    }

    fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> CoordResult<String> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(cap) = max_len {
            // Approximate trimming keeps XADD cheap
            cmd.arg("MAXLEN").arg("~").arg(cap);
        }
        cmd.arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }
        cmd.query(&mut conn)
            .map_err(|e| CoordError::Command(format!("XADD failed: {e}")))
    }

    fn create_group(&self, stream: &str, group: &str) -> CoordResult<()> {
        let mut conn = self.conn()?;
        let result: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match result {
            Ok(_) => Ok(()),
            // BUSYGROUP means the group already exists
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(CoordError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CoordResult<Vec<StreamEntry>> {
        let mut conn = self.conn()?;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("XREADGROUP failed: {e}")))?;

        Self::parse_read_reply(reply)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> CoordResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("XACK failed: {e}")))
    }

    fn stream_len(&self, stream: &str) -> CoordResult<u64> {
        let mut conn = self.conn()?;
        redis::cmd("XLEN")
            .arg(stream)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("XLEN failed: {e}")))
    }

    fn pending_count(&self, stream: &str, group: &str) -> CoordResult<u64> {
        let mut conn = self.conn()?;
        // XPENDING summary reply: [count, min-id, max-id, consumers]
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query(&mut conn)
            .map_err(|e| CoordError::Command(format!("XPENDING failed: {e}")))?;

        match reply {
            redis::Value::Bulk(parts) => match parts.first() {
                Some(redis::Value::Int(count)) => Ok((*count).max(0) as u64),
                _ => Ok(0),
            },
            redis::Value::Nil => Ok(0),
            other => Err(CoordError::Command(format!(
                "unexpected XPENDING reply: {other:?}"
            ))),
        }
    }
}
