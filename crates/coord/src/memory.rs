//! In-memory coordination store for tests and embedded deployments.
//!
//! Single-process stand-in for a Redis-like server. One mutex guards all
//! state, so every operation (native script execution included) is atomic
//! with respect to every other, matching the atomicity a real server gives
//! scripted execution. A condvar wakes blocked group-readers on append.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::store::{CoordError, CoordResult, CoordStore, ScriptSpec, StreamEntry};

/// View of the bucket space handed to native scripts.
///
/// Scripts mutate through this trait while the store lock is held, so a
/// script's reads and writes are atomic as a unit.
pub trait ScriptKv {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>);
    fn delete(&mut self, key: &str) -> bool;
}

/// A Rust closure standing in for a server-side script.
pub type NativeScript =
    Arc<dyn Fn(&mut dyn ScriptKv, &[String], &[String]) -> Result<i64, String> + Send + Sync>;

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Group {
    /// Highest entry sequence already handed to a group member.
    last_delivered: u64,
    /// Delivered but not yet acknowledged entry sequences.
    pending: HashSet<u64>,
}

#[derive(Debug, Default)]
struct Stream {
    next_seq: u64,
    entries: VecDeque<(u64, Vec<(String, String)>)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, ValueEntry>,
    streams: HashMap<String, Stream>,
}

struct KvView<'a> {
    values: &'a mut HashMap<String, ValueEntry>,
    now: Instant,
}

impl ScriptKv for KvView<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .filter(|e| !e.is_expired(self.now))
            .map(|e| e.value.clone())
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: ttl.map(|t| self.now + t),
            },
        );
    }

    fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }
}

/// In-memory [`CoordStore`].
pub struct InMemoryCoordStore {
    inner: Mutex<Inner>,
    appended: Condvar,
    scripts: Mutex<HashMap<&'static str, NativeScript>>,
}

impl InMemoryCoordStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            appended: Condvar::new(),
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register the native handler executed for `script.name`.
    ///
    /// The handler runs under the store lock, so its reads and writes form one
    /// atomic unit, the in-process analogue of server-side Lua.
    pub fn register_native<F>(&self, name: &'static str, handler: F)
    where
        F: Fn(&mut dyn ScriptKv, &[String], &[String]) -> Result<i64, String>
            + Send
            + Sync
            + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .insert(name, Arc::new(handler));
    }

    fn entry_id(seq: u64) -> String {
        format!("{seq}-0")
    }

    fn parse_entry_id(id: &str) -> CoordResult<u64> {
        let seq = id.split('-').next().unwrap_or(id);
        seq.parse::<u64>()
            .map_err(|_| CoordError::Command(format!("invalid entry id: {id}")))
    }
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordStore for InMemoryCoordStore {
    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.values.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> CoordResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.values.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> CoordResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.values.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                inner.values.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn eval(&self, script: &ScriptSpec, keys: &[String], args: &[String]) -> CoordResult<i64> {
        let handler = {
            let scripts = self.scripts.lock().unwrap();
            scripts.get(script.name).cloned()
        };
        let handler = handler.ok_or_else(|| {
            CoordError::Script(format!(
                "no native handler registered for script '{}'",
                script.name
            ))
        })?;

        let mut inner = self.inner.lock().unwrap();
        let mut view = KvView {
            values: &mut inner.values,
            now: Instant::now(),
        };
        handler(&mut view, keys, args).map_err(CoordError::Script)
    }

    fn stream_add(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> CoordResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner.streams.entry(stream.to_string()).or_default();
        s.next_seq += 1;
        let seq = s.next_seq;
        s.entries.push_back((seq, fields.to_vec()));

        if let Some(cap) = max_len {
            while s.entries.len() > cap {
                s.entries.pop_front();
            }
        }

        drop(inner);
        self.appended.notify_all();
        Ok(Self::entry_id(seq))
    }

    fn create_group(&self, stream: &str, group: &str) -> CoordResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> CoordResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        let mut inner = self.inner.lock().unwrap();

        loop {
            let Stream {
                entries, groups, ..
            } = inner.streams.get_mut(stream).ok_or_else(|| {
                CoordError::Command(format!("no such stream or group: {stream}/{group}"))
            })?;
            let g = groups.get_mut(group).ok_or_else(|| {
                CoordError::Command(format!("no such stream or group: {stream}/{group}"))
            })?;

            let mut batch = Vec::new();
            for (seq, fields) in entries.iter() {
                if *seq <= g.last_delivered {
                    continue;
                }
                batch.push(StreamEntry {
                    id: Self::entry_id(*seq),
                    fields: fields.iter().cloned().collect(),
                });
                g.pending.insert(*seq);
                g.last_delivered = *seq;
                if batch.len() >= count {
                    break;
                }
            }

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _timeout) = self
                .appended
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    fn ack(&self, stream: &str, group: &str, ids: &[String]) -> CoordResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Some(s) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            let seq = Self::parse_entry_id(id)?;
            if g.pending.remove(&seq) {
                acked += 1;
            }
        }
        Ok(acked)
    }

    fn stream_len(&self, stream: &str) -> CoordResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    fn pending_count(&self, stream: &str, group: &str) -> CoordResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_get_delete_roundtrip() {
        let store = InMemoryCoordStore::new();
        store.set("k", "v", None).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn values_expire() {
        let store = InMemoryCoordStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .unwrap();
        assert!(store.get("k").unwrap().is_some());
        thread::sleep(Duration::from_millis(25));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn expire_refreshes_ttl() {
        let store = InMemoryCoordStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .unwrap();
        assert!(store.expire("k", Duration::from_secs(60)).unwrap());
        thread::sleep(Duration::from_millis(25));
        assert!(store.get("k").unwrap().is_some());
        assert!(!store.expire("missing", Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn group_read_delivers_each_entry_once() {
        let store = InMemoryCoordStore::new();
        store.create_group("s", "g").unwrap();
        store
            .stream_add("s", &[("a".into(), "1".into())], None)
            .unwrap();
        store
            .stream_add("s", &[("a".into(), "2".into())], None)
            .unwrap();

        let batch = store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(batch.len(), 2);

        // Never-delivered only: a second read returns nothing.
        let again = store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(store.pending_count("s", "g").unwrap(), 2);

        let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
        assert_eq!(store.ack("s", "g", &ids).unwrap(), 2);
        assert_eq!(store.pending_count("s", "g").unwrap(), 0);

        // Acking twice is harmless.
        assert_eq!(store.ack("s", "g", &ids).unwrap(), 0);
    }

    #[test]
    fn create_group_is_idempotent() {
        let store = InMemoryCoordStore::new();
        store.create_group("s", "g").unwrap();
        store
            .stream_add("s", &[("a".into(), "1".into())], None)
            .unwrap();
        store.create_group("s", "g").unwrap();

        // Recreating the group kept its cursor.
        let batch = store
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn read_group_without_group_errors() {
        let store = InMemoryCoordStore::new();
        let err = store
            .read_group("nope", "g", "c", 1, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, CoordError::Command(_)));
    }

    #[test]
    fn max_len_trims_oldest() {
        let store = InMemoryCoordStore::new();
        for i in 0..10 {
            store
                .stream_add("s", &[("i".into(), i.to_string())], Some(5))
                .unwrap();
        }
        assert_eq!(store.stream_len("s").unwrap(), 5);

        store.create_group("s", "g").unwrap();
        let batch = store
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(batch[0].fields["i"], "5");
    }

    #[test]
    fn blocking_read_wakes_on_append() {
        let store = InMemoryCoordStore::arc();
        store.create_group("s", "g").unwrap();

        let reader = {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .read_group("s", "g", "c", 1, Duration::from_secs(5))
                    .unwrap()
            })
        };

        thread::sleep(Duration::from_millis(30));
        store
            .stream_add("s", &[("a".into(), "1".into())], None)
            .unwrap();

        let batch = reader.join().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn native_scripts_run_atomically_over_the_kv_space() {
        let store = InMemoryCoordStore::new();
        store.register_native("incr_both", |kv, keys, _args| {
            for key in keys {
                let current: i64 = kv.get(key).map_or(0, |v| v.parse().unwrap_or(0));
                kv.set(key, (current + 1).to_string(), None);
            }
            Ok(keys.len() as i64)
        });

        let spec = ScriptSpec {
            name: "incr_both",
            source: "-- native only in tests",
        };
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.eval(&spec, &keys, &[]).unwrap(), 2);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn eval_of_unregistered_script_fails() {
        let store = InMemoryCoordStore::new();
        let spec = ScriptSpec {
            name: "missing",
            source: "",
        };
        let err = store.eval(&spec, &[], &[]).unwrap_err();
        assert!(matches!(err, CoordError::Script(_)));
    }
}
