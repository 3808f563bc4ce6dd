//! End-to-end pipeline behavior against the in-memory coordination store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prepline_coord::{CoordError, CoordResult, CoordStore, InMemoryCoordStore, ScriptSpec, StreamEntry};
use prepline_core::{SubjectId, TaskStatus};
use prepline_tasks::{
    ConsumerConfig, InMemoryStatusStore, StatusStore, TaskConsumer, TaskKind, TaskProducer,
};

fn unreachable_err() -> CoordError {
    CoordError::Connection("connection refused".to_string())
}

/// A store where every operation fails, for exercising degraded paths.
struct UnreachableStore;

impl CoordStore for UnreachableStore {
    fn get(&self, _key: &str) -> CoordResult<Option<String>> {
        Err(unreachable_err())
    }
    fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> CoordResult<()> {
        Err(unreachable_err())
    }
    fn delete(&self, _key: &str) -> CoordResult<bool> {
        Err(unreachable_err())
    }
    fn expire(&self, _key: &str, _ttl: Duration) -> CoordResult<bool> {
        Err(unreachable_err())
    }
    fn eval(&self, _script: &ScriptSpec, _keys: &[String], _args: &[String]) -> CoordResult<i64> {
        Err(unreachable_err())
    }
    fn stream_add(
        &self,
        _stream: &str,
        _fields: &[(String, String)],
        _max_len: Option<usize>,
    ) -> CoordResult<String> {
        Err(unreachable_err())
    }
    fn create_group(&self, _stream: &str, _group: &str) -> CoordResult<()> {
        Err(unreachable_err())
    }
    fn read_group(
        &self,
        _stream: &str,
        _group: &str,
        _consumer: &str,
        _count: usize,
        _block: Duration,
    ) -> CoordResult<Vec<StreamEntry>> {
        Err(unreachable_err())
    }
    fn ack(&self, _stream: &str, _group: &str, _ids: &[String]) -> CoordResult<u64> {
        Err(unreachable_err())
    }
    fn stream_len(&self, _stream: &str) -> CoordResult<u64> {
        Err(unreachable_err())
    }
    fn pending_count(&self, _stream: &str, _group: &str) -> CoordResult<u64> {
        Err(unreachable_err())
    }
}

fn drain(store: &Arc<InMemoryCoordStore>, consumer: &TaskConsumer, kind: TaskKind) -> usize {
    let mut processed = 0;
    loop {
        let batch = store
            .read_group(
                kind.stream_key(),
                kind.group(),
                consumer.consumer_name(),
                10,
                Duration::ZERO,
            )
            .unwrap();
        if batch.is_empty() {
            return processed;
        }
        for entry in &batch {
            consumer.process_entry(entry);
            processed += 1;
        }
    }
}

#[test]
fn task_recovers_after_two_transient_failures() {
    prepline_observability::init();

    let store = InMemoryCoordStore::arc();
    let status = InMemoryStatusStore::arc();
    let subject = SubjectId::from("42");
    status.register(subject.clone());

    store
        .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
        .unwrap();

    let producer = TaskProducer::new(store.clone(), status.clone(), TaskKind::Vectorize);
    let mut payload = BTreeMap::new();
    payload.insert("content".to_string(), "chapter one".to_string());
    producer.enqueue(subject.clone(), payload);

    let attempts = Arc::new(AtomicU32::new(0));
    let seen_retries = Arc::new(Mutex::new(Vec::new()));
    let attempts_in_body = attempts.clone();
    let seen_in_body = seen_retries.clone();

    let consumer = TaskConsumer::new(
        store.clone(),
        status.clone(),
        TaskKind::Vectorize,
        Box::new(move |msg| {
            seen_in_body.lock().unwrap().push(msg.retry_count);
            let attempt = attempts_in_body.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err("embedding service timeout".to_string())
            } else {
                Ok(())
            }
        }),
    );

    let processed = drain(&store, &consumer, TaskKind::Vectorize);
    assert_eq!(processed, 3);
    assert_eq!(*seen_retries.lock().unwrap(), vec![0, 1, 2]);

    let record = status.status(&subject).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.error, None);

    // Three entries were appended in total and all are acknowledged.
    assert_eq!(
        store.stream_len(TaskKind::Vectorize.stream_key()).unwrap(),
        3
    );
    assert_eq!(
        store
            .pending_count(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap(),
        0
    );
}

#[test]
fn spawned_consumer_processes_work_and_stops_on_shutdown() {
    let store = InMemoryCoordStore::arc();
    let status = InMemoryStatusStore::arc();
    let subject = SubjectId::from("session-9");
    status.register(subject.clone());

    let producer = TaskProducer::new(store.clone(), status.clone(), TaskKind::Evaluate);
    producer.enqueue(subject.clone(), BTreeMap::new());

    let consumer = TaskConsumer::new(
        store.clone(),
        status.clone(),
        TaskKind::Evaluate,
        Box::new(|_| Ok(())),
    );
    let handle = consumer.spawn(ConsumerConfig {
        batch_size: 10,
        block_timeout: Duration::from_millis(20),
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = status.status(&subject).unwrap().unwrap();
        if record.status == TaskStatus::Completed {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "task never completed");
        std::thread::sleep(Duration::from_millis(10));
    }

    handle.stop();
}

#[test]
fn enqueue_failure_marks_the_subject_failed() {
    let store: Arc<dyn CoordStore> = Arc::new(UnreachableStore);
    let status = InMemoryStatusStore::arc();
    let subject = SubjectId::from("doc-down");
    status.register(subject.clone());

    let producer = TaskProducer::new(store, status.clone(), TaskKind::Analyze);
    // Must not panic or propagate the store error.
    producer.enqueue(subject.clone(), BTreeMap::new());

    let record = status.status(&subject).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error.unwrap().starts_with("enqueue failed:"));
}

#[test]
fn two_group_members_split_the_work_without_overlap() {
    let store = InMemoryCoordStore::arc();
    let status = InMemoryStatusStore::arc();
    store
        .create_group(TaskKind::Analyze.stream_key(), TaskKind::Analyze.group())
        .unwrap();

    let producer = TaskProducer::new(store.clone(), status.clone(), TaskKind::Analyze);
    for i in 0..6 {
        let subject = SubjectId::from(format!("resume-{i}").as_str());
        status.register(subject.clone());
        producer.enqueue(subject, BTreeMap::new());
    }

    let make_counted_consumer = |counter: Arc<AtomicU32>| {
        TaskConsumer::new(
            store.clone(),
            status.clone(),
            TaskKind::Analyze,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
    };

    let count_a = Arc::new(AtomicU32::new(0));
    let count_b = Arc::new(AtomicU32::new(0));
    let a = make_counted_consumer(count_a.clone());
    let b = make_counted_consumer(count_b.clone());

    // Alternate readers; group delivery means each entry goes to exactly one.
    loop {
        let batch_a = store
            .read_group(
                TaskKind::Analyze.stream_key(),
                TaskKind::Analyze.group(),
                a.consumer_name(),
                2,
                Duration::ZERO,
            )
            .unwrap();
        let batch_b = store
            .read_group(
                TaskKind::Analyze.stream_key(),
                TaskKind::Analyze.group(),
                b.consumer_name(),
                2,
                Duration::ZERO,
            )
            .unwrap();
        if batch_a.is_empty() && batch_b.is_empty() {
            break;
        }
        for entry in &batch_a {
            a.process_entry(entry);
        }
        for entry in &batch_b {
            b.process_entry(entry);
        }
    }

    assert_eq!(
        count_a.load(Ordering::SeqCst) + count_b.load(Ordering::SeqCst),
        6
    );
    assert_eq!(
        store
            .pending_count(TaskKind::Analyze.stream_key(), TaskKind::Analyze.group())
            .unwrap(),
        0
    );
}
