//! Consumer side of the pipeline.
//!
//! One [`TaskConsumer`] is one member of its kind's consumer group. It pulls
//! never-delivered entries in batches, runs the task body per message, and
//! acknowledges every consumed entry whether it succeeded or not; failed
//! work comes back as a fresh message with a bumped retry count instead of
//! lingering in the group's pending list.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use prepline_coord::{CoordStore, StreamEntry};
use prepline_core::{truncate_error, TaskStatus};

use crate::message::{TaskKind, TaskMessage};
use crate::producer::TaskProducer;
use crate::status::StatusStore;
use crate::{BATCH_SIZE, BLOCK_TIMEOUT, MAX_RETRIES};

/// The work a task performs, supplied by the embedding application.
///
/// Errors are plain strings because they cross the pipeline only to be
/// logged and recorded on the subject's status.
pub type TaskBody = Box<dyn Fn(&TaskMessage) -> Result<(), String> + Send + Sync>;

/// Tuning knobs for a consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub block_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            block_timeout: BLOCK_TIMEOUT,
        }
    }
}

/// A single worker for one task kind.
pub struct TaskConsumer {
    store: Arc<dyn CoordStore>,
    status: Arc<dyn StatusStore>,
    producer: TaskProducer,
    kind: TaskKind,
    body: TaskBody,
    consumer_name: String,
}

impl TaskConsumer {
    pub fn new(
        store: Arc<dyn CoordStore>,
        status: Arc<dyn StatusStore>,
        kind: TaskKind,
        body: TaskBody,
    ) -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let consumer_name = format!("{}{}", kind.consumer_prefix(), suffix);
        let producer = TaskProducer::new(store.clone(), status.clone(), kind);
        Self {
            store,
            status,
            producer,
            kind,
            body,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Start the worker thread.
    pub fn spawn(self, config: ConsumerConfig) -> TaskConsumerHandle {
        // Group creation is best effort: the loop surfaces the real failure
        // on its first read if the store stays unreachable.
        if let Err(e) = self
            .store
            .create_group(self.kind.stream_key(), self.kind.group())
        {
            warn!(kind = %self.kind, error = %e, "consumer group creation failed");
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let consumer_name = self.consumer_name.clone();
        let kind = self.kind;

        let join = thread::spawn(move || {
            info!(kind = %kind, consumer = %self.consumer_name, "task consumer started");
            self.run(config, shutdown_rx);
            info!(kind = %kind, consumer = %self.consumer_name, "task consumer stopped");
        });

        TaskConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            consumer_name,
        }
    }

    fn run(&self, config: ConsumerConfig, shutdown: Receiver<()>) {
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let batch = self.store.read_group(
                self.kind.stream_key(),
                self.kind.group(),
                &self.consumer_name,
                config.batch_size,
                config.block_timeout,
            );

            match batch {
                Ok(entries) => {
                    for entry in &entries {
                        self.process_entry(entry);
                    }
                }
                Err(e) => {
                    error!(kind = %self.kind, error = %e, "stream read failed");
                    thread::sleep(config.block_timeout);
                }
            }
        }
    }

    /// Handle one delivered entry end to end.
    ///
    /// The entry is acknowledged on every path out of here: retries travel
    /// as new messages, so leaving an entry pending buys nothing.
    pub fn process_entry(&self, entry: &StreamEntry) {
        let message = match TaskMessage::from_fields(&entry.fields) {
            Ok(message) => message,
            Err(e) => {
                warn!(kind = %self.kind, entry_id = %entry.id, error = %e, "dropping malformed task entry");
                self.ack_entry(&entry.id);
                return;
            }
        };

        self.set_status(&message, TaskStatus::Processing, None);

        match self.status.exists(&message.subject_id) {
            Ok(false) => {
                debug!(kind = %self.kind, subject_id = %message.subject_id, "subject deleted, skipping task");
                self.ack_entry(&entry.id);
                return;
            }
            Ok(true) => {}
            Err(e) => {
                // Can't tell; run the body rather than silently drop work.
                warn!(kind = %self.kind, subject_id = %message.subject_id, error = %e, "subject existence check failed");
            }
        }

        match (self.body)(&message) {
            Ok(()) => {
                debug!(kind = %self.kind, subject_id = %message.subject_id, retry_count = message.retry_count, "task completed");
                self.set_status(&message, TaskStatus::Completed, None);
            }
            Err(body_err) => self.handle_failure(&message, &body_err),
        }

        self.ack_entry(&entry.id);
    }

    fn handle_failure(&self, message: &TaskMessage, body_err: &str) {
        if message.retry_count < MAX_RETRIES {
            let retry = message.next_retry();
            warn!(
                kind = %self.kind,
                subject_id = %message.subject_id,
                retry_count = retry.retry_count,
                error = %body_err,
                "task failed, re-enqueueing"
            );
            if let Err(e) = self.producer.publish(&retry) {
                error!(kind = %self.kind, subject_id = %message.subject_id, error = %e, "retry enqueue failed");
                let reason = truncate_error(&format!("retry enqueue failed: {e}"));
                self.set_status(message, TaskStatus::Failed, Some(&reason));
            }
        } else {
            let reason = truncate_error(&format!(
                "task failed after {} retries: {body_err}",
                message.retry_count
            ));
            error!(kind = %self.kind, subject_id = %message.subject_id, error = %reason, "task failed permanently");
            self.set_status(message, TaskStatus::Failed, Some(&reason));
        }
    }

    fn set_status(&self, message: &TaskMessage, status: TaskStatus, error: Option<&str>) {
        if let Err(e) = self
            .status
            .set_status(&message.subject_id, status, error)
        {
            error!(kind = %self.kind, subject_id = %message.subject_id, error = %e, "status update failed");
        }
    }

    fn ack_entry(&self, entry_id: &str) {
        if let Err(e) = self.store.ack(
            self.kind.stream_key(),
            self.kind.group(),
            &[entry_id.to_string()],
        ) {
            // At-least-once: a lost ack means a redelivery, not lost work.
            warn!(kind = %self.kind, %entry_id, error = %e, "ack failed");
        }
    }
}

/// Handle to a spawned consumer; dropping it stops the worker.
pub struct TaskConsumerHandle {
    shutdown: Sender<()>,
    join: Option<JoinHandle<()>>,
    consumer_name: String,
}

impl TaskConsumerHandle {
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Signal the worker and wait for it to finish its current batch.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TaskConsumerHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};

    use prepline_coord::InMemoryCoordStore;
    use prepline_core::SubjectId;

    use crate::status::{InMemoryStatusStore, StatusStore};

    fn consumer_with_body(
        store: Arc<InMemoryCoordStore>,
        status: Arc<InMemoryStatusStore>,
        body: TaskBody,
    ) -> TaskConsumer {
        TaskConsumer::new(store, status, TaskKind::Vectorize, body)
    }

    fn drain_one(store: &InMemoryCoordStore, consumer: &TaskConsumer) -> Option<StreamEntry> {
        let batch = store
            .read_group(
                TaskKind::Vectorize.stream_key(),
                TaskKind::Vectorize.group(),
                consumer.consumer_name(),
                1,
                Duration::ZERO,
            )
            .unwrap();
        batch.into_iter().next()
    }

    #[test]
    fn successful_task_completes_and_acks() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        let subject = SubjectId::from("doc-1");
        status.register(subject.clone());

        store
            .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap();
        let producer = TaskProducer::new(store.clone(), status.clone(), TaskKind::Vectorize);
        producer.enqueue(subject.clone(), BTreeMap::new());

        let consumer = consumer_with_body(store.clone(), status.clone(), Box::new(|_| Ok(())));
        let entry = drain_one(&store, &consumer).unwrap();
        consumer.process_entry(&entry);

        let record = status.status(&subject).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(
            store
                .pending_count(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
                .unwrap(),
            0
        );
    }

    #[test]
    fn malformed_entry_is_acked_and_dropped() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        store
            .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap();

        // No subject_id field at all.
        store
            .stream_add(
                TaskKind::Vectorize.stream_key(),
                &[("junk".to_string(), "1".to_string())],
                None,
            )
            .unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let ran_in_body = ran.clone();
        let consumer = consumer_with_body(
            store.clone(),
            status,
            Box::new(move |_| {
                ran_in_body.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let entry = drain_one(&store, &consumer).unwrap();
        consumer.process_entry(&entry);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(
            store
                .pending_count(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
                .unwrap(),
            0
        );
    }

    #[test]
    fn deleted_subject_is_skipped_without_running_the_body() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        store
            .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap();

        let mut fields = HashMap::new();
        fields.insert("subject_id".to_string(), "gone".to_string());
        let entry = StreamEntry {
            id: store
                .stream_add(
                    TaskKind::Vectorize.stream_key(),
                    &[("subject_id".to_string(), "gone".to_string())],
                    None,
                )
                .unwrap(),
            fields,
        };

        let ran = Arc::new(AtomicU32::new(0));
        let ran_in_body = ran.clone();
        let consumer = consumer_with_body(
            store.clone(),
            status,
            Box::new(move |_| {
                ran_in_body.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        consumer.process_entry(&entry);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_task_is_reenqueued_with_bumped_count() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        let subject = SubjectId::from("doc-2");
        status.register(subject.clone());
        store
            .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap();

        let producer = TaskProducer::new(store.clone(), status.clone(), TaskKind::Vectorize);
        producer.enqueue(subject.clone(), BTreeMap::new());

        let consumer = consumer_with_body(
            store.clone(),
            status.clone(),
            Box::new(|_| Err("model unavailable".to_string())),
        );
        let entry = drain_one(&store, &consumer).unwrap();
        consumer.process_entry(&entry);

        // The retry is a brand-new entry.
        let retry_entry = drain_one(&store, &consumer).unwrap();
        let retry = TaskMessage::from_fields(&retry_entry.fields).unwrap();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.subject_id, subject);

        // Not failed yet.
        let record = status.status(&subject).unwrap().unwrap();
        assert_ne!(record.status, TaskStatus::Failed);
    }

    #[test]
    fn exhausted_retries_mark_failed_with_truncated_error() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        let subject = SubjectId::from("doc-3");
        status.register(subject.clone());
        store
            .create_group(TaskKind::Vectorize.stream_key(), TaskKind::Vectorize.group())
            .unwrap();

        let mut message = TaskMessage::new(subject.clone(), BTreeMap::new());
        message.retry_count = MAX_RETRIES;
        let id = store
            .stream_add(TaskKind::Vectorize.stream_key(), &message.to_fields(), None)
            .unwrap();
        let entry = StreamEntry {
            id,
            fields: message.to_fields().into_iter().collect(),
        };

        let long_err = "x".repeat(2000);
        let consumer = consumer_with_body(
            store.clone(),
            status.clone(),
            Box::new(move |_| Err(long_err.clone())),
        );
        consumer.process_entry(&entry);

        let record = status.status(&subject).unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.starts_with("task failed after 3 retries:"));
        assert_eq!(error.chars().count(), prepline_core::ERROR_MAX_LEN);

        // Nothing new was enqueued.
        assert_eq!(
            store
                .stream_len(TaskKind::Vectorize.stream_key())
                .unwrap(),
            1
        );
    }

    #[test]
    fn consumer_names_carry_the_kind_prefix() {
        let store = InMemoryCoordStore::arc();
        let status = InMemoryStatusStore::arc();
        let a = consumer_with_body(store.clone(), status.clone(), Box::new(|_| Ok(())));
        let b = consumer_with_body(store, status, Box::new(|_| Ok(())));
        assert!(a.consumer_name().starts_with("vectorize-consumer-"));
        assert_ne!(a.consumer_name(), b.consumer_name());
    }
}
