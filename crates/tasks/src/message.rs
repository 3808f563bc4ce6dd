//! Task kinds and the wire form of a task message.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use prepline_core::SubjectId;

/// The three background task families of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Vectorize a knowledge base document for retrieval.
    Vectorize,
    /// Analyze an uploaded resume.
    Analyze,
    /// Evaluate a finished interview session.
    Evaluate,
}

impl TaskKind {
    /// Stream the messages of this kind travel on.
    pub fn stream_key(&self) -> &'static str {
        match self {
            TaskKind::Vectorize => "knowledgebase:vectorize:stream",
            TaskKind::Analyze => "resume:analyze:stream",
            TaskKind::Evaluate => "interview:evaluate:stream",
        }
    }

    /// Consumer group name; one group per kind, workers share it.
    pub fn group(&self) -> &'static str {
        match self {
            TaskKind::Vectorize => "vectorize-group",
            TaskKind::Analyze => "analyze-group",
            TaskKind::Evaluate => "evaluate-group",
        }
    }

    /// Prefix for generated per-worker consumer names.
    pub fn consumer_prefix(&self) -> &'static str {
        match self {
            TaskKind::Vectorize => "vectorize-consumer-",
            TaskKind::Analyze => "analyze-consumer-",
            TaskKind::Evaluate => "evaluate-consumer-",
        }
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TaskKind::Vectorize => "vectorize",
            TaskKind::Analyze => "analyze",
            TaskKind::Evaluate => "evaluate",
        };
        f.write_str(s)
    }
}

const FIELD_SUBJECT_ID: &str = "subject_id";
const FIELD_RETRY_COUNT: &str = "retry_count";

/// A stream entry that could not be decoded into a [`TaskMessage`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedTask {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has unparsable value '{1}'")]
    BadValue(&'static str, String),
}

/// One unit of background work as carried on a stream.
///
/// `payload` holds kind-specific fields (document content, resume text, ...)
/// and travels opaque through the pipeline. Retry state rides in the message
/// itself: a retried task is a brand-new stream entry with a bumped count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub subject_id: SubjectId,
    pub retry_count: u32,
    pub payload: BTreeMap<String, String>,
}

impl TaskMessage {
    pub fn new(subject_id: SubjectId, payload: BTreeMap<String, String>) -> Self {
        Self {
            subject_id,
            retry_count: 0,
            payload,
        }
    }

    /// The message re-enqueued after a failed attempt.
    pub fn next_retry(&self) -> Self {
        Self {
            subject_id: self.subject_id.clone(),
            retry_count: self.retry_count + 1,
            payload: self.payload.clone(),
        }
    }

    /// Flatten into stream fields.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(self.payload.len() + 2);
        fields.push((FIELD_SUBJECT_ID.to_string(), self.subject_id.to_string()));
        fields.push((FIELD_RETRY_COUNT.to_string(), self.retry_count.to_string()));
        for (name, value) in &self.payload {
            fields.push((name.clone(), value.clone()));
        }
        fields
    }

    /// Decode stream fields back into a message.
    ///
    /// A missing `retry_count` decodes as 0 (entries written by older
    /// producers); a missing subject id is malformed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, MalformedTask> {
        let subject_id = fields
            .get(FIELD_SUBJECT_ID)
            .filter(|v| !v.is_empty())
            .ok_or(MalformedTask::MissingField(FIELD_SUBJECT_ID))?;

        let retry_count = match fields.get(FIELD_RETRY_COUNT) {
            None => 0,
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| MalformedTask::BadValue(FIELD_RETRY_COUNT, raw.clone()))?,
        };

        let payload = fields
            .iter()
            .filter(|(name, _)| name.as_str() != FIELD_SUBJECT_ID && name.as_str() != FIELD_RETRY_COUNT)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self {
            subject_id: SubjectId::from(subject_id.as_str()),
            retry_count,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields_of(msg: &TaskMessage) -> HashMap<String, String> {
        msg.to_fields().into_iter().collect()
    }

    #[test]
    fn fields_decode_back_to_the_same_message() {
        let mut payload = BTreeMap::new();
        payload.insert("content".to_string(), "some document".to_string());
        let msg = TaskMessage::new(SubjectId::from("doc-7"), payload);

        let decoded = TaskMessage::from_fields(&fields_of(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn next_retry_bumps_only_the_count() {
        let msg = TaskMessage::new(SubjectId::from("s"), BTreeMap::new());
        let retried = msg.next_retry();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.subject_id, msg.subject_id);
        assert_eq!(retried.payload, msg.payload);
    }

    #[test]
    fn missing_subject_is_malformed() {
        let mut fields = HashMap::new();
        fields.insert("retry_count".to_string(), "0".to_string());
        let err = TaskMessage::from_fields(&fields).unwrap_err();
        assert_eq!(err, MalformedTask::MissingField("subject_id"));
    }

    #[test]
    fn missing_retry_count_defaults_to_zero() {
        let mut fields = HashMap::new();
        fields.insert("subject_id".to_string(), "s".to_string());
        let msg = TaskMessage::from_fields(&fields).unwrap();
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn garbage_retry_count_is_malformed() {
        let mut fields = HashMap::new();
        fields.insert("subject_id".to_string(), "s".to_string());
        fields.insert("retry_count".to_string(), "many".to_string());
        let err = TaskMessage::from_fields(&fields).unwrap_err();
        assert!(matches!(err, MalformedTask::BadValue("retry_count", _)));
    }

    #[test]
    fn kind_constants_line_up() {
        assert_eq!(TaskKind::Vectorize.stream_key(), "knowledgebase:vectorize:stream");
        assert_eq!(TaskKind::Analyze.group(), "analyze-group");
        assert_eq!(TaskKind::Evaluate.consumer_prefix(), "evaluate-consumer-");
    }
}
