//! Strongly-typed identifiers used across the domain.
//!
//! Identifiers are opaque strings rather than UUIDs: a subject id may be a
//! numeric database key (knowledge base, resume) or a generated session token,
//! and the coordination store carries everything as strings anyway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the business record that owns an asynchronous task
/// (knowledge-base id, resume id, session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

/// Identifier of a mock-interview session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(SubjectId);
impl_string_newtype!(SessionId);

impl From<i64> for SubjectId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl SessionId {
    /// Generate a fresh session identifier (16 hex characters).
    ///
    /// Random rather than time-ordered so session tokens are not guessable.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(uuid[..16].to_string())
    }
}

impl From<&SessionId> for SubjectId {
    fn from(value: &SessionId) -> Self {
        SubjectId::new(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_ids_are_unique_and_short() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn subject_id_from_numeric_key() {
        let id = SubjectId::from(42i64);
        assert_eq!(id.as_str(), "42");
    }
}
