//! Evidence records and the retrieval seam
//!
//! The retrieval subsystem is an external collaborator reached through
//! [`EvidenceResolver`]. Sessions never talk to it directly; they go through a
//! per-session [`EvidenceStore`] which caches answers for the session lifetime.

pub mod cache;
pub mod resolvers;
pub mod store;

pub use cache::SharedEvidenceCache;
pub use resolvers::{HttpEvidenceResolver, StaticEvidenceResolver};
pub use store::EvidenceStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Text surrounding the cited passage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    #[serde(default)]
    pub pre: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub post: String,
}

/// A resolved search result, immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: String,
    #[serde(default)]
    pub snippet: Snippet,
    pub source: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EvidenceRecord {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            snippet: Snippet::default(),
            source: source.into(),
            url: url.into(),
            title: title.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_snippet(mut self, pre: &str, text: &str, post: &str) -> Self {
        self.snippet = Snippet {
            pre: pre.to_string(),
            text: text.to_string(),
            post: post.to_string(),
        };
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Name of the first required field that is empty, if any.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        [
            ("id", &self.id),
            ("source", &self.source),
            ("url", &self.url),
            ("title", &self.title),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// Answer of the retrieval collaborator for one id
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(EvidenceRecord),
    NotFound,
}

/// Transient retrieval failure. A definitive miss is `Resolution::NotFound`.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("Retrieval timed out after {0:?}")]
    Timeout(Duration),
    #[error("Retrieval transport error: {0}")]
    Transport(String),
    #[error("Invalid retrieval payload: {0}")]
    InvalidPayload(String),
}

/// Read-only lookup into the retrieval subsystem.
///
/// Implementations are shared by every live session and must tolerate
/// concurrent calls.
#[async_trait]
pub trait EvidenceResolver: Send + Sync {
    async fn resolve(&self, instance_hash: &str, id: &str) -> Result<Resolution, ResolveError>;
}
