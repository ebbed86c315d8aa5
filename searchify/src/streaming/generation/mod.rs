//! Generation source seam
//!
//! The generation engine is an external collaborator that turns a query into
//! an ordered, finite sequence of text deltas. Every source yields
//! [`GenerationEvent`]s and ends with exactly one `Complete` or `Failed`.

pub mod http;
pub mod scripted;

pub use http::HttpGenerationSource;
pub use scripted::{EchoGenerationSource, ScriptStep, ScriptedGenerationSource, StreamMonitor};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub session_id: String,
    pub instance_hash: String,
    pub query: String,
}

/// A piece of generated text, appended to the session as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub text: String,
    /// Ids the engine expects to cite soon; used to warm the evidence store
    #[serde(default)]
    pub citations: Vec<String>,
}

impl TextDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
        }
    }

    pub fn with_citations<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.citations = ids.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Delta(TextDelta),
    Complete,
    Failed(String),
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationEvent::Delta(_))
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation source unavailable: {0}")]
    Unavailable(String),
    /// The source was reached but refused the request
    #[error("Generation request rejected: {0}")]
    Rejected(String),
}

pub type GenerationStream = BoxStream<'static, GenerationEvent>;

/// Starts a generation for one session.
///
/// `start` fails only when the source cannot begin at all; failures after the
/// first delta are reported in-band as `GenerationEvent::Failed`. Dropping the
/// returned stream must stop the underlying generation.
#[async_trait]
pub trait GenerationSource: Send + Sync {
    async fn start(&self, request: GenerationRequest) -> Result<GenerationStream, GenerationError>;
}
