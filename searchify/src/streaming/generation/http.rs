//! Upstream generation engine reached over SSE
//!
//! The gateway POSTs a [`GenerationRequest`] as JSON and reads back an event
//! stream. Recognized events:
//!
//! - `delta` (or unnamed `message`): `{"text": "...", "citations": ["0"]}`
//! - `done`: generation finished; its data is ignored
//! - `error`: `{"message": "..."}`, generation failed
//!
//! Other event names are ignored.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest_eventsource::{Error as UpstreamError, Event as UpstreamEvent, EventSource};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    GenerationError, GenerationEvent, GenerationRequest, GenerationSource, GenerationStream,
    TextDelta,
};

pub struct HttpGenerationSource {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpGenerationSource {
    pub fn new(
        url: impl Into<String>,
        bearer_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GenerationError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            bearer_token,
        })
    }
}

#[derive(Deserialize)]
struct UpstreamFailure {
    #[serde(default)]
    message: String,
}

/// Map one upstream SSE message onto a generation event.
pub fn decode_upstream_event(event: &str, data: &str) -> Option<GenerationEvent> {
    match event {
        "" | "message" | "delta" => Some(match serde_json::from_str::<TextDelta>(data) {
            Ok(delta) => GenerationEvent::Delta(delta),
            Err(e) => GenerationEvent::Failed(format!("malformed delta from upstream: {}", e)),
        }),
        "done" => Some(GenerationEvent::Complete),
        "error" => {
            let message = serde_json::from_str::<UpstreamFailure>(data)
                .map(|e| e.message)
                .unwrap_or_else(|_| data.to_string());
            Some(GenerationEvent::Failed(message))
        }
        other => {
            debug!(event = other, "Ignoring upstream event");
            None
        }
    }
}

struct UpstreamState {
    source: EventSource,
    finished: bool,
}

#[async_trait]
impl GenerationSource for HttpGenerationSource {
    async fn start(&self, request: GenerationRequest) -> Result<GenerationStream, GenerationError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let mut source = EventSource::new(builder).map_err(|e| {
            GenerationError::Unavailable(format!("Failed to connect to {}: {}", self.url, e))
        })?;

        // Wait for the upstream to accept before the client gets a 200.
        match source.next().await {
            Some(Ok(UpstreamEvent::Open)) => {}
            Some(Ok(UpstreamEvent::Message(message))) => {
                source.close();
                return Err(GenerationError::Unavailable(format!(
                    "unexpected `{}` event before open",
                    message.event
                )));
            }
            Some(Err(err)) => {
                source.close();
                return Err(match err {
                    UpstreamError::InvalidStatusCode(status, _) => {
                        GenerationError::Rejected(format!("upstream answered {}", status))
                    }
                    UpstreamError::InvalidContentType(content_type, _) => GenerationError::Rejected(
                        format!("upstream answered with content type {:?}", content_type),
                    ),
                    other => GenerationError::Unavailable(other.to_string()),
                });
            }
            None => {
                return Err(GenerationError::Unavailable(
                    "upstream closed before opening".to_string(),
                ))
            }
        }
        debug!(url = %self.url, session_id = %request.session_id, "Upstream generation opened");

        let state = UpstreamState {
            source,
            finished: false,
        };
        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                let event = match state.source.next().await {
                    Some(Ok(UpstreamEvent::Open)) => continue,
                    Some(Ok(UpstreamEvent::Message(message))) => {
                        match decode_upstream_event(&message.event, &message.data) {
                            Some(event) => event,
                            None => continue,
                        }
                    }
                    Some(Err(UpstreamError::StreamEnded)) | None => {
                        warn!("Upstream generation ended without `done`");
                        GenerationEvent::Failed("upstream ended without `done`".to_string())
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Upstream generation stream error");
                        GenerationEvent::Failed(err.to_string())
                    }
                };
                if event.is_terminal() {
                    state.finished = true;
                    state.source.close();
                }
                return Some((event, state));
            }
        })
        .boxed())
    }
}
