//! Streaming loop for one session
//!
//! Two tasks cooperate per session: a producer forwarding the generation
//! stream into a bounded queue, and the session loop which folds deltas into
//! the session, assembles chunks and writes them to the sink. The queue depth
//! bounds how far generation can run ahead of a slow client.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::generation::{GenerationEvent, GenerationStream, TextDelta};
use super::transport::{FrameSink, TransportEncoder, TransportError};
use crate::chunk::ChunkAssembler;
use crate::citation::CitationScanner;
use crate::config::StreamConfig;
use crate::session::{Session, SessionState};

/// Why a session stopped streaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed,
    GenerationFailed(String),
    IdleTimeout,
    Shutdown,
    /// The client went away; no terminal chunk was delivered
    Disconnected(String),
}

impl Termination {
    /// Whether the client received a terminal chunk.
    pub fn delivered_terminal(&self) -> bool {
        !matches!(self, Termination::Disconnected(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub termination: Termination,
    pub final_state: SessionState,
    pub chunks_emitted: usize,
    pub text_len: usize,
    pub resolved_citations: usize,
    pub unresolved_citations: usize,
    pub elapsed: Duration,
}

enum Wake {
    Shutdown,
    ClientGone,
    Event(GenerationEvent),
    SourceGone,
    Idle,
}

pub struct StreamSession<S: FrameSink> {
    session: Session,
    assembler: ChunkAssembler,
    encoder: TransportEncoder,
    sink: S,
    config: StreamConfig,
    shutdown: CancellationToken,
    last_emitted_text: Option<String>,
    chunks_emitted: usize,
}

impl<S: FrameSink> StreamSession<S> {
    pub fn new(session: Session, sink: S, config: StreamConfig) -> Self {
        Self {
            assembler: ChunkAssembler::new(CitationScanner::new(config.citation_grammar)),
            session,
            encoder: TransportEncoder,
            sink,
            config,
            shutdown: CancellationToken::new(),
            last_emitted_text: None,
            chunks_emitted: 0,
        }
    }

    /// Stop the session with a terminal chunk once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Stream `generation` to the sink until a terminal chunk is written or
    /// the client goes away.
    pub async fn run(self, generation: GenerationStream) -> SessionReport {
        let span = info_span!(
            "stream_session",
            session_id = %self.session.id(),
            instance_hash = %self.session.instance_hash()
        );
        self.drive(generation).instrument(span).await
    }

    async fn drive(mut self, generation: GenerationStream) -> SessionReport {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel(self.config.delta_queue_depth.max(1));
        let producer_token = CancellationToken::new();
        let producer = tokio::spawn(
            pump_generation(generation, tx, producer_token.clone()).in_current_span(),
        );

        let termination = self.consume(&mut rx).await;

        producer_token.cancel();
        drop(rx);
        if let Err(e) = producer.await {
            warn!(error = %e, "Generation producer task failed");
        }

        let report = SessionReport {
            session_id: self.session.id().to_string(),
            started_at: self.session.started_at(),
            termination,
            final_state: self.session.state(),
            chunks_emitted: self.chunks_emitted,
            text_len: self.session.accumulated_text().len(),
            resolved_citations: self.session.evidence().resolved_count(),
            unresolved_citations: self.session.evidence().unresolved_count(),
            elapsed: started.elapsed(),
        };
        info!(
            termination = ?report.termination,
            chunks = report.chunks_emitted,
            text_len = report.text_len,
            resolved = report.resolved_citations,
            unresolved = report.unresolved_citations,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Session finished"
        );
        report
    }

    async fn consume(&mut self, rx: &mut mpsc::Receiver<GenerationEvent>) -> Termination {
        let idle = self.config.idle_timeout();
        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                _ = self.sink.closed() => Wake::ClientGone,
                received = tokio::time::timeout(idle, rx.recv()) => match received {
                    Ok(Some(event)) => Wake::Event(event),
                    Ok(None) => Wake::SourceGone,
                    Err(_) => Wake::Idle,
                },
            };

            let delta = match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested, completing session");
                    return self.finish(Termination::Shutdown).await;
                }
                Wake::ClientGone => return self.abandon("client closed the stream".to_string()),
                Wake::Idle => {
                    warn!(idle_ms = idle.as_millis() as u64, "Generation went idle");
                    return self.finish(Termination::IdleTimeout).await;
                }
                Wake::SourceGone => {
                    return self
                        .finish(Termination::GenerationFailed(
                            "generation source went away".to_string(),
                        ))
                        .await
                }
                Wake::Event(GenerationEvent::Delta(delta)) => delta,
                Wake::Event(terminal) => return self.finish(terminal_cause(terminal)).await,
            };

            self.apply(delta).await;

            // fold deltas that are already waiting into the same chunk
            let mut folded = 1;
            while folded < self.config.max_deltas_per_chunk {
                match rx.try_recv() {
                    Ok(GenerationEvent::Delta(delta)) => {
                        self.apply(delta).await;
                        folded += 1;
                    }
                    Ok(terminal) => return self.finish(terminal_cause(terminal)).await,
                    Err(_) => break,
                }
            }
            if folded > 1 {
                debug!(deltas = folded, "Folded queued deltas into one chunk");
            }

            if let Err(e) = self.emit(false).await {
                return self.abandon(e.to_string());
            }
        }
    }

    async fn apply(&mut self, delta: TextDelta) {
        if !delta.citations.is_empty() {
            self.session
                .evidence_mut()
                .resolve_pending(delta.citations.iter().map(String::as_str))
                .await;
        }
        if let Err(e) = self.session.append(&delta.text) {
            debug!(error = %e, "Dropping delta");
        }
    }

    async fn emit(&mut self, is_done: bool) -> Result<(), TransportError> {
        if !is_done && self.last_emitted_text.as_deref() == Some(self.session.accumulated_text()) {
            return Ok(());
        }
        let chunk = self.assembler.assemble(&mut self.session, is_done).await;
        self.encoder
            .write(&mut self.sink, &chunk, self.config.write_timeout())
            .await?;
        self.chunks_emitted += 1;
        self.last_emitted_text = Some(chunk.updated_text);
        Ok(())
    }

    /// Move to `Completing`, write the terminal chunk and close.
    async fn finish(&mut self, cause: Termination) -> Termination {
        if let Err(e) = self.session.begin_completing() {
            debug!(error = %e, "Session already completing");
        }
        match self.emit(true).await {
            Ok(()) => {
                self.session.close();
                cause
            }
            Err(e) => self.abandon(e.to_string()),
        }
    }

    fn abandon(&mut self, reason: String) -> Termination {
        info!(reason = %reason, "Client gone, cancelling generation");
        self.session.close();
        Termination::Disconnected(reason)
    }
}

fn terminal_cause(event: GenerationEvent) -> Termination {
    match event {
        GenerationEvent::Failed(reason) => {
            warn!(reason = %reason, "Generation failed mid-stream");
            Termination::GenerationFailed(reason)
        }
        _ => Termination::Completed,
    }
}

/// Forward generation events into the session queue until a terminal event,
/// cancellation, or the session dropping its receiver. Dropping `generation`
/// on the way out stops the upstream.
async fn pump_generation(
    mut generation: GenerationStream,
    tx: mpsc::Sender<GenerationEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = generation.next() => next.unwrap_or(GenerationEvent::Complete),
        };
        let terminal = event.is_terminal();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(event) => sent,
        };
        if sent.is_err() || terminal {
            break;
        }
    }
    drop(generation);
    debug!("Generation producer stopped");
}
