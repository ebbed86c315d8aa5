#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use searchify::config::{EvidenceConfig, StreamConfig};
use searchify::evidence::{
    EvidenceRecord, EvidenceResolver, Resolution, ResolveError, StaticEvidenceResolver,
};
use searchify::streaming::{
    parse_frames, ChannelFrameSink, Frame, ScriptStep, ScriptedGenerationSource, SessionReport,
    StreamSession,
};
use searchify::{Chunk, CitationScanner, Session};
use tokio::sync::mpsc;

pub const INSTANCE: &str = "inst-a";

pub fn bio101() -> EvidenceRecord {
    EvidenceRecord::new("0", "web", "http://x", "Bio101")
        .with_snippet("Plants ", "use light", " to make sugar.")
}

pub fn chem201() -> EvidenceRecord {
    EvidenceRecord::new("1", "kb", "http://kb/chem201", "Chem201")
}

pub fn static_resolver() -> StaticEvidenceResolver {
    StaticEvidenceResolver::new()
        .with_record(INSTANCE, bio101())
        .with_record(INSTANCE, chem201())
}

/// Wraps a resolver and counts lookups per id; the first `fail_first` lookups
/// of every id fail with a transport error.
pub struct CountingResolver {
    inner: StaticEvidenceResolver,
    fail_first: usize,
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingResolver {
    pub fn new(inner: StaticEvidenceResolver) -> Self {
        Self::flaky(inner, 0)
    }

    pub fn flaky(inner: StaticEvidenceResolver, fail_first: usize) -> Self {
        Self {
            inner,
            fail_first,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EvidenceResolver for CountingResolver {
    async fn resolve(&self, instance_hash: &str, id: &str) -> Result<Resolution, ResolveError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if call <= self.fail_first {
            return Err(ResolveError::Transport("connection reset".to_string()));
        }
        self.inner.resolve(instance_hash, id).await
    }
}

pub fn session_with(resolver: Arc<dyn EvidenceResolver>) -> Session {
    Session::new(INSTANCE, "what is photosynthesis", resolver, &EvidenceConfig::default())
}

/// One chunk per delta, so chunk counts are deterministic.
pub fn unbatched() -> StreamConfig {
    StreamConfig {
        max_deltas_per_chunk: 1,
        ..StreamConfig::default()
    }
}

pub async fn drain(mut rx: mpsc::Receiver<Frame>) -> Vec<Chunk> {
    let mut body = Vec::new();
    while let Some(frame) = rx.recv().await {
        body.extend(frame.into_bytes());
    }
    parse_frames(&String::from_utf8(body).expect("frames are utf8"))
}

/// Run a full session over a channel sink and return the report and chunks.
pub async fn run_script(
    steps: Vec<ScriptStep>,
    resolver: Arc<dyn EvidenceResolver>,
    config: StreamConfig,
) -> (SessionReport, Vec<Chunk>) {
    let source = ScriptedGenerationSource::new(steps);
    let (sink, rx) = ChannelFrameSink::channel(64);
    let report = StreamSession::new(session_with(resolver), sink, config)
        .run(source.stream())
        .await;
    (report, drain(rx).await)
}

/// Invariants every finished stream must satisfy.
pub fn assert_stream_invariants(chunks: &[Chunk]) {
    assert!(!chunks.is_empty(), "a stream always carries a terminal chunk");

    let terminal: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_done)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminal, vec![chunks.len() - 1], "exactly one terminal chunk, last");

    let scanner = CitationScanner::default();
    for pair in chunks.windows(2) {
        assert!(
            pair[1].updated_text.starts_with(&pair[0].updated_text),
            "text only grows: {:?} -> {:?}",
            pair[0].updated_text,
            pair[1].updated_text
        );
    }
    for chunk in chunks {
        let cited = scanner.scan(&chunk.updated_text);
        let ids = chunk.result_ids();
        for id in &ids {
            assert!(cited.contains(id), "result {} is not cited in {:?}", id, chunk.updated_text);
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len(), "duplicate results in {:?}", ids);
        for record in &chunk.search_results {
            assert_eq!(record.missing_required_field(), None);
        }
    }
}
