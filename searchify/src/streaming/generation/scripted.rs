//! Deterministic generation sources for local runs and tests

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{
    GenerationError, GenerationEvent, GenerationRequest, GenerationSource, GenerationStream,
    TextDelta,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Delta(TextDelta),
    Pause(Duration),
    /// Ends the script with `GenerationEvent::Failed`
    Fail(String),
    /// Never yields again
    Hang,
}

impl ScriptStep {
    pub fn text(text: &str) -> Self {
        ScriptStep::Delta(TextDelta::new(text))
    }
}

#[derive(Default)]
struct MonitorInner {
    started: AtomicUsize,
    yielded: AtomicUsize,
    dropped: AtomicUsize,
    notify: Notify,
}

/// Observes the streams a scripted source hands out.
#[derive(Clone, Default)]
pub struct StreamMonitor {
    inner: Arc<MonitorInner>,
}

impl StreamMonitor {
    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Deltas pulled out of all streams so far.
    pub fn yielded(&self) -> usize {
        self.inner.yielded.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Wait until every started stream has been dropped.
    pub async fn wait_dropped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.dropped() >= self.started() {
                return;
            }
            notified.await;
        }
    }
}

struct MonitorGuard(StreamMonitor);

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.0.inner.dropped.fetch_add(1, Ordering::SeqCst);
        self.0.inner.notify.notify_waiters();
    }
}

struct ScriptState {
    steps: VecDeque<ScriptStep>,
    guard: MonitorGuard,
    finished: bool,
}

/// Plays back a fixed script of steps, then completes.
#[derive(Clone, Default)]
pub struct ScriptedGenerationSource {
    steps: Vec<ScriptStep>,
    refuse_start: Option<String>,
    monitor: StreamMonitor,
}

impl ScriptedGenerationSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// A source whose `start` always fails.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            refuse_start: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn from_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| ScriptStep::text(t)).collect())
    }

    pub fn monitor(&self) -> StreamMonitor {
        self.monitor.clone()
    }

    pub fn stream(&self) -> GenerationStream {
        self.monitor.inner.started.fetch_add(1, Ordering::SeqCst);
        let state = ScriptState {
            steps: self.steps.iter().cloned().collect(),
            guard: MonitorGuard(self.monitor.clone()),
            finished: false,
        };
        stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                match state.steps.pop_front() {
                    Some(ScriptStep::Delta(delta)) => {
                        state.guard.0.inner.yielded.fetch_add(1, Ordering::SeqCst);
                        return Some((GenerationEvent::Delta(delta), state));
                    }
                    Some(ScriptStep::Pause(duration)) => tokio::time::sleep(duration).await,
                    Some(ScriptStep::Fail(reason)) => {
                        state.finished = true;
                        return Some((GenerationEvent::Failed(reason), state));
                    }
                    Some(ScriptStep::Hang) => futures::future::pending::<()>().await,
                    None => {
                        state.finished = true;
                        return Some((GenerationEvent::Complete, state));
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl GenerationSource for ScriptedGenerationSource {
    async fn start(&self, _request: GenerationRequest) -> Result<GenerationStream, GenerationError> {
        if let Some(reason) = &self.refuse_start {
            return Err(GenerationError::Unavailable(reason.clone()));
        }
        Ok(self.stream())
    }
}

/// Streams the query back one word at a time.
#[derive(Debug, Clone)]
pub struct EchoGenerationSource {
    delay: Duration,
}

impl EchoGenerationSource {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl GenerationSource for EchoGenerationSource {
    async fn start(&self, request: GenerationRequest) -> Result<GenerationStream, GenerationError> {
        let mut steps = Vec::new();
        for (idx, word) in request.query.split_whitespace().enumerate() {
            if !self.delay.is_zero() {
                steps.push(ScriptStep::Pause(self.delay));
            }
            let text = if idx == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            };
            steps.push(ScriptStep::Delta(TextDelta::new(text)));
        }
        Ok(ScriptedGenerationSource::new(steps).stream())
    }
}
