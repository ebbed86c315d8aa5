//! HTTP surface of the streaming gateway
//!
//! - `POST /v1/stream`: authenticate, start a generation, stream chunks as SSE
//! - `GET /health`: liveness plus the number of live sessions

mod response;
mod stream;

pub use response::ErrorResponse;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::access::{AccessControl, RateLimiter, StaticAccessControl};
use crate::config::{EvidenceConfig, GatewayConfig, GenerationConfig, RetrievalConfig, StreamConfig};
use crate::error::GatewayError;
use crate::evidence::{
    EvidenceResolver, HttpEvidenceResolver, SharedEvidenceCache, StaticEvidenceResolver,
};
use crate::streaming::{EchoGenerationSource, GenerationSource, HttpGenerationSource};

/// Shared state behind every request
pub struct GatewayState {
    pub access: Arc<dyn AccessControl>,
    pub rate_limiter: RateLimiter,
    pub generation: Arc<dyn GenerationSource>,
    pub resolver: Arc<dyn EvidenceResolver>,
    pub stream_config: StreamConfig,
    pub evidence_config: EvidenceConfig,
    /// Cancelled on server shutdown; every session holds a child token
    pub shutdown: CancellationToken,
    active_sessions: Arc<AtomicUsize>,
}

impl GatewayState {
    pub fn new(
        access: Arc<dyn AccessControl>,
        generation: Arc<dyn GenerationSource>,
        resolver: Arc<dyn EvidenceResolver>,
    ) -> Self {
        Self {
            access,
            rate_limiter: RateLimiter::disabled(),
            generation,
            resolver,
            stream_config: StreamConfig::default(),
            evidence_config: EvidenceConfig::default(),
            shutdown: CancellationToken::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn with_evidence_config(mut self, config: EvidenceConfig) -> Self {
        self.evidence_config = config;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let access = StaticAccessControl::from_config(config)?;
        info!(
            keys = access.key_count(),
            instances = config.instances.len(),
            "Loaded access control"
        );
        let access = Arc::new(access);

        let generation: Arc<dyn GenerationSource> = match &config.generation {
            GenerationConfig::Http {
                url,
                bearer_token,
                connect_timeout_ms,
            } => Arc::new(HttpGenerationSource::new(
                url.clone(),
                bearer_token.clone(),
                Duration::from_millis(*connect_timeout_ms),
            )?),
            GenerationConfig::Echo { delay_ms } => {
                Arc::new(EchoGenerationSource::new(Duration::from_millis(*delay_ms)))
            }
        };

        let mut resolver: Arc<dyn EvidenceResolver> = match &config.retrieval {
            RetrievalConfig::Static { path: Some(path) } => Arc::new(load_static_evidence(path)?),
            RetrievalConfig::Static { path: None } => Arc::new(StaticEvidenceResolver::new()),
            RetrievalConfig::Http {
                base_url,
                bearer_token,
            } => Arc::new(HttpEvidenceResolver::with_timeout(
                base_url.clone(),
                bearer_token.clone(),
                config.evidence.resolve_timeout(),
            )?),
        };
        if config.evidence.shared_cache_entries > 0 {
            resolver = Arc::new(SharedEvidenceCache::new(
                resolver,
                config.evidence.shared_cache_entries,
            ));
        }

        Ok(Self::new(access, generation, resolver)
            .with_rate_limiter(RateLimiter::from_config(&config.rate_limit))
            .with_stream_config(config.stream.clone())
            .with_evidence_config(config.evidence.clone()))
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    fn track_session(&self) -> ActiveSessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        ActiveSessionGuard(Arc::clone(&self.active_sessions))
    }
}

fn load_static_evidence(path: &Path) -> Result<StaticEvidenceResolver, GatewayError> {
    let resolver = StaticEvidenceResolver::from_json_file(path)?;
    info!(
        path = %path.display(),
        records = resolver.record_count(),
        "Loaded static evidence"
    );
    Ok(resolver)
}

struct ActiveSessionGuard(Arc<AtomicUsize>);

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/stream", post(stream::stream_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "active_sessions": state.active_sessions() }))
}

/// Build the gateway from `config` and serve until Ctrl+C.
pub async fn serve(config: GatewayConfig) -> Result<(), GatewayError> {
    let state = Arc::new(GatewayState::from_config(&config)?);
    let listener = TcpListener::bind(config.bind_addr.as_str())
        .await
        .map_err(|e| GatewayError::Internal(format!("Gateway bind error: {}", e)))?;
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves. Live sessions are completed
/// with a terminal chunk before the server stops.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<GatewayState>,
    signal: F,
) -> Result<(), GatewayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Searchify gateway listening on http://{}", addr);
    }
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            shutdown.cancel();
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("Gateway server error: {}", e)))?;
    info!("Searchify gateway stopped");
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down");
}
