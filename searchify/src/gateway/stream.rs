use axum::extract::rejection::JsonRejection;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::unfold;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use super::GatewayState;
use crate::error::GatewayError;
use crate::session::Session;
use crate::streaming::{ChannelFrameSink, GenerationRequest, StreamSession};

pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Matched case-insensitively
const QUERY_CREDENTIAL_PARAMS: &[&str] = &["api_key", "apikey", "key", "token", "access_token"];
const BODY_CREDENTIAL_FIELDS: &[&str] = &["api_key", "apikey", "key", "authorization"];

#[derive(Debug, Deserialize)]
struct StreamRequest {
    instance_hash: String,
    query: String,
}

/// POST /v1/stream
pub(super) async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    if let Some(raw_query) = raw_query.as_deref() {
        reject_query_credentials(raw_query)?;
    }
    if let Ok(Json(value)) = &body {
        reject_body_credentials(value)?;
    }
    let api_key = extract_bearer(&headers)?;
    let request = parse_request(body)?;

    let tenant = state
        .access
        .authorize(&api_key, &request.instance_hash)
        .await?;
    if !state.rate_limiter.allow(&tenant.key_id) {
        warn!(key_id = %tenant.key_id, "Rate limit exceeded");
        return Err(GatewayError::RateLimited);
    }

    let session = Session::new(
        tenant.instance_hash.clone(),
        request.query,
        Arc::clone(&state.resolver),
        &state.evidence_config,
    );
    let session_id = session.id().to_string();

    let generation = state
        .generation
        .start(GenerationRequest {
            session_id: session_id.clone(),
            instance_hash: tenant.instance_hash.clone(),
            query: session.query().to_string(),
        })
        .await
        .map_err(|e| {
            warn!(session_id = %session_id, error = %e, "Generation source failed to start");
            GatewayError::from(e)
        })?;

    info!(
        session_id = %session_id,
        instance_hash = %tenant.instance_hash,
        key_id = %tenant.key_id,
        "Starting stream"
    );

    let (sink, frames) = ChannelFrameSink::channel(state.stream_config.frame_buffer);
    let stream_session = StreamSession::new(session, sink, state.stream_config.clone())
        .with_shutdown(state.shutdown.child_token());
    let guard = state.track_session();
    tokio::spawn(async move {
        let _guard = guard;
        stream_session.run(generation).await;
    });

    // dropping the body (client gone) closes the sink and cancels the session
    let events = unfold(frames, |mut frames| async move {
        let frame = frames.recv().await?;
        Some((Ok::<_, Infallible>(Event::default().data(frame.payload())), frames))
    });

    Ok((
        [(SESSION_ID_HEADER, session_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

fn reject_query_credentials(raw_query: &str) -> Result<(), GatewayError> {
    for pair in raw_query.split('&') {
        let name = pair.split('=').next().unwrap_or_default();
        let name = urlencoding::decode(name)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| name.to_string());
        if QUERY_CREDENTIAL_PARAMS
            .iter()
            .any(|param| param.eq_ignore_ascii_case(&name))
        {
            return Err(GatewayError::CredentialsOutsideHeader(format!(
                "query parameter `{}`",
                name
            )));
        }
    }
    Ok(())
}

fn reject_body_credentials(body: &Value) -> Result<(), GatewayError> {
    let Some(fields) = body.as_object() else {
        return Ok(());
    };
    match fields.keys().find(|key| {
        BODY_CREDENTIAL_FIELDS
            .iter()
            .any(|field| field.eq_ignore_ascii_case(key))
    }) {
        Some(field) => Err(GatewayError::CredentialsOutsideHeader(format!(
            "body field `{}`",
            field
        ))),
        None => Ok(()),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Result<String, GatewayError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
        })
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".to_string()))
}

fn parse_request(body: Result<Json<Value>, JsonRejection>) -> Result<StreamRequest, GatewayError> {
    let Json(value) = body.map_err(|rejection| GatewayError::BadRequest(rejection.body_text()))?;
    let request: StreamRequest = serde_json::from_value(value)
        .map_err(|e| GatewayError::BadRequest(format!("invalid request body: {}", e)))?;
    if request.instance_hash.trim().is_empty() {
        return Err(GatewayError::BadRequest(
            "instance_hash must not be empty".to_string(),
        ));
    }
    if request.query.trim().is_empty() {
        return Err(GatewayError::BadRequest("query must not be empty".to_string()));
    }
    Ok(request)
}
