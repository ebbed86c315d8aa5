use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::Value;

use searchify::streaming::{
    GenerationError, GenerationEvent, GenerationRequest, GenerationSource, HttpGenerationSource,
    TextDelta,
};

const UPSTREAM_TOKEN: &str = "up-secret";

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
}

fn sse(events: Vec<Event>) -> Response {
    Sse::new(stream::iter(events.into_iter().map(Ok::<_, Infallible>))).into_response()
}

fn delta(text: &str) -> Event {
    Event::default()
        .event("delta")
        .data(serde_json::json!({ "text": text }).to_string())
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", UPSTREAM_TOKEN))
        .unwrap_or(false)
}

async fn complete(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let query = request["query"].as_str().unwrap_or_default().to_string();
    sse(vec![
        delta(&query),
        Event::default()
            .event("delta")
            .data(r#"{"text":" [0]","citations":["0"]}"#),
        Event::default().event("ping").data("{}"),
        Event::default().event("done").data("{}"),
    ])
}

async fn failing(State(upstream): State<Upstream>) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    sse(vec![
        delta("partial"),
        Event::default()
            .event("error")
            .data(r#"{"message":"overloaded"}"#),
    ])
}

async fn truncated(State(upstream): State<Upstream>) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    sse(vec![delta("partial")])
}

async fn rejected(State(upstream): State<Upstream>) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::BAD_REQUEST.into_response()
}

async fn spawn_upstream() -> (String, Upstream) {
    let upstream = Upstream::default();
    let app = Router::new()
        .route("/complete", post(complete))
        .route("/failing", post(failing))
        .route("/truncated", post(truncated))
        .route("/rejected", post(rejected))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), upstream)
}

fn source(base: &str, path: &str) -> HttpGenerationSource {
    HttpGenerationSource::new(
        format!("{}{}", base, path),
        Some(UPSTREAM_TOKEN.to_string()),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn request(query: &str) -> GenerationRequest {
    GenerationRequest {
        session_id: "session-1".to_string(),
        instance_hash: "inst-a".to_string(),
        query: query.to_string(),
    }
}

#[tokio::test]
async fn test_upstream_deltas_then_done_complete_the_generation() {
    let (base, upstream) = spawn_upstream().await;
    let stream = source(&base, "/complete")
        .start(request("plants use light"))
        .await
        .unwrap();
    let events: Vec<GenerationEvent> = stream.collect().await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Delta(TextDelta::new("plants use light")),
            GenerationEvent::Delta(TextDelta::new(" [0]").with_citations(["0"])),
            GenerationEvent::Complete,
        ]
    );
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_error_event_fails_the_generation() {
    let (base, _) = spawn_upstream().await;
    let events: Vec<GenerationEvent> = source(&base, "/failing")
        .start(request("q"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Delta(TextDelta::new("partial")),
            GenerationEvent::Failed("overloaded".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_upstream_ending_without_done_fails_without_reconnecting() {
    let (base, upstream) = spawn_upstream().await;
    let events: Vec<GenerationEvent> = source(&base, "/truncated")
        .start(request("q"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], GenerationEvent::Delta(TextDelta::new("partial")));
    assert!(matches!(&events[1], GenerationEvent::Failed(msg) if msg.contains("done")));

    // give a reconnect attempt time to show up
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upstream_refusal_is_rejected_at_start() {
    let (base, upstream) = spawn_upstream().await;

    let refused = source(&base, "/rejected").start(request("q")).await;
    assert!(matches!(refused, Err(GenerationError::Rejected(_))));

    let unauthorized = HttpGenerationSource::new(
        format!("{}/complete", base),
        None,
        Duration::from_secs(2),
    )
    .unwrap()
    .start(request("q"))
    .await;
    assert!(matches!(unauthorized, Err(GenerationError::Rejected(_))));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
}
