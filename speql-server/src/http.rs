//! HTTP/SSE edge (C11, §6).
//!
//! The main port serves one endpoint: `POST /` takes `{"content": "..."}`
//! and streams the pipeline's [`Frame`]s back as `data: <json>\n\n` SSE
//! events. The control port (`main port + 1`) bypasses Debug entirely for
//! A/B baselining — it runs `explain` then `preview` directly against the
//! cursor-stripped raw SQL. Both ports also serve `/healthz` and `/metrics`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Deserialize;

use crate::orchestrator::{self, Core, Frame};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("speql_requests_total", "Total requests handled").unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("speql_frames_total", "Frames emitted, by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

#[derive(Debug, Deserialize)]
struct RequestBody {
    content: String,
}

/// Build the main-port router: the SSE pipeline endpoint plus health/metrics.
pub fn main_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/", post(handle_pipeline))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(core)
}

/// Build the control-port router (`port + 1`): a single baseline endpoint
/// that skips Debug, plus the same health/metrics pair.
pub fn control_router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/", post(handle_control))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(core)
}

async fn handle_pipeline(
    State(core): State<Arc<Core>>,
    Json(body): Json<RequestBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    REQUESTS_TOTAL.inc();

    let session_key = format!("{:x}", speql::hash::key_hash(&body.content));

    let frames = orchestrator::handle_request(core, body.content, session_key).await;
    for frame in &frames {
        FRAMES_TOTAL.with_label_values(&[frame_kind(frame)]).inc();
    }

    let events = frames
        .into_iter()
        .map(|f| Ok(Event::default().data(serde_json::to_string(&f).unwrap_or_default())));
    Sse::new(stream::iter(events)).keep_alive(KeepAlive::default())
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Modification { .. } => "modification",
        Frame::ErrorInfo { .. } => "error_info",
        Frame::Terminal { .. } => "terminal",
    }
}

#[derive(serde::Serialize)]
struct ControlResponse {
    preview: String,
}

async fn handle_control(
    State(core): State<Arc<Core>>,
    Json(body): Json<RequestBody>,
) -> axum::response::Response {
    let cursor_id = core.config.cursor_identifier.clone();
    let raw_sql = body.content.replace(&cursor_id, "");

    if let Err(e) = core.warehouse.explain(&raw_sql).await {
        return (axum::http::StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
    }

    match orchestrator::preview(&core, &raw_sql).await {
        Ok(preview) => Json(ControlResponse { preview }).into_response(),
        Err(e) => (axum::http::StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8(buf).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_labels_match_variants() {
        assert_eq!(
            frame_kind(&Frame::ErrorInfo {
                error_info: "x".into()
            }),
            "error_info"
        );
    }

    #[test]
    fn session_key_hash_is_stable_for_identical_input() {
        assert_eq!(
            speql::hash::key_hash("SELECT 1"),
            speql::hash::key_hash("SELECT 1")
        );
    }
}
