//! Liveness, readiness and server info endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::mcp::SUPPORTED_PROTOCOL_VERSIONS;

use super::state::ServerState;

pub fn health_routes() -> Router<ServerState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/info", get(info))
}

async fn health(State(state): State<ServerState>) -> Response {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "skills_loaded": state.catalog.active_count(),
        "sessions_active": state.sessions.active_count(),
        "invocation_log": {
            "queued": state.invocation_log.queued(),
            "dropped_events_total": state.invocation_log.dropped_events_total(),
        },
    }))
    .into_response()
}

/// Ready when the metadata store answers and the catalog is non-empty (or
/// an empty catalog is explicitly allowed).
async fn ready(State(state): State<ServerState>) -> Response {
    if let Err(e) = state.catalog.metadata().ping() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "reason": format!("metadata store: {e}")})),
        )
            .into_response();
    }

    let loaded = state.catalog.active_count();
    if loaded == 0 && !state.config.allow_empty_catalog {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "reason": "no skills loaded"})),
        )
            .into_response();
    }

    Json(json!({
        "status": "ready",
        "skills_loaded": loaded,
        "sessions_active": state.sessions.active_count(),
    }))
    .into_response()
}

async fn info(State(state): State<ServerState>) -> Response {
    Json(json!({
        "name": state.config.server_name(),
        "version": state.config.server_version(),
        "protocol_versions": SUPPORTED_PROTOCOL_VERSIONS,
        "storage_backend": state.config.storage_backend.as_str(),
    }))
    .into_response()
}
