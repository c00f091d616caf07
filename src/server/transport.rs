//! Streamable HTTP transport for MCP.
//!
//! `POST /mcp` carries JSON-RPC requests (single or batched) and answers
//! with a plain JSON body, or with an SSE stream when the client asks for
//! `text/event-stream`. `GET /mcp` is the long-poll notification stream for
//! a session; `DELETE /mcp` closes the session. The session id travels in
//! the `Mcp-Session-Id` header (header names are case-insensitive on input;
//! the canonical spelling is used in documentation and the constant below).

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::protocol::methods;
use crate::mcp::{McpError, McpResponse, SessionHandle, SessionRegistry, SessionState};

use super::state::ServerState;

/// Canonical session header name. Lowercase variants are accepted on input
/// (HTTP header lookup is case-insensitive).
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

static SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

const CONTENT_TYPE_SSE: &str = "text/event-stream";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(CONTENT_TYPE_SSE))
        .unwrap_or(false)
}

fn with_session_header(mut response: Response, session_id: Option<&str>) -> Response {
    if let Some(id) = session_id {
        if let Ok(value) = HeaderValue::from_str(id) {
            response.headers_mut().insert(&SESSION_HEADER, value);
        }
    }
    response
}

fn rpc_error(status: StatusCode, error: McpError, session_id: Option<&str>) -> Response {
    let body = McpResponse::error(None, error);
    with_session_header((status, Json(body)).into_response(), session_id)
}

/// `POST /mcp`: process a JSON-RPC request or batch for a session.
pub async fn post_mcp(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                McpError::ParseError(e.to_string()),
                None,
            );
        }
    };

    let (messages, is_batch) = match payload {
        Value::Array(items) => (items, true),
        other => (vec![other], false),
    };
    if messages.is_empty() {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            McpError::InvalidRequest("empty batch".to_string()),
            None,
        );
    }

    // Resolve the session, or create one for an initial `initialize`.
    let starts_with_initialize = messages
        .first()
        .and_then(|m| m.get("method"))
        .and_then(|m| m.as_str())
        == Some(methods::INITIALIZE);

    let (slot, created) = match session_id_from_headers(&headers) {
        Some(id) => match state.sessions.resolve_for_request(&id) {
            Some(slot) => (slot, false),
            None => {
                return rpc_error(StatusCode::NOT_FOUND, McpError::SessionNotFound, None);
            }
        },
        None if starts_with_initialize => (state.sessions.create(), true),
        None => {
            return rpc_error(StatusCode::NOT_FOUND, McpError::SessionNotFound, None);
        }
    };
    let session_id = slot.state.lock().unwrap().id.clone();

    // Dropping the guard on client disconnect cancels in-flight dispatch.
    let cancel = CancellationToken::new();
    let _drop_guard = cancel.clone().drop_guard();

    // Requests within one body are processed in arrival order.
    let mut responses = Vec::with_capacity(messages.len());
    for message in messages {
        if let Some(response) = state.engine.handle_message(message, &slot, &cancel).await {
            responses.push(response);
        }
    }

    // A rejected initialize leaves no session behind.
    let mismatch_code = McpError::ProtocolMismatch {
        requested: String::new(),
    }
    .code();
    let mut session_header: Option<&str> = Some(&session_id);
    if created
        && responses
            .iter()
            .any(|r| matches!(&r.error, Some(e) if e.code == mismatch_code))
    {
        state.sessions.close(&session_id);
        session_header = None;
    }

    // All-notification bodies are acknowledged without content.
    if responses.is_empty() {
        return with_session_header(StatusCode::ACCEPTED.into_response(), session_header);
    }

    if wants_sse(&headers) {
        let mut events: Vec<Result<Event, Infallible>> = responses
            .iter()
            .map(|r| {
                Ok(Event::default()
                    .event("message")
                    .data(serde_json::to_string(r).expect("response serializes")))
            })
            .collect();
        events.push(Ok(Event::default().event("done").data("[DONE]")));

        let sse = Sse::new(stream::iter(events));
        return with_session_header(sse.into_response(), session_header);
    }

    let body = if is_batch {
        serde_json::to_value(&responses).expect("responses serialize")
    } else {
        serde_json::to_value(&responses[0]).expect("response serializes")
    };
    with_session_header(Json(body).into_response(), session_header)
}

/// `GET /mcp`: long-poll SSE stream for server-initiated notifications.
/// Reconnecting with the same session header resumes the session and
/// delivers buffered notifications (at-most-once within the ring).
pub async fn get_mcp(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if !wants_sse(&headers) {
        return rpc_error(
            StatusCode::METHOD_NOT_ALLOWED,
            McpError::InvalidRequest("GET requires Accept: text/event-stream".to_string()),
            None,
        );
    }
    let Some(session_id) = session_id_from_headers(&headers) else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            McpError::InvalidRequest(format!("missing {} header", MCP_SESSION_HEADER)),
            None,
        );
    };
    let Some(slot) = state.sessions.resolve_for_stream(&session_id) else {
        return rpc_error(StatusCode::NOT_FOUND, McpError::SessionNotFound, None);
    };

    let stream = notification_stream(slot, Arc::clone(&state.sessions), session_id.clone());
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text(" ping"),
    );
    with_session_header(sse.into_response(), Some(&session_id))
}

/// `DELETE /mcp`: explicit session close; idempotent.
pub async fn delete_mcp(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if let Some(session_id) = session_id_from_headers(&headers) {
        state.sessions.close(&session_id);
        debug!("session {} closed by client", session_id);
    }
    StatusCode::NO_CONTENT.into_response()
}

struct StreamCtx {
    slot: SessionHandle,
    registry: Arc<SessionRegistry>,
    buffer: VecDeque<Event>,
}

/// Stream of buffered and live notifications for a session. Each SSE event
/// carries exactly one complete JSON-RPC message. The stream ends when the
/// session closes.
fn notification_stream(
    slot: SessionHandle,
    registry: Arc<SessionRegistry>,
    session_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut buffer = VecDeque::new();
    buffer.push_back(
        Event::default()
            .event("connected")
            .data(json!({ "sessionId": session_id }).to_string()),
    );
    for message in registry.take_pending(&slot) {
        buffer.push_back(message_event(&message));
    }

    let ctx = StreamCtx {
        slot,
        registry,
        buffer,
    };

    stream::unfold(ctx, |mut ctx| async move {
        loop {
            if let Some(event) = ctx.buffer.pop_front() {
                return Some((Ok::<_, Infallible>(event), ctx));
            }
            if ctx.slot.state.lock().unwrap().state == SessionState::Closed {
                return None;
            }

            // Register interest before draining so a notification landing
            // in between cannot be missed.
            let mut notified = pin!(ctx.slot.notify.notified());
            notified.as_mut().enable();

            let pending = ctx.registry.take_pending(&ctx.slot);
            if pending.is_empty() {
                notified.await;
            } else {
                for message in pending {
                    ctx.buffer.push_back(message_event(&message));
                }
            }
        }
    })
}

fn message_event(message: &Value) -> Event {
    Event::default().event("message").data(message.to_string())
}
