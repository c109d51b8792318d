//! The streamable HTTP transport.
//!
//! One mount path, three verbs:
//!
//! * `POST` — client→server messages. Requests return their JSON-RPC
//!   response in the body; notifications and client responses return 202.
//!   `initialize` is the only POST accepted without a session header and
//!   returns the new `Mcp-Session-Id`.
//! * `GET` — the long-lived server→client SSE stream. Each event carries its
//!   stream cursor as the SSE id; `Last-Event-ID` resumes strictly after it.
//!   Heartbeats are comment frames.
//! * `DELETE` — explicit session termination.
//!
//! Stale or missing session headers map to HTTP 404 so clients re-initialize.

use std::convert::Infallible;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::StreamExt;
use serde_json::json;
use tracing::debug;

use super::{EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE};
use crate::error::{ErrorData, StreamError, codes};
use crate::model::{JsonRpcMessage, RequestId, method};
use crate::server::McpServer;
use crate::service::engine::InitializeOutcome;
use crate::session::SessionId;

/// Build the axum router serving the MCP mount path.
pub fn router(server: McpServer) -> Router {
    let path = server.core().config.mount_path.clone();
    Router::new()
        .route(
            &path,
            get(get_handler).post(post_handler).delete(delete_handler),
        )
        .with_state(server)
}

/// HTTP status a peer-visible error maps to. Protocol-level errors ride in a
/// 200 body; middleware denials get their distinctive status codes.
fn error_status(error: &ErrorData) -> StatusCode {
    match error.code {
        codes::AUTH_REJECTED => StatusCode::UNAUTHORIZED,
        codes::RATE_LIMITED => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    }
}

fn rpc_error_response(status: StatusCode, id: Option<RequestId>, error: ErrorData) -> Response {
    let body = match id {
        Some(id) => serde_json::to_value(JsonRpcMessage::error(id, error))
            .unwrap_or_else(|_| json!({})),
        None => json!({ "jsonrpc": "2.0", "id": null, "error": error }),
    };
    (status, Json(body)).into_response()
}

async fn post_handler(
    State(server): State<McpServer>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if !content_type.is_some_and(|value| value.starts_with(JSON_MIME_TYPE)) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                None,
                ErrorData::parse_error(e.to_string(), None),
            );
        }
    };
    let message = match JsonRpcMessage::try_from_value(value) {
        Ok(message) => message,
        Err(e) => return rpc_error_response(StatusCode::BAD_REQUEST, None, e),
    };
    let request_id = match &message {
        JsonRpcMessage::Request(request) => Some(request.id.clone()),
        _ => None,
    };

    let session_id: Option<SessionId> = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(Into::into);

    let Some(session_id) = session_id else {
        // The only message accepted without a session is `initialize`.
        let is_initialize = matches!(
            &message,
            JsonRpcMessage::Request(request) if request.method == method::INITIALIZE
        );
        if !is_initialize {
            return (StatusCode::NOT_FOUND, "missing session: re-initialize").into_response();
        }
        debug!("initialize request, creating session");
        return match server
            .core()
            .clone()
            .initialize_session(message, headers.clone())
            .await
        {
            Ok(InitializeOutcome::Started {
                session_id,
                response,
            }) => {
                let mut http_response = (StatusCode::OK, Json(response)).into_response();
                if let Ok(value) = HeaderValue::from_str(&session_id) {
                    http_response.headers_mut().insert(HEADER_SESSION_ID, value);
                }
                http_response
            }
            Ok(InitializeOutcome::Failed { response }) => {
                (StatusCode::OK, Json(response)).into_response()
            }
            Err(e) => {
                let status = error_status(&e);
                rpc_error_response(status, request_id, e)
            }
        };
    };

    let session = match server.core().broker.resolve(&session_id).await {
        Ok(session) => session,
        Err(e) => return rpc_error_response(StatusCode::INTERNAL_SERVER_ERROR, request_id, e),
    };
    let Some(session) = session else {
        // Shutdown is idempotent: a second shutdown on a gone session is a
        // no-op success.
        if let JsonRpcMessage::Request(request) = &message {
            if request.method == method::SHUTDOWN {
                let frame = JsonRpcMessage::response(request.id.clone(), json!({}));
                return (StatusCode::OK, Json(frame)).into_response();
            }
        }
        return (StatusCode::NOT_FOUND, "session not found: re-initialize").into_response();
    };

    match server
        .core()
        .clone()
        .handle_message(session, message, headers.clone())
        .await
    {
        Ok(Some(frame)) => (StatusCode::OK, Json(frame)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let status = error_status(&e);
            rpc_error_response(status, request_id, e)
        }
    }
}

async fn get_handler(State(server): State<McpServer>, headers: HeaderMap) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    if !accept.is_some_and(|value| value.contains(EVENT_STREAM_MIME_TYPE)) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Accept must include text/event-stream",
        )
            .into_response();
    }

    let session_id: Option<SessionId> = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(Into::into);
    let Some(session_id) = session_id else {
        return (StatusCode::NOT_FOUND, "missing session: re-initialize").into_response();
    };
    let session = match server.core().broker.resolve(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, "session not found: re-initialize").into_response();
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    session.touch();

    let from_cursor = match headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
    {
        None => 0,
        Some(raw) => match raw.parse::<u64>() {
            Ok(cursor) => cursor,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "invalid Last-Event-ID").into_response();
            }
        },
    };

    debug!(session_id = %session_id, from_cursor, "opening event stream");
    let stream = match server.core().streams.subscribe(&session_id, from_cursor).await {
        Ok(stream) => stream,
        Err(StreamError::ReplayUnavailable { .. }) => {
            return (StatusCode::NOT_FOUND, "replay unavailable: re-initialize").into_response();
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    // The supplied cursor acknowledges everything up to it.
    if from_cursor > 0 {
        let _ = server.core().streams.trim(&session_id, from_cursor).await;
    }

    let events = stream.map(|event| {
        let data = serde_json::to_string(&event.message).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().id(event.cursor.to_string()).data(data))
    });
    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(server.core().config.heartbeat_interval)
                .text("ping"),
        )
        .into_response()
}

async fn delete_handler(State(server): State<McpServer>, headers: HeaderMap) -> Response {
    let session_id: Option<SessionId> = headers
        .get(HEADER_SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .map(Into::into);
    let Some(session_id) = session_id else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };
    debug!(session_id = %session_id, "explicit session termination");
    server
        .core()
        .broker
        .terminate(
            &session_id,
            ErrorData::new(codes::REQUEST_CANCELLED, "session deleted", None),
        )
        .await;
    StatusCode::ACCEPTED.into_response()
}
