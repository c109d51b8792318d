//! Protocol error values and the error taxonomy of the server core.
//!
//! Everything a peer can observe is an [`ErrorData`] with a JSON-RPC error
//! code; infrastructure failures (store, stream log) carry their own
//! `thiserror` enums and are converted at the boundary where they become
//! peer-visible.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard and server-reserved JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

pub mod codes {
    use super::ErrorCode;

    pub const PARSE_ERROR: ErrorCode = ErrorCode(-32700);
    pub const INVALID_REQUEST: ErrorCode = ErrorCode(-32600);
    pub const METHOD_NOT_FOUND: ErrorCode = ErrorCode(-32601);
    pub const INVALID_PARAMS: ErrorCode = ErrorCode(-32602);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(-32603);

    pub const REQUEST_TIMEOUT: ErrorCode = ErrorCode(-32001);
    pub const SERVER_NOT_INITIALIZED: ErrorCode = ErrorCode(-32002);
    pub const CAPABILITY_UNAVAILABLE: ErrorCode = ErrorCode(-32004);
    pub const RATE_LIMITED: ErrorCode = ErrorCode(-32005);
    pub const AUTH_REJECTED: ErrorCode = ErrorCode(-32006);
    pub const STREAM_OVERFLOW: ErrorCode = ErrorCode(-32007);
    pub const CONTEXT_CLOSED: ErrorCode = ErrorCode(-32008);

    pub const REQUEST_CANCELLED: ErrorCode = ErrorCode(-32800);
}

/// The `error` member of a JSON-RPC error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(codes::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(codes::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(codes::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message, data)
    }

    pub fn server_not_initialized() -> Self {
        Self::new(
            codes::SERVER_NOT_INITIALIZED,
            "server not initialized: send initialize first",
            None,
        )
    }

    pub fn capability_unavailable(feature: &str) -> Self {
        Self::new(
            codes::CAPABILITY_UNAVAILABLE,
            format!("client does not support {feature}"),
            None,
        )
    }

    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(codes::REQUEST_TIMEOUT, message, None)
    }

    pub fn request_cancelled(reason: Option<String>) -> Self {
        Self::new(
            codes::REQUEST_CANCELLED,
            "request cancelled",
            reason.map(|r| serde_json::json!({ "reason": r })),
        )
    }

    pub fn context_closed() -> Self {
        Self::new(
            codes::CONTEXT_CLOSED,
            "context used after its handler returned",
            None,
        )
    }
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Failures of a session store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures of a stream manager backend.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no stream buffer for session {0}")]
    SessionUnknown(String),
    #[error("replay from cursor {requested} unavailable, earliest retained is {earliest}")]
    ReplayUnavailable { requested: u64, earliest: u64 },
    #[error("stream backend error: {0}")]
    Backend(String),
}
