//! Transport layer: one streamable HTTP mount carrying bidirectional
//! JSON-RPC for every session.

pub mod streamable_http;

pub use streamable_http::router;

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";
pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
