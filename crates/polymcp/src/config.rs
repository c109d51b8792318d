//! Server configuration: the recognized options, nothing ambient.

use std::time::Duration;

use crate::model::{Implementation, SUPPORTED_PROTOCOL_VERSIONS};

/// Configuration for the protocol server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name and version reported as `serverInfo` on `initialize`.
    pub server_info: Implementation,
    /// Optional free-form guidance returned to clients on `initialize`.
    pub instructions: Option<String>,
    /// Mount path of the streamable HTTP endpoint.
    pub mount_path: String,
    /// Protocol revisions the server accepts, newest first.
    pub protocol_versions: Vec<String>,
    /// Idle time after which a session is evicted.
    pub idle_timeout: Duration,
    /// Period of the background eviction sweep.
    pub eviction_interval: Duration,
    /// Interval between SSE comment heartbeats.
    pub heartbeat_interval: Duration,
    /// Timeout for server-initiated (sampling/elicitation/roots) calls.
    pub outbound_request_timeout: Duration,
    /// Messages retained per session for stream replay.
    pub stream_retention: usize,
    /// Buffered messages above which the oldest un-acked entry is dropped
    /// and the session is torn down with a `streamOverflow` error.
    pub stream_high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new("polymcp", env!("CARGO_PKG_VERSION")),
            instructions: None,
            mount_path: "/mcp".to_string(),
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            outbound_request_timeout: Duration::from_secs(60),
            stream_retention: 1000,
            stream_high_water: 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation::new(name, version),
            ..Default::default()
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn outbound_request_timeout(mut self, timeout: Duration) -> Self {
        self.outbound_request_timeout = timeout;
        self
    }

    pub fn stream_retention(mut self, retention: usize) -> Self {
        self.stream_retention = retention;
        self
    }

    pub fn stream_high_water(mut self, high_water: usize) -> Self {
        self.stream_high_water = high_water;
        self
    }

    /// Negotiate a protocol version: the client's requested revision if the
    /// server supports it, otherwise none.
    pub fn negotiate_version(&self, requested: &str) -> Option<&str> {
        self.protocol_versions
            .iter()
            .find(|v| v.as_str() == requested)
            .map(String::as_str)
    }
}
