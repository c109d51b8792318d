//! Sessions: the stateful association between one client and the server.
//!
//! A session is created by the transport on a successful `initialize`, keyed
//! by an opaque server-assigned id the client echoes in the `Mcp-Session-Id`
//! header. The [`SessionRecord`] is the serializable part (what a
//! [`store::SessionStore`] persists); the [`SessionHandle`] adds the
//! node-local runtime state: the inbound dispatch lock, the arena of pending
//! server-initiated requests, and cancellation tokens for in-flight handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorData;
use crate::model::{
    ClientCapabilities, Implementation, JsonObject, LoggingLevel, RequestId, ServerCapabilities,
};

pub mod broker;
#[cfg(feature = "distributed")]
#[cfg_attr(docsrs, doc(cfg(feature = "distributed")))]
pub mod redis;
pub mod store;

pub use broker::SessionBroker;
pub use store::{InMemorySessionStore, SessionStore};

/// Opaque session identifier, assigned on `initialize`.
pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Lifecycle states of a session.
///
/// `Uninitialized` accepts only `initialize`; `Initializing` has returned the
/// initialize response and waits for the `initialized` notification; `Ready`
/// exposes the full method surface; `Terminated` rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Terminated,
}

/// The persistable attributes of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_capabilities: Option<ClientCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_capabilities: Option<ServerCapabilities>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Data attached by middleware, readable from handler contexts.
    #[serde(default)]
    pub user_context: JsonObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LoggingLevel>,
}

impl SessionRecord {
    pub fn new(id: &SessionId) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            state: SessionState::Uninitialized,
            protocol_version: None,
            client_info: None,
            client_capabilities: None,
            server_capabilities: None,
            created_at: now,
            last_activity_at: now,
            user_context: JsonObject::new(),
            log_level: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ErrorData> {
        serde_json::to_vec(self)
            .map_err(|e| ErrorData::internal_error(format!("failed to encode session: {e}"), None))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ErrorData> {
        serde_json::from_slice(bytes)
            .map_err(|e| ErrorData::internal_error(format!("failed to decode session: {e}"), None))
    }
}

type PendingSender = oneshot::Sender<Result<Value, ErrorData>>;

/// Node-local runtime state of a live session.
pub struct SessionHandle {
    id: SessionId,
    record: RwLock<SessionRecord>,
    /// Serializes inbound message intake for this session.
    pub(crate) dispatch_lock: Mutex<()>,
    /// Completion handles for server-initiated requests, indexed by id.
    /// Each entry is removed exactly once: by the client's response, by the
    /// per-call timeout, or by cancellation.
    pending: std::sync::Mutex<HashMap<RequestId, PendingSender>>,
    /// Cancellation tokens of in-flight inbound requests.
    inflight: std::sync::Mutex<HashMap<RequestId, CancellationToken>>,
    next_outbound_id: AtomicI64,
    last_activity: std::sync::Mutex<Instant>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: SessionId) -> Arc<Self> {
        let record = SessionRecord::new(&id);
        Arc::new(Self {
            id,
            record: RwLock::new(record),
            dispatch_lock: Mutex::new(()),
            pending: std::sync::Mutex::new(HashMap::new()),
            inflight: std::sync::Mutex::new(HashMap::new()),
            next_outbound_id: AtomicI64::new(1),
            last_activity: std::sync::Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_record(record: SessionRecord) -> Arc<Self> {
        let id: SessionId = record.id.as_str().into();
        Arc::new(Self {
            id,
            record: RwLock::new(record),
            dispatch_lock: Mutex::new(()),
            pending: std::sync::Mutex::new(HashMap::new()),
            inflight: std::sync::Mutex::new(HashMap::new()),
            next_outbound_id: AtomicI64::new(1),
            last_activity: std::sync::Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn record(&self) -> SessionRecord {
        self.record.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.record.read().await.state
    }

    pub async fn update_record<R>(&self, update: impl FnOnce(&mut SessionRecord) -> R) -> R {
        let mut record = self.record.write().await;
        let result = update(&mut record);
        record.last_activity_at = Utc::now();
        result
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }

    /// Session-level cancellation, fired when the session terminates.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn next_outbound_id(&self) -> RequestId {
        RequestId::Number(self.next_outbound_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Park a completion handle for a server-initiated request.
    pub fn register_pending(&self, id: RequestId) -> oneshot::Receiver<Result<Value, ErrorData>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Resolve a pending entry with the client's response or error.
    /// Returns false when no entry was waiting (late or unknown id).
    pub fn resolve_pending(&self, id: &RequestId, outcome: Result<Value, ErrorData>) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without resolving it (timeout or cancellation).
    pub fn remove_pending(&self, id: &RequestId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn fail_all_pending(&self, error: ErrorData) {
        let senders: Vec<PendingSender> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for sender in senders {
            let _ = sender.send(Err(error.clone()));
        }
    }

    /// Register an in-flight inbound request and get its cancellation token.
    pub fn register_inflight(&self, id: RequestId) -> CancellationToken {
        let token = self.cancel.child_token();
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, token.clone());
        token
    }

    pub fn finish_inflight(&self, id: &RequestId) {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    /// Raise the cancellation signal of an in-flight request, if any.
    pub fn cancel_inflight(&self, id: &RequestId) -> bool {
        let token = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Terminate runtime state: cancel handlers, fail pending round-trips.
    pub fn shutdown(&self, error: ErrorData) {
        self.cancel.cancel();
        self.fail_all_pending(error);
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_roundtrips_through_bytes() {
        let id = session_id();
        let mut record = SessionRecord::new(&id);
        record.state = SessionState::Ready;
        record.protocol_version = Some("2025-11-25".to_string());
        record
            .user_context
            .insert("principal".to_string(), serde_json::json!("alice"));
        let bytes = record.to_bytes().unwrap();
        let decoded = SessionRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.state, SessionState::Ready);
        assert_eq!(decoded.user_context["principal"], "alice");
    }

    #[tokio::test]
    async fn pending_entry_removed_exactly_once() {
        let handle = SessionHandle::new(session_id());
        let id = handle.next_outbound_id();
        let rx = handle.register_pending(id.clone());
        assert!(handle.resolve_pending(&id, Ok(serde_json::json!({}))));
        // Second resolution finds nothing.
        assert!(!handle.resolve_pending(&id, Ok(serde_json::json!({}))));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_inflight_raises_token() {
        let handle = SessionHandle::new(session_id());
        let token = handle.register_inflight(RequestId::Number(7));
        assert!(!token.is_cancelled());
        assert!(handle.cancel_inflight(&RequestId::Number(7)));
        assert!(token.is_cancelled());
        assert!(!handle.cancel_inflight(&RequestId::Number(8)));
    }

    #[tokio::test]
    async fn shutdown_fails_pending() {
        let handle = SessionHandle::new(session_id());
        let id = handle.next_outbound_id();
        let rx = handle.register_pending(id);
        handle.shutdown(ErrorData::request_timeout("session terminated"));
        let outcome = rx.await.unwrap();
        assert!(outcome.is_err());
    }
}
