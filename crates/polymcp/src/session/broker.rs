//! The broker maps session ids to live handles and owns the lifecycle:
//! creation on `initialize`, resolution (with rehydration from the shared
//! store when another node created the session), explicit termination, and
//! the background idle eviction sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionHandle, SessionId, SessionRecord, SessionState, SessionStore, session_id};
use crate::error::ErrorData;
use crate::stream::StreamManager;

pub struct SessionBroker {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    store: Arc<dyn SessionStore>,
    streams: Arc<dyn StreamManager>,
    idle_timeout: Duration,
    store_ttl: Duration,
}

impl SessionBroker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        streams: Arc<dyn StreamManager>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            streams,
            // Let the store expire sessions the evictor missed, with slack
            // so a live node always wins the race.
            store_ttl: idle_timeout.saturating_mul(2),
            idle_timeout,
        }
    }

    /// Create a fresh session in `Uninitialized` state.
    pub async fn create_session(&self) -> Result<Arc<SessionHandle>, ErrorData> {
        let id = session_id();
        let handle = SessionHandle::new(id.clone());
        self.streams
            .open(&id)
            .await
            .map_err(|e| ErrorData::internal_error(format!("failed to open stream: {e}"), None))?;
        self.sessions.write().await.insert(id.clone(), handle.clone());
        self.persist(&handle).await?;
        info!(session_id = %id, "session created");
        Ok(handle)
    }

    /// Look up a live session, rehydrating from the store when another node
    /// created it. Terminated sessions resolve to `None`.
    pub async fn resolve(&self, id: &SessionId) -> Result<Option<Arc<SessionHandle>>, ErrorData> {
        if let Some(handle) = self.sessions.read().await.get(id).cloned() {
            if handle.state().await == SessionState::Terminated {
                return Ok(None);
            }
            return Ok(Some(handle));
        }
        let bytes = self
            .store
            .get(id)
            .await
            .map_err(|e| ErrorData::internal_error(format!("session store error: {e}"), None))?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let record = SessionRecord::from_bytes(&bytes)?;
        if record.state == SessionState::Terminated {
            return Ok(None);
        }
        debug!(session_id = %id, "rehydrating session from store");
        let handle = SessionHandle::from_record(record);
        self.streams.open(id).await.map_err(|e| {
            ErrorData::internal_error(format!("failed to open stream: {e}"), None)
        })?;
        let mut sessions = self.sessions.write().await;
        // Another task may have rehydrated concurrently; first one wins.
        let handle = sessions.entry(id.clone()).or_insert(handle).clone();
        Ok(Some(handle))
    }

    /// Write the session record through to the store.
    pub async fn persist(&self, handle: &SessionHandle) -> Result<(), ErrorData> {
        let bytes = handle.record().await.to_bytes()?;
        self.store
            .put(handle.id(), bytes, Some(self.store_ttl))
            .await
            .map_err(|e| ErrorData::internal_error(format!("session store error: {e}"), None))
    }

    /// Transition the session to `Terminated` and release its resources.
    /// Idempotent: terminating an unknown or already-terminated session is a
    /// no-op.
    pub async fn terminate(&self, id: &SessionId, reason: ErrorData) {
        let handle = self.sessions.write().await.remove(id);
        if let Some(handle) = &handle {
            handle
                .update_record(|record| record.state = SessionState::Terminated)
                .await;
            handle.shutdown(reason);
        }
        if let Err(e) = self.streams.close(id).await {
            warn!(session_id = %id, error = %e, "failed to close stream");
        }
        if let Err(e) = self.store.delete(id).await {
            warn!(session_id = %id, error = %e, "failed to delete session from store");
        }
        if handle.is_some() {
            info!(session_id = %id, "session terminated");
        }
    }

    /// Snapshot of all live handles on this node.
    pub async fn active_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Terminate every session idle longer than the configured timeout.
    pub async fn evict_idle(&self) -> usize {
        let idle: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| handle.idle_for() > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let evicted = idle.len();
        for id in idle {
            debug!(session_id = %id, "evicting idle session");
            self.terminate(&id, ErrorData::request_timeout("session idle timeout")).await;
        }
        evicted
    }

    /// Run the eviction sweep until the token is cancelled.
    pub fn spawn_evictor(
        self: Arc<Self>,
        interval: Duration,
        ct: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let broker = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = broker.evict_idle().await;
                        if evicted > 0 {
                            debug!(evicted, "idle sessions evicted");
                        }
                    }
                    _ = ct.cancelled() => break,
                }
            }
        })
    }
}
