//! Pluggable persistence of session metadata.
//!
//! Values are opaque byte strings and are preserved verbatim; the broker
//! owns the encoding. The store must guarantee read-your-writes for a single
//! session key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SessionId;
use crate::error::StoreError;

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store the value, replacing any previous one. A `ttl` of `None` keeps
    /// the entry until deleted.
    async fn put(
        &self,
        session_id: &SessionId,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Process-local session store (default).
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: RwLock<HashMap<SessionId, Entry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let entries = self.entries.read().await;
            match entries.get(session_id) {
                Some(entry) if !entry.expires_at.is_some_and(|at| at <= Instant::now()) => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it lazily.
        self.entries.write().await.remove(session_id);
        Ok(None)
    }

    async fn put(
        &self,
        session_id: &SessionId,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(session_id.clone(), entry);
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }
}
