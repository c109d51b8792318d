//! In-process stream manager: one bounded ring buffer per session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use super::{EventStream, PublishReceipt, StreamEvent, StreamManager};
use crate::error::StreamError;
use crate::model::JsonRpcMessage;
use crate::session::SessionId;

struct Buffer {
    events: VecDeque<StreamEvent>,
    /// Next cursor to assign; cursors start at 1.
    next_cursor: u64,
    /// Highest cursor ever removed from the buffer; replay below this fails.
    trimmed_to: u64,
    /// Highest cursor the client acknowledged via `trim`.
    acked: u64,
}

struct SessionBuffer {
    state: std::sync::Mutex<Buffer>,
    /// Latest published cursor; subscribers wait on changes.
    publish_tx: watch::Sender<u64>,
    /// Highest cursor handed to any live subscriber.
    delivered: AtomicU64,
    closed: AtomicBool,
}

/// Bounded in-memory stream buffers, one per session.
///
/// `retention` bounds what is kept for replay; `high_water` bounds the
/// backlog a slow consumer may accumulate before the oldest unseen entry is
/// dropped and the publish is reported as an overflow.
pub struct InMemoryStreamManager {
    retention: usize,
    high_water: usize,
    buffers: RwLock<HashMap<SessionId, Arc<SessionBuffer>>>,
}

impl InMemoryStreamManager {
    pub fn new(retention: usize, high_water: usize) -> Self {
        Self {
            retention,
            high_water,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    async fn buffer(&self, session_id: &SessionId) -> Result<Arc<SessionBuffer>, StreamError> {
        self.buffers
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StreamError::SessionUnknown(session_id.to_string()))
    }
}

impl Default for InMemoryStreamManager {
    fn default() -> Self {
        Self::new(1000, 1024)
    }
}

#[async_trait]
impl StreamManager for InMemoryStreamManager {
    async fn open(&self, session_id: &SessionId) -> Result<(), StreamError> {
        let mut buffers = self.buffers.write().await;
        buffers.entry(session_id.clone()).or_insert_with(|| {
            Arc::new(SessionBuffer {
                state: std::sync::Mutex::new(Buffer {
                    events: VecDeque::new(),
                    next_cursor: 1,
                    trimmed_to: 0,
                    acked: 0,
                }),
                publish_tx: watch::channel(0).0,
                delivered: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            })
        });
        Ok(())
    }

    async fn publish(
        &self,
        session_id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<PublishReceipt, StreamError> {
        let buffer = self.buffer(session_id).await?;
        let (cursor, overflowed) = {
            let mut state = buffer
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let cursor = state.next_cursor;
            state.next_cursor += 1;
            state.events.push_back(StreamEvent { cursor, message });

            let mut overflowed = false;
            let seen = state.acked.max(buffer.delivered.load(Ordering::Acquire));
            if cursor.saturating_sub(seen) > self.high_water as u64 {
                if let Some(front) = state.events.pop_front() {
                    state.trimmed_to = front.cursor;
                    overflowed = front.cursor > seen;
                }
            }
            while state.events.len() > self.retention {
                if let Some(front) = state.events.pop_front() {
                    state.trimmed_to = front.cursor;
                }
            }
            (cursor, overflowed)
        };
        buffer.publish_tx.send_replace(cursor);
        Ok(PublishReceipt { cursor, overflowed })
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        from_cursor: u64,
    ) -> Result<EventStream, StreamError> {
        let buffer = self.buffer(session_id).await?;
        {
            let state = buffer
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if from_cursor != 0 && from_cursor < state.trimmed_to {
                return Err(StreamError::ReplayUnavailable {
                    requested: from_cursor,
                    earliest: state.trimmed_to + 1,
                });
            }
        }
        // Subscribe before the first drain so publishes between the drain and
        // the wait still bump the watch version.
        let mut rx = buffer.publish_tx.subscribe();
        let mut cursor = from_cursor;
        let stream = async_stream::stream! {
            loop {
                let batch: Vec<StreamEvent> = {
                    let state = buffer
                        .state
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    state
                        .events
                        .iter()
                        .filter(|event| event.cursor > cursor)
                        .cloned()
                        .collect()
                };
                for event in batch {
                    cursor = event.cursor;
                    buffer.delivered.fetch_max(cursor, Ordering::Release);
                    yield event;
                }
                if buffer.closed.load(Ordering::Acquire) {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn trim(&self, session_id: &SessionId, upto_cursor: u64) -> Result<(), StreamError> {
        let buffer = self.buffer(session_id).await?;
        let mut state = buffer
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.acked = state.acked.max(upto_cursor);
        while state
            .events
            .front()
            .is_some_and(|event| event.cursor <= upto_cursor)
        {
            if let Some(front) = state.events.pop_front() {
                state.trimmed_to = front.cursor;
            }
        }
        Ok(())
    }

    async fn close(&self, session_id: &SessionId) -> Result<(), StreamError> {
        let buffer = self.buffers.write().await.remove(session_id);
        if let Some(buffer) = buffer {
            buffer.closed.store(true, Ordering::Release);
            // Wake subscribers so they observe the close.
            let current = *buffer.publish_tx.borrow();
            buffer.publish_tx.send_replace(current);
        }
        Ok(())
    }
}
