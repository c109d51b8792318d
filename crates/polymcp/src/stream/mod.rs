//! Per-session outbound delivery with monotonic cursors and resumable replay.
//!
//! The [`StreamManager`] owns everything the server pushes to a client outside
//! a POST response body: notifications, server-initiated requests, progress
//! and log messages. Messages are buffered per session, each stamped with a
//! strictly increasing cursor that the transport exposes as the SSE event id,
//! so a reconnecting client can resume with everything after the last cursor
//! it observed.
//!
//! # Implementations
//!
//! * [`memory::InMemoryStreamManager`] — bounded in-process ring buffer
//!   (default).
//! * [`redis::RedisStreamManager`] — shared append-only log plus a wake-up
//!   channel per session, letting a message published on one node reach a
//!   client whose stream is held by another (`distributed` feature).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::StreamError;
use crate::model::JsonRpcMessage;
use crate::session::SessionId;

pub mod memory;
#[cfg(feature = "distributed")]
#[cfg_attr(docsrs, doc(cfg(feature = "distributed")))]
pub mod redis;

/// One buffered outbound message together with its cursor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamEvent {
    pub cursor: u64,
    pub message: JsonRpcMessage,
}

/// Outcome of a publish: the assigned cursor, and whether the bounded buffer
/// had to drop an entry no consumer had seen. An overflow obliges the caller
/// to tear the session down after emitting a `streamOverflow` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub cursor: u64,
    pub overflowed: bool,
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Contract for per-session outbound buffering and fan-out.
///
/// Cursors are monotonic per session; messages from one producer are
/// delivered in publish order; cross-session ordering is undefined.
#[async_trait]
pub trait StreamManager: Send + Sync + 'static {
    /// Create the buffer for a new session. Idempotent.
    async fn open(&self, session_id: &SessionId) -> Result<(), StreamError>;

    /// Append a message to the session's buffer and wake any subscriber.
    async fn publish(
        &self,
        session_id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<PublishReceipt, StreamError>;

    /// A lazy, cancellable sequence of events with cursor strictly greater
    /// than `from_cursor`, replaying what is buffered and then tailing live.
    ///
    /// `from_cursor = 0` means "from the start of what is still buffered".
    /// A non-zero cursor older than the earliest retained entry fails with
    /// [`StreamError::ReplayUnavailable`].
    async fn subscribe(
        &self,
        session_id: &SessionId,
        from_cursor: u64,
    ) -> Result<EventStream, StreamError>;

    /// Drop buffered entries with cursor `<= upto_cursor` (client ack).
    async fn trim(&self, session_id: &SessionId, upto_cursor: u64) -> Result<(), StreamError>;

    /// Tear down the session's buffer and end any live subscription.
    async fn close(&self, session_id: &SessionId) -> Result<(), StreamError>;
}
