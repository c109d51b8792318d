//! Redis-backed stream manager for horizontally scaled deployments.
//!
//! Each session gets an append-only log (a sorted set scored by cursor), a
//! cursor counter, and a pub/sub wake channel. `publish` writes the log entry
//! and publishes a wake-up; `subscribe` replays the log from the requested
//! cursor and then tails via pub/sub. A message published on node A therefore
//! reaches a client whose SSE stream is held by node B.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{EventStream, PublishReceipt, StreamEvent, StreamManager};
use crate::error::StreamError;
use crate::model::JsonRpcMessage;
use crate::session::SessionId;

/// Sentinel published on the wake channel when a session closes.
const CLOSE_SENTINEL: &str = "close";

/// Fallback poll interval covering lost pub/sub wake-ups.
const TAIL_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisStreamManager {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
    key_prefix: String,
    retention: usize,
    ttl: Duration,
    max_retries: u32,
}

impl RedisStreamManager {
    /// Connect and verify the instance is responsive.
    pub async fn new(connection_string: &str) -> Result<Self, StreamError> {
        Self::with_config(connection_string, "polymcp", 1000, Duration::from_secs(600)).await
    }

    pub async fn with_config(
        connection_string: &str,
        key_prefix: &str,
        retention: usize,
        ttl: Duration,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(connection_string)
            .map_err(|e| StreamError::Backend(format!("failed to create redis client: {e}")))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StreamError::Backend(format!("failed to connect to redis: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| StreamError::Backend(format!("redis ping failed: {e}")))?;
        debug!("redis stream log connection established");
        Ok(Self {
            client,
            connection,
            key_prefix: key_prefix.to_string(),
            retention,
            ttl,
            max_retries: 3,
        })
    }

    fn log_key(&self, session_id: &SessionId) -> String {
        format!("{}:stream:log:{}", self.key_prefix, session_id)
    }

    fn cursor_key(&self, session_id: &SessionId) -> String {
        format!("{}:stream:cur:{}", self.key_prefix, session_id)
    }

    fn ack_key(&self, session_id: &SessionId) -> String {
        format!("{}:stream:ack:{}", self.key_prefix, session_id)
    }

    fn wake_channel(&self, session_id: &SessionId) -> String {
        format!("{}:stream:wake:{}", self.key_prefix, session_id)
    }

    /// Log members are `<cursor>:<json>` so identical payloads at different
    /// cursors stay distinct set members.
    fn encode_entry(cursor: u64, message: &JsonRpcMessage) -> Result<String, StreamError> {
        let json = serde_json::to_string(message)
            .map_err(|e| StreamError::Backend(format!("failed to encode log entry: {e}")))?;
        Ok(format!("{cursor}:{json}"))
    }

    fn decode_entry(member: &str) -> Option<StreamEvent> {
        let (cursor, json) = member.split_once(':')?;
        let cursor = cursor.parse().ok()?;
        let message = serde_json::from_str(json).ok()?;
        Some(StreamEvent { cursor, message })
    }

    async fn with_retries<T, F, Fut>(&self, mut operation: F) -> Result<T, StreamError>
    where
        F: FnMut(redis::aio::MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation(self.connection.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if attempts >= self.max_retries => {
                    return Err(StreamError::Backend(format!(
                        "redis operation failed after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => {
                    warn!(attempts, error = %e, "redis stream operation failed, retrying");
                    let backoff = 100u64 << (attempts - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn earliest_cursor(&self, session_id: &SessionId) -> Result<Option<u64>, StreamError> {
        let log_key = self.log_key(session_id);
        let members: Vec<String> = self
            .with_retries(|mut conn| {
                let log_key = log_key.clone();
                async move { conn.zrange(log_key, 0, 0).await }
            })
            .await?;
        Ok(members
            .first()
            .and_then(|m| Self::decode_entry(m))
            .map(|e| e.cursor))
    }

    async fn last_cursor(&self, session_id: &SessionId) -> Result<u64, StreamError> {
        let cursor_key = self.cursor_key(session_id);
        let last: Option<u64> = self
            .with_retries(|mut conn| {
                let cursor_key = cursor_key.clone();
                async move { conn.get(cursor_key).await }
            })
            .await?;
        Ok(last.unwrap_or(0))
    }

    async fn read_after(
        &self,
        session_id: &SessionId,
        cursor: u64,
    ) -> Result<Vec<StreamEvent>, StreamError> {
        let log_key = self.log_key(session_id);
        let members: Vec<String> = self
            .with_retries(|mut conn| {
                let log_key = log_key.clone();
                let min = format!("({cursor}");
                async move { conn.zrangebyscore(log_key, min, "+inf").await }
            })
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| Self::decode_entry(m))
            .collect())
    }
}

#[async_trait]
impl StreamManager for RedisStreamManager {
    async fn open(&self, _session_id: &SessionId) -> Result<(), StreamError> {
        // Keys are created on first publish; nothing to allocate up front.
        Ok(())
    }

    async fn publish(
        &self,
        session_id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<PublishReceipt, StreamError> {
        let cursor_key = self.cursor_key(session_id);
        let log_key = self.log_key(session_id);
        let ack_key = self.ack_key(session_id);
        let wake_channel = self.wake_channel(session_id);
        let ttl_secs = self.ttl.as_secs() as i64;
        let last_dropped_rank = -(self.retention as isize) - 1;

        let cursor: u64 = self
            .with_retries(|mut conn| {
                let cursor_key = cursor_key.clone();
                async move { conn.incr(cursor_key, 1u64).await }
            })
            .await?;
        let entry = Self::encode_entry(cursor, &message)?;

        let removed: i64 = self
            .with_retries(|mut conn| {
                let log_key = log_key.clone();
                let entry = entry.clone();
                let cursor_key = cursor_key.clone();
                async move {
                    let _: i64 = conn.zadd(&log_key, entry, cursor).await?;
                    let removed: i64 = conn
                        .zremrangebyrank(&log_key, 0, last_dropped_rank)
                        .await?;
                    let _: bool = conn.expire(&log_key, ttl_secs).await?;
                    let _: bool = conn.expire(&cursor_key, ttl_secs).await?;
                    Ok(removed)
                }
            })
            .await?;

        let mut overflowed = false;
        if removed > 0 {
            let acked: Option<u64> = self
                .with_retries(|mut conn| {
                    let ack_key = ack_key.clone();
                    async move { conn.get(ack_key).await }
                })
                .await?;
            let dropped_upto = cursor.saturating_sub(self.retention as u64);
            overflowed = dropped_upto > acked.unwrap_or(0);
        }

        let _: i64 = self
            .with_retries(|mut conn| {
                let wake_channel = wake_channel.clone();
                let payload = cursor.to_string();
                async move { conn.publish(wake_channel, payload).await }
            })
            .await?;

        Ok(PublishReceipt { cursor, overflowed })
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        from_cursor: u64,
    ) -> Result<EventStream, StreamError> {
        // Validate the replay window before tailing.
        match self.earliest_cursor(session_id).await? {
            Some(earliest) if from_cursor != 0 && from_cursor + 1 < earliest => {
                return Err(StreamError::ReplayUnavailable {
                    requested: from_cursor,
                    earliest,
                });
            }
            None => {
                let last = self.last_cursor(session_id).await?;
                if from_cursor != 0 && from_cursor < last {
                    return Err(StreamError::ReplayUnavailable {
                        requested: from_cursor,
                        earliest: last + 1,
                    });
                }
            }
            _ => {}
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StreamError::Backend(format!("failed to open pubsub: {e}")))?;
        pubsub
            .subscribe(self.wake_channel(session_id))
            .await
            .map_err(|e| StreamError::Backend(format!("failed to subscribe: {e}")))?;
        let mut wake = pubsub.into_on_message();

        let manager = self.clone();
        let session_id = session_id.clone();
        let mut cursor = from_cursor;
        let stream = async_stream::stream! {
            loop {
                match manager.read_after(&session_id, cursor).await {
                    Ok(batch) => {
                        for event in batch {
                            cursor = event.cursor;
                            yield event;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stream log read failed, ending subscription");
                        break;
                    }
                }
                tokio::select! {
                    message = wake.next() => {
                        match message {
                            Some(message) => {
                                let payload: String = message.get_payload().unwrap_or_default();
                                if payload == CLOSE_SENTINEL {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn trim(&self, session_id: &SessionId, upto_cursor: u64) -> Result<(), StreamError> {
        let log_key = self.log_key(session_id);
        let ack_key = self.ack_key(session_id);
        let ttl_secs = self.ttl.as_secs() as i64;
        self.with_retries(|mut conn| {
            let log_key = log_key.clone();
            let ack_key = ack_key.clone();
            async move {
                let _: i64 = conn
                    .zrembyscore(&log_key, "-inf", upto_cursor as f64)
                    .await?;
                let _: () = conn.set(&ack_key, upto_cursor).await?;
                let _: bool = conn.expire(&ack_key, ttl_secs).await?;
                Ok(())
            }
        })
        .await
    }

    async fn close(&self, session_id: &SessionId) -> Result<(), StreamError> {
        let log_key = self.log_key(session_id);
        let cursor_key = self.cursor_key(session_id);
        let ack_key = self.ack_key(session_id);
        let wake_channel = self.wake_channel(session_id);
        self.with_retries(|mut conn| {
            let log_key = log_key.clone();
            let cursor_key = cursor_key.clone();
            let ack_key = ack_key.clone();
            let wake_channel = wake_channel.clone();
            async move {
                let _: i64 = conn.del(vec![log_key, cursor_key, ack_key]).await?;
                let _: i64 = conn.publish(wake_channel, CLOSE_SENTINEL).await?;
                Ok(())
            }
        })
        .await
    }
}
