//! Redis-backed session store for multi-node deployments.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{SessionId, SessionStore};
use crate::error::StoreError;

#[derive(Clone)]
pub struct RedisSessionStore {
    connection: redis::aio::MultiplexedConnection,
    key_prefix: String,
    max_retries: u32,
}

impl RedisSessionStore {
    /// Connect and verify the instance is responsive.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::with_prefix(connection_string, "polymcp").await
    }

    pub async fn with_prefix(connection_string: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(connection_string)
            .map_err(|e| StoreError::Backend(format!("failed to create redis client: {e}")))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect to redis: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| StoreError::Backend(format!("redis ping failed: {e}")))?;
        debug!("redis session store connection established");
        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            max_retries: 3,
        })
    }

    fn key(&self, session_id: &SessionId) -> String {
        format!("{}:session:{}", self.key_prefix, session_id)
    }

    async fn with_retries<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
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
                    return Err(StoreError::Backend(format!(
                        "redis operation failed after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => {
                    warn!(attempts, error = %e, "redis store operation failed, retrying");
                    let backoff = 100u64 << (attempts - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.key(session_id);
        self.with_retries(|mut conn| {
            let key = key.clone();
            async move { conn.get(key).await }
        })
        .await
    }

    async fn put(
        &self,
        session_id: &SessionId,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = self.key(session_id);
        self.with_retries(|mut conn| {
            let key = key.clone();
            let value = value.clone();
            async move {
                match ttl {
                    Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1)).await,
                    None => conn.set(key, value).await,
                }
            }
        })
        .await
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let key = self.key(session_id);
        let _: i64 = self
            .with_retries(|mut conn| {
                let key = key.clone();
                async move { conn.del(key).await }
            })
            .await?;
        Ok(())
    }
}
