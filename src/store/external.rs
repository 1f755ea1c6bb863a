//! External store mirror
//!
//! Publish-side Redis mirror of event envelopes and order records, plus
//! the administrative wipe at startup. The mirror is not authoritative
//! and its traffic is re-publishable, so there is no backoff loop: a
//! failed operation gets exactly one more try on a fresh connection, and
//! a second failure surfaces as `UNAVAILABLE` for the caller to log.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::future::Future;
use tokio::sync::Mutex;

use crate::error::OesError;

pub struct ExternalStore {
    url: String,
    /// Lazily re-established after a failure; `None` until first use.
    connection: Mutex<Option<ConnectionManager>>,
}

impl ExternalStore {
    /// Open and verify the initial connection.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let store = Self {
            url: url.to_string(),
            connection: Mutex::new(None),
        };
        store.reconnect().await?;
        Ok(store)
    }

    async fn reconnect(&self) -> Result<ConnectionManager, RedisError> {
        let manager = ConnectionManager::new(Client::open(self.url.as_str())?).await?;
        *self.connection.lock().await = Some(manager.clone());
        Ok(manager)
    }

    async fn current(&self) -> Result<ConnectionManager, RedisError> {
        let cached = self.connection.lock().await.clone();
        match cached {
            Some(conn) => Ok(conn),
            None => self.reconnect().await,
        }
    }

    /// Run an operation, giving it one second chance on a fresh
    /// connection when the first attempt fails.
    async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, OesError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let conn = self.current().await.map_err(unavailable)?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::debug!("Mirror operation failed, reconnecting: {}", first);
                let conn = self.reconnect().await.map_err(unavailable)?;
                op(conn).await.map_err(unavailable)
            }
        }
    }

    /// Publish a serialized envelope to the topic's channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i32, OesError> {
        self.with_connection(|mut conn| {
            let channel = channel.to_string();
            let payload = payload.to_string();
            async move { conn.publish(&channel, payload).await }
        })
        .await
    }

    /// Mirror a full order record under `order:{id}`.
    pub async fn mirror_hash(&self, key: &str, fields: &[(String, String)]) -> Result<(), OesError> {
        self.with_connection(|mut conn| {
            let key = key.to_string();
            let fields = fields.to_vec();
            async move { conn.hset_multiple(&key, &fields).await }
        })
        .await
    }

    /// SCAN + DEL every key matching the pattern. Used by the startup wipe
    /// unless OES_NO_CLEAR_DATA is set.
    pub async fn clear_pattern(&self, pattern: &str) -> Result<usize, OesError> {
        self.with_connection(|mut conn| {
            let pattern = pattern.to_string();
            async move {
                let mut removed = 0usize;
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await?;
                    if !batch.is_empty() {
                        let deleted: usize = conn.del(&batch).await?;
                        removed += deleted;
                    }
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok(removed)
            }
        })
        .await
    }

    /// Liveness probe; false when the store is unreachable.
    pub async fn ping(&self) -> bool {
        self.with_connection(|mut conn| async move {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong == "PONG")
        })
        .await
        .unwrap_or(false)
    }
}

fn unavailable(e: RedisError) -> OesError {
    OesError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        assert!(ExternalStore::connect("not-a-url").await.is_err());
    }
}
