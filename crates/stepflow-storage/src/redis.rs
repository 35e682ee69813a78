//! Redis implementation of QueueStore
//!
//! One adapter instance owns one multiplexed connection manager. The manager
//! reconnects on failure, but a blocking `BLPOP` still monopolizes it for the
//! duration of the wait, so callers that pop must do so on their own
//! [`duplicate`](crate::queue::QueueStore::duplicate)d adapter, which opens a
//! fresh manager from the shared client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::StoreError;
use crate::queue::QueueStore;

/// Redis-backed [`QueueStore`].
#[derive(Clone)]
pub struct RedisQueueStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisQueueStore {
    /// Open a connection manager against `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        debug!(url, "connected queue store");
        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn kv_err(e: redis::RedisError) -> StoreError {
    StoreError::Kv(e.to_string())
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.hset_multiple(key, fields).await.map_err(kv_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(kv_err)
    }

    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(kv_err)
    }

    async fn list_push_right(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.rpush(list, value).await.map_err(kv_err)
    }

    async fn list_pop_left_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        // BLPOP takes whole seconds; zero would block forever.
        let secs = timeout.as_secs().max(1) as f64;
        let popped: Option<(String, String)> =
            conn.blpop(list, secs).await.map_err(kv_err)?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(set.is_some())
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(kv_err)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        // TTL returns -2 for a missing key and -1 for a key without expiry;
        // both read as "not held" here.
        let ttl: i64 = conn.ttl(key).await.map_err(kv_err)?;
        Ok(ttl.max(0))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.del(key).await.map_err(kv_err)
    }

    async fn duplicate(&self) -> Result<Arc<dyn QueueStore>, StoreError> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            manager,
        }))
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        // The manager closes its connection when the last clone drops.
        Ok(())
    }
}
