//! QueueStore trait definition and key namespace

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Default key prefix when a deployment does not configure one.
pub const DEFAULT_QUEUE_PREFIX: &str = "stepflow";

/// Key namespace for one deployment's queue store footprint.
///
/// Every key the engine touches is derived here, so two deployments sharing
/// one store only need distinct prefixes.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The FIFO list of queued execution ids.
    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    /// Hash of stringified execution fields.
    pub fn execution(&self, id: &str) -> String {
        format!("{}:execution:{}", self.prefix, id)
    }

    /// Hash of step-id to wrapped step cache blobs.
    pub fn steps(&self, id: &str) -> String {
        format!("{}:steps:{}", self.prefix, id)
    }

    /// TTL-bound scheduler leader key.
    pub fn leader(&self) -> String {
        format!("{}:scheduler:leader", self.prefix)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_PREFIX)
    }
}

/// KV and queue operations backing the hot path of the engine.
///
/// Implementations must be safe for concurrent use; the blocking list pop
/// must hand each value to exactly one caller even across processes.
///
/// The blocking pop monopolizes a connection, which is why the contract
/// includes [`duplicate`](QueueStore::duplicate): workers pop on their own
/// duplicated connection, step caching runs on another, and shared metadata
/// updates keep the original. Updates are never head-of-line blocked behind
/// a pop this way.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Connectivity probe used by the startup handshake.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Set hash fields; last writer wins per field.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// All fields of a hash; empty map when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// One hash field; `None` when either the key or the field is missing.
    async fn hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// FIFO append.
    async fn list_push_right(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Block up to `timeout` for the leftmost value; `None` on timeout.
    ///
    /// Atomic across concurrent callers: each value is returned to exactly
    /// one caller. This is the linearization point of the queue.
    async fn list_pop_left_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Atomic set-if-absent with expiry; `true` when the key was set.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Reset the expiry of an existing key.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Seconds until expiry; zero when the key is absent or already expired.
    async fn remaining_ttl(&self, key: &str) -> Result<i64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// An independent connection sharing this adapter's configuration.
    async fn duplicate(&self) -> Result<Arc<dyn QueueStore>, StoreError>;

    /// Release this connection. Further calls on the adapter are undefined.
    async fn disconnect(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let keys = QueueKeys::new("acme");
        assert_eq!(keys.queue(), "acme:queue");
        assert_eq!(keys.execution("e1"), "acme:execution:e1");
        assert_eq!(keys.steps("e1"), "acme:steps:e1");
        assert_eq!(keys.leader(), "acme:scheduler:leader");
    }

    #[test]
    fn default_prefix() {
        assert_eq!(QueueKeys::default().queue(), "stepflow:queue");
    }
}
