//! Hit store persisted in a networked key/value backend.
//!
//! Expiry is left to the backend: every write refreshes a per-key TTL of
//! `ceil(window_ms / 1000)` seconds, so idle keys evict themselves without a
//! sweep. Sub-second windows are therefore only approximately honoured by the
//! backend's eviction; pruning on access stays exact.

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{HitHistory, Store};
use crate::error::{LimiterError, Result};

/// Minimal string key/value operations a remote store needs.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Read the raw value under `key`.
    async fn fetch(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key`, expiring after `ttl_secs` seconds.
    async fn store(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A [`Store`] that keeps histories as JSON arrays in a [`KeyValueBackend`].
pub struct RemoteStore<B> {
    backend: B,
    prefix: String,
    ttl_secs: u64,
}

impl<B: KeyValueBackend> RemoteStore<B> {
    /// Create a store whose keys live under `prefix` and expire after the
    /// window, rounded up to whole seconds.
    pub fn new(backend: B, window_ms: u64, prefix: impl Into<String>) -> Result<Self> {
        if window_ms == 0 {
            return Err(LimiterError::Configuration(
                "window_ms must be a positive number of milliseconds".to_string(),
            ));
        }

        Ok(Self {
            backend,
            prefix: prefix.into(),
            ttl_secs: window_ms.div_ceil(1000),
        })
    }

    /// TTL applied on every write.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn encode(history: &HitHistory) -> Result<String> {
    Ok(serde_json::to_string(history)?)
}

fn decode(raw: &str) -> Result<HitHistory> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl<B: KeyValueBackend> Store for RemoteStore<B> {
    async fn get(&self, key: &str) -> Result<Option<HitHistory>> {
        let remote_key = self.namespaced(key);
        let Some(raw) = self.backend.fetch(&remote_key).await? else {
            return Ok(None);
        };

        match decode(&raw) {
            Ok(history) => Ok(Some(history)),
            Err(e) => {
                warn!(
                    key = %remote_key,
                    error = %e,
                    "Discarding undecodable hit history"
                );
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, history: HitHistory) -> Result<()> {
        let remote_key = self.namespaced(key);

        if history.is_empty() {
            return self.backend.delete(&remote_key).await;
        }

        trace!(
            key = %remote_key,
            hits = history.len(),
            ttl_secs = self.ttl_secs,
            "Persisting hit history"
        );

        let value = encode(&history)?;
        self.backend.store(&remote_key, value, self.ttl_secs).await
    }

    fn retention_ms(&self) -> Option<u64> {
        Some(self.ttl_secs.saturating_mul(1000))
    }
}

/// [`KeyValueBackend`] over a Redis connection.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisBackend {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KeyValueBackend for RedisBackend {
    async fn fetch(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn store(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Key/value backend that records the TTL of each write.
    #[derive(Default)]
    struct FakeBackend {
        entries: Mutex<HashMap<String, (String, u64)>>,
    }

    impl FakeBackend {
        fn raw(&self, key: &str) -> Option<(String, u64)> {
            self.entries.lock().get(key).cloned()
        }

        fn put_raw(&self, key: &str, value: &str) {
            self.entries
                .lock()
                .insert(key.to_string(), (value.to_string(), 0));
        }
    }

    #[async_trait]
    impl KeyValueBackend for FakeBackend {
        async fn fetch(&self, key: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().get(key).map(|(v, _)| v.clone()))
        }

        async fn store(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
            self.entries.lock().insert(key.to_string(), (value, ttl_secs));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.entries.lock().remove(key);
            Ok(())
        }
    }

    struct DownBackend;

    #[async_trait]
    impl KeyValueBackend for DownBackend {
        async fn fetch(&self, _key: &str) -> Result<Option<String>> {
            Err(LimiterError::Backend("connection refused".to_string()))
        }

        async fn store(&self, _key: &str, _value: String, _ttl_secs: u64) -> Result<()> {
            Err(LimiterError::Backend("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(LimiterError::Backend("connection refused".to_string()))
        }
    }

    #[test]
    fn test_ttl_rounds_up_to_seconds() {
        assert_eq!(RemoteStore::new(FakeBackend::default(), 1, "rl:").unwrap().ttl_secs(), 1);
        assert_eq!(RemoteStore::new(FakeBackend::default(), 1000, "rl:").unwrap().ttl_secs(), 1);
        assert_eq!(RemoteStore::new(FakeBackend::default(), 1001, "rl:").unwrap().ttl_secs(), 2);
        assert_eq!(RemoteStore::new(FakeBackend::default(), 60_000, "rl:").unwrap().ttl_secs(), 60);
    }

    #[test]
    fn test_retention_is_the_rounded_ttl() {
        let store = RemoteStore::new(FakeBackend::default(), 1500, "rl:").unwrap();
        assert_eq!(store.retention_ms(), Some(2000));
    }

    #[test]
    fn test_rejects_zero_window() {
        assert!(RemoteStore::new(FakeBackend::default(), 0, "rl:").is_err());
    }

    #[tokio::test]
    async fn test_set_writes_namespaced_json_with_ttl() {
        let store = RemoteStore::new(FakeBackend::default(), 1500, "rl:").unwrap();
        store.set("10.0.0.1", vec![100, 200]).await.unwrap();

        let (raw, ttl) = store.backend().raw("rl:10.0.0.1").unwrap();
        assert_eq!(raw, "[100,200]");
        assert_eq!(ttl, 2);

        assert_eq!(store.get("10.0.0.1").await.unwrap(), Some(vec![100, 200]));
    }

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let store = RemoteStore::new(FakeBackend::default(), 1000, "rl:").unwrap();
        assert_eq!(store.get("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_treated_as_absent() {
        let store = RemoteStore::new(FakeBackend::default(), 1000, "rl:").unwrap();
        store.backend().put_raw("rl:k", "not json");

        assert_eq!(store.get("k").await.unwrap(), None);

        // A fresh history replaces the unreadable value
        let history = store.record_hit("k", 5000, 1000).await.unwrap();
        assert_eq!(history, vec![5000]);
        assert_eq!(store.backend().raw("rl:k").unwrap().0, "[5000]");
    }

    #[tokio::test]
    async fn test_empty_history_deletes_key() {
        let store = RemoteStore::new(FakeBackend::default(), 1000, "rl:").unwrap();
        store.set("k", vec![1]).await.unwrap();
        store.pop_last("k").await.unwrap();

        assert!(store.backend().raw("rl:k").is_none());
    }

    #[tokio::test]
    async fn test_backend_failure_is_surfaced() {
        let store = RemoteStore::new(DownBackend, 1000, "rl:").unwrap();

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_backend());

        let err = store.set("k", vec![1]).await.unwrap_err();
        assert!(err.is_backend());
    }
}
