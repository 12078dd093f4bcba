//! Hit history storage.
//!
//! A [`Store`] maps a key to the timestamps of the hits counted against it.
//! Stores never prune on `get`; the sliding window arithmetic lives in
//! [`prune`] so every backend shares one algorithm.

mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::{KeyValueBackend, RemoteStore};
#[cfg(feature = "redis")]
pub use remote::RedisBackend;

use async_trait::async_trait;

use crate::error::Result;

/// Millisecond timestamps of counted hits, oldest first.
pub type HitHistory = Vec<u64>;

/// Drop every timestamp that has left the window ending at `now`.
///
/// A timestamp `t` survives iff `t > now - window_ms`.
pub fn prune(history: &mut HitHistory, now: u64, window_ms: u64) {
    history.retain(|&t| t.saturating_add(window_ms) > now);
}

/// Storage contract for per-key hit histories.
///
/// Only [`get`](Store::get) and [`set`](Store::set) are required. The provided
/// read-modify-write methods are built on them and are therefore not atomic:
/// two concurrent [`record_hit`](Store::record_hit) calls on the same key can
/// both read the same history and one hit is lost. Backends that can update a
/// key atomically should override them.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the stored history for `key`, or `None` if the key is unknown.
    async fn get(&self, key: &str) -> Result<Option<HitHistory>>;

    /// Replace the stored history for `key`. An empty history removes the key.
    async fn set(&self, key: &str, history: HitHistory) -> Result<()>;

    /// Prune the history for `key`, append `now`, persist it and return it.
    async fn record_hit(&self, key: &str, now: u64, window_ms: u64) -> Result<HitHistory> {
        let mut history = self.get(key).await?.unwrap_or_default();
        prune(&mut history, now, window_ms);
        history.push(now);
        self.set(key, history.clone()).await?;
        Ok(history)
    }

    /// Remove the most recently appended hit for `key`, if any.
    async fn pop_last(&self, key: &str) -> Result<()> {
        if let Some(mut history) = self.get(key).await? {
            if history.pop().is_some() {
                self.set(key, history).await?;
            }
        }
        Ok(())
    }

    /// Release background resources. Must be idempotent.
    async fn shutdown(&self) {}

    /// How long the store keeps a hit on its own before evicting it, if
    /// bounded. A limiter whose window is longer would lose live hits.
    fn retention_ms(&self) -> Option<u64> {
        None
    }
}
