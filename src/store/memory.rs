//! In-process hit store with a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{prune, HitHistory, Store};
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, Result};

/// Handle to the background sweep task.
struct Sweeper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Hit store backed by a concurrent in-process map.
///
/// Keys only get pruned when they are touched, so a sweep task runs once per
/// window and evicts keys whose whole history has expired. Updates to a single
/// key are atomic: `record_hit` and `pop_last` hold the key's shard lock for
/// the whole read-modify-write.
pub struct MemoryStore {
    entries: Arc<DashMap<String, HitHistory>>,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .field("window_ms", &self.window_ms)
            .field("sweeping", &self.sweeper.lock().is_some())
            .finish()
    }
}

impl MemoryStore {
    /// Create a store that sweeps every `window_ms` using the wall clock.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(window_ms: u64) -> Result<Self> {
        Self::with_clock(window_ms, Arc::new(SystemClock))
    }

    /// Create a store that sweeps every `window_ms` using `clock` for expiry.
    pub fn with_clock(window_ms: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if window_ms == 0 {
            return Err(LimiterError::Configuration(
                "sweep period must be a positive number of milliseconds".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            LimiterError::Configuration(format!("MemoryStore requires a Tokio runtime: {}", e))
        })?;

        let entries = Arc::new(DashMap::new());
        let (stop, mut stop_rx) = oneshot::channel();

        let task_entries = Arc::clone(&entries);
        let task_clock = Arc::clone(&clock);
        let handle = runtime.spawn(async move {
            let period = Duration::from_millis(window_ms);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        sweep_entries(&task_entries, task_clock.now_millis(), window_ms);
                    }
                }
            }
        });

        info!(window_ms = window_ms, "Memory store sweeper started");

        Ok(Self {
            entries,
            window_ms,
            clock,
            sweeper: Mutex::new(Some(Sweeper { stop, handle })),
        })
    }

    /// Run one sweep pass now. Returns the number of keys evicted.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.clock.now_millis(), self.window_ms)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is currently held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the background sweep is still scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

/// Prune every key and evict the ones left empty.
fn sweep_entries(entries: &DashMap<String, HitHistory>, now: u64, window_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, history| {
        prune(history, now, window_ms);
        !history.is_empty()
    });
    let evicted = before.saturating_sub(entries.len());

    debug!(
        evicted = evicted,
        remaining = entries.len(),
        "Swept memory store"
    );

    evicted
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<HitHistory>> {
        Ok(self.entries.get(key).map(|history| history.value().clone()))
    }

    async fn set(&self, key: &str, history: HitHistory) -> Result<()> {
        if history.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), history);
        }
        Ok(())
    }

    async fn record_hit(&self, key: &str, now: u64, window_ms: u64) -> Result<HitHistory> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        prune(entry.value_mut(), now, window_ms);
        entry.value_mut().push(now);
        Ok(entry.value().clone())
    }

    async fn pop_last(&self, key: &str) -> Result<()> {
        let emptied = match self.entries.get_mut(key) {
            Some(mut history) => {
                history.pop();
                history.is_empty()
            }
            None => false,
        };

        if emptied {
            self.entries.remove_if(key, |_, history| history.is_empty());
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            // The task may already be gone if the runtime is shutting down.
            let _ = sweeper.stop.send(());
            let _ = sweeper.handle.await;
            info!("Memory store sweeper stopped");
        }
    }

    fn retention_ms(&self) -> Option<u64> {
        Some(self.window_ms)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.handle.abort();
        }
    }
}
