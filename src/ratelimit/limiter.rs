//! Sliding window log counting engine.

use std::sync::Arc;
use tracing::{debug, trace};

use super::decision::QuotaDecision;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::store::{prune, Store};

/// The counting engine.
///
/// Holds no per-key state: every call reads and writes the [`Store`]. Calls on
/// the same key are not serialized here, so exactness under concurrency is
/// whatever the store's `record_hit`/`pop_last` provide.
pub struct RateLimiter {
    config: LimiterConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over `store` using the wall clock.
    pub fn new(config: LimiterConfig, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a limiter over `store` reading time from `clock`.
    pub fn with_clock(
        config: LimiterConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        if let Some(retention_ms) = store.retention_ms() {
            if retention_ms < config.window_ms {
                return Err(LimiterError::Configuration(format!(
                    "store keeps hits for {}ms, shorter than the {}ms window",
                    retention_ms, config.window_ms
                )));
            }
        }

        debug!(
            window_ms = config.window_ms,
            limit = config.limit,
            count_failed = config.count_failed,
            count_successful = config.count_successful,
            "Rate limiter created"
        );

        Ok(Self {
            config,
            store,
            clock,
        })
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Count a hit for `key` and evaluate the quota.
    ///
    /// The hit is recorded before the decision is made, so a rejected request
    /// still occupies a slot until it expires.
    pub async fn check(&self, key: &str) -> Result<QuotaDecision> {
        let now = self.clock.now_millis();

        trace!(key = %key, now = now, "Checking rate limit");

        let history = self
            .store
            .record_hit(key, now, self.config.window_ms)
            .await?;
        let decision =
            QuotaDecision::from_history(&history, self.config.limit, self.config.window_ms, now);

        if !decision.is_admitted() {
            debug!(
                key = %key,
                count = decision.current_count,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Remove the most recent hit for `key`.
    ///
    /// Best effort: a concurrent `check` on the same key may have appended in
    /// the meantime, in which case that newer hit is the one removed.
    pub async fn retract(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Retracting hit");
        self.store.pop_last(key).await
    }

    /// Forget every hit recorded for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Resetting key");
        self.store.set(key, Vec::new()).await
    }

    /// Current quota for `key` without recording a hit.
    pub async fn inspect(&self, key: &str) -> Result<QuotaDecision> {
        let now = self.clock.now_millis();
        let mut history = self.store.get(key).await?.unwrap_or_default();
        prune(&mut history, now, self.config.window_ms);

        Ok(QuotaDecision::from_history(
            &history,
            self.config.limit,
            self.config.window_ms,
            now,
        ))
    }

    /// Release the store's background resources.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}
