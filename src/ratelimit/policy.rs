//! Two-phase admission contract for request adapters.
//!
//! An adapter calls [`Policy::admit`] when a request arrives, applies the
//! [`Admission`] to its protocol (headers, rejection), and once the request has
//! concluded hands the outcome to the returned [`Finalizer`]. The finalizer
//! retracts the hit when the outcome should not count against the quota.

use std::sync::Arc;
use tracing::{debug, warn};

use super::decision::QuotaDecision;
use super::limiter::RateLimiter;
use crate::error::{LimiterError, Result};

/// Derives the rate limit key from a request.
pub type KeyFn<Req> = Arc<dyn Fn(&Req) -> String + Send + Sync>;
/// Decides whether a request bypasses counting.
pub type SkipFn<Req> = Arc<dyn Fn(&Req) -> bool + Send + Sync>;
/// Invoked for every request whose check exceeded the limit.
pub type ExceededFn<Req> = Arc<dyn Fn(&Req, &QuotaDecision) + Send + Sync>;

/// How a request ended, by status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    /// Statuses of 400 and above are failures.
    pub fn from_status(status: u16) -> Self {
        if status >= 400 {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        }
    }
}

/// Result of admitting one request.
#[derive(Debug)]
pub enum Admission {
    /// The skip predicate matched; nothing was counted.
    Skipped,
    /// The store failed and the request is let through unenforced.
    Unenforced { error: LimiterError },
    /// The hit was counted.
    Checked {
        decision: QuotaDecision,
        finalizer: Finalizer,
    },
}

impl Admission {
    /// Whether the request may proceed. Store failures fail open.
    pub fn is_admitted(&self) -> bool {
        match self {
            Admission::Skipped | Admission::Unenforced { .. } => true,
            Admission::Checked { decision, .. } => decision.is_admitted(),
        }
    }

    /// The quota decision, if the hit was counted.
    pub fn decision(&self) -> Option<&QuotaDecision> {
        match self {
            Admission::Checked { decision, .. } => Some(decision),
            _ => None,
        }
    }

    /// Take the finalizer, if the hit was counted.
    pub fn into_finalizer(self) -> Option<Finalizer> {
        match self {
            Admission::Checked { finalizer, .. } => Some(finalizer),
            _ => None,
        }
    }
}

/// Completes a counted request. Consumed by [`finalize`](Finalizer::finalize),
/// so it runs at most once; dropping it keeps the hit.
pub struct Finalizer {
    limiter: Arc<RateLimiter>,
    key: String,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer").field("key", &self.key).finish()
    }
}

impl Finalizer {
    /// The key the hit was counted under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Report how the request ended. Returns whether the hit was retracted.
    ///
    /// Retraction failures are logged and never reach the caller.
    pub async fn finalize(self, outcome: Outcome) -> bool {
        let config = self.limiter.config();
        let counts = match outcome {
            Outcome::Succeeded => config.count_successful,
            Outcome::Failed => config.count_failed,
        };
        if counts {
            return false;
        }

        match self.limiter.retract(&self.key).await {
            Ok(()) => {
                debug!(key = %self.key, outcome = ?outcome, "Uncounted request");
                true
            }
            Err(e) => {
                warn!(
                    key = %self.key,
                    outcome = ?outcome,
                    error = %e,
                    "Failed to retract hit"
                );
                false
            }
        }
    }
}

/// Per-route admission policy over a shared [`RateLimiter`].
pub struct Policy<Req> {
    limiter: Arc<RateLimiter>,
    key_fn: KeyFn<Req>,
    skip_fn: SkipFn<Req>,
    on_exceeded: Option<ExceededFn<Req>>,
}

impl<Req> Policy<Req> {
    /// Start building a policy over `limiter`.
    pub fn builder(limiter: Arc<RateLimiter>) -> PolicyBuilder<Req> {
        PolicyBuilder {
            limiter,
            key_fn: None,
            skip_fn: None,
            on_exceeded: None,
        }
    }

    /// The limiter this policy counts against.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Count `req` and decide whether it may proceed.
    pub async fn admit(&self, req: &Req) -> Admission {
        if (self.skip_fn)(req) {
            return Admission::Skipped;
        }

        let key = (self.key_fn)(req);
        let decision = match self.limiter.check(&key).await {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    key = %key,
                    error = %error,
                    "Rate limit store unavailable, admitting request"
                );
                return Admission::Unenforced { error };
            }
        };

        if !decision.is_admitted() {
            if let Some(on_exceeded) = &self.on_exceeded {
                on_exceeded(req, &decision);
            }
        }

        Admission::Checked {
            decision,
            finalizer: Finalizer {
                limiter: Arc::clone(&self.limiter),
                key,
            },
        }
    }
}

/// Builder for [`Policy`].
pub struct PolicyBuilder<Req> {
    limiter: Arc<RateLimiter>,
    key_fn: Option<KeyFn<Req>>,
    skip_fn: Option<SkipFn<Req>>,
    on_exceeded: Option<ExceededFn<Req>>,
}

impl<Req: 'static> PolicyBuilder<Req> {
    /// Set how a key is derived from a request. Required.
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Set which requests bypass counting. Defaults to none.
    pub fn skip_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req) -> bool + Send + Sync + 'static,
    {
        self.skip_fn = Some(Arc::new(f));
        self
    }

    /// Set a callback for requests over the limit.
    pub fn on_exceeded<F>(mut self, f: F) -> Self
    where
        F: Fn(&Req, &QuotaDecision) + Send + Sync + 'static,
    {
        self.on_exceeded = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Policy<Req>> {
        let key_fn = self.key_fn.ok_or_else(|| {
            LimiterError::Configuration("a key function is required".to_string())
        })?;

        let skip_fn: SkipFn<Req> = match self.skip_fn {
            Some(skip_fn) => skip_fn,
            None => Arc::new(|_: &Req| false),
        };

        Ok(Policy {
            limiter: self.limiter,
            key_fn,
            skip_fn,
            on_exceeded: self.on_exceeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimiterConfig;
    use crate::store::{HitHistory, MemoryStore, Store};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Request {
        addr: &'static str,
        path: &'static str,
    }

    fn req(addr: &'static str, path: &'static str) -> Request {
        Request { addr, path }
    }

    fn limiter(limit: u64, count_failed: bool, count_successful: bool) -> Arc<RateLimiter> {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::with_clock(60_000, clock.clone()).unwrap());
        let config = LimiterConfig {
            window_ms: 60_000,
            limit,
            count_failed,
            count_successful,
        };
        Arc::new(RateLimiter::with_clock(config, store, clock).unwrap())
    }

    fn by_addr(limiter: Arc<RateLimiter>) -> Policy<Request> {
        Policy::builder(limiter)
            .key_fn(|r: &Request| r.addr.to_string())
            .build()
            .unwrap()
    }

    /// Store that fails every operation.
    struct DownStore;

    #[async_trait]
    impl Store for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<HitHistory>> {
            Err(LimiterError::Backend("connection reset".to_string()))
        }

        async fn set(&self, _key: &str, _history: HitHistory) -> Result<()> {
            Err(LimiterError::Backend("connection reset".to_string()))
        }
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(Outcome::from_status(200), Outcome::Succeeded);
        assert_eq!(Outcome::from_status(304), Outcome::Succeeded);
        assert_eq!(Outcome::from_status(400), Outcome::Failed);
        assert_eq!(Outcome::from_status(503), Outcome::Failed);
    }

    #[tokio::test]
    async fn test_builder_requires_key_fn() {
        let result = Policy::<Request>::builder(limiter(1, true, true)).build();
        assert!(matches!(result, Err(LimiterError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_admit_and_reject() {
        let policy = by_addr(limiter(1, true, true));

        let first = policy.admit(&req("10.0.0.1", "/")).await;
        assert!(first.is_admitted());
        assert_eq!(first.decision().unwrap().remaining, 0);

        let second = policy.admit(&req("10.0.0.1", "/")).await;
        assert!(!second.is_admitted());

        assert!(policy.admit(&req("10.0.0.2", "/")).await.is_admitted());
    }

    #[tokio::test]
    async fn test_skip_fn_bypasses_counting() {
        let shared = limiter(1, true, true);
        let policy = Policy::builder(shared.clone())
            .key_fn(|r: &Request| r.addr.to_string())
            .skip_fn(|r: &Request| r.path == "/health")
            .build()
            .unwrap();

        for _ in 0..3 {
            let admission = policy.admit(&req("10.0.0.1", "/health")).await;
            assert!(matches!(admission, Admission::Skipped));
        }

        assert_eq!(shared.inspect("10.0.0.1").await.unwrap().current_count, 0);
    }

    #[tokio::test]
    async fn test_on_exceeded_fires_per_rejection() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let policy = Policy::builder(limiter(2, true, true))
            .key_fn(|r: &Request| r.addr.to_string())
            .on_exceeded(move |_r: &Request, decision: &QuotaDecision| {
                assert!(decision.current_count > decision.limit);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        for _ in 0..4 {
            policy.admit(&req("10.0.0.1", "/")).await;
        }

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let config = LimiterConfig {
            window_ms: 1000,
            limit: 1,
            ..LimiterConfig::default()
        };
        let limiter = Arc::new(RateLimiter::new(config, Arc::new(DownStore)).unwrap());
        let policy = by_addr(limiter);

        let admission = policy.admit(&req("10.0.0.1", "/")).await;
        assert!(admission.is_admitted());
        match admission {
            Admission::Unenforced { error } => assert!(error.is_backend()),
            other => panic!("expected Unenforced, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_requests_are_uncounted_when_disabled() {
        let shared = limiter(10, false, true);
        let policy = by_addr(shared.clone());

        let finalizer = policy.admit(&req("10.0.0.1", "/")).await.into_finalizer().unwrap();
        assert!(finalizer.finalize(Outcome::from_status(500)).await);
        assert_eq!(shared.inspect("10.0.0.1").await.unwrap().current_count, 0);

        let finalizer = policy.admit(&req("10.0.0.1", "/")).await.into_finalizer().unwrap();
        assert!(!finalizer.finalize(Outcome::from_status(200)).await);
        assert_eq!(shared.inspect("10.0.0.1").await.unwrap().current_count, 1);
    }

    #[tokio::test]
    async fn test_successful_requests_are_uncounted_when_disabled() {
        let shared = limiter(10, true, false);
        let policy = by_addr(shared.clone());

        let finalizer = policy.admit(&req("10.0.0.1", "/")).await.into_finalizer().unwrap();
        assert_eq!(finalizer.key(), "10.0.0.1");
        assert!(finalizer.finalize(Outcome::Succeeded).await);

        let finalizer = policy.admit(&req("10.0.0.1", "/")).await.into_finalizer().unwrap();
        assert!(!finalizer.finalize(Outcome::Failed).await);

        assert_eq!(shared.inspect("10.0.0.1").await.unwrap().current_count, 1);
    }

    #[tokio::test]
    async fn test_dropped_finalizer_keeps_hit() {
        let shared = limiter(10, false, false);
        let policy = by_addr(shared.clone());

        drop(policy.admit(&req("10.0.0.1", "/")).await);
        assert_eq!(shared.inspect("10.0.0.1").await.unwrap().current_count, 1);
    }
}
