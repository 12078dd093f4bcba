//! Sliding window admission: the counting engine and the adapter contract.

mod decision;
mod limiter;
mod policy;

pub use decision::QuotaDecision;
pub use limiter::RateLimiter;
pub use policy::{Admission, ExceededFn, Finalizer, KeyFn, Outcome, Policy, PolicyBuilder, SkipFn};
