//! Windowkeeper - Sliding Window Request Admission
//!
//! This crate decides whether a request identified by a key falls within its
//! quota for a sliding time window. Hit timestamps live in a pluggable
//! [`store::Store`]: an in-process [`store::MemoryStore`] that sweeps idle
//! keys, or a [`store::RemoteStore`] that leans on the backend's native TTL.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
