//! Cross-process notifiers.
//!
//! The bus abstraction and the in-process bus live in `warlog-events`.
//! This module provides broker-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubNotifier};

/// Channel used when none is configured.
pub const DEFAULT_CHANNEL: &str = "warlog:stats";
