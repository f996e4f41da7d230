//! Tenant stats document storage.
//!
//! One JSON document per tenant key. Writers never send whole documents:
//! every changed field is written at its path atomically, after resolving its
//! [`FieldOp`](warlog_stats::FieldOp) against the stored value, so concurrent
//! writers (other queues, other processes) cannot lose each other's updates.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use warlog_core::TenantKey;
use warlog_stats::{FieldChange, FieldPath, TenantStats};

use crate::jobs::JobError;

pub use in_memory::InMemoryStatsStore;
pub use postgres::PostgresStatsStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored document could not be decoded.
    #[error("corrupt document for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Corruption is not transient: it becomes `Internal`, which the retry runner
/// reports as `ExhaustedRetries` without another attempt.
impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => JobError::StoreUnavailable(msg),
            corrupt @ StoreError::Corrupt { .. } => JobError::Internal(corrupt.to_string()),
        }
    }
}

/// Durable per-tenant document store.
#[async_trait::async_trait]
pub trait StatsStore: Send + Sync {
    /// Load the document of `key`; `None` if nothing was ever written.
    async fn find(&self, key: &TenantKey) -> Result<Option<TenantStats>, StoreError>;

    /// Write every changed field at its path per its op, creating the
    /// document and any missing intermediate objects.
    async fn apply(&self, key: &TenantKey, changes: &[FieldChange]) -> Result<(), StoreError>;

    /// Remove the field at `path`. Returns whether it existed.
    async fn unset(&self, key: &TenantKey, path: &FieldPath) -> Result<bool, StoreError>;

    /// Remove the whole document of `key`. Returns whether it existed.
    async fn delete(&self, key: &TenantKey) -> Result<bool, StoreError>;

    /// Remove every document. Returns how many were removed.
    async fn drop_all(&self) -> Result<u64, StoreError>;

    /// Keys that currently have a document.
    async fn keys(&self) -> Result<Vec<TenantKey>, StoreError>;
}

#[async_trait::async_trait]
impl<S> StatsStore for Arc<S>
where
    S: StatsStore + ?Sized,
{
    async fn find(&self, key: &TenantKey) -> Result<Option<TenantStats>, StoreError> {
        (**self).find(key).await
    }

    async fn apply(&self, key: &TenantKey, changes: &[FieldChange]) -> Result<(), StoreError> {
        (**self).apply(key, changes).await
    }

    async fn unset(&self, key: &TenantKey, path: &FieldPath) -> Result<bool, StoreError> {
        (**self).unset(key, path).await
    }

    async fn delete(&self, key: &TenantKey) -> Result<bool, StoreError> {
        (**self).delete(key).await
    }

    async fn drop_all(&self) -> Result<u64, StoreError> {
        (**self).drop_all().await
    }

    async fn keys(&self) -> Result<Vec<TenantKey>, StoreError> {
        (**self).keys().await
    }
}

/// Decode a stored document.
pub(crate) fn decode(key: &TenantKey, doc: serde_json::Value) -> Result<TenantStats, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_job_errors() {
        let unavailable: JobError = StoreError::unavailable("pool timed out").into();
        assert_eq!(unavailable, JobError::StoreUnavailable("pool timed out".into()));
        assert!(unavailable.is_retryable());

        let corrupt: JobError = StoreError::Corrupt {
            key: "k".into(),
            reason: "bad".into(),
        }
        .into();
        assert!(matches!(corrupt, JobError::Internal(_)));
        assert!(!corrupt.is_retryable());
    }

    #[test]
    fn decode_reports_corrupt_documents() {
        let key = TenantKey::parse("k").unwrap();
        let err = decode(&key, serde_json::json!({ "battles": 5 })).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
