//! Errors raised while validating pipeline input.
//!
//! Queue and store failures are not domain errors; `warlog-infra` has its
//! own types for those.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A fragment entry or field value was malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A tenant key, battle id or player id was rejected.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
