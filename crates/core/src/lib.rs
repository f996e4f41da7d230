//! `warlog-core`: shared building blocks for the battle-stats pipeline.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{BattleId, PlayerId, TenantKey};
