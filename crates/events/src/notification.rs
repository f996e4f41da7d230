//! Notifications emitted after a tenant store was written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warlog_core::{BattleId, TenantKey};

/// What happened to a tenant store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsEvent {
    /// At least one field of the store changed value.
    Changed { key: TenantKey },
    /// The whole store of `key` was removed.
    Cleared { key: TenantKey },
    /// One battle was removed from the store of `key`.
    BattleDeleted { key: TenantKey, battle_id: BattleId },
    /// Every tenant store was removed.
    AllCleared,
}

impl StatsEvent {
    /// The tenant this event concerns (`None` for store-wide events).
    pub fn key(&self) -> Option<&TenantKey> {
        match self {
            Self::Changed { key } | Self::Cleared { key } | Self::BattleDeleted { key, .. } => {
                Some(key)
            }
            Self::AllCleared => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Changed { .. } => "changed",
            Self::Cleared { .. } => "cleared",
            Self::BattleDeleted { .. } => "battle_deleted",
            Self::AllCleared => "all_cleared",
        }
    }
}

/// Envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: StatsEvent,
}

impl Notification {
    pub fn new(event: StatsEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn changed(key: TenantKey) -> Self {
        Self::new(StatsEvent::Changed { key })
    }

    pub fn cleared(key: TenantKey) -> Self {
        Self::new(StatsEvent::Cleared { key })
    }

    pub fn battle_deleted(key: TenantKey, battle_id: BattleId) -> Self {
        Self::new(StatsEvent::BattleDeleted { key, battle_id })
    }

    pub fn all_cleared() -> Self {
        Self::new(StatsEvent::AllCleared)
    }
}
