//! Per-tenant stats model.
//!
//! Every field has a "not yet known" default so that partially written
//! documents (field-level upserts from several writers) always decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use warlog_core::{BattleId, DomainError, PlayerId};

/// Placeholder map name meaning "not yet reported".
pub const UNKNOWN_MAP: &str = "Unknown Map";
/// Placeholder player name meaning "not yet reported".
pub const UNKNOWN_PLAYER: &str = "Unknown Player";
/// Placeholder vehicle meaning "not yet reported".
pub const UNKNOWN_VEHICLE: &str = "Unknown Vehicle";

/// Outcome of a battle from the tenant's point of view.
///
/// Stored as the integers `-1` (unknown), `0` (loss) and `1` (win).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum BattleOutcome {
    #[default]
    Unknown,
    Loss,
    Win,
}

impl BattleOutcome {
    /// Map a wire code to an outcome. Codes outside `-1..=1` are not outcomes.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::Unknown),
            0 => Some(Self::Loss),
            1 => Some(Self::Win),
            _ => None,
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::Unknown => -1,
            Self::Loss => 0,
            Self::Win => 1,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl From<BattleOutcome> for i8 {
    fn from(value: BattleOutcome) -> Self {
        value.code()
    }
}

impl TryFrom<i8> for BattleOutcome {
    type Error = DomainError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Self::from_code(i64::from(value))
            .ok_or_else(|| DomainError::validation(format!("invalid battle outcome code {value}")))
    }
}

/// One player's contribution to one battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerContribution {
    pub name: String,
    pub damage: f64,
    pub kills: u64,
    pub points: f64,
    pub vehicle: String,
}

impl Default for PlayerContribution {
    fn default() -> Self {
        Self {
            name: UNKNOWN_PLAYER.to_string(),
            damage: 0.0,
            kills: 0,
            points: 0.0,
            vehicle: UNKNOWN_VEHICLE.to_string(),
        }
    }
}

/// One battle as currently known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BattleRecord {
    /// Start timestamp in milliseconds.
    pub start_time: i64,
    /// Duration in seconds.
    pub duration: u64,
    pub win: BattleOutcome,
    pub map_name: String,
    pub players: BTreeMap<PlayerId, PlayerContribution>,
}

impl Default for BattleRecord {
    fn default() -> Self {
        Self {
            start_time: 0,
            duration: 0,
            win: BattleOutcome::Unknown,
            map_name: UNKNOWN_MAP.to_string(),
            players: BTreeMap::new(),
        }
    }
}

/// Tenant-wide player directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerInfo {
    pub display_name: String,
}

/// The authoritative stats document of one tenant key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantStats {
    pub battles: BTreeMap<BattleId, BattleRecord>,
    pub players: BTreeMap<PlayerId, PlayerInfo>,
}

impl TenantStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.battles.is_empty() && self.players.is_empty()
    }

    pub fn battle(&self, id: &BattleId) -> Option<&BattleRecord> {
        self.battles.get(id)
    }

    /// Battles ordered newest first (`startTime` descending, then id ascending).
    pub fn battles_by_recency(&self) -> Vec<(&BattleId, &BattleRecord)> {
        let mut battles: Vec<_> = self.battles.iter().collect();
        battles.sort_by(|(a_id, a), (b_id, b)| {
            b.start_time.cmp(&a.start_time).then_with(|| a_id.cmp(b_id))
        });
        battles
    }
}
