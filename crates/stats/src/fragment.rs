//! Normalization of loosely-typed incoming fragments.
//!
//! Producers send JSON whose shape varies between client versions and relays:
//! numbers may arrive wrapped in extended-precision tags, contribution entries
//! may be nested inside `_id` envelopes, and some entries are simply broken.
//! [`Fragment::from_value`] runs once, before any merge rule, and produces a
//! strict shape. Malformed entries are skipped and recorded as
//! [`FragmentRejection`]s; normalization itself never fails.

use serde_json::{Map, Value};
use thiserror::Error;

use warlog_core::{BattleId, DomainError, PlayerId};

use crate::model::BattleOutcome;

/// Tags used by producers to carry numbers as strings.
const WIDE_NUMBER_TAGS: [&str; 5] = [
    "wideInt",
    "wideDouble",
    "$numberLong",
    "$numberInt",
    "$numberDouble",
];

/// Keys that mark an object as an actual contribution (not an envelope).
const CONTRIBUTION_FIELDS: [&str; 5] = ["name", "damage", "kills", "points", "vehicle"];

/// A malformed part of a fragment that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {error}")]
pub struct FragmentRejection {
    /// Dotted location of the rejected entry (`$` is the fragment itself).
    pub path: String,
    pub error: DomainError,
}

impl FragmentRejection {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error: DomainError::validation(reason),
        }
    }
}

/// Nickname report for a player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerNameUpdate {
    pub id: PlayerId,
    pub display_name: String,
}

/// One player's reported numbers inside a battle fragment.
///
/// `None` means "not reported" and never changes stored data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContributionFragment {
    pub name: Option<String>,
    pub damage: Option<f64>,
    pub kills: Option<u64>,
    pub points: Option<f64>,
    pub vehicle: Option<String>,
}

/// A partial report of one battle.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleFragment {
    pub id: BattleId,
    pub start_time: Option<i64>,
    pub duration: Option<u64>,
    pub win: Option<BattleOutcome>,
    pub map_name: Option<String>,
    pub players: Vec<(PlayerId, ContributionFragment)>,
}

impl BattleFragment {
    pub fn new(id: BattleId) -> Self {
        Self {
            id,
            start_time: None,
            duration: None,
            win: None,
            map_name: None,
            players: Vec::new(),
        }
    }
}

/// A normalized fragment, ready for the merge rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    pub players: Vec<PlayerNameUpdate>,
    pub battles: Vec<BattleFragment>,
    pub rejected: Vec<FragmentRejection>,
}

impl Fragment {
    /// Normalize a raw JSON fragment.
    pub fn from_value(value: &Value) -> Self {
        let mut fragment = Fragment::default();

        let Some(root) = value.as_object() else {
            fragment
                .rejected
                .push(FragmentRejection::new("$", "fragment must be a JSON object"));
            return fragment;
        };

        match root.get("players") {
            None | Some(Value::Null) => {}
            Some(Value::Object(players)) => {
                for (id, entry) in players {
                    match normalize_nickname(id, entry) {
                        Ok(update) => fragment.players.push(update),
                        Err(rejection) => fragment.rejected.push(rejection),
                    }
                }
            }
            Some(_) => fragment
                .rejected
                .push(FragmentRejection::new("players", "must be an object")),
        }

        match root.get("battles") {
            None | Some(Value::Null) => {}
            Some(Value::Object(battles)) => {
                for (id, entry) in battles {
                    match normalize_battle(id, entry, &mut fragment.rejected) {
                        Ok(battle) => fragment.battles.push(battle),
                        Err(rejection) => fragment.rejected.push(rejection),
                    }
                }
            }
            Some(_) => fragment
                .rejected
                .push(FragmentRejection::new("battles", "must be an object")),
        }

        fragment
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.battles.is_empty()
    }
}

fn normalize_nickname(id: &str, entry: &Value) -> Result<PlayerNameUpdate, FragmentRejection> {
    let path = format!("players.{id}");
    let id = PlayerId::parse(id).map_err(|e| FragmentRejection {
        path: path.clone(),
        error: e,
    })?;

    let name = match entry {
        Value::String(s) => non_empty(s),
        Value::Object(obj) => ["displayName", "name", "nickname"]
            .iter()
            .find_map(|field| obj.get(*field).and_then(Value::as_str).and_then(non_empty)),
        _ => None,
    };

    match name {
        Some(display_name) => Ok(PlayerNameUpdate { id, display_name }),
        None => Err(FragmentRejection::new(path, "missing display name")),
    }
}

fn normalize_battle(
    id: &str,
    entry: &Value,
    rejected: &mut Vec<FragmentRejection>,
) -> Result<BattleFragment, FragmentRejection> {
    let path = format!("battles.{id}");
    let battle_id = BattleId::parse(id).map_err(|e| FragmentRejection {
        path: path.clone(),
        error: e,
    })?;

    let Some(obj) = entry.as_object() else {
        return Err(FragmentRejection::new(path, "battle must be an object"));
    };

    let players = match obj.get("players") {
        None | Some(Value::Null) => None,
        Some(Value::Object(players)) => Some(players),
        Some(_) => return Err(FragmentRejection::new(path, "players must be an object")),
    };

    let mut battle = BattleFragment::new(battle_id);
    battle.start_time = obj.get("startTime").and_then(present).map(to_i64);
    battle.duration = obj
        .get("duration")
        .and_then(present)
        .map(|v| to_i64(v).max(0) as u64);
    battle.win = obj
        .get("win")
        .and_then(present)
        .and_then(|v| BattleOutcome::from_code(to_i64(v)));
    battle.map_name = text(obj, "mapName");

    for (player, entry) in players.into_iter().flatten() {
        let player_path = format!("{path}.players.{player}");
        let player_id = match PlayerId::parse(player.as_str()) {
            Ok(player_id) => player_id,
            Err(error) => {
                rejected.push(FragmentRejection {
                    path: player_path,
                    error,
                });
                continue;
            }
        };

        let Some(contribution) = entry.as_object() else {
            rejected.push(FragmentRejection::new(
                player_path,
                "contribution must be an object",
            ));
            continue;
        };

        battle
            .players
            .push((player_id, normalize_contribution(unwrap_envelope(contribution))));
    }

    Ok(battle)
}

fn normalize_contribution(obj: &Map<String, Value>) -> ContributionFragment {
    ContributionFragment {
        name: text(obj, "name"),
        damage: obj.get("damage").and_then(present).map(to_non_negative_f64),
        kills: obj
            .get("kills")
            .and_then(present)
            .map(|v| to_i64(v).max(0) as u64),
        points: obj.get("points").and_then(present).map(to_non_negative_f64),
        vehicle: text(obj, "vehicle"),
    }
}

/// Peel `{_id: {_id: {...}}}` envelopes down to the object carrying fields.
fn unwrap_envelope(mut obj: &Map<String, Value>) -> &Map<String, Value> {
    while !CONTRIBUTION_FIELDS.iter().any(|f| obj.contains_key(*f)) {
        match obj.get("_id").and_then(Value::as_object) {
            Some(inner) => obj = inner,
            None => break,
        }
    }
    obj
}

/// Strip extended-precision tags, e.g. `{"wideInt": "123"}` -> `"123"`.
fn unwrap_wide(mut value: &Value) -> &Value {
    while let Value::Object(obj) = value {
        match WIDE_NUMBER_TAGS.iter().find_map(|tag| obj.get(*tag)) {
            Some(inner) if obj.len() == 1 => value = inner,
            _ => break,
        }
    }
    value
}

fn present(value: &Value) -> Option<&Value> {
    (!value.is_null()).then_some(value)
}

fn to_i64(value: &Value) -> i64 {
    match unwrap_wide(value) {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f as i64)
                })
                .unwrap_or(0)
        }
        _ => 0,
    }
}

fn to_non_negative_f64(value: &Value) -> f64 {
    let parsed = match unwrap_wide(value) {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if parsed.is_finite() { parsed.max(0.0) } else { 0.0 }
}

fn text(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field).and_then(Value::as_str).and_then(non_empty)
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
