//! Reconciliation of incoming fragments into a tenant's stats.
//!
//! Producers deliver at-least-once and out of order, so every field rule here
//! is idempotent, and commutative for reports that agree on a battle's facts:
//!
//! | field | rule |
//! |---|---|
//! | `startTime`, `duration`, `damage`, `kills`, `points` | maximum |
//! | `win` | known outcome replaces, unknown never overwrites |
//! | `mapName`, `vehicle` | first non-sentinel value is sticky |
//! | contribution `name` | non-sentinel replaces, sentinel never overwrites |
//! | `displayName` | last write wins |
//!
//! The engine is pure: it returns the next state together with the list of
//! field-level changes. Each change carries the [`FieldOp`] of its rule, and
//! stores re-apply that rule against the value they hold when writing. A
//! change merged from a stale read therefore never lowers a maximum or
//! replaces a sticky value written by a concurrent job.

use std::fmt;

use serde_json::Value;

use warlog_core::BattleId;

use crate::fragment::{BattleFragment, ContributionFragment, Fragment, FragmentRejection};
use crate::model::{
    BattleOutcome, BattleRecord, PlayerContribution, PlayerInfo, TenantStats, UNKNOWN_MAP,
    UNKNOWN_PLAYER, UNKNOWN_VEHICLE,
};

/// Location of a field inside a tenant document, e.g. `battles.B1.duration`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path of a whole battle entry.
    pub fn battle(id: &BattleId) -> Self {
        Self::new(["battles", id.as_str()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// How a store combines an incoming value with the one it holds.
///
/// Every op writes the incoming value when the field is missing or null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// Replace the stored value.
    Set,
    /// Keep the larger number.
    Max,
    /// Replace only while the stored value is still the given sentinel.
    FillSentinel(&'static str),
    /// Seed a default; an existing value is never touched.
    Insert,
}

impl FieldOp {
    /// Stable name, used by stores that resolve ops server-side.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Max => "max",
            Self::FillSentinel(_) => "fill",
            Self::Insert => "insert",
        }
    }

    pub fn sentinel(&self) -> Option<&'static str> {
        match self {
            Self::FillSentinel(sentinel) => Some(*sentinel),
            _ => None,
        }
    }
}

/// A single field whose value changed during a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub path: FieldPath,
    pub value: Value,
    pub op: FieldOp,
}

impl FieldChange {
    pub fn new(path: FieldPath, value: impl Into<Value>, op: FieldOp) -> Self {
        Self {
            path,
            value: value.into(),
            op,
        }
    }

    /// Value to store given what the store currently holds at `path`.
    /// `None` means the stored value wins and nothing is written.
    pub fn resolve(&self, stored: Option<&Value>) -> Option<Value> {
        let stored = match stored {
            None | Some(Value::Null) => return Some(self.value.clone()),
            Some(stored) => stored,
        };
        let replace = match self.op {
            FieldOp::Set => *stored != self.value,
            FieldOp::Max => !numeric_at_least(stored, &self.value),
            FieldOp::FillSentinel(sentinel) => {
                stored.as_str() == Some(sentinel) && self.value.as_str() != Some(sentinel)
            }
            FieldOp::Insert => false,
        };
        replace.then(|| self.value.clone())
    }
}

// A non-numeric stored value is always replaced.
fn numeric_at_least(stored: &Value, incoming: &Value) -> bool {
    if let (Some(a), Some(b)) = (stored.as_i64(), incoming.as_i64()) {
        return a >= b;
    }
    if let (Some(a), Some(b)) = (stored.as_u64(), incoming.as_u64()) {
        return a >= b;
    }
    match (stored.as_f64(), incoming.as_f64()) {
        (Some(a), Some(b)) => a >= b,
        _ => false,
    }
}

/// Result of merging one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub stats: TenantStats,
    /// Fields whose stored value must change, in deterministic order.
    pub changes: Vec<FieldChange>,
    /// Entries of the fragment that were skipped as malformed.
    pub rejected: Vec<FragmentRejection>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Stateless merge engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Merge a raw JSON fragment into `existing`.
    pub fn merge(&self, existing: &TenantStats, incoming: &Value) -> MergeOutcome {
        self.merge_fragment(existing, Fragment::from_value(incoming))
    }

    /// Merge an already normalized fragment into `existing`.
    pub fn merge_fragment(&self, existing: &TenantStats, fragment: Fragment) -> MergeOutcome {
        let Fragment {
            players,
            battles,
            rejected,
        } = fragment;

        let mut stats = existing.clone();
        let mut changes = Vec::new();

        for update in players {
            let unchanged = stats
                .players
                .get(&update.id)
                .is_some_and(|info| info.display_name == update.display_name);
            if unchanged {
                continue;
            }
            changes.push(FieldChange::new(
                FieldPath::new(["players", update.id.as_str(), "displayName"]),
                update.display_name.clone(),
                FieldOp::Set,
            ));
            stats.players.insert(
                update.id,
                PlayerInfo {
                    display_name: update.display_name,
                },
            );
        }

        for incoming in battles {
            let before = stats.battles.get(&incoming.id).cloned();
            let mut after = before.clone().unwrap_or_default();
            merge_battle(&mut after, &incoming);
            diff_battle(
                &FieldPath::battle(&incoming.id),
                before.as_ref(),
                &after,
                &mut changes,
            );
            stats.battles.insert(incoming.id, after);
        }

        MergeOutcome {
            stats,
            changes,
            rejected,
        }
    }
}

fn merge_battle(record: &mut BattleRecord, incoming: &BattleFragment) {
    if let Some(start_time) = incoming.start_time {
        record.start_time = record.start_time.max(start_time);
    }
    if let Some(duration) = incoming.duration {
        record.duration = record.duration.max(duration);
    }
    if let Some(win) = incoming.win {
        if win.is_known() {
            record.win = win;
        }
    }
    keep_first_known(&mut record.map_name, incoming.map_name.as_deref(), UNKNOWN_MAP);

    for (player, contribution) in &incoming.players {
        let current = record.players.entry(player.clone()).or_default();
        merge_contribution(current, contribution);
    }
}

fn merge_contribution(current: &mut PlayerContribution, incoming: &ContributionFragment) {
    if let Some(name) = incoming.name.as_deref() {
        if name != UNKNOWN_PLAYER {
            current.name = name.to_string();
        }
    }
    if let Some(damage) = incoming.damage {
        current.damage = current.damage.max(damage);
    }
    if let Some(kills) = incoming.kills {
        current.kills = current.kills.max(kills);
    }
    if let Some(points) = incoming.points {
        current.points = current.points.max(points);
    }
    keep_first_known(&mut current.vehicle, incoming.vehicle.as_deref(), UNKNOWN_VEHICLE);
}

fn keep_first_known(current: &mut String, incoming: Option<&str>, sentinel: &str) {
    if current.as_str() != sentinel {
        return;
    }
    if let Some(value) = incoming {
        if value != sentinel {
            *current = value.to_string();
        }
    }
}

fn diff_battle(
    path: &FieldPath,
    before: Option<&BattleRecord>,
    after: &BattleRecord,
    changes: &mut Vec<FieldChange>,
) {
    if before.is_none_or(|b| b.start_time != after.start_time) {
        changes.push(FieldChange::new(path.child("startTime"), after.start_time, FieldOp::Max));
    }
    if before.is_none_or(|b| b.duration != after.duration) {
        changes.push(FieldChange::new(path.child("duration"), after.duration, FieldOp::Max));
    }
    if before.is_none_or(|b| b.win != after.win) {
        let op = if after.win.is_known() {
            FieldOp::Set
        } else {
            FieldOp::Insert
        };
        changes.push(FieldChange::new(path.child("win"), outcome_value(after.win), op));
    }
    if before.is_none_or(|b| b.map_name != after.map_name) {
        changes.push(FieldChange::new(
            path.child("mapName"),
            after.map_name.clone(),
            sticky_op(&after.map_name, UNKNOWN_MAP),
        ));
    }

    for (player, contribution) in &after.players {
        let previous = before.and_then(|b| b.players.get(player));
        diff_contribution(
            &path.child("players").child(player.as_str()),
            previous,
            contribution,
            changes,
        );
    }
}

fn diff_contribution(
    path: &FieldPath,
    before: Option<&PlayerContribution>,
    after: &PlayerContribution,
    changes: &mut Vec<FieldChange>,
) {
    if before.is_none_or(|b| b.name != after.name) {
        let op = if after.name == UNKNOWN_PLAYER {
            FieldOp::Insert
        } else {
            FieldOp::Set
        };
        changes.push(FieldChange::new(path.child("name"), after.name.clone(), op));
    }
    if before.is_none_or(|b| b.damage != after.damage) {
        changes.push(FieldChange::new(path.child("damage"), after.damage, FieldOp::Max));
    }
    if before.is_none_or(|b| b.kills != after.kills) {
        changes.push(FieldChange::new(path.child("kills"), after.kills, FieldOp::Max));
    }
    if before.is_none_or(|b| b.points != after.points) {
        changes.push(FieldChange::new(path.child("points"), after.points, FieldOp::Max));
    }
    if before.is_none_or(|b| b.vehicle != after.vehicle) {
        changes.push(FieldChange::new(
            path.child("vehicle"),
            after.vehicle.clone(),
            sticky_op(&after.vehicle, UNKNOWN_VEHICLE),
        ));
    }
}

/// Sentinels only seed; known values fill a sentinel and then stick.
fn sticky_op(value: &str, sentinel: &'static str) -> FieldOp {
    if value == sentinel {
        FieldOp::Insert
    } else {
        FieldOp::FillSentinel(sentinel)
    }
}

fn outcome_value(outcome: BattleOutcome) -> Value {
    Value::from(outcome.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    use warlog_core::PlayerId;

    fn bid(s: &str) -> BattleId {
        BattleId::parse(s).unwrap()
    }

    fn pid(s: &str) -> PlayerId {
        PlayerId::parse(s).unwrap()
    }

    fn apply(stats: &TenantStats, fragment: &Value) -> MergeOutcome {
        ReconciliationEngine::new().merge(stats, fragment)
    }

    #[test]
    fn out_of_order_reports_converge_on_best_known_values() {
        let first = json!({ "battles": { "B1": {
            "startTime": 100, "duration": 0, "win": -1, "mapName": "Unknown Map",
            "players": { "P1": { "name": "A", "damage": 50 } }
        }}});
        let second = json!({ "battles": { "B1": {
            "startTime": 90, "duration": 120, "win": 1, "mapName": "Berlin",
            "players": { "P1": { "damage": 30 }, "P2": { "name": "C", "damage": 20 } }
        }}});

        let stats = apply(&TenantStats::new(), &first).stats;
        let stats = apply(&stats, &second).stats;

        let b1 = stats.battle(&bid("B1")).unwrap();
        assert_eq!(b1.start_time, 100);
        assert_eq!(b1.duration, 120);
        assert_eq!(b1.win, BattleOutcome::Win);
        assert_eq!(b1.map_name, "Berlin");
        assert_eq!(b1.players[&pid("P1")].damage, 50.0);
        assert_eq!(b1.players[&pid("P1")].name, "A");
        assert_eq!(b1.players[&pid("P2")].damage, 20.0);
        assert_eq!(b1.players[&pid("P2")].name, "C");
    }

    #[test]
    fn new_battle_emits_every_seeded_field() {
        let outcome = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": { "duration": 5, "players": { "P1": {} } } } }),
        );

        let paths: Vec<String> = outcome.changes.iter().map(|c| c.path.to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "battles.B1.startTime",
                "battles.B1.duration",
                "battles.B1.win",
                "battles.B1.mapName",
                "battles.B1.players.P1.name",
                "battles.B1.players.P1.damage",
                "battles.B1.players.P1.kills",
                "battles.B1.players.P1.points",
                "battles.B1.players.P1.vehicle",
            ]
        );
        assert_eq!(outcome.changes[2].value, json!(-1));
        assert_eq!(outcome.changes[3].value, json!(UNKNOWN_MAP));

        // Seeded defaults never overwrite what a concurrent writer stored.
        let ops: Vec<FieldOp> = outcome.changes.iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                FieldOp::Max,
                FieldOp::Max,
                FieldOp::Insert,
                FieldOp::Insert,
                FieldOp::Insert,
                FieldOp::Max,
                FieldOp::Max,
                FieldOp::Max,
                FieldOp::Insert,
            ]
        );
    }

    #[test]
    fn changes_resolve_against_newer_stored_values() {
        let path = FieldPath::new(["battles", "B1", "duration"]);
        let max = FieldChange::new(path.clone(), 30u64, FieldOp::Max);
        assert_eq!(max.resolve(None), Some(json!(30)));
        assert_eq!(max.resolve(Some(&Value::Null)), Some(json!(30)));
        assert_eq!(max.resolve(Some(&json!(120))), None);
        assert_eq!(max.resolve(Some(&json!(10))), Some(json!(30)));
        assert_eq!(
            FieldChange::new(path.clone(), 40.5, FieldOp::Max).resolve(Some(&json!(40))),
            Some(json!(40.5))
        );

        let map = FieldChange::new(path.clone(), "Ensk", FieldOp::FillSentinel(UNKNOWN_MAP));
        assert_eq!(map.resolve(Some(&json!(UNKNOWN_MAP))), Some(json!("Ensk")));
        assert_eq!(map.resolve(Some(&json!("Berlin"))), None);

        let seed = FieldChange::new(path.clone(), UNKNOWN_MAP, FieldOp::Insert);
        assert_eq!(seed.resolve(Some(&json!("Berlin"))), None);
        assert_eq!(seed.resolve(None), Some(json!(UNKNOWN_MAP)));

        let set = FieldChange::new(path, 1, FieldOp::Set);
        assert_eq!(set.resolve(Some(&json!(0))), Some(json!(1)));
        assert_eq!(set.resolve(Some(&json!(1))), None);
    }

    #[test]
    fn only_changed_fields_are_reported() {
        let stats = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": { "duration": 5, "mapName": "Ensk" } } }),
        )
        .stats;

        let outcome = apply(
            &stats,
            &json!({ "battles": { "B1": { "duration": 9, "mapName": "Berlin", "win": -1 } } }),
        );
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].path.to_string(), "battles.B1.duration");
        assert_eq!(outcome.changes[0].value, json!(9));
        assert_eq!(outcome.stats.battle(&bid("B1")).unwrap().map_name, "Ensk");
    }

    #[test]
    fn concrete_outcome_replaces_but_unknown_never_does() {
        let stats = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": { "win": 0 } } }),
        )
        .stats;
        let stats = apply(&stats, &json!({ "battles": { "B1": { "win": -1 } } })).stats;
        assert_eq!(stats.battle(&bid("B1")).unwrap().win, BattleOutcome::Loss);

        let stats = apply(&stats, &json!({ "battles": { "B1": { "win": 1 } } })).stats;
        assert_eq!(stats.battle(&bid("B1")).unwrap().win, BattleOutcome::Win);
    }

    #[test]
    fn vehicle_is_sticky_but_name_follows_latest_report() {
        let stats = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": { "players": { "P1": { "name": "Old", "vehicle": "T-34" } } } } }),
        )
        .stats;
        let stats = apply(
            &stats,
            &json!({ "battles": { "B1": { "players": { "P1": { "name": "New", "vehicle": "IS-2" } } } } }),
        )
        .stats;
        let stats = apply(
            &stats,
            &json!({ "battles": { "B1": { "players": { "P1": { "name": "Unknown Player" } } } } }),
        )
        .stats;

        let p1 = &stats.battle(&bid("B1")).unwrap().players[&pid("P1")];
        assert_eq!(p1.vehicle, "T-34");
        assert_eq!(p1.name, "New");
    }

    #[test]
    fn nickname_changes_overwrite_and_repeat_is_noop() {
        let stats = apply(&TenantStats::new(), &json!({ "players": { "P1": "Alpha" } })).stats;
        let renamed = apply(&stats, &json!({ "players": { "P1": { "displayName": "Omega" } } }));
        assert!(renamed.changed());
        assert_eq!(renamed.stats.players[&pid("P1")].display_name, "Omega");
        assert_eq!(
            renamed.changes[0].path.to_string(),
            "players.P1.displayName"
        );

        let repeat = apply(&renamed.stats, &json!({ "players": { "P1": "Omega" } }));
        assert!(!repeat.changed());
    }

    #[test]
    fn malformed_battle_is_skipped_and_not_marked_changed() {
        let outcome = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": 42, "B2": { "duration": 3 } } }),
        );
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.stats.battle(&bid("B1")).is_none());
        assert!(outcome.stats.battle(&bid("B2")).is_some());

        let only_bad = apply(&TenantStats::new(), &json!({ "battles": { "B1": "junk" } }));
        assert!(!only_bad.changed());
        assert!(only_bad.stats.is_empty());
    }

    #[test]
    fn existing_battles_are_left_untouched_by_unrelated_fragments() {
        let stats = apply(
            &TenantStats::new(),
            &json!({ "battles": { "B1": { "duration": 30 } } }),
        )
        .stats;
        let outcome = apply(&stats, &json!({ "battles": { "B2": { "duration": 10 } } }));
        assert_eq!(outcome.stats.battle(&bid("B1")), stats.battle(&bid("B1")));
        assert!(outcome
            .changes
            .iter()
            .all(|c| c.path.segments()[1] == "B2"));
    }

    // Generated fragments agree on each battle's facts (map, outcome, vehicle
    // and player names), differing only in what each report knows.
    const MAPS: [&str; 3] = ["Berlin", "Prokhorovka", "Ensk"];
    const OUTCOMES: [i64; 3] = [1, 0, 1];
    const NAMES: [&str; 3] = ["Alpha", "Bravo", "Charlie"];
    const VEHICLES: [&str; 2] = ["T-34", "Tiger"];

    type ContributionShape = (usize, Option<u32>, Option<u32>, Option<u32>, bool, bool);
    type BattleShape = (
        usize,
        Option<i64>,
        Option<u64>,
        bool,
        bool,
        Vec<ContributionShape>,
    );

    fn numeric(value: u32, wrap: bool) -> Value {
        if wrap {
            json!({ "wideDouble": value.to_string() })
        } else {
            json!(value)
        }
    }

    fn contribution_strategy() -> impl Strategy<Value = ContributionShape> {
        (
            0..NAMES.len(),
            prop::option::of(0u32..5_000),
            prop::option::of(0u32..20),
            prop::option::of(0u32..3_000),
            any::<bool>(),
            any::<bool>(),
        )
    }

    fn battle_strategy() -> impl Strategy<Value = BattleShape> {
        (
            0..MAPS.len(),
            prop::option::of(0i64..10_000),
            prop::option::of(0u64..900),
            any::<bool>(),
            any::<bool>(),
            prop::collection::vec(contribution_strategy(), 0..3),
        )
    }

    fn build_fragment(battles: Vec<BattleShape>, nicknames: Vec<usize>) -> Value {
        let mut battle_map = serde_json::Map::new();
        for (b, start_time, duration, knows_win, knows_map, contributions) in battles {
            let mut battle = serde_json::Map::new();
            if let Some(start_time) = start_time {
                battle.insert("startTime".into(), json!({ "wideInt": start_time.to_string() }));
            }
            if let Some(duration) = duration {
                battle.insert("duration".into(), json!(duration));
            }
            battle.insert(
                "win".into(),
                json!(if knows_win { OUTCOMES[b] } else { -1 }),
            );
            battle.insert(
                "mapName".into(),
                json!(if knows_map { MAPS[b] } else { UNKNOWN_MAP }),
            );

            let mut players = serde_json::Map::new();
            for (p, damage, kills, points, knows_name, knows_vehicle) in contributions {
                let mut c = serde_json::Map::new();
                if knows_name {
                    c.insert("name".into(), json!(NAMES[p]));
                }
                if knows_vehicle {
                    c.insert("vehicle".into(), json!(VEHICLES[(b + p) % VEHICLES.len()]));
                }
                if let Some(damage) = damage {
                    c.insert("damage".into(), numeric(damage, damage % 3 == 0));
                }
                if let Some(kills) = kills {
                    c.insert("kills".into(), json!(kills));
                }
                if let Some(points) = points {
                    c.insert("points".into(), numeric(points, points % 2 == 0));
                }
                let entry = if p == 0 {
                    json!({ "_id": { "_id": Value::Object(c) } })
                } else {
                    Value::Object(c)
                };
                players.insert(format!("P{p}"), entry);
            }
            battle.insert("players".into(), Value::Object(players));
            battle_map.insert(format!("B{b}"), Value::Object(battle));
        }

        let mut nickname_map = serde_json::Map::new();
        for p in nicknames {
            nickname_map.insert(format!("P{p}"), json!(NAMES[p]));
        }

        json!({ "battles": Value::Object(battle_map), "players": Value::Object(nickname_map) })
    }

    fn fragment_strategy() -> impl Strategy<Value = Value> {
        (
            prop::collection::vec(battle_strategy(), 0..4),
            prop::collection::vec(0..NAMES.len(), 0..3),
        )
            .prop_map(|(battles, nicknames)| build_fragment(battles, nicknames))
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: re-applying a fragment is a no-op.
        #[test]
        fn merge_is_idempotent(seed in fragment_strategy(), fragment in fragment_strategy()) {
            let base = apply(&TenantStats::new(), &seed).stats;
            let once = apply(&base, &fragment);
            let twice = apply(&once.stats, &fragment);

            prop_assert!(!twice.changed());
            prop_assert_eq!(twice.stats, once.stats);
        }

        /// Property: the order in which two fragments arrive does not matter.
        #[test]
        fn merge_is_order_insensitive(
            seed in fragment_strategy(),
            f1 in fragment_strategy(),
            f2 in fragment_strategy(),
        ) {
            let base = apply(&TenantStats::new(), &seed).stats;
            let one_then_two = apply(&apply(&base, &f1).stats, &f2).stats;
            let two_then_one = apply(&apply(&base, &f2).stats, &f1).stats;

            prop_assert_eq!(one_then_two, two_then_one);
        }

        /// Property: start time and duration never decrease.
        #[test]
        fn merge_is_monotonic(seed in fragment_strategy(), fragment in fragment_strategy()) {
            let base = apply(&TenantStats::new(), &seed).stats;
            let next = apply(&base, &fragment).stats;

            for (id, before) in &base.battles {
                let after = next.battle(id).expect("merge never removes battles");
                prop_assert!(after.duration >= before.duration);
                prop_assert!(after.start_time >= before.start_time);
                for (player, contribution) in &before.players {
                    let merged = &after.players[player];
                    prop_assert!(merged.damage >= contribution.damage);
                    prop_assert!(merged.kills >= contribution.kills);
                    prop_assert!(merged.points >= contribution.points);
                }
            }
        }

        /// Property: a known map name survives sentinel and conflicting reports.
        #[test]
        fn known_map_name_is_sticky(
            seed in fragment_strategy(),
            other in "[A-Za-z ]{1,12}",
            use_sentinel in any::<bool>(),
        ) {
            let base = apply(&TenantStats::new(), &seed).stats;
            let incoming = if use_sentinel { UNKNOWN_MAP.to_string() } else { other };

            for (id, before) in &base.battles {
                if before.map_name == UNKNOWN_MAP {
                    continue;
                }
                let mut battles = serde_json::Map::new();
                battles.insert(id.to_string(), json!({ "mapName": incoming.clone() }));
                let fragment = json!({ "battles": Value::Object(battles) });
                let after = apply(&base, &fragment);
                prop_assert_eq!(&after.stats.battle(id).unwrap().map_name, &before.map_name);
                prop_assert!(!after.changed());
            }
        }
    }
}
