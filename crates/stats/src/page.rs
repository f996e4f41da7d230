//! Read-side pagination over a tenant's battles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use warlog_core::{BattleId, PlayerId};

use crate::model::{BattleRecord, PlayerInfo, TenantStats};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 200;
const DEFAULT_PAGE_SIZE: usize = 20;

/// Page selection (1-based page number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Clamp the request into range: page >= 1, 1 <= size <= [`MAX_PAGE_SIZE`].
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// A battle together with its id, as listed on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedBattle {
    pub id: BattleId,
    #[serde(flatten)]
    pub record: BattleRecord,
}

/// One page of a tenant store, newest battles first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsPage {
    pub page: usize,
    pub page_size: usize,
    pub total_battles: usize,
    pub has_more: bool,
    pub battles: Vec<PagedBattle>,
    /// Directory entries of players appearing in this page's battles.
    pub players: BTreeMap<PlayerId, PlayerInfo>,
}

impl StatsPage {
    /// Cut one page out of `stats`.
    pub fn from_stats(stats: &TenantStats, request: PageRequest) -> Self {
        let request = PageRequest::new(request.page, request.page_size);
        let ordered = stats.battles_by_recency();
        let total_battles = ordered.len();

        let battles: Vec<PagedBattle> = ordered
            .into_iter()
            .skip(request.offset())
            .take(request.page_size)
            .map(|(id, record)| PagedBattle {
                id: id.clone(),
                record: record.clone(),
            })
            .collect();

        let players = battles
            .iter()
            .flat_map(|b| b.record.players.keys())
            .filter_map(|player| {
                stats
                    .players
                    .get(player)
                    .map(|info| (player.clone(), info.clone()))
            })
            .collect();

        let has_more = request.offset().saturating_add(battles.len()) < total_battles;

        Self {
            page: request.page,
            page_size: request.page_size,
            total_battles,
            has_more,
            battles,
            players,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlayerContribution;

    fn stats_with(battles: &[(&str, i64, &[&str])]) -> TenantStats {
        let mut stats = TenantStats::new();
        for (id, start, players) in battles {
            let mut record = BattleRecord {
                start_time: *start,
                ..Default::default()
            };
            for p in *players {
                let player = PlayerId::parse(*p).unwrap();
                record
                    .players
                    .insert(player.clone(), PlayerContribution::default());
                stats.players.insert(
                    player,
                    PlayerInfo {
                        display_name: format!("nick-{p}"),
                    },
                );
            }
            stats.battles.insert(BattleId::parse(*id).unwrap(), record);
        }
        stats
    }

    #[test]
    fn pages_are_sorted_newest_first() {
        let stats = stats_with(&[
            ("B1", 10, &["P1"]),
            ("B2", 30, &["P2"]),
            ("B3", 20, &["P3"]),
        ]);

        let first = StatsPage::from_stats(&stats, PageRequest::new(1, 2));
        let ids: Vec<&str> = first.battles.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["B2", "B3"]);
        assert_eq!(first.total_battles, 3);
        assert!(first.has_more);

        let second = StatsPage::from_stats(&stats, PageRequest::new(2, 2));
        let ids: Vec<&str> = second.battles.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["B1"]);
        assert!(!second.has_more);
    }

    #[test]
    fn page_players_are_limited_to_listed_battles() {
        let stats = stats_with(&[("B1", 10, &["P1"]), ("B2", 30, &["P2", "P3"])]);

        let page = StatsPage::from_stats(&stats, PageRequest::new(1, 1));
        let players: Vec<&str> = page.players.keys().map(|p| p.as_str()).collect();
        assert_eq!(players, vec!["P2", "P3"]);
    }

    #[test]
    fn out_of_range_requests_are_clamped() {
        let stats = stats_with(&[("B1", 10, &[])]);

        let page = StatsPage::from_stats(&stats, PageRequest::new(0, 0));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.battles.len(), 1);

        let beyond = StatsPage::from_stats(&stats, PageRequest::new(9, 10_000));
        assert_eq!(beyond.page_size, MAX_PAGE_SIZE);
        assert!(beyond.battles.is_empty());
        assert!(!beyond.has_more);
    }

    #[test]
    fn paged_battle_serializes_flat() {
        let stats = stats_with(&[("B1", 10, &[])]);
        let page = StatsPage::from_stats(&stats, PageRequest::default());
        let json = serde_json::to_value(&page).unwrap();

        assert_eq!(json["battles"][0]["id"], "B1");
        assert_eq!(json["battles"][0]["startTime"], 10);
        assert_eq!(json["totalBattles"], 1);
    }
}
