//! Battle statistics domain (pure).
//!
//! This crate contains the per-tenant stats model and the rules that fold
//! incoming fragments into it, implemented as deterministic logic (no IO,
//! no async, no storage).

pub mod fragment;
pub mod model;
pub mod page;
pub mod reconcile;

pub use fragment::{
    BattleFragment, ContributionFragment, Fragment, FragmentRejection, PlayerNameUpdate,
};
pub use model::{
    BattleOutcome, BattleRecord, PlayerContribution, PlayerInfo, TenantStats, UNKNOWN_MAP,
    UNKNOWN_PLAYER, UNKNOWN_VEHICLE,
};
pub use page::{PageRequest, PagedBattle, StatsPage};
pub use reconcile::{FieldChange, FieldOp, FieldPath, MergeOutcome, ReconciliationEngine};
