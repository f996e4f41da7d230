//! Stats ingestion service.
//!
//! Entry point of the write path: fragments are admitted into the queue of
//! their tenant key, merged against the stored document and persisted as
//! field-level upserts. Every persisted change is announced on the notifier.
//! Reads go straight to the store and are never queued.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use warlog_core::{BattleId, TenantKey};
use warlog_events::{EventBus, Notification};
use warlog_stats::{FieldPath, PageRequest, ReconciliationEngine, StatsPage, TenantStats};

use crate::config::IngestConfig;
use crate::jobs::{
    BatchReport, JobError, JobHandle, Priority, QueueManager, QueueStats, ShutdownReport,
    SubmitOptions,
};
use crate::read_model::{StatsStore, StoreError};

/// Result of one ingested fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    /// Whether the stored document changed.
    pub changed: bool,
    pub changed_fields: usize,
    /// Entries of the fragment skipped as malformed.
    pub rejected: usize,
}

/// Observability snapshot of the write path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub pending_by_key: BTreeMap<String, usize>,
    pub in_flight_by_key: BTreeMap<String, usize>,
    pub default_queue: QueueStats,
    /// Entries waiting in open batches.
    pub buffered: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
}

struct IngestInner<S, B> {
    store: S,
    notifier: B,
    engine: ReconciliationEngine,
    queues: QueueManager,
    options: SubmitOptions,
    /// Keys changed by batched entries since their last notification.
    dirty: Mutex<HashSet<TenantKey>>,
}

/// Write path for tenant stats.
///
/// Cloning is cheap; clones share the same queues, store and notifier.
pub struct IngestService<S, B> {
    inner: Arc<IngestInner<S, B>>,
}

impl<S, B> Clone for IngestService<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, B> IngestService<S, B>
where
    S: StatsStore + 'static,
    B: EventBus<Notification> + 'static,
{
    /// Build a service on top of an existing queue manager.
    ///
    /// Registers the manager's batch listener; a manager should back only
    /// one service.
    pub fn new(store: S, notifier: B, queues: QueueManager, options: SubmitOptions) -> Self {
        let inner = Arc::new(IngestInner {
            store,
            notifier,
            engine: ReconciliationEngine::new(),
            queues,
            options,
            dirty: Mutex::new(HashSet::new()),
        });

        let weak: Weak<IngestInner<S, B>> = Arc::downgrade(&inner);
        inner.queues.set_batch_listener(Arc::new(move |report: &BatchReport| {
            if let Some(inner) = weak.upgrade() {
                inner.on_batch(report);
            }
        }));

        Self { inner }
    }

    pub fn from_config(store: S, notifier: B, config: &IngestConfig) -> Self {
        let queues = QueueManager::new(config.manager_config());
        Self::new(store, notifier, queues, config.submit_options())
    }

    pub fn queues(&self) -> &QueueManager {
        &self.inner.queues
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn notifier(&self) -> &B {
        &self.inner.notifier
    }

    /// Queue `fragment` for `key`.
    ///
    /// Fails fast with `QueueFull` when the key's queue is at its ceiling;
    /// the caller should retry later. The handle resolves once the fragment
    /// has been merged and persisted (or finally failed).
    pub fn submit(
        &self,
        key: &TenantKey,
        fragment: Value,
        priority: Priority,
    ) -> Result<JobHandle<MergeSummary>, JobError> {
        self.inner.queues.ensure_capacity(Some(key))?;

        let inner = self.inner.clone();
        let job_key = key.clone();
        let fragment = Arc::new(fragment);
        self.inner.queues.submit_with_retry(
            Some(key),
            self.inner.options.with_priority(priority),
            move || {
                let inner = inner.clone();
                let key = job_key.clone();
                let fragment = fragment.clone();
                async move {
                    let summary = inner.ingest(&key, &fragment).await?;
                    if summary.changed {
                        inner.notify(Notification::changed(key));
                    }
                    Ok(summary)
                }
            },
        )
    }

    /// Queue `fragment` for `key` through the batching layer.
    ///
    /// Fragments of one flushed batch produce at most one `Changed`
    /// notification.
    pub fn submit_batched(
        &self,
        key: &TenantKey,
        fragment: Value,
    ) -> Result<JobHandle<MergeSummary>, JobError> {
        let inner = self.inner.clone();
        let job_key = key.clone();
        let fragment = Arc::new(fragment);
        self.inner
            .queues
            .submit_batched(key, self.inner.options, move || {
                let inner = inner.clone();
                let key = job_key.clone();
                let fragment = fragment.clone();
                async move {
                    let summary = inner.ingest(&key, &fragment).await?;
                    if summary.changed {
                        inner.mark_dirty(key);
                    }
                    Ok(summary)
                }
            })
    }

    /// Current document of `key`; empty if nothing was ingested yet.
    pub async fn get_store(&self, key: &TenantKey) -> Result<TenantStats, StoreError> {
        Ok(self.inner.store.find(key).await?.unwrap_or_default())
    }

    /// One page of `key`'s battles, most recent first. `page` is 1-based.
    pub async fn get_page(
        &self,
        key: &TenantKey,
        page: usize,
        page_size: usize,
    ) -> Result<StatsPage, StoreError> {
        let stats = self.get_store(key).await?;
        Ok(StatsPage::from_stats(&stats, PageRequest::new(page, page_size)))
    }

    /// Remove the whole document of `key`. Resolves to whether it existed.
    pub fn clear(&self, key: &TenantKey) -> Result<JobHandle<bool>, JobError> {
        let inner = self.inner.clone();
        let job_key = key.clone();
        self.inner.queues.submit_critical(Some(key), move || {
            let inner = inner.clone();
            let key = job_key.clone();
            async move {
                let existed = inner.store.delete(&key).await?;
                info!(key = %key, existed, "stats cleared");
                inner.notify(Notification::cleared(key));
                Ok(existed)
            }
        })
    }

    /// Remove one battle of `key`. Resolves to whether it existed.
    pub fn delete_battle(
        &self,
        key: &TenantKey,
        battle_id: &BattleId,
    ) -> Result<JobHandle<bool>, JobError> {
        let inner = self.inner.clone();
        let job_key = key.clone();
        let battle_id = battle_id.clone();
        self.inner.queues.submit_critical(Some(key), move || {
            let inner = inner.clone();
            let key = job_key.clone();
            let battle_id = battle_id.clone();
            async move {
                let existed = inner
                    .store
                    .unset(&key, &FieldPath::battle(&battle_id))
                    .await?;
                info!(key = %key, battle_id = %battle_id, existed, "battle deleted");
                inner.notify(Notification::battle_deleted(key, battle_id));
                Ok(existed)
            }
        })
    }

    /// Remove every document. Runs on the default queue and resolves to the
    /// number of documents removed.
    pub fn drop_all(&self) -> Result<JobHandle<u64>, JobError> {
        let inner = self.inner.clone();
        self.inner.queues.submit_critical(None, move || {
            let inner = inner.clone();
            async move {
                let removed = inner.store.drop_all().await?;
                info!(removed, "all stats dropped");
                inner.notify(Notification::all_cleared());
                Ok(removed)
            }
        })
    }

    pub fn stats(&self) -> IngestStats {
        let stats = self.inner.queues.stats();
        IngestStats {
            pending_by_key: stats.pending_by_key(),
            in_flight_by_key: stats.in_flight_by_key(),
            default_queue: stats.default_queue,
            buffered: stats.buffered,
            total_accepted: stats.totals.accepted,
            total_rejected: stats.totals.rejected,
            total_succeeded: stats.totals.succeeded,
            total_failed: stats.totals.failed,
        }
    }

    /// Stop admissions and drain every queue.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.queues.shutdown().await
    }
}

impl<S, B> IngestInner<S, B>
where
    S: StatsStore,
    B: EventBus<Notification>,
{
    /// Read, merge and persist one fragment.
    async fn ingest(&self, key: &TenantKey, fragment: &Value) -> Result<MergeSummary, JobError> {
        let existing = self.store.find(key).await?.unwrap_or_default();
        let outcome = self.engine.merge(&existing, fragment);

        for rejection in &outcome.rejected {
            warn!(key = %key, path = %rejection.path, error = %rejection.error, "fragment entry rejected");
        }
        if outcome.changed() {
            self.store.apply(key, &outcome.changes).await?;
        }

        let summary = MergeSummary {
            changed: outcome.changed(),
            changed_fields: outcome.changes.len(),
            rejected: outcome.rejected.len(),
        };
        debug!(
            key = %key,
            changed_fields = summary.changed_fields,
            rejected = summary.rejected,
            "fragment merged"
        );
        Ok(summary)
    }

    fn notify(&self, notification: Notification) {
        let event_type = notification.event.event_type();
        if let Err(error) = self.notifier.publish(notification) {
            warn!(event_type, error = %error, "notification publish failed");
        }
    }

    fn mark_dirty(&self, key: TenantKey) {
        self.dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    fn on_batch(&self, report: &BatchReport) {
        let changed = self
            .dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&report.key);
        if changed {
            self.notify(Notification::changed(report.key.clone()));
        }
    }
}
