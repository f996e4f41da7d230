//! Per-key write batching.
//!
//! Small submissions to the same key are buffered and executed as one
//! queued job. A batch flushes when it holds `max_items` entries or when
//! `max_delay` elapsed since its first entry, whichever comes first.
//! Entries run one after another, each isolated from its siblings, and each
//! fulfils its own [`JobHandle`](super::JobHandle).

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error};

use warlog_core::TenantKey;

use super::task::{BoxFuture, ErasedJob};
use super::types::{JobError, Tally};

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_items: usize,
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_delay: Duration::from_millis(100),
        }
    }
}

/// Summary of one executed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub key: TenantKey,
    pub succeeded: usize,
    pub failed: usize,
}

/// Invoked once per executed batch.
pub type BatchListener = Arc<dyn Fn(&BatchReport) + Send + Sync>;

/// A flushed batch, queued as a single job.
pub(crate) struct BatchJob {
    key: TenantKey,
    entries: Vec<Box<dyn ErasedJob>>,
    listener: Option<BatchListener>,
}

impl BatchJob {
    pub(crate) fn new(
        key: TenantKey,
        entries: Vec<Box<dyn ErasedJob>>,
        listener: Option<BatchListener>,
    ) -> Self {
        Self {
            key,
            entries,
            listener,
        }
    }
}

impl ErasedJob for BatchJob {
    fn weight(&self) -> u64 {
        self.entries.len() as u64
    }

    fn run(self: Box<Self>, timeout: Option<Duration>) -> BoxFuture<'static, Tally> {
        let BatchJob {
            key,
            entries,
            listener,
        } = *self;

        Box::pin(async move {
            let size = entries.len();
            let mut tally = Tally::default();
            for entry in entries {
                tally += entry.run(timeout).await;
            }
            debug!(key = %key, size, succeeded = tally.succeeded, failed = tally.failed, "batch executed");

            if let Some(listener) = listener {
                let report = BatchReport {
                    key,
                    succeeded: tally.succeeded as usize,
                    failed: tally.failed as usize,
                };
                if catch_unwind(AssertUnwindSafe(|| listener(&report))).is_err() {
                    error!(key = %report.key, "batch listener panicked");
                }
            }
            tally
        })
    }

    fn reject(self: Box<Self>, error: JobError) {
        for entry in self.entries {
            entry.reject(error.clone());
        }
    }
}

/// Result of buffering one entry.
pub(crate) enum Buffered {
    /// First entry of a new batch; its delay timer must be armed.
    Opened(u64),
    /// Added to an already open batch.
    Appended,
    /// The batch reached `max_items` and was closed; flush these entries.
    Full(Vec<Box<dyn ErasedJob>>),
}

struct OpenBatch {
    id: u64,
    entries: Vec<Box<dyn ErasedJob>>,
}

#[derive(Default)]
struct BatcherState {
    next_id: u64,
    open: HashMap<TenantKey, OpenBatch>,
}

/// Open batches of every key.
pub(crate) struct Batcher {
    config: BatchConfig,
    state: Mutex<BatcherState>,
}

impl Batcher {
    pub(crate) fn new(config: BatchConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BatcherState::default()),
        }
    }

    pub(crate) fn config(&self) -> BatchConfig {
        self.config
    }

    pub(crate) fn push(&self, key: &TenantKey, entry: Box<dyn ErasedJob>) -> Buffered {
        let mut state = self.lock();
        let max_items = self.config.max_items.max(1);

        let id = state.next_id;
        let batch = state.open.entry(key.clone()).or_insert_with(|| OpenBatch {
            id,
            entries: Vec::new(),
        });
        let opened = batch.entries.is_empty();
        batch.entries.push(entry);

        if batch.entries.len() >= max_items {
            let entries = std::mem::take(&mut batch.entries);
            state.open.remove(key);
            if opened {
                state.next_id += 1;
            }
            return Buffered::Full(entries);
        }

        if opened {
            state.next_id += 1;
            Buffered::Opened(id)
        } else {
            Buffered::Appended
        }
    }

    /// Close batch `id` of `key` if it is still open.
    pub(crate) fn take(&self, key: &TenantKey, id: u64) -> Option<Vec<Box<dyn ErasedJob>>> {
        let mut state = self.lock();
        if state.open.get(key).is_some_and(|batch| batch.id == id) {
            state.open.remove(key).map(|batch| batch.entries)
        } else {
            None
        }
    }

    /// Close every open batch.
    pub(crate) fn take_all(&self) -> Vec<(TenantKey, Vec<Box<dyn ErasedJob>>)> {
        self.lock()
            .open
            .drain()
            .map(|(key, batch)| (key, batch.entries))
            .collect()
    }

    /// Number of entries currently buffered.
    pub(crate) fn buffered(&self) -> usize {
        self.lock().open.values().map(|batch| batch.entries.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, BatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
