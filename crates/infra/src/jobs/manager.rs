//! Owns the execution lanes of one worker process.
//!
//! One shared default queue serves keyless (administrative) work. Every
//! tenant key gets its own [`PerKeyQueue`], created on first use with half
//! the default concurrency and rate budget, and evicted once it stayed idle
//! for the grace period. Queue state is per process; nothing here is shared
//! across workers.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use warlog_core::TenantKey;

use super::batch::{BatchConfig, BatchJob, BatchListener, Batcher, Buffered};
use super::queue::{IdleHook, PerKeyQueue, QueueConfig};
use super::retry::RetryRunner;
use super::task::{ErasedJob, JobHandle, PendingJob};
use super::types::{
    CounterSnapshot, JobCounters, JobError, PRIORITY_CRITICAL, PRIORITY_NORMAL, QueueStats,
    RetryPolicy, SubmitOptions,
};

/// Name of the shared keyless queue.
pub const DEFAULT_QUEUE: &str = "default";

/// Limits of every queue owned by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub default_queue: QueueConfig,
    /// Template for per-key queues.
    pub key_queue: QueueConfig,
    pub batch: BatchConfig,
    /// Retry settings used by critical submissions.
    pub retry: SubmitOptions,
    /// Per-queue drain deadline during shutdown.
    pub drain_deadline: Duration,
    /// Overall shutdown deadline.
    pub shutdown_deadline: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let default_queue = QueueConfig::default();
        let key_queue = QueueConfig {
            max_pending: 50,
            idle_grace: Some(Duration::from_secs(60)),
            ..default_queue.halved()
        };
        Self {
            default_queue,
            key_queue,
            batch: BatchConfig::default(),
            retry: SubmitOptions::default(),
            drain_deadline: Duration::from_secs(10),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

/// Snapshot of every queue plus process-lifetime counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ManagerStats {
    pub default_queue: QueueStats,
    pub queues: BTreeMap<String, QueueStats>,
    /// Entries waiting in open batches.
    pub buffered: usize,
    pub totals: CounterSnapshot,
}

impl ManagerStats {
    pub fn pending_by_key(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(key, stats)| (key.clone(), stats.pending))
            .collect()
    }

    pub fn in_flight_by_key(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(key, stats)| (key.clone(), stats.in_flight))
            .collect()
    }
}

/// Outcome of [`QueueManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShutdownReport {
    /// Queues that finished all their work before their deadline.
    pub drained: usize,
    /// Results discarded because they never started.
    pub discarded: usize,
    /// Some deadline elapsed.
    pub timed_out: bool,
}

struct ManagerInner {
    config: ManagerConfig,
    counters: Arc<JobCounters>,
    default_queue: PerKeyQueue,
    queues: Mutex<HashMap<TenantKey, PerKeyQueue>>,
    batcher: Batcher,
    listener: Mutex<Option<BatchListener>>,
    closing: AtomicBool,
    /// Set once shutdown has collected the queue table; no queue is created
    /// after that.
    sealed: AtomicBool,
}

/// Per-process table of execution lanes.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl QueueManager {
    pub fn new(config: ManagerConfig) -> Self {
        let counters = Arc::new(JobCounters::default());
        let default_queue = PerKeyQueue::with_counters(
            DEFAULT_QUEUE,
            config.default_queue.clone(),
            counters.clone(),
            None,
        );
        let batcher = Batcher::new(config.batch);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                counters,
                default_queue,
                queues: Mutex::new(HashMap::new()),
                batcher,
                listener: Mutex::new(None),
                closing: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Run `task` on the queue of `key` (the default queue when `None`),
    /// retrying retryable failures per `options`.
    pub fn submit_with_retry<T, F, Fut>(
        &self,
        key: Option<&TenantKey>,
        options: SubmitOptions,
        task: F,
    ) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let runner = RetryRunner::new(RetryPolicy::from_options(&options));
        let (job, handle) = PendingJob::new(async move { runner.run(task).await });
        self.submit_job(key, Box::new(job), options.priority)?;
        Ok(handle)
    }

    /// Like [`submit_with_retry`](Self::submit_with_retry) at maximum
    /// priority. Still bound by the ceiling, concurrency and rate limits.
    pub fn submit_critical<T, F, Fut>(
        &self,
        key: Option<&TenantKey>,
        task: F,
    ) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let options = self.inner.config.retry.with_priority(PRIORITY_CRITICAL);
        self.submit_with_retry(key, options, task)
    }

    /// Buffer `task` in the open batch of `key`.
    ///
    /// The returned handle resolves with this task's own result once the
    /// batch it belongs to has executed it.
    pub fn submit_batched<T, F, Fut>(
        &self,
        key: &TenantKey,
        options: SubmitOptions,
        task: F,
    ) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        if self.is_closing() {
            self.inner.counters.record_rejected(1);
            return Err(JobError::QueueClosed {
                queue: key.to_string(),
            });
        }
        self.ensure_capacity(Some(key))?;

        let runner = RetryRunner::new(RetryPolicy::from_options(&options));
        let (job, handle) = PendingJob::new(async move { runner.run(task).await });

        match self.inner.batcher.push(key, Box::new(job)) {
            Buffered::Opened(id) => self.arm_batch_timer(key.clone(), id),
            Buffered::Appended => {}
            Buffered::Full(entries) => self.flush_batch(key.clone(), entries),
        }
        Ok(handle)
    }

    /// Register the callback invoked once per executed batch.
    pub fn set_batch_listener(&self, listener: BatchListener) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Whether a submission for `key` would be refused with `QueueFull`.
    ///
    /// A key without a live queue is never full.
    pub fn is_queue_full(&self, key: Option<&TenantKey>) -> bool {
        match key {
            None => self.inner.default_queue.is_full(),
            Some(key) => self.lock_queues().get(key).is_some_and(PerKeyQueue::is_full),
        }
    }

    /// Refuse with `QueueFull` when the queue of `key` is at its ceiling,
    /// before any job is built.
    pub fn ensure_capacity(&self, key: Option<&TenantKey>) -> Result<(), JobError> {
        if !self.is_queue_full(key) {
            return Ok(());
        }
        self.inner.counters.record_rejected(1);

        let (queue, capacity) = match key {
            Some(key) => (key.to_string(), self.key_capacity()),
            None => (
                DEFAULT_QUEUE.to_string(),
                self.inner.config.default_queue.max_pending,
            ),
        };
        warn!(queue = %queue, capacity, "queue full, submission rejected");
        Err(JobError::QueueFull { queue, capacity })
    }

    /// Pending ceiling of per-key queues.
    pub fn key_capacity(&self) -> usize {
        self.inner.config.key_queue.max_pending
    }

    /// The live queue of `key`, if any.
    pub fn queue(&self, key: &TenantKey) -> Option<PerKeyQueue> {
        self.lock_queues().get(key).cloned()
    }

    pub fn default_queue(&self) -> &PerKeyQueue {
        &self.inner.default_queue
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ManagerStats {
        let queues = self
            .lock_queues()
            .iter()
            .map(|(key, queue)| (key.to_string(), queue.stats()))
            .collect();

        ManagerStats {
            default_queue: self.inner.default_queue.stats(),
            queues,
            buffered: self.inner.batcher.buffered(),
            totals: self.inner.counters.snapshot(),
        }
    }

    /// Stop admissions, flush open batches and wait for every queue to
    /// drain. Never waits longer than the configured shutdown deadline.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            debug!("shutdown requested again");
        }
        info!("queue manager shutting down");

        for (key, entries) in self.inner.batcher.take_all() {
            self.flush_batch(key, entries);
        }

        let mut queues: Vec<PerKeyQueue> = {
            let table = self.lock_queues();
            self.inner.sealed.store(true, Ordering::SeqCst);
            table.values().cloned().collect()
        };
        queues.push(self.inner.default_queue.clone());
        for queue in &queues {
            queue.close();
        }

        let drain_deadline = self.inner.config.drain_deadline;
        let mut drains = JoinSet::new();
        for queue in queues.iter().cloned() {
            drains.spawn(async move { queue.drain(drain_deadline).await });
        }

        let mut report = ShutdownReport::default();
        let collect = async {
            while let Some(joined) = drains.join_next().await {
                match joined {
                    Ok(drain) if drain.timed_out => {
                        report.timed_out = true;
                        report.discarded += drain.discarded;
                    }
                    Ok(_) => report.drained += 1,
                    Err(error) => warn!(error = %error, "queue drain task failed"),
                }
            }
        };

        if tokio::time::timeout(self.inner.config.shutdown_deadline, collect)
            .await
            .is_err()
        {
            drains.abort_all();
            report.timed_out = true;
            for queue in &queues {
                report.discarded += queue.discard_waiting();
            }
            warn!("shutdown deadline elapsed, proceeding anyway");
        }

        info!(
            drained = report.drained,
            discarded = report.discarded,
            timed_out = report.timed_out,
            "queue manager stopped"
        );
        report
    }

    fn submit_job(
        &self,
        key: Option<&TenantKey>,
        job: Box<dyn ErasedJob>,
        priority: i32,
    ) -> Result<(), JobError> {
        if self.is_closing() {
            let error = JobError::QueueClosed {
                queue: key.map_or_else(|| DEFAULT_QUEUE.to_string(), TenantKey::to_string),
            };
            self.inner.counters.record_rejected(job.weight());
            job.reject(error.clone());
            return Err(error);
        }
        self.enqueue(key, job, priority)
    }

    fn enqueue(
        &self,
        key: Option<&TenantKey>,
        job: Box<dyn ErasedJob>,
        priority: i32,
    ) -> Result<(), JobError> {
        match key {
            None => self.inner.default_queue.submit_job(job, priority),
            Some(key) => {
                // Held across the submit so an eviction cannot retire the
                // queue between lookup and admission.
                let mut queues = self.lock_queues();
                if self.inner.sealed.load(Ordering::SeqCst) && !queues.contains_key(key) {
                    let error = JobError::QueueClosed {
                        queue: key.to_string(),
                    };
                    warn!(key = %key, "queue table sealed, job rejected");
                    self.inner.counters.record_rejected(job.weight());
                    job.reject(error.clone());
                    return Err(error);
                }
                let queue = queues
                    .entry(key.clone())
                    .or_insert_with(|| self.create_queue(key));
                queue.submit_job(job, priority)
            }
        }
    }

    fn create_queue(&self, key: &TenantKey) -> PerKeyQueue {
        let manager = Arc::downgrade(&self.inner);
        let hook_key = key.clone();
        let hook: IdleHook = Arc::new(move |epoch| {
            if let Some(inner) = manager.upgrade() {
                QueueManager { inner }.evict(&hook_key, epoch);
            }
        });

        info!(key = %key, "queue created");
        PerKeyQueue::with_counters(
            key.as_str(),
            self.inner.config.key_queue.clone(),
            self.inner.counters.clone(),
            Some(hook),
        )
    }

    fn evict(&self, key: &TenantKey, epoch: u64) {
        let mut queues = self.lock_queues();
        let retired = queues
            .get(key)
            .is_some_and(|queue| queue.retire_if_idle(epoch));
        if retired {
            queues.remove(key);
            info!(key = %key, "idle queue evicted");
        }
    }

    fn flush_batch(&self, key: TenantKey, entries: Vec<Box<dyn ErasedJob>>) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let size = entries.len();
        debug!(key = %key, size, "batch flushed");

        let batch = BatchJob::new(key.clone(), entries, listener);
        if let Err(error) = self.enqueue(Some(&key), Box::new(batch), PRIORITY_NORMAL) {
            warn!(key = %key, size, error = %error, "batch refused");
        }
    }

    fn arm_batch_timer(&self, key: TenantKey, id: u64) {
        let manager = Arc::downgrade(&self.inner);
        let delay = self.inner.batcher.config().max_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let manager = QueueManager { inner };
            if let Some(entries) = manager.inner.batcher.take(&key, id) {
                manager.flush_batch(key, entries);
            }
        });
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<TenantKey, PerKeyQueue>> {
        self.inner.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
