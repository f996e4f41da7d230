//! A bounded, rate-limited execution lane for one tenant key.
//!
//! - waiting jobs are ordered by priority, then submission order
//! - at most `concurrency` jobs run at once
//! - at most `rate_cap` jobs start per `rate_interval` (fixed window)
//! - at most `max_pending` jobs are outstanding (waiting + running);
//!   further submissions fail fast with [`JobError::QueueFull`]
//!
//! The queue never blocks a submitter. Every method except [`PerKeyQueue::drain`]
//! is synchronous, but dispatching spawns Tokio tasks, so the queue must be
//! used from within a Tokio runtime.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use super::task::{ErasedJob, JobHandle, PendingJob};
use super::types::{JobCounters, JobError, Priority, QueueStats, Tally};

/// Limits of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum jobs running at once.
    pub concurrency: usize,
    /// Maximum jobs started per `rate_interval` (0 disables the limit).
    pub rate_cap: usize,
    pub rate_interval: Duration,
    /// Ceiling on outstanding (waiting + running) jobs.
    pub max_pending: usize,
    pub job_timeout: Option<Duration>,
    /// How long the queue must stay idle before it asks to be evicted.
    pub idle_grace: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_cap: 100,
            rate_interval: Duration::from_secs(1),
            max_pending: 1000,
            job_timeout: Some(Duration::from_secs(30)),
            idle_grace: None,
        }
    }
}

impl QueueConfig {
    /// Same limits with concurrency and rate budget halved (at least 1).
    /// An unlimited rate stays unlimited.
    pub fn halved(&self) -> Self {
        let rate_cap = match self.rate_cap {
            0 => 0,
            cap => (cap / 2).max(1),
        };
        Self {
            concurrency: (self.concurrency / 2).max(1),
            rate_cap,
            ..self.clone()
        }
    }
}

/// Outcome of [`PerKeyQueue::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Waiting jobs dropped because the deadline elapsed.
    pub discarded: usize,
    pub timed_out: bool,
}

/// Called with the idle epoch once a queue stayed idle for its grace period.
pub(crate) type IdleHook = Arc<dyn Fn(u64) + Send + Sync>;

struct Queued {
    priority: Priority,
    seq: u64,
    job: Box<dyn ErasedJob>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Fixed-window start limiter.
#[derive(Debug)]
struct RateWindow {
    cap: usize,
    interval: Duration,
    opened_at: Option<Instant>,
    used: usize,
}

impl RateWindow {
    fn new(cap: usize, interval: Duration) -> Self {
        Self {
            cap,
            interval,
            opened_at: None,
            used: 0,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        if self.cap == 0 {
            return true;
        }
        let expired = self
            .opened_at
            .is_none_or(|opened| now.duration_since(opened) >= self.interval);
        if expired {
            self.opened_at = Some(now);
            self.used = 0;
        }
        if self.used < self.cap {
            self.used += 1;
            true
        } else {
            false
        }
    }

    fn reopens_at(&self, now: Instant) -> Instant {
        self.opened_at.map_or(now, |opened| opened + self.interval)
    }
}

struct QueueState {
    waiting: BinaryHeap<Queued>,
    next_seq: u64,
    in_flight: usize,
    paused: bool,
    accepting: bool,
    rate: RateWindow,
    rate_timer_armed: bool,
    /// Bumped on every admission; an eviction is only valid for the epoch it was armed in.
    idle_epoch: u64,
    eviction_armed_for: Option<u64>,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.waiting.len() + self.in_flight
    }

    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight == 0
    }
}

struct QueueInner {
    name: String,
    config: QueueConfig,
    counters: Arc<JobCounters>,
    state: Mutex<QueueState>,
    settled: Notify,
    idle_hook: Option<IdleHook>,
}

/// Execution lane for one tenant key (or the shared default lane).
///
/// Cloning is cheap; clones share the same lane.
#[derive(Clone)]
pub struct PerKeyQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for PerKeyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerKeyQueue")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PerKeyQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self::with_counters(name, config, Arc::default(), None)
    }

    pub(crate) fn with_counters(
        name: impl Into<String>,
        config: QueueConfig,
        counters: Arc<JobCounters>,
        idle_hook: Option<IdleHook>,
    ) -> Self {
        let state = QueueState {
            waiting: BinaryHeap::new(),
            next_seq: 0,
            in_flight: 0,
            paused: false,
            accepting: true,
            rate: RateWindow::new(config.rate_cap, config.rate_interval),
            rate_timer_armed: false,
            idle_epoch: 0,
            eviction_armed_for: None,
        };
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                config,
                counters,
                state: Mutex::new(state),
                settled: Notify::new(),
                idle_hook,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn counters(&self) -> &JobCounters {
        &self.inner.counters
    }

    /// Enqueue `future` at `priority`.
    pub fn submit<T, Fut>(&self, priority: Priority, future: Fut) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        let (job, handle) = PendingJob::new(future);
        self.submit_job(Box::new(job), priority)?;
        Ok(handle)
    }

    /// Enqueue an erased job. On refusal the job is rejected with the
    /// returned error before this returns.
    pub(crate) fn submit_job(&self, job: Box<dyn ErasedJob>, priority: Priority) -> Result<(), JobError> {
        let weight = job.weight();
        let mut state = self.lock();

        let refusal = if !state.accepting {
            Some(JobError::QueueClosed {
                queue: self.inner.name.clone(),
            })
        } else if state.outstanding() >= self.inner.config.max_pending {
            Some(JobError::QueueFull {
                queue: self.inner.name.clone(),
                capacity: self.inner.config.max_pending,
            })
        } else {
            None
        };

        if let Some(error) = refusal {
            drop(state);
            warn!(queue = %self.inner.name, error = %error, "job rejected");
            self.inner.counters.record_rejected(weight);
            job.reject(error.clone());
            return Err(error);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.idle_epoch += 1;
        state.waiting.push(Queued { priority, seq, job });
        drop(state);

        self.inner.counters.record_accepted(weight);
        debug!(queue = %self.inner.name, priority, seq, "job admitted");
        self.dispatch();
        Ok(())
    }

    /// Whether the next submission would be refused with `QueueFull`.
    pub fn is_full(&self) -> bool {
        self.lock().outstanding() >= self.inner.config.max_pending
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.waiting.len(),
            in_flight: state.in_flight,
            paused: state.paused,
            accepting: state.accepting,
        }
    }

    /// Stop starting jobs. Submissions are still admitted.
    pub fn pause(&self) {
        self.lock().paused = true;
        info!(queue = %self.inner.name, "queue paused");
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        info!(queue = %self.inner.name, "queue resumed");
        self.dispatch();
    }

    /// Stop admitting jobs. Already admitted jobs still run.
    pub fn close(&self) {
        self.lock().accepting = false;
    }

    /// Close, then wait up to `deadline` for every admitted job to finish.
    /// Jobs still waiting at the deadline are discarded.
    pub async fn drain(&self, deadline: Duration) -> DrainReport {
        {
            let mut state = self.lock();
            state.accepting = false;
            state.paused = false;
        }
        self.dispatch();

        let settled = async {
            loop {
                let notified = self.inner.settled.notified();
                if self.is_idle() {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(deadline, settled).await.is_ok() {
            info!(queue = %self.inner.name, "queue drained");
            return DrainReport::default();
        }

        let discarded = self.discard_waiting();
        warn!(queue = %self.inner.name, discarded, "drain deadline elapsed, waiting jobs discarded");
        DrainReport {
            discarded,
            timed_out: true,
        }
    }

    /// Reject every waiting job with [`JobError::Discarded`]; returns how
    /// many results were discarded.
    pub(crate) fn discard_waiting(&self) -> usize {
        let dropped: Vec<Queued> = self.lock().waiting.drain().collect();

        let mut discarded = 0;
        for queued in dropped {
            discarded += queued.job.weight();
            queued.job.reject(JobError::Discarded);
        }
        self.inner.counters.record(Tally {
            succeeded: 0,
            failed: discarded,
        });
        self.inner.settled.notify_waiters();
        discarded as usize
    }

    /// Close the queue if it is still idle in `epoch`. Returns whether it
    /// was retired.
    pub(crate) fn retire_if_idle(&self, epoch: u64) -> bool {
        let mut state = self.lock();
        if state.accepting && state.is_idle() && state.idle_epoch == epoch {
            state.accepting = false;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start as many waiting jobs as the limits allow.
    fn dispatch(&self) {
        let mut ready = Vec::new();
        let mut rate_timer = None;
        let mut eviction = None;

        {
            let mut state = self.lock();
            let now = Instant::now();
            let concurrency = self.inner.config.concurrency.max(1);

            while !state.paused && state.in_flight < concurrency && !state.waiting.is_empty() {
                if !state.rate.try_acquire(now) {
                    if !state.rate_timer_armed {
                        state.rate_timer_armed = true;
                        rate_timer = Some(state.rate.reopens_at(now));
                    }
                    break;
                }
                if let Some(next) = state.waiting.pop() {
                    state.in_flight += 1;
                    ready.push(next.job);
                }
            }

            let evictable = self.inner.idle_hook.is_some() && self.inner.config.idle_grace.is_some();
            if evictable
                && state.accepting
                && state.is_idle()
                && state.eviction_armed_for != Some(state.idle_epoch)
            {
                state.eviction_armed_for = Some(state.idle_epoch);
                eviction = Some(state.idle_epoch);
            }
        }

        for job in ready {
            self.launch(job);
        }
        if let Some(at) = rate_timer {
            self.arm_rate_timer(at);
        }
        if let Some(epoch) = eviction {
            self.arm_eviction(epoch);
        }
    }

    fn launch(&self, job: Box<dyn ErasedJob>) {
        let queue = self.clone();
        let timeout = self.inner.config.job_timeout;
        let span = info_span!("job", queue = %self.inner.name);

        tokio::spawn(
            async move {
                debug!("job started");
                let tally = job.run(timeout).await;
                debug!(succeeded = tally.succeeded, failed = tally.failed, "job finished");
                queue.inner.counters.record(tally);
                queue.finish();
            }
            .instrument(span),
        );
    }

    fn finish(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.dispatch();
        self.inner.settled.notify_waiters();
    }

    fn arm_rate_timer(&self, at: Instant) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            queue.lock().rate_timer_armed = false;
            queue.dispatch();
        });
    }

    fn arm_eviction(&self, epoch: u64) {
        let (Some(grace), Some(hook)) = (self.inner.config.idle_grace, self.inner.idle_hook.clone())
        else {
            return;
        };
        let queue = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = queue.upgrade() else {
                return;
            };
            let still_idle = {
                let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.accepting && state.is_idle() && state.idle_epoch == epoch
            };
            if still_idle {
                hook(epoch);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::jobs::types::{PRIORITY_CRITICAL, PRIORITY_NORMAL};

    fn config() -> QueueConfig {
        QueueConfig {
            concurrency: 1,
            rate_cap: 0,
            rate_interval: Duration::from_secs(1),
            max_pending: 50,
            job_timeout: None,
            idle_grace: None,
        }
    }

    /// A job that runs until the returned sender fires.
    fn gated(queue: &PerKeyQueue) -> (oneshot::Sender<()>, JobHandle<()>) {
        let (release, gate) = oneshot::channel::<()>();
        let handle = queue
            .submit(PRIORITY_NORMAL, async move {
                let _ = gate.await;
                Ok(())
            })
            .unwrap();
        (release, handle)
    }

    #[tokio::test]
    async fn higher_priority_runs_first_and_ties_are_fifo() {
        let queue = PerKeyQueue::new("k", config());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, blocker) = gated(&queue);

        let mut handles = Vec::new();
        for (label, priority) in [("low-1", 1), ("high", 5), ("low-2", 1), ("critical", PRIORITY_CRITICAL)] {
            let order = order.clone();
            handles.push(
                queue
                    .submit(priority, async move {
                        order.lock().unwrap().push(label);
                        Ok(())
                    })
                    .unwrap(),
            );
        }

        release.send(()).unwrap();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high", "low-1", "low-2"]
        );
    }

    #[tokio::test]
    async fn ceiling_counts_waiting_and_running_jobs() {
        let queue = PerKeyQueue::new("k", QueueConfig { max_pending: 2, ..config() });
        let (release_a, a) = gated(&queue);
        let (release_b, b) = gated(&queue);

        assert!(queue.is_full());
        let refused = queue.submit(PRIORITY_NORMAL, async { Ok(()) });
        assert!(matches!(refused, Err(JobError::QueueFull { capacity: 2, .. })));

        release_a.send(()).unwrap();
        release_b.send(()).unwrap();
        a.await.unwrap();
        b.await.unwrap();

        let counters = queue.counters().snapshot();
        assert_eq!(counters.accepted, 2);
        assert_eq!(counters.rejected, 1);
        assert_eq!(counters.succeeded, 2);
        assert!(!queue.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let queue = PerKeyQueue::new("k", QueueConfig { concurrency: 2, ..config() });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                queue
                    .submit(PRIORITY_NORMAL, async move {
                        let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_are_rate_limited_per_window() {
        let queue = PerKeyQueue::new(
            "k",
            QueueConfig {
                concurrency: 10,
                rate_cap: 2,
                ..config()
            },
        );
        let origin = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                queue
                    .submit(PRIORITY_NORMAL, async move { Ok(Instant::now()) })
                    .unwrap()
            })
            .collect();

        let mut started = Vec::new();
        for handle in handles {
            started.push(handle.await.unwrap().duration_since(origin));
        }

        assert!(started[1] < Duration::from_secs(1));
        assert!(started[2] >= Duration::from_secs(1));
        assert!(started[3] < Duration::from_secs(2));
        assert!(started[4] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_queue_admits_but_does_not_start() {
        let queue = PerKeyQueue::new("k", config());
        queue.pause();

        let handle = queue.submit(PRIORITY_NORMAL, async { Ok(7) }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = queue.stats();
        assert_eq!((stats.pending, stats.in_flight, stats.paused), (1, 0, true));

        queue.resume();
        assert_eq!(handle.await, Ok(7));
    }

    #[tokio::test]
    async fn closed_queue_refuses_submissions() {
        let queue = PerKeyQueue::new("k", config());
        queue.close();

        let refused = queue.submit(PRIORITY_NORMAL, async { Ok(()) });
        assert!(matches!(refused, Err(JobError::QueueClosed { .. })));
        assert!(!queue.stats().accepting);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_admitted_jobs() {
        let queue = PerKeyQueue::new("k", config());
        let handles: Vec<_> = (0..3)
            .map(|i| {
                queue
                    .submit(PRIORITY_NORMAL, async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();

        let report = queue.drain(Duration::from_secs(10)).await;

        assert_eq!(report, DrainReport::default());
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await, Ok(i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_deadline_discards_waiting_jobs() {
        let queue = PerKeyQueue::new("k", config());
        let slow = queue
            .submit(PRIORITY_NORMAL, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();
        let waiting = queue.submit(PRIORITY_NORMAL, async { Ok(()) }).unwrap();

        let report = queue.drain(Duration::from_secs(1)).await;

        assert_eq!(
            report,
            DrainReport {
                discarded: 1,
                timed_out: true
            }
        );
        assert_eq!(waiting.await, Err(JobError::Discarded));
        // The running job is not cancelled.
        assert_eq!(slow.await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_hook_fires_after_grace_unless_work_arrives() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let hook: IdleHook = {
            let fired = fired.clone();
            Arc::new(move |epoch| fired.lock().unwrap().push(epoch))
        };
        let queue = PerKeyQueue::with_counters(
            "k",
            QueueConfig {
                idle_grace: Some(Duration::from_secs(60)),
                ..config()
            },
            Arc::default(),
            Some(hook),
        );

        queue.submit(PRIORITY_NORMAL, async { Ok(()) }).unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        queue.submit(PRIORITY_NORMAL, async { Ok(()) }).unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*fired.lock().unwrap(), vec![2]);

        assert!(queue.retire_if_idle(2));
        assert!(!queue.stats().accepting);
    }
}
