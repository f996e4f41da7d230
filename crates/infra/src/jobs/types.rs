//! Core job types and policies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduling priority. Higher values are dispatched first; equal
/// priorities are served in submission order.
pub type Priority = i32;

/// Priority of ordinary ingestion work.
pub const PRIORITY_NORMAL: Priority = 0;

/// Priority of destructive administrative work (clear, delete, drop all).
pub const PRIORITY_CRITICAL: Priority = Priority::MAX;

/// Why a job did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job's input was malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Admission rejected: the queue already holds `capacity` outstanding jobs.
    #[error("queue {queue} is full ({capacity} outstanding jobs), try again later")]
    QueueFull { queue: String, capacity: usize },

    /// Admission rejected: the queue is draining or shut down.
    #[error("queue {queue} is closed")]
    QueueClosed { queue: String },

    /// The per-job timeout elapsed.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The backing store could not serve the request.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unexpected failure inside the job (including panics).
    #[error("internal error: {0}")]
    Internal(String),

    /// Every attempt failed; `last` is the final attempt's error.
    #[error("{last} (gave up after {attempts} attempts)")]
    ExhaustedRetries { attempts: u32, last: Box<JobError> },

    /// The job was still waiting when its queue was drained.
    #[error("job discarded before it ran")]
    Discarded,
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether another attempt may succeed.
    ///
    /// Only store unavailability is transient. Timeouts are final: retrying
    /// against an already slow store adds load without helping.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

/// Exponential retry policy: the delay after attempt `n` is
/// `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    /// Build from `retries` (extra attempts) and a base delay.
    pub fn from_options(options: &SubmitOptions) -> Self {
        Self::exponential(options.retries.saturating_add(1), options.retry_delay)
    }

    /// Delay to wait after attempt `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts ran.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Per-submission knobs of [`QueueManager`](super::QueueManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub retry_delay: Duration,
    pub priority: Priority,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(200),
            priority: PRIORITY_NORMAL,
        }
    }
}

impl SubmitOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// Observable state of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    /// Jobs waiting for a slot.
    pub pending: usize,
    /// Jobs currently running.
    pub in_flight: usize,
    /// Dispatching suspended.
    pub paused: bool,
    /// New submissions admitted.
    pub accepting: bool,
}

impl QueueStats {
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// How many finished jobs succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub succeeded: u64,
    pub failed: u64,
}

impl Tally {
    pub fn of<T>(result: &Result<T, JobError>) -> Self {
        match result {
            Ok(_) => Self {
                succeeded: 1,
                failed: 0,
            },
            Err(_) => Self {
                succeeded: 0,
                failed: 1,
            },
        }
    }
}

impl std::ops::AddAssign for Tally {
    fn add_assign(&mut self, rhs: Self) {
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
    }
}

/// Process-lifetime job counters shared by every queue of a manager.
#[derive(Debug, Default)]
pub struct JobCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl JobCounters {
    pub fn record_accepted(&self, jobs: u64) {
        self.accepted.fetch_add(jobs, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, jobs: u64) {
        self.rejected.fetch_add(jobs, Ordering::Relaxed);
    }

    pub fn record(&self, tally: Tally) {
        self.succeeded.fetch_add(tally.succeeded, Ordering::Relaxed);
        self.failed.fetch_add(tally.failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`JobCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
}
