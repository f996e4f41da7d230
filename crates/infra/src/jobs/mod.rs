//! Admission control and execution of ingestion work.
//!
//! ## Components
//!
//! - `RetryRunner`: bounded retries with exponential backoff
//! - `PerKeyQueue`: bounded, rate-limited, priority-ordered lane for one key
//! - `QueueManager`: lazily created per-key lanes plus the shared default lane
//! - batching: per-key buffers flushed by size or delay, one queued job per batch
//! - `JobHandle`: per-submission completion handle

pub mod batch;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod task;
pub mod types;

pub use batch::{BatchConfig, BatchListener, BatchReport};
pub use manager::{DEFAULT_QUEUE, ManagerConfig, ManagerStats, QueueManager, ShutdownReport};
pub use queue::{DrainReport, PerKeyQueue, QueueConfig};
pub use retry::RetryRunner;
pub use task::JobHandle;
pub use types::{
    CounterSnapshot, JobCounters, JobError, PRIORITY_CRITICAL, PRIORITY_NORMAL, Priority,
    QueueStats, RetryPolicy, SubmitOptions, Tally,
};
