//! Ingestion configuration.
//!
//! Every setting has a default and may be overridden through `WARLOG_*`
//! environment variables. A value that does not parse is ignored with a
//! warning; startup never fails because of configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::event_bus::DEFAULT_CHANNEL;
use crate::jobs::{BatchConfig, ManagerConfig, QueueConfig, SubmitOptions};

/// Queue limits. Per-key queues derive concurrency and rate cap from the
/// default queue by halving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub rate_cap: usize,
    pub rate_interval: Duration,
    pub max_pending: usize,
    pub key_max_pending: usize,
    pub job_timeout: Duration,
    pub idle_grace: Duration,
    pub drain_deadline: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_cap: 100,
            rate_interval: Duration::from_secs(1),
            max_pending: 1000,
            key_max_pending: 50,
            job_timeout: Duration::from_secs(30),
            idle_grace: Duration::from_secs(60),
            drain_deadline: Duration::from_secs(10),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Full configuration of an ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IngestConfig {
    pub queue: QueueSettings,
    pub batch: BatchConfig,
    pub retry: RetrySettings,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_channel: Option<String>,
}

impl IngestConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = Reader { lookup: &lookup };

        let queue = QueueSettings {
            concurrency: read.parse("WARLOG_QUEUE_CONCURRENCY", defaults.queue.concurrency),
            rate_cap: read.parse("WARLOG_QUEUE_RATE_CAP", defaults.queue.rate_cap),
            rate_interval: read.millis("WARLOG_QUEUE_RATE_INTERVAL_MS", defaults.queue.rate_interval),
            max_pending: read.parse("WARLOG_QUEUE_MAX_PENDING", defaults.queue.max_pending),
            key_max_pending: read.parse("WARLOG_KEY_QUEUE_MAX_PENDING", defaults.queue.key_max_pending),
            job_timeout: read.millis("WARLOG_JOB_TIMEOUT_MS", defaults.queue.job_timeout),
            idle_grace: read.millis("WARLOG_IDLE_GRACE_MS", defaults.queue.idle_grace),
            drain_deadline: read.millis("WARLOG_DRAIN_DEADLINE_MS", defaults.queue.drain_deadline),
            shutdown_deadline: read.millis(
                "WARLOG_SHUTDOWN_DEADLINE_MS",
                defaults.queue.shutdown_deadline,
            ),
        };

        let batch = BatchConfig {
            max_items: read.parse("WARLOG_BATCH_MAX_ITEMS", defaults.batch.max_items),
            max_delay: read.millis("WARLOG_BATCH_MAX_DELAY_MS", defaults.batch.max_delay),
        };

        let retry = RetrySettings {
            retries: read.parse("WARLOG_RETRIES", defaults.retry.retries),
            delay: read.millis("WARLOG_RETRY_DELAY_MS", defaults.retry.delay),
        };

        Self {
            queue,
            batch,
            retry,
            database_url: read.string("WARLOG_DATABASE_URL"),
            redis_url: read.string("WARLOG_REDIS_URL"),
            redis_channel: read.string("WARLOG_REDIS_CHANNEL"),
        }
    }

    /// Channel for the Redis notifier, [`DEFAULT_CHANNEL`] unless
    /// `WARLOG_REDIS_CHANNEL` is set.
    pub fn redis_channel(&self) -> &str {
        self.redis_channel.as_deref().unwrap_or(DEFAULT_CHANNEL)
    }

    /// Default submission options (normal priority).
    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions::default().with_retries(self.retry.retries, self.retry.delay)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let queue = &self.queue;
        let default_queue = QueueConfig {
            concurrency: queue.concurrency.max(1),
            rate_cap: queue.rate_cap,
            rate_interval: queue.rate_interval,
            max_pending: queue.max_pending,
            job_timeout: Some(queue.job_timeout).filter(|timeout| !timeout.is_zero()),
            idle_grace: None,
        };
        let key_queue = QueueConfig {
            max_pending: queue.key_max_pending,
            idle_grace: Some(queue.idle_grace),
            ..default_queue.halved()
        };

        ManagerConfig {
            default_queue,
            key_queue,
            batch: self.batch,
            retry: self.submit_options(),
            drain_deadline: queue.drain_deadline,
            shutdown_deadline: queue.shutdown_deadline,
        }
    }
}

struct Reader<'a, F> {
    lookup: &'a F,
}

impl<F> Reader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        let Some(raw) = self.string(name) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, default = ?default, "invalid setting, using default");
                default
            }
        }
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        let millis = self.parse(name, default.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> IngestConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IngestConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = load(&[]);

        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.redis_channel(), DEFAULT_CHANNEL);

        let manager = config.manager_config();
        assert_eq!(manager, ManagerConfig::default());
        assert_eq!(manager.key_queue.concurrency, 5);
        assert_eq!(manager.key_queue.rate_cap, 50);
        assert_eq!(manager.key_queue.max_pending, 50);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("WARLOG_QUEUE_CONCURRENCY", "4"),
            ("WARLOG_KEY_QUEUE_MAX_PENDING", "8"),
            ("WARLOG_BATCH_MAX_DELAY_MS", "250"),
            ("WARLOG_RETRIES", "0"),
            ("WARLOG_DATABASE_URL", "postgres://localhost/warlog"),
            ("WARLOG_REDIS_CHANNEL", "warlog:staging"),
        ]);

        assert_eq!(config.queue.concurrency, 4);
        assert_eq!(config.batch.max_delay, Duration::from_millis(250));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/warlog"));
        assert_eq!(config.redis_channel(), "warlog:staging");

        let manager = config.manager_config();
        assert_eq!(manager.key_queue.concurrency, 2);
        assert_eq!(manager.key_queue.max_pending, 8);
        assert_eq!(manager.retry.retries, 0);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = load(&[
            ("WARLOG_QUEUE_CONCURRENCY", "many"),
            ("WARLOG_JOB_TIMEOUT_MS", "-5"),
            ("WARLOG_REDIS_URL", "   "),
        ]);

        assert_eq!(config.queue.concurrency, 10);
        assert_eq!(config.queue.job_timeout, Duration::from_secs(30));
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn zero_timeout_disables_job_timeout() {
        let config = load(&[("WARLOG_JOB_TIMEOUT_MS", "0")]);
        assert_eq!(config.manager_config().default_queue.job_timeout, None);
    }
}
