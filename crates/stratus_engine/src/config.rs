//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Largest batch a remote modify call accepts.
pub const MAX_PUSH_BATCH_SIZE: usize = 400;

/// Default number of records sent per modify call.
pub const DEFAULT_PUSH_BATCH_SIZE: usize = 30;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote container identifier.
    pub container_id: String,
    /// Private zone names provisioned on sign-in.
    pub partition_names: Vec<String>,
    /// Maximum records per modify call.
    pub push_batch_size: usize,
    /// Resubmissions allowed for a conflicting write.
    pub max_conflict_retries: u32,
    /// Trailing-edge delay before a scheduled upload runs.
    pub upload_debounce: Duration,
    /// Longest wait for the next batch of remote changes.
    pub fetch_timeout: Duration,
    /// Batches buffered between fetch tasks and the consumer.
    pub channel_capacity: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            partition_names: Vec::new(),
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            max_conflict_retries: 3,
            upload_debounce: Duration::from_millis(200),
            fetch_timeout: Duration::from_secs(60),
            channel_capacity: 16,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the zone names provisioned on sign-in.
    pub fn with_partition_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the push batch size, clamped to `1..=MAX_PUSH_BATCH_SIZE`.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.clamp(1, MAX_PUSH_BATCH_SIZE);
        self
    }

    /// Sets the conflict resubmission ceiling.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the upload debounce window.
    pub fn with_upload_debounce(mut self, debounce: Duration) -> Self {
        self.upload_debounce = debounce;
        self
    }

    /// Sets the fetch idle timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the change channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
