//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of changes requested per pull page.
    pub pull_batch_size: u32,
    /// Timeout applied to every push and pull call.
    pub timeout: Duration,
    /// Retry configuration for failed pushes.
    pub retry: RetryConfig,
    /// Interval for periodic automatic sync.
    pub sync_interval: Option<Duration>,
    /// Quiet window after reconnecting before a sync is started.
    pub reconnect_debounce: Duration,
    /// Consecutive retryable push failures after which the link is treated
    /// as down and the rest of the push phase is skipped.
    pub max_consecutive_failures: u32,
}

impl SyncConfig {
    /// Creates a new sync configuration with default values.
    pub fn new() -> Self {
        Self {
            pull_batch_size: 100,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_interval: None,
            reconnect_debounce: Duration::from_secs(2),
            max_consecutive_failures: 3,
        }
    }

    /// Sets how many retryable push failures in a row abort the push phase
    /// (at least one).
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the reconnect debounce window.
    pub fn with_reconnect_debounce(mut self, debounce: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Push attempts before a change is surfaced as a push-failed conflict.
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
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
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

    /// Calculates the delay before retrying after failed attempt `attempt`
    /// (1-indexed; attempt 0 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
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
        Self::new(5)
    }
}

/// Configuration for connectivity monitoring.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interval between background connectivity probes.
    pub probe_interval: Duration,
}

impl NetworkConfig {
    /// Creates a new network configuration.
    pub fn new(probe_interval: Duration) -> Self {
        Self { probe_interval }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
