//! Timing and addressing knobs for one wake cycle.

use core::{fmt, time::Duration};

use crate::acquisition::DEFAULT_RETRY_INTERVAL;
use crate::delivery::TOPIC_CAPACITY;

/// Configuration consumed by [`crate::cycle::WakeCycle`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CycleConfig {
    /// Deadline for every enabled source to report.
    pub acquisition_timeout: Duration,
    /// Bound on the wait for acquisition and transport readiness.
    pub barrier_timeout: Duration,
    /// Bound on draining the delivery queue after publishing.
    pub flush_timeout: Duration,
    /// Time spent powered down between wake cycles.
    pub sleep_interval: Duration,
    /// Spacing between failed measurement attempts.
    pub retry_interval: Duration,
    /// Topic the aggregated reading is published on.
    pub topic: &'static str,
}

impl CycleConfig {
    pub const DEFAULT_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_TOPIC: &'static str = "sensors/node";

    #[must_use]
    pub const fn new() -> Self {
        Self {
            acquisition_timeout: Self::DEFAULT_ACQUISITION_TIMEOUT,
            barrier_timeout: Self::DEFAULT_BARRIER_TIMEOUT,
            flush_timeout: Self::DEFAULT_FLUSH_TIMEOUT,
            sleep_interval: Self::DEFAULT_SLEEP_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            topic: Self::DEFAULT_TOPIC,
        }
    }

    #[must_use]
    pub const fn with_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_topic(mut self, topic: &'static str) -> Self {
        self.topic = topic;
        self
    }

    /// Rejects settings that would stall the cycle or break the link protocol.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval.is_zero() {
            return Err(ConfigError::ZeroRetryInterval);
        }
        if self.sleep_interval.is_zero() {
            return Err(ConfigError::ZeroSleepInterval);
        }
        if self.topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.topic.len() > TOPIC_CAPACITY {
            return Err(ConfigError::TopicTooLong);
        }
        if self.topic.contains(char::is_whitespace) {
            return Err(ConfigError::TopicHasWhitespace);
        }
        Ok(())
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    ZeroRetryInterval,
    ZeroSleepInterval,
    EmptyTopic,
    TopicTooLong,
    TopicHasWhitespace,
    /// The aggregator was built with a different retry interval.
    RetryIntervalMismatch,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigError::ZeroRetryInterval => "retry interval must be non-zero",
            ConfigError::ZeroSleepInterval => "sleep interval must be non-zero",
            ConfigError::EmptyTopic => "topic is empty",
            ConfigError::TopicTooLong => "topic exceeds buffer",
            ConfigError::TopicHasWhitespace => "topic contains whitespace",
            ConfigError::RetryIntervalMismatch => "aggregator retry interval differs from config",
        })
    }
}
