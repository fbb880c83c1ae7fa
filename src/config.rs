//! Runtime configuration for the messaging and event fabric.

use std::time::Duration;

/// Minimum allowed value for any millisecond timeout field.
const MIN_TIMEOUT_MILLIS: u64 = 1000;

/// Validated configuration for a [`crate::event_service::CrossServerEventService`].
///
/// Construct via [`Config::builder`]; `Config::default()` returns the
/// all-defaults configuration, which is always valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub enable_cross_node_broadcast: bool,
    pub enable_local_processing: bool,
    pub enable_graceful_degradation: bool,
    pub circuit_breaker_failure_threshold: usize,
    pub circuit_breaker_timeout: Duration,
    pub max_retry_attempts: usize,
    pub retry_delay: Duration,
    pub retry_backoff_multiplier: f64,
    /// Ceiling on the computed backoff delay. `None` means 10x `retry_delay`.
    pub retry_max_delay: Option<Duration>,
    pub event_processing_timeout: Duration,
    pub network_broadcast_timeout: Duration,
    pub max_concurrent_events: usize,
    /// Only consulted if a future implementation wires cross-node broadcast to a
    /// dedicated channel; the current implementation always publishes wrapper
    /// envelopes through `MessagingService::broadcast` (the fixed `"broadcast"`
    /// channel). See SPEC_FULL.md's Open Question resolutions.
    pub event_broadcast_channel: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_cross_node_broadcast: true,
            enable_local_processing: true,
            enable_graceful_degradation: true,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_timeout: Duration::from_millis(30_000),
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            retry_backoff_multiplier: 2.0,
            retry_max_delay: None,
            event_processing_timeout: Duration::from_millis(10_000),
            network_broadcast_timeout: Duration::from_millis(5_000),
            max_concurrent_events: 100,
            event_broadcast_channel: "conexus:events".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// `retry_max_delay` if set, else 10x `retry_delay`.
    pub fn effective_retry_max_delay(&self) -> Duration {
        self.retry_max_delay.unwrap_or(self.retry_delay.saturating_mul(10))
    }
}

/// Errors raised when a [`Config`] fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("circuit_breaker_failure_threshold must be >= 1 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("max_retry_attempts must be >= 1 (got {0})")]
    InvalidMaxRetryAttempts(usize),
    #[error("circuit_breaker_timeout must be >= 1000ms (got {0:?})")]
    TimeoutTooShort(Duration),
    #[error("event_processing_timeout must be >= 1000ms (got {0:?})")]
    EventProcessingTimeoutTooShort(Duration),
    #[error("network_broadcast_timeout must be >= 1000ms (got {0:?})")]
    NetworkBroadcastTimeoutTooShort(Duration),
    #[error("retry_backoff_multiplier must be >= 1.0 (got {0})")]
    InvalidBackoffMultiplier(f64),
    #[error("max_concurrent_events must be >= 1 (got {0})")]
    InvalidMaxConcurrentEvents(usize),
    #[error("event_broadcast_channel must not be empty")]
    EmptyChannelName,
}

/// Builder for [`Config`], following the chainable-setter + fallible-`build()`
/// shape used throughout this workspace (see `RetryPolicyBuilder`).
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    pub fn enable_cross_node_broadcast(mut self, enabled: bool) -> Self {
        self.config.enable_cross_node_broadcast = enabled;
        self
    }

    pub fn enable_local_processing(mut self, enabled: bool) -> Self {
        self.config.enable_local_processing = enabled;
        self
    }

    pub fn enable_graceful_degradation(mut self, enabled: bool) -> Self {
        self.config.enable_graceful_degradation = enabled;
        self
    }

    pub fn circuit_breaker_failure_threshold(mut self, threshold: usize) -> Self {
        self.config.circuit_breaker_failure_threshold = threshold;
        self
    }

    pub fn circuit_breaker_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker_timeout = timeout;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: usize) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn retry_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn retry_max_delay(mut self, max_delay: Duration) -> Self {
        self.config.retry_max_delay = Some(max_delay);
        self
    }

    pub fn event_processing_timeout(mut self, timeout: Duration) -> Self {
        self.config.event_processing_timeout = timeout;
        self
    }

    pub fn network_broadcast_timeout(mut self, timeout: Duration) -> Self {
        self.config.network_broadcast_timeout = timeout;
        self
    }

    pub fn max_concurrent_events(mut self, max: usize) -> Self {
        self.config.max_concurrent_events = max;
        self
    }

    pub fn event_broadcast_channel(mut self, channel: impl Into<String>) -> Self {
        self.config.event_broadcast_channel = channel.into();
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let c = &self.config;
        if c.circuit_breaker_failure_threshold < 1 {
            return Err(ConfigError::InvalidFailureThreshold(c.circuit_breaker_failure_threshold));
        }
        if c.max_retry_attempts < 1 {
            return Err(ConfigError::InvalidMaxRetryAttempts(c.max_retry_attempts));
        }
        if c.circuit_breaker_timeout.as_millis() < MIN_TIMEOUT_MILLIS as u128 {
            return Err(ConfigError::TimeoutTooShort(c.circuit_breaker_timeout));
        }
        if c.event_processing_timeout.as_millis() < MIN_TIMEOUT_MILLIS as u128 {
            return Err(ConfigError::EventProcessingTimeoutTooShort(c.event_processing_timeout));
        }
        if c.network_broadcast_timeout.as_millis() < MIN_TIMEOUT_MILLIS as u128 {
            return Err(ConfigError::NetworkBroadcastTimeoutTooShort(c.network_broadcast_timeout));
        }
        if c.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(c.retry_backoff_multiplier));
        }
        if c.max_concurrent_events < 1 {
            return Err(ConfigError::InvalidMaxConcurrentEvents(c.max_concurrent_events));
        }
        if c.event_broadcast_channel.trim().is_empty() {
            return Err(ConfigError::EmptyChannelName);
        }
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
