//! Listener configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::duration_millis;
use super::poller::SourceRetryPolicy;

/// Queue listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Unique listener ID (generated if not provided)
    pub listener_id: String,

    /// Queue key to drain
    pub queue_key: String,

    /// Maximum concurrent handler invocations
    pub max_workers: usize,

    /// How long each `pop_wait` blocks before the loop re-checks its state
    #[serde(with = "duration_millis")]
    pub poll_timeout: Duration,

    /// Resume intake after a saturation pause (`false` stops the listener
    /// the first time it saturates)
    pub resume_when_idle: bool,

    /// What to do when the queue source itself fails
    pub source_retry: SourceRetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listener_id: format!("listener-{}", Uuid::now_v7()),
            queue_key: String::new(),
            max_workers: 4,
            poll_timeout: Duration::from_secs(5),
            resume_when_idle: true,
            source_retry: SourceRetryPolicy::default(),
        }
    }
}

impl ListenerConfig {
    /// Create a configuration for `queue_key`
    pub fn new(queue_key: impl Into<String>) -> Self {
        Self {
            queue_key: queue_key.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DRAINQ_QUEUE_KEY`: queue key (falls back to `queue_key`)
    /// - `DRAINQ_MAX_WORKERS`: worker capacity (default: 4)
    /// - `DRAINQ_POLL_TIMEOUT_MS`: `pop_wait` timeout in milliseconds (default: 5000)
    /// - `DRAINQ_RESUME_WHEN_IDLE`: "false" to stop on the first saturation
    pub fn from_env(queue_key: impl Into<String>) -> Self {
        let defaults = Self::new(queue_key);

        let queue_key = std::env::var("DRAINQ_QUEUE_KEY").unwrap_or(defaults.queue_key.clone());

        let max_workers = std::env::var("DRAINQ_MAX_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_workers);

        let poll_timeout = std::env::var("DRAINQ_POLL_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_timeout);

        let resume_when_idle = std::env::var("DRAINQ_RESUME_WHEN_IDLE")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(defaults.resume_when_idle);

        Self {
            queue_key,
            max_workers,
            poll_timeout,
            resume_when_idle,
            ..defaults
        }
    }

    /// Set the listener ID
    pub fn with_listener_id(mut self, id: impl Into<String>) -> Self {
        self.listener_id = id.into();
        self
    }

    /// Set the worker capacity
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the `pop_wait` timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set whether intake resumes after a saturation pause
    pub fn with_resume_when_idle(mut self, resume: bool) -> Self {
        self.resume_when_idle = resume;
        self
    }

    /// Set the source retry policy
    pub fn with_source_retry(mut self, policy: SourceRetryPolicy) -> Self {
        self.source_retry = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_key.is_empty() {
            return Err("queue_key must not be empty".into());
        }
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".into());
        }
        if self.poll_timeout.is_zero() {
            return Err("poll_timeout must be greater than zero".into());
        }
        if self.source_retry.max_consecutive_failures == Some(0) {
            return Err("source_retry.max_consecutive_failures must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert!(config.listener_id.starts_with("listener-"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert!(config.resume_when_idle);
    }

    #[test]
    fn test_config_builder() {
        let config = ListenerConfig::new("jobs")
            .with_listener_id("test-listener")
            .with_max_workers(8)
            .with_poll_timeout(Duration::from_millis(250))
            .with_resume_when_idle(false);

        assert_eq!(config.listener_id, "test-listener");
        assert_eq!(config.queue_key, "jobs");
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
        assert!(!config.resume_when_idle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(ListenerConfig::default().validate().is_err());
        assert!(ListenerConfig::new("q").with_max_workers(0).validate().is_err());
        assert!(ListenerConfig::new("q")
            .with_poll_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ListenerConfig::new("q")
            .with_source_retry(SourceRetryPolicy::default().with_max_consecutive_failures(Some(0)))
            .validate()
            .is_err());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let config = ListenerConfig::new("jobs").with_poll_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_timeout"], 1500);

        let parsed: ListenerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.poll_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.queue_key, "jobs");
    }
}
