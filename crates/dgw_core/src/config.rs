//! Router configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the scheduler and transport adapter.
///
/// Every field has a default, so a JSON file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of resource indices (devices); one registry shard each.
    pub shard_count: usize,
    /// Worker threads per shard. Only one of them runs a pass at a time.
    pub workers_per_shard: usize,
    /// Event wait timeout. A timeout is a normal wakeup that runs a pass.
    pub wait_timeout_ms: u64,
    /// PUSH messages injected into one source per pass.
    pub push_budget: usize,
    /// Decision responses polled per schedule key per pass.
    pub max_responses_per_pass: usize,
    /// Bound on draining in-flight channel sends at teardown.
    pub output_completion_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            workers_per_shard: 1,
            wait_timeout_ms: 2000,
            push_budget: 64,
            max_responses_per_pass: 100,
            output_completion_timeout_ms: 100,
        }
    }
}

/// Errors in a [`RouterConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid router config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
}

impl RouterConfig {
    /// Parse a config from JSON and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the JSON is malformed or a field is zero.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero count or budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("shard_count", self.shard_count),
            ("workers_per_shard", self.workers_per_shard),
            ("push_budget", self.push_budget),
            ("max_responses_per_pass", self.max_responses_per_pass),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    #[must_use]
    pub fn with_workers_per_shard(mut self, workers: usize) -> Self {
        self.workers_per_shard = workers;
        self
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_push_budget(mut self, budget: usize) -> Self {
        self.push_budget = budget;
        self
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    #[must_use]
    pub fn output_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.output_completion_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RouterConfig::from_json(r#"{ "shard_count": 2 }"#).unwrap();
        assert_eq!(config.shard_count, 2);
        assert_eq!(config.push_budget, 64);
        assert_eq!(config.wait_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let err = RouterConfig::from_json(r#"{ "shard_count": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "shard_count" }));
    }

    #[test]
    fn test_builders() {
        let config = RouterConfig::default()
            .with_shard_count(4)
            .with_wait_timeout(Duration::from_millis(5));
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.wait_timeout_ms, 5);
    }
}
