//! Engine and scheduler configuration.

use std::time::Duration;

use pipesync_core::PipelineType;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Pipeline worker configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed sleep between dispatch cycles
    pub poll_interval: Duration,
    /// `Processing` rows untouched for this long are reaped
    pub zombie_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            zombie_timeout: Duration::from_secs(30 * 60),
            name: "pipeline-worker".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_zombie_timeout(mut self, timeout: Duration) -> Self {
        self.zombie_timeout = timeout;
        self
    }

    /// Zombie timeout as a wall-clock delta.
    pub fn zombie_delta(&self) -> Result<chrono::Duration, ConfigError> {
        if self.zombie_timeout.is_zero() {
            return Err(ConfigError::invalid("zombie_timeout", "must be positive"));
        }
        chrono::Duration::from_std(self.zombie_timeout)
            .map_err(|e| ConfigError::invalid("zombie_timeout", e.to_string()))
    }
}

/// Recurring trigger configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often every enabled tenant gets a new run
    pub interval: Duration,
    /// Pipelines the scheduler triggers
    pub pipelines: Vec<PipelineType>,
    /// Name for logging
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            pipelines: PipelineType::ALL.to_vec(),
            name: "scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_pipelines(mut self, pipelines: impl IntoIterator<Item = PipelineType>) -> Self {
        self.pipelines = pipelines.into_iter().collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.zombie_delta().unwrap(), chrono::Duration::minutes(30));
    }

    #[test]
    fn zero_zombie_timeout_is_rejected() {
        let config = EngineConfig::default().with_zombie_timeout(Duration::ZERO);
        assert!(matches!(
            config.zombie_delta(),
            Err(ConfigError::Invalid { key: "zombie_timeout", .. })
        ));
    }
}
