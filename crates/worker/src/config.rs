//! Worker settings read from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pipesync_core::PipelineType;
use pipesync_engine::{ConfigError, EngineConfig, SchedulerConfig};
use pipesync_pipelines::DEFAULT_BATCH_SIZE;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "PIPESYNC_DB_MAX_CONNECTIONS";
pub const POLL_INTERVAL_MS: &str = "PIPESYNC_POLL_INTERVAL_MS";
pub const ZOMBIE_TIMEOUT_SECS: &str = "PIPESYNC_ZOMBIE_TIMEOUT_SECS";
pub const BATCH_SIZE: &str = "PIPESYNC_BATCH_SIZE";
pub const SCHEDULE_INTERVAL_SECS: &str = "PIPESYNC_SCHEDULE_INTERVAL_SECS";
pub const PIPELINES: &str = "PIPESYNC_PIPELINES";
pub const INBOX_DIR: &str = "PIPESYNC_INBOX_DIR";
pub const COMMERCE_URL: &str = "PIPESYNC_COMMERCE_URL";
pub const COMMERCE_TOKEN: &str = "PIPESYNC_COMMERCE_TOKEN";
pub const COMMERCE_TIMEOUT_SECS: &str = "PIPESYNC_COMMERCE_TIMEOUT_SECS";

/// Commerce admin gateway connection.
#[derive(Clone)]
pub struct CommerceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for CommerceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommerceConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Shared by every pipeline worker; each gets its own name.
    pub engine: EngineConfig,
    pub batch_size: usize,
    /// `None` disables recurring runs.
    pub schedule: Option<SchedulerConfig>,
    pub pipelines: Vec<PipelineType>,
    pub inbox_dir: PathBuf,
    pub commerce: CommerceConfig,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"***")
            .field("db_max_connections", &self.db_max_connections)
            .field("engine", &self.engine)
            .field("batch_size", &self.batch_size)
            .field("schedule", &self.schedule)
            .field("pipelines", &self.pipelines)
            .field("inbox_dir", &self.inbox_dir)
            .field("commerce", &self.commerce)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = get(DATABASE_URL).ok_or(ConfigError::Missing(DATABASE_URL))?;
        let base_url = get(COMMERCE_URL).ok_or(ConfigError::Missing(COMMERCE_URL))?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(COMMERCE_URL, "expected an http(s) URL"));
        }

        let engine = EngineConfig::default()
            .with_poll_interval(Duration::from_millis(parse_or(&get, POLL_INTERVAL_MS, 1_000)?))
            .with_zombie_timeout(Duration::from_secs(parse_or(&get, ZOMBIE_TIMEOUT_SECS, 30 * 60)?));
        engine.zombie_delta()?;

        let batch_size: usize = parse_or(&get, BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::invalid(BATCH_SIZE, "must be at least 1"));
        }

        let pipelines = match get(PIPELINES) {
            Some(raw) => parse_pipelines(&raw)?,
            None => PipelineType::ALL.to_vec(),
        };

        let schedule_secs: u64 = parse_or(&get, SCHEDULE_INTERVAL_SECS, 60 * 60)?;
        let schedule = (schedule_secs > 0).then(|| {
            SchedulerConfig::default()
                .with_interval(Duration::from_secs(schedule_secs))
                .with_pipelines(pipelines.iter().copied())
        });

        Ok(Self {
            database_url,
            db_max_connections: parse_or(&get, DB_MAX_CONNECTIONS, 5)?,
            engine,
            batch_size,
            schedule,
            pipelines,
            inbox_dir: get(INBOX_DIR).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("inbox")),
            commerce: CommerceConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                token: get(COMMERCE_TOKEN),
                timeout: Duration::from_secs(parse_or(&get, COMMERCE_TIMEOUT_SECS, 30)?),
            },
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("`{raw}`: {e}"))),
        None => Ok(default),
    }
}

/// Comma separated pipeline tags, e.g. `variant_sync,tracking_sync`.
fn parse_pipelines(raw: &str) -> Result<Vec<PipelineType>, ConfigError> {
    let mut pipelines = Vec::new();
    for tag in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let pipeline: PipelineType = tag
            .parse()
            .map_err(|e: pipesync_core::DomainError| ConfigError::invalid(PIPELINES, e.to_string()))?;
        if !pipelines.contains(&pipeline) {
            pipelines.push(pipeline);
        }
    }
    if pipelines.is_empty() {
        return Err(ConfigError::invalid(PIPELINES, "no pipeline selected"));
    }
    Ok(pipelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        (DATABASE_URL, "postgres://pipesync@localhost/pipesync"),
        (COMMERCE_URL, "https://commerce.internal/"),
    ];

    #[test]
    fn defaults() {
        let config = config(&REQUIRED).unwrap();
        assert_eq!(config.engine.poll_interval, Duration::from_secs(1));
        assert_eq!(config.engine.zombie_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.pipelines, PipelineType::ALL.to_vec());
        assert_eq!(config.schedule.unwrap().interval, Duration::from_secs(3600));
        assert_eq!(config.commerce.base_url, "https://commerce.internal");
        assert_eq!(config.inbox_dir, PathBuf::from("inbox"));
    }

    #[test]
    fn required_settings() {
        assert_eq!(
            config(&[REQUIRED[1]]).unwrap_err(),
            ConfigError::Missing(DATABASE_URL)
        );
        assert_eq!(
            config(&[REQUIRED[0], (COMMERCE_URL, "  ")]).unwrap_err(),
            ConfigError::Missing(COMMERCE_URL)
        );
    }

    #[test]
    fn overrides_and_validation() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            (POLL_INTERVAL_MS, "250"),
            (BATCH_SIZE, "100"),
            (SCHEDULE_INTERVAL_SECS, "0"),
            (PIPELINES, "tracking_sync, tracking_sync"),
            (COMMERCE_TOKEN, "secret"),
        ]);
        let config = config(&vars).unwrap();
        assert_eq!(config.engine.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 100);
        assert!(config.schedule.is_none());
        assert_eq!(config.pipelines, vec![PipelineType::TrackingSync]);
        assert!(!format!("{config:?}").contains("secret"));

        for (key, value) in [
            (BATCH_SIZE, "0"),
            (ZOMBIE_TIMEOUT_SECS, "0"),
            (POLL_INTERVAL_MS, "soon"),
            (PIPELINES, "order_sync"),
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((key, value));
            assert!(
                matches!(config_err(&vars), ConfigError::Invalid { .. }),
                "{key}={value} should be rejected"
            );
        }
    }

    fn config_err(vars: &[(&str, &str)]) -> ConfigError {
        config(vars).unwrap_err()
    }
}
