use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::Level;

use crate::error::ConfigError;
use crate::logging::LogConfig;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RUN_DURATION: Duration = Duration::from_secs(100);
pub const DEFAULT_LOOP_SLEEP: Duration = Duration::from_secs(1);

/// Deserialize a `Duration` written as integer milliseconds.
///
/// Use with `#[serde(deserialize_with = "conduit::config::duration_ms::deserialize")]`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// --- Orchestrator Configuration ---

/// Timing and sizing for the orchestrator loop and the worker loops it hosts.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// How long the orchestrator loop runs before shutting the pipeline down.
    #[serde(rename = "run_duration_ms", deserialize_with = "duration_ms::deserialize")]
    pub run_duration: Duration,

    /// Sleep between orchestrator loop iterations.
    #[serde(rename = "loop_sleep_ms", deserialize_with = "duration_ms::deserialize")]
    pub loop_sleep: Duration,

    /// Timeout for blocking queue calls inside worker loops. Bounds shutdown latency.
    #[serde(rename = "poll_timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub poll_timeout: Duration,

    /// Capacity for queues built from this config; 0 means unbounded.
    pub default_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_duration: DEFAULT_RUN_DURATION,
            loop_sleep: DEFAULT_LOOP_SLEEP,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            default_queue_capacity: 0,
        }
    }
}

// --- Logging Configuration ---

/// Logging section of a pipeline config file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub level: String,
    pub json_format: bool,
    pub file_path: Option<PathBuf>,
    pub target_filters: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: None,
            target_filters: None,
        }
    }
}

impl LogSettings {
    /// Convert into a [`LogConfig`] for [`logging::init`](crate::logging::init).
    pub fn to_log_config(&self) -> Result<LogConfig, ConfigError> {
        let level = Level::from_str(&self.level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.level)))?;

        Ok(LogConfig {
            level,
            json_format: self.json_format,
            target_filters: self.target_filters.clone(),
            ..Default::default()
        })
    }
}

// --- Pipeline Configuration ---

/// Top-level configuration file for a pipeline binary.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub orchestrator: OrchestratorConfig,
    pub logging: LogSettings,
}

impl PipelineConfig {
    /// Parse and validate a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms must be greater than 0".to_string()));
        }
        if self.orchestrator.loop_sleep.is_zero() {
            return Err(ConfigError::Invalid("loop_sleep_ms must be greater than 0".to_string()));
        }
        self.logging.to_log_config()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.orchestrator.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.orchestrator.run_duration, Duration::from_secs(100));
        assert_eq!(config.orchestrator.loop_sleep, Duration::from_secs(1));
        assert_eq!(config.orchestrator.default_queue_capacity, 0);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "orchestrator:\n  run_duration_ms: 2500\nlogging:\n  level: debug\n",
        )
        .unwrap();

        assert_eq!(config.orchestrator.run_duration, Duration::from_millis(2500));
        assert_eq!(config.orchestrator.poll_timeout, DEFAULT_POLL_TIMEOUT);
        assert_eq!(config.logging.to_log_config().unwrap().level, Level::DEBUG);
    }

    #[test]
    fn test_zero_poll_timeout_rejected() {
        let err = PipelineConfig::from_yaml_str("orchestrator:\n  poll_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_level_rejected() {
        let err = PipelineConfig::from_yaml_str("logging:\n  level: loud\n").unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = PipelineConfig::from_yaml_str("orchestrator:\n  workers: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "orchestrator:\n  loop_sleep_ms: 250\n  default_queue_capacity: 16").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.orchestrator.loop_sleep, Duration::from_millis(250));
        assert_eq!(config.orchestrator.default_queue_capacity, 16);
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::load("/nonexistent/conduit.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
