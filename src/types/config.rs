//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (path given directly or through
//! `TOOLHUB_CONFIG`); every section falls back to its defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TOOLHUB_CONFIG";

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Execution engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Calling-log retention sweep.
    #[serde(default)]
    pub janitor: JanitorConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load from `TOOLHUB_CONFIG` if set, defaults otherwise.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}

/// Admission policy for tools that reference no concurrency group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UngroupedPolicy {
    /// No bound at all.
    Unbounded,
    /// All ungrouped tools share one gate of this size.
    Shared { max_concurrency: usize },
}

impl Default for UngroupedPolicy {
    fn default() -> Self {
        UngroupedPolicy::Shared {
            max_concurrency: 16,
        }
    }
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission policy for ungrouped tools.
    pub ungrouped: UngroupedPolicy,

    /// Timeout applied when neither the invocation nor the tool sets one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Upper bound for a dependency install command.
    #[serde(with = "humantime_serde")]
    pub install_timeout: Duration,

    /// Upper bound for a single dependency testcase command.
    #[serde(with = "humantime_serde")]
    pub testcase_timeout: Duration,

    /// How long a terminated process gets before it is force-killed.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// A service must stay alive this long before it counts as running.
    #[serde(with = "humantime_serde")]
    pub service_start_grace: Duration,

    /// How long a stopping service gets before it is force-killed.
    #[serde(with = "humantime_serde")]
    pub service_stop_grace: Duration,

    /// Bounded channel capacity for streamed output (in chunks).
    pub stream_channel_capacity: usize,

    /// Read size for a single output chunk.
    pub chunk_bytes: usize,

    /// Cap on buffered stdout/stderr per invocation; extra output is dropped
    /// and the result is marked truncated.
    pub max_output_bytes: usize,

    /// Bytes of stderr/stdout kept for diagnostics (services, streams).
    pub tail_bytes: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if let UngroupedPolicy::Shared { max_concurrency: 0 } = self.ungrouped {
            return Err(Error::configuration(
                "ungrouped max_concurrency must be at least 1",
            ));
        }
        if self.stream_channel_capacity == 0 || self.chunk_bytes == 0 {
            return Err(Error::configuration(
                "stream_channel_capacity and chunk_bytes must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ungrouped: UngroupedPolicy::default(),
            default_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(600),
            testcase_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            service_start_grace: Duration::from_millis(500),
            service_stop_grace: Duration::from_secs(5),
            stream_channel_capacity: 64,
            chunk_bytes: 8 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
            tail_bytes: 64 * 1024,
        }
    }
}

/// Calling-log retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// How often to prune calling logs (default: 10 minutes).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.engine.validate().unwrap();
        assert_eq!(
            config.engine.ungrouped,
            UngroupedPolicy::Shared {
                max_concurrency: 16
            }
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"engine": {{"default_timeout": "5s", "ungrouped": {{"mode": "unbounded"}}}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.default_timeout, Duration::from_secs(5));
        assert_eq!(config.engine.ungrouped, UngroupedPolicy::Unbounded);
        assert_eq!(config.engine.stream_channel_capacity, 64);
        assert_eq!(config.janitor.interval, Duration::from_secs(600));
    }

    #[test]
    fn test_zero_ungrouped_limit_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"engine": {{"ungrouped": {{"mode": "shared", "max_concurrency": 0}}}}}}"#
        )
        .unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = Config::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
