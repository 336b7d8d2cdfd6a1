//! Configuration of replicas and the proxy

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Errors while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of the reservation system
///
/// Every field has a default, so a configuration file only needs to list the
/// values it overrides. Durations are written in humantime notation, e.g.
/// `"5s"` or `"30m"`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the environment (`dev`, `staging`, `prod`, ...)
    pub environment: String,
    /// Default log level, overridden by `RUST_LOG`
    pub log_level: String,
    /// Artificial delay per processed reservation
    #[serde(with = "humantime_serde")]
    pub processing_delay: Duration,

    /// Capacity of the book cache
    pub cache_size: usize,
    /// Store connections opened eagerly at startup
    pub min_connections: usize,
    /// Upper bound on live store connections
    pub max_connections: usize,

    /// Maximum number of reservations processed per batch
    pub batch_size: usize,
    /// Pause after each processed batch
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    /// How long the worker idles on an empty queue before re-checking
    #[serde(with = "humantime_serde")]
    pub idle_interval: Duration,
    /// Pause after a failed batch
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Number of latency samples kept by the SLA tracker
    pub sla_window: usize,
    /// Time between two SLA reports
    #[serde(with = "humantime_serde")]
    pub sla_report_interval: Duration,
    /// File the SLA reports are appended to
    pub sla_report_path: PathBuf,

    /// Replicas the reverse proxy balances across, in rotation order
    pub backends: Vec<String>,
    /// Timeout for one forwarded request
    #[serde(with = "humantime_serde")]
    pub proxy_timeout: Duration,
    /// Time between two load balancer statistics reports
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Number of threads serving HTTP requests
    pub handler_threads: usize,
    /// Seed the store with the sample catalog
    pub seed_sample_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: String::from("dev"),
            log_level: String::from("debug"),
            processing_delay: Duration::ZERO,
            cache_size: 1000,
            min_connections: 2,
            max_connections: 10,
            batch_size: 10,
            batch_interval: Duration::from_secs(5),
            idle_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            sla_window: 1000,
            sla_report_interval: Duration::from_secs(30 * 60),
            sla_report_path: PathBuf::from("sla_report.txt"),
            backends: vec![
                String::from("http://localhost:8080"),
                String::from("http://localhost:8081"),
            ],
            proxy_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
            handler_threads: 16,
            seed_sample_data: true,
        }
    }
}

impl Config {
    /// Load `config_{environment}.json` from `dir`
    ///
    /// A missing file is not an error: the defaults are used (with the
    /// requested environment name) and a warning is logged.
    pub fn load(dir: &Path, environment: &str) -> Result<Self, ConfigError> {
        let path = dir.join(format!("config_{environment}.json"));
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self {
                    environment: environment.to_string(),
                    ..Self::default()
                });
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        let config = Self::from_json(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Load the file selected by the `ENVIRONMENT` variable (default `dev`)
    pub fn from_env(dir: &Path) -> Result<Self, ConfigError> {
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| String::from("dev"));
        Self::load(dir, &environment)
    }

    /// Parse a JSON document, filling in defaults for missing fields
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the relations between fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::Invalid("cache_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.sla_window == 0 {
            return Err(ConfigError::Invalid("sla_window must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_json(
            r#"{
                "environment": "staging",
                "processing_delay": "100ms",
                "cache_size": 500,
                "batch_interval": "2s"
            }"#,
        )
        .unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.processing_delay, Duration::from_millis(100));
        assert_eq!(config.cache_size, 500);
        assert_eq!(config.batch_interval, Duration::from_secs(2));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.sla_report_interval, Duration::from_secs(1800));
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = Config::from_json(r#"{ "min_connections": 5, "max_connections": 2 }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = Config::from_json(r#"{ "batch_interval": 5 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join("library-core-config-missing");
        let config = Config::load(&dir, "nowhere").unwrap();
        assert_eq!(config.environment, "nowhere");
        assert_eq!(config.min_connections, 2);
    }
}
