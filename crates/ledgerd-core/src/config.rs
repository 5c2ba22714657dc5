//! Configuration loading and typed config structures for the daemon.
//!
//! Configuration lives in a YAML file (conventionally `ledgerd-config.yaml`).
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```yaml
//! data_dir: ./ledgerd-data
//! heartbeat_interval_secs: 5.0
//! auto_start: true
//! listener_warn_after_ms: 1000
//! listener_timeout_ms: 5000
//! broadcast_capacity: 1024
//! logging:
//!   level: info
//!   json: false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable overriding [`DaemonConfig::data_dir`].
pub const ENV_DATA_DIR: &str = "LEDGERD_DATA_DIR";

/// Environment variable overriding [`DaemonConfig::heartbeat_interval_secs`].
pub const ENV_HEARTBEAT_INTERVAL_SECS: &str = "LEDGERD_HEARTBEAT_INTERVAL_SECS";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// An environment override could not be parsed.
    #[error("invalid value in environment variable {var}: {reason}")]
    Env {
        /// The variable name.
        var: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the event log and the index.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between heartbeats. Must be finite and positive.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,

    /// Whether opening the daemon also starts it.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Listener calls slower than this are logged as warnings.
    #[serde(default = "default_listener_warn_after_ms")]
    pub listener_warn_after_ms: u64,

    /// Listener calls still running after this are abandoned and counted
    /// as failures. Must be positive.
    #[serde(default = "default_listener_timeout_ms")]
    pub listener_timeout_ms: u64,

    /// Buffered events per asynchronous subscriber before it lags.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the heartbeat interval in seconds.
    #[must_use]
    pub const fn with_heartbeat_interval_secs(mut self, secs: f64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Set whether opening also starts the daemon.
    #[must_use]
    pub const fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Set the slow-listener warning threshold.
    #[must_use]
    pub const fn with_listener_warn_after_ms(mut self, ms: u64) -> Self {
        self.listener_warn_after_ms = ms;
        self
    }

    /// Set the listener call timeout.
    #[must_use]
    pub const fn with_listener_timeout_ms(mut self, ms: u64) -> Self {
        self.listener_timeout_ms = ms;
        self
    }

    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override file values:
    /// - `LEDGERD_DATA_DIR` overrides `data_dir`
    /// - `LEDGERD_HEARTBEAT_INTERVAL_SECS` overrides `heartbeat_interval_secs`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, an
    /// override is malformed, or a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. No overrides, no validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply `LEDGERD_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if an override cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var(ENV_HEARTBEAT_INTERVAL_SECS) {
            self.heartbeat_interval_secs =
                val.trim().parse().map_err(|e: std::num::ParseFloatError| ConfigError::Env {
                    var: ENV_HEARTBEAT_INTERVAL_SECS,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.heartbeat_interval()?;
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "broadcast_capacity",
                reason: String::from("must be at least 1"),
            });
        }
        if self.listener_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "listener_timeout_ms",
                reason: String::from("must be greater than zero"),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "data_dir",
                reason: String::from("must not be empty"),
            });
        }
        Ok(())
    }

    /// The heartbeat interval as a [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the interval is not a finite
    /// positive number of seconds.
    pub fn heartbeat_interval(&self) -> Result<Duration, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            field: "heartbeat_interval_secs",
            reason,
        };
        let interval = Duration::try_from_secs_f64(self.heartbeat_interval_secs)
            .map_err(|e| invalid(e.to_string()))?;
        if interval.is_zero() {
            return Err(invalid(String::from("must be greater than zero")));
        }
        Ok(interval)
    }

    /// The slow-listener warning threshold as a [`Duration`].
    pub const fn listener_warn_after(&self) -> Duration {
        Duration::from_millis(self.listener_warn_after_ms)
    }

    /// The listener call timeout as a [`Duration`].
    pub const fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            auto_start: true,
            listener_warn_after_ms: default_listener_warn_after_ms(),
            listener_timeout_ms: default_listener_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration, consumed by the daemon binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./ledgerd-data")
}

const fn default_heartbeat_interval_secs() -> f64 {
    5.0
}

const fn default_true() -> bool {
    true
}

const fn default_listener_warn_after_ms() -> u64 {
    1_000
}

const fn default_listener_timeout_ms() -> u64 {
    5_000
}

const fn default_broadcast_capacity() -> usize {
    1_024
}

fn default_log_level() -> String {
    String::from("info")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval().unwrap(), Duration::from_secs(5));
        assert!(config.auto_start);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r"
data_dir: /var/lib/ledgerd
heartbeat_interval_secs: 0.25
auto_start: false
listener_warn_after_ms: 50
listener_timeout_ms: 200
broadcast_capacity: 16
logging:
  level: debug
  json: true
";
        let config = DaemonConfig::parse(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ledgerd"));
        assert_eq!(
            config.heartbeat_interval().unwrap(),
            Duration::from_millis(250)
        );
        assert!(!config.auto_start);
        assert_eq!(config.listener_warn_after(), Duration::from_millis(50));
        assert_eq!(config.listener_timeout(), Duration::from_millis(200));
        assert_eq!(config.broadcast_capacity, 16);
        assert!(config.logging.json);
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        let partial = DaemonConfig::parse("auto_start: false\n").unwrap();
        assert!(!partial.auto_start);
        assert_eq!(partial.broadcast_capacity, 1_024);
    }

    #[test]
    fn rejects_bad_intervals() {
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = DaemonConfig::new("data").with_heartbeat_interval_secs(secs);
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::Invalid {
                        field: "heartbeat_interval_secs",
                        ..
                    })
                ),
                "accepted {secs}"
            );
        }
    }

    #[test]
    fn rejects_zero_broadcast_capacity() {
        let mut config = DaemonConfig::new("data");
        config.broadcast_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_listener_timeout() {
        let config = DaemonConfig::new("data").with_listener_timeout_ms(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "listener_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgerd-config.yaml");
        std::fs::write(&path, "heartbeat_interval_secs: 2\nauto_start: false\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert!(!config.auto_start);
        assert!(DaemonConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }
}
