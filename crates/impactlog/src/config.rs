//! Configuration management for impactlog.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults. All
//! values are fixed at startup.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::writer::DEFAULT_FLUSH_THRESHOLD;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "impactlog";

/// Default log file name.
const LOG_FILE_NAME: &str = "impacts.csv";

/// Prefix for environment overrides, e.g. `IMPACTLOG_SERVER__PORT=8080`.
const ENV_PREFIX: &str = "IMPACTLOG_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `IMPACTLOG_`, sections split on `__`)
/// 2. TOML config file at `~/.config/impactlog/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Access control configuration.
    pub access: AccessConfig,
    /// Event log configuration.
    pub log: LogConfig,
    /// Sampling loop configuration.
    pub monitor: MonitorConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Buffered bytes that trigger a socket write.
    pub flush_threshold: usize,
    /// Deadline for a whole connection in milliseconds.
    /// Set to 0 to let a stalled client hold its connection indefinitely.
    pub idle_timeout_ms: u64,
    /// How often the page polls `/status`, in milliseconds.
    pub poll_interval_ms: u64,
    /// Page template to use instead of the built-in one.
    pub template_path: Option<PathBuf>,
    /// Stylesheet to use instead of the built-in one.
    pub stylesheet_path: Option<PathBuf>,
}

/// Access control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Peers whose address string starts with this prefix are served.
    pub allowed_prefix: String,
    /// Rate limiting window in milliseconds.
    pub window_ms: u64,
    /// Requests allowed per client inside one window.
    pub max_requests: usize,
    /// Upper bound on clients tracked by the rate limiter.
    pub max_tracked_clients: usize,
}

/// Event log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Path to the log file.
    /// Defaults to `~/.local/share/impactlog/impacts.csv`
    pub path: Option<PathBuf>,
    /// Column names written as the header row.
    pub columns: Vec<String>,
}

/// How impact timestamps are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStyle {
    /// Time since the monitor started, `mm:ss:mmm`.
    #[default]
    Uptime,
    /// Local wall-clock time, `HH:MM:SS.mmm`.
    WallClock,
}

/// Sampling loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the sampling loop at all.
    pub enabled: bool,
    /// Magnitude (in g) above which an impact is recorded.
    pub impact_threshold: f64,
    /// Magnitude (in g) above which an impact counts as a crash.
    pub crash_threshold: f64,
    /// Sampling interval in milliseconds.
    pub sample_rate_ms: u64,
    /// How long the alert indicator runs after an impact, in milliseconds.
    pub alert_duration_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Timestamp format for recorded impacts.
    pub timestamp_style: TimestampStyle,
    /// Chance per sample that the simulated sensor reports an impact.
    pub simulated_impact_probability: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 80,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            idle_timeout_ms: 0, // Opt-in only
            poll_interval_ms: 2000,
            template_path: None,
            stylesheet_path: None,
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_prefix: "192.168.4.".to_string(),
            window_ms: 5000,
            max_requests: 10,
            max_tracked_clients: 64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: None, // Will be resolved to default at runtime
            columns: vec![
                "Time since boot (mm:ss:msms)".to_string(),
                "G-Force".to_string(),
            ],
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            impact_threshold: 2.5,
            crash_threshold: 3.5,
            sample_rate_ms: 100,
            alert_duration_ms: 3000,
            heartbeat_ms: 1000,
            timestamp_style: TimestampStyle::Uptime,
            simulated_impact_probability: 0.01,
        }
    }
}

impl AccessConfig {
    /// Get the rate limiting window as a Duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl ServerConfig {
    /// Get the connection deadline, if one is configured.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Get the page polling interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MonitorConfig {
    /// Get the sampling interval as a Duration.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_rate_ms)
    }

    /// Get the alert duration as a Duration.
    #[must_use]
    pub fn alert_duration(&self) -> Duration {
        Duration::from_millis(self.alert_duration_ms)
    }

    /// Get the heartbeat interval as a Duration.
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Config {
    /// Load configuration from all sources, reading `config_path` instead of
    /// the default file when given.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        // Server
        if self.server.flush_threshold == 0 {
            return Err(Error::config("flush_threshold must be greater than 0"));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be greater than 0"));
        }

        // Access
        if self.access.window_ms == 0 {
            return Err(Error::config("window_ms must be greater than 0"));
        }
        if self.access.max_requests == 0 {
            return Err(Error::config("max_requests must be greater than 0"));
        }
        if self.access.max_tracked_clients == 0 {
            return Err(Error::config(
                "max_tracked_clients must be greater than 0",
            ));
        }

        // Log
        if self.log.columns.len() != 2 {
            return Err(Error::config(format!(
                "log columns must name exactly 2 fields, got {}",
                self.log.columns.len()
            )));
        }
        for column in &self.log.columns {
            if column.is_empty() || column.contains(&[',', '\n', '\r'][..]) {
                return Err(Error::config(format!(
                    "invalid log column name: {column:?}"
                )));
            }
        }

        // Monitor
        if self.monitor.sample_rate_ms == 0 {
            return Err(Error::config("sample_rate_ms must be greater than 0"));
        }
        if self.monitor.heartbeat_ms == 0 {
            return Err(Error::config("heartbeat_ms must be greater than 0"));
        }
        if self.monitor.impact_threshold.is_nan() || self.monitor.impact_threshold <= 0.0 {
            return Err(Error::config("impact_threshold must be greater than 0"));
        }
        if self.monitor.crash_threshold < self.monitor.impact_threshold {
            return Err(Error::config(format!(
                "crash_threshold ({}) cannot be less than impact_threshold ({})",
                self.monitor.crash_threshold, self.monitor.impact_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.monitor.simulated_impact_probability) {
            return Err(Error::config(
                "simulated_impact_probability must be between 0 and 1",
            ));
        }

        Ok(())
    }

    /// Get the log file path, resolving defaults if not set.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.log
            .path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(LOG_FILE_NAME))
    }
}
