/*!
 * Configuration for the object model
 *
 * Every timing knob of the caches, event layer and job trackers lives here.
 * Values are plain integers in the file and exposed as `Duration`s.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for caches, events, jobs and the proxy repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Property snapshots younger than this are served without a fetch
    #[serde(default = "default_refresh_threshold_ms")]
    pub property_refresh_threshold_ms: u64,

    /// Association lists younger than this are served without a query
    #[serde(default = "default_refresh_threshold_ms")]
    pub association_refresh_threshold_ms: u64,

    /// Server-side polling window (`WITHIN n`) for event subscriptions
    #[serde(default = "default_event_within_secs")]
    pub event_within_secs: u64,

    /// Rotation period of the bulk monitor's missed-event buffer
    #[serde(default = "default_bulk_cleanup_interval_ms")]
    pub bulk_cleanup_interval_ms: u64,

    /// Safety re-check period while waiting on a job
    #[serde(default = "default_job_recheck_interval_ms")]
    pub job_recheck_interval_ms: u64,

    /// Poll period of the network job wait
    #[serde(default = "default_network_poll_interval_ms")]
    pub network_poll_interval_ms: u64,

    /// Continuous unreachability tolerated by the network job wait
    #[serde(default = "default_network_ceiling_secs")]
    pub network_ceiling_secs: u64,

    /// How often running tasks check their server is still there
    #[serde(default = "default_task_connection_check_interval_ms")]
    pub task_connection_check_interval_ms: u64,

    /// Unused proxies are downgraded to weak references after this long
    #[serde(default = "default_proxy_idle_timeout_secs")]
    pub proxy_idle_timeout_secs: u64,

    #[serde(default = "default_repository_cleanup_interval_secs")]
    pub repository_cleanup_interval_secs: u64,

    /// Upper bound on the text of one generated query
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            property_refresh_threshold_ms: default_refresh_threshold_ms(),
            association_refresh_threshold_ms: default_refresh_threshold_ms(),
            event_within_secs: default_event_within_secs(),
            bulk_cleanup_interval_ms: default_bulk_cleanup_interval_ms(),
            job_recheck_interval_ms: default_job_recheck_interval_ms(),
            network_poll_interval_ms: default_network_poll_interval_ms(),
            network_ceiling_secs: default_network_ceiling_secs(),
            task_connection_check_interval_ms: default_task_connection_check_interval_ms(),
            proxy_idle_timeout_secs: default_proxy_idle_timeout_secs(),
            repository_cleanup_interval_secs: default_repository_cleanup_interval_secs(),
            max_query_length: default_max_query_length(),
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_refresh_threshold_ms() -> u64 {
    1000
}

fn default_event_within_secs() -> u64 {
    2
}

fn default_bulk_cleanup_interval_ms() -> u64 {
    5000
}

fn default_job_recheck_interval_ms() -> u64 {
    1000
}

fn default_network_poll_interval_ms() -> u64 {
    5000
}

fn default_network_ceiling_secs() -> u64 {
    15 * 60
}

fn default_task_connection_check_interval_ms() -> u64 {
    5000
}

fn default_proxy_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_repository_cleanup_interval_secs() -> u64 {
    10 * 60
}

fn default_max_query_length() -> usize {
    16 * 1024
}

impl ModelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ModelConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings that would spin or never fire
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("bulk_cleanup_interval_ms", self.bulk_cleanup_interval_ms),
            ("job_recheck_interval_ms", self.job_recheck_interval_ms),
            ("network_poll_interval_ms", self.network_poll_interval_ms),
            (
                "task_connection_check_interval_ms",
                self.task_connection_check_interval_ms,
            ),
            (
                "repository_cleanup_interval_secs",
                self.repository_cleanup_interval_secs,
            ),
            ("event_within_secs", self.event_within_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }

        if self.network_ceiling_secs * 1000 < self.network_poll_interval_ms {
            return Err(Error::Config(
                "network_ceiling_secs must cover at least one poll interval".to_string(),
            ));
        }

        // room for the SELECT template plus at least one clause
        if self.max_query_length < 256 {
            return Err(Error::Config(format!(
                "max_query_length {} is too small (minimum 256)",
                self.max_query_length
            )));
        }
        Ok(())
    }

    /// Shorter intervals for interactive tools
    pub fn responsive() -> Self {
        Self {
            property_refresh_threshold_ms: 250,
            association_refresh_threshold_ms: 250,
            event_within_secs: 1,
            bulk_cleanup_interval_ms: 2000,
            job_recheck_interval_ms: 250,
            network_poll_interval_ms: 1000,
            task_connection_check_interval_ms: 2000,
            ..Default::default()
        }
    }

    pub fn property_refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.property_refresh_threshold_ms)
    }

    pub fn association_refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.association_refresh_threshold_ms)
    }

    pub fn event_within(&self) -> Duration {
        Duration::from_secs(self.event_within_secs)
    }

    pub fn bulk_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.bulk_cleanup_interval_ms)
    }

    pub fn job_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.job_recheck_interval_ms)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_millis(self.network_poll_interval_ms)
    }

    pub fn network_ceiling(&self) -> Duration {
        Duration::from_secs(self.network_ceiling_secs)
    }

    pub fn task_connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.task_connection_check_interval_ms)
    }

    pub fn proxy_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_idle_timeout_secs)
    }

    pub fn repository_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.repository_cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.property_refresh_threshold(), Duration::from_secs(1));
        assert_eq!(config.event_within(), Duration::from_secs(2));
        assert_eq!(config.network_ceiling(), Duration::from_secs(900));
        assert_eq!(config.max_query_length, 16384);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_responsive_preset() {
        let config = ModelConfig::responsive();
        assert!(config.job_recheck_interval() < ModelConfig::default().job_recheck_interval());
        assert_eq!(config.network_ceiling_secs, 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ModelConfig = toml::from_str(
            r#"
            event_within_secs = 5
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.event_within_secs, 5);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.bulk_cleanup_interval_ms, 5000);
    }

    #[test]
    fn test_file_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let mut config = ModelConfig::responsive();
        config.log_file = Some(PathBuf::from("/var/log/virtmgmt.json"));
        config.to_file(file.path()).unwrap();

        let loaded = ModelConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ModelConfig {
            job_recheck_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("job_recheck_interval_ms"));
    }

    #[test]
    fn test_validate_rejects_tiny_query_length() {
        let config = ModelConfig {
            max_query_length: 40,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file_reports_parse_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "event_within_secs = \"soon\"").unwrap();
        assert!(matches!(
            ModelConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
