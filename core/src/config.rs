//! Harness configuration.
//!
//! Loaded from a YAML file (every field optional) and overridden by CLI flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CriTestError, Result};

/// Default CRI runtime endpoint.
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///var/run/containerd/containerd.sock";

/// Default control-plane address used to resolve relative streaming URLs.
pub const DEFAULT_STREAMING_BASE_URL: &str = "http://127.0.0.1:10250";

/// Default image for test containers.
pub const DEFAULT_CONTAINER_IMAGE: &str = "busybox:1.26";

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriTestConfig {
    /// CRI RuntimeService endpoint (`unix://`, bare socket path, `tcp://` or `http://`)
    pub runtime_endpoint: String,

    /// CRI ImageService endpoint (falls back to the runtime endpoint when empty)
    pub image_endpoint: String,

    /// Per-call timeout for RuntimeService RPCs, in seconds
    pub runtime_timeout_secs: u64,

    /// Per-call timeout for ImageService RPCs, in seconds
    pub image_timeout_secs: u64,

    /// Base address for relative exec/attach streaming URLs
    pub streaming_base_url: String,

    /// PEM bundle verifying `https` streaming servers; unset accepts any
    /// server certificate
    pub streaming_ca_file: Option<PathBuf>,

    /// Interval between container status polls, in milliseconds
    pub poll_interval_ms: u64,

    /// Deadline for a container to reach a polled state, in seconds
    pub state_deadline_secs: u64,

    /// StopContainer grace period and caller-side bound, in seconds
    pub stop_timeout_secs: i64,

    /// ExecSync command timeout, in seconds
    pub exec_sync_timeout_secs: i64,

    /// Image used for scenario containers
    pub default_image: String,

    /// Number of scenarios executed concurrently
    pub parallel: usize,

    /// Default log level when `RUST_LOG` is unset
    pub log_level: LogLevel,
}

impl Default for CriTestConfig {
    fn default() -> Self {
        Self {
            runtime_endpoint: DEFAULT_RUNTIME_ENDPOINT.to_string(),
            image_endpoint: String::new(),
            runtime_timeout_secs: 120,
            image_timeout_secs: 300,
            streaming_base_url: DEFAULT_STREAMING_BASE_URL.to_string(),
            streaming_ca_file: None,
            poll_interval_ms: 4000,
            state_deadline_secs: 60,
            stop_timeout_secs: 60,
            exec_sync_timeout_secs: 5,
            default_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            parallel: 1,
            log_level: LogLevel::Info,
        }
    }
}

impl CriTestConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the harness cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_endpoint.trim().is_empty() {
            return Err(CriTestError::ConfigError(
                "runtime_endpoint must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(CriTestError::ConfigError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.state_deadline_secs == 0 {
            return Err(CriTestError::ConfigError(
                "state_deadline_secs must be greater than zero".to_string(),
            ));
        }
        if self.stop_timeout_secs <= 0 {
            return Err(CriTestError::ConfigError(
                "stop_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.parallel == 0 {
            return Err(CriTestError::ConfigError(
                "parallel must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.streaming_base_url).map_err(|e| {
            CriTestError::ConfigError(format!(
                "invalid streaming_base_url '{}': {}",
                self.streaming_base_url, e
            ))
        })?;
        if let Some(path) = &self.streaming_ca_file {
            if !path.is_file() {
                return Err(CriTestError::ConfigError(format!(
                    "streaming_ca_file {} is not a file",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Image endpoint, falling back to the runtime endpoint.
    pub fn image_endpoint(&self) -> &str {
        if self.image_endpoint.is_empty() {
            &self.runtime_endpoint
        } else {
            &self.image_endpoint
        }
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn state_deadline(&self) -> Duration {
        Duration::from_secs(self.state_deadline_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs.max(0) as u64)
    }

    pub fn exec_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_sync_timeout_secs.max(0) as u64)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CriTestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(4));
        assert_eq!(config.state_deadline(), Duration::from_secs(60));
        assert_eq!(config.default_image, "busybox:1.26");
    }

    #[test]
    fn test_image_endpoint_falls_back_to_runtime() {
        let mut config = CriTestConfig::default();
        assert_eq!(config.image_endpoint(), DEFAULT_RUNTIME_ENDPOINT);

        config.image_endpoint = "unix:///run/images.sock".to_string();
        assert_eq!(config.image_endpoint(), "unix:///run/images.sock");
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = CriTestConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CriTestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_streaming_url() {
        let config = CriTestConfig {
            streaming_base_url: "not a url".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("streaming_base_url"));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let config = CriTestConfig {
            runtime_endpoint: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "runtime_endpoint: unix:///run/crio/crio.sock\nparallel: 4\nlog_level: debug"
        )
        .unwrap();

        let config = CriTestConfig::from_file(file.path()).unwrap();
        assert_eq!(config.runtime_endpoint, "unix:///run/crio/crio.sock");
        assert_eq!(config.parallel, 4);
        assert_eq!(config.log_level, LogLevel::Debug);
        // Unset fields keep their defaults
        assert_eq!(config.exec_sync_timeout_secs, 5);
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "parallel: [not, a, number]").unwrap();
        let err = CriTestConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, CriTestError::SerializationError(_)));
    }

    #[test]
    fn test_validate_checks_streaming_ca_file() {
        let mut config = CriTestConfig {
            streaming_ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("streaming_ca_file"));

        let file = tempfile::NamedTempFile::new().unwrap();
        config.streaming_ca_file = Some(file.path().to_path_buf());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_into_tracing() {
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
    }
}
