//! Daemon configuration.
//!
//! Loaded from a TOML file (explicit path, or
//! `$XDG_CONFIG_HOME/docsync/config.toml`), then overridden by the
//! `DOCSYNC_SOCKET` environment variable. Missing keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::session::SessionSettings;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/docsync.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV_VAR: &str = "DOCSYNC_SOCKET";

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the server listens on.
    pub socket_path: PathBuf,

    /// How often unused sessions are looked for.
    pub check_unused_sessions_ms: u64,

    /// How long a session without connections is kept.
    pub unused_session_lifetime_ms: u64,

    /// How often server statistics are logged.
    pub stats_log_frequency_ms: u64,

    /// Locked document operations slower than this are logged.
    pub slow_callback_warning_ms: u64,

    /// Maximum number of concurrent connections.
    pub max_connections: usize,

    /// Outbound messages buffered per connection.
    pub outbound_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            check_unused_sessions_ms: 17_000,
            unused_session_lifetime_ms: 15_000,
            stats_log_frequency_ms: 15_000,
            slow_callback_warning_ms: 100,
            max_connections: 1024,
            outbound_buffer: 64,
        }
    }
}

impl DaemonConfig {
    /// Default config file location.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("docsync").join("config.toml"))
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Reads a config file. Fails if the file is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml(&contents, path)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Loads `path`, or the default location if it exists, else defaults.
    ///
    /// The environment override is applied and the result validated.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::config_path() {
                Some(default) if default.exists() => Self::load(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(socket) = std::env::var(SOCKET_ENV_VAR) {
            if !socket.is_empty() {
                self.socket_path = PathBuf::from(socket);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("check_unused_sessions_ms", self.check_unused_sessions_ms),
            ("stats_log_frequency_ms", self.stats_log_frequency_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "outbound_buffer",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn check_unused_sessions(&self) -> Duration {
        Duration::from_millis(self.check_unused_sessions_ms)
    }

    pub fn unused_session_lifetime(&self) -> Duration {
        Duration::from_millis(self.unused_session_lifetime_ms)
    }

    pub fn stats_log_frequency(&self) -> Duration {
        Duration::from_millis(self.stats_log_frequency_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            slow_operation_warning: Duration::from_millis(self.slow_callback_warning_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.check_unused_sessions(), Duration::from_millis(17_000));
        assert_eq!(config.unused_session_lifetime(), Duration::from_millis(15_000));
        assert_eq!(config.max_connections, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            "unused_session_lifetime_ms = 500\nmax_connections = 8\n",
            Path::new("inline.toml"),
        )
        .unwrap();
        assert_eq!(config.unused_session_lifetime_ms, 500);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.stats_log_frequency_ms, 15_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "socket_path = \"/run/docsync/test.sock\"").unwrap();
        writeln!(file, "slow_callback_warning_ms = 250").unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/docsync/test.sock"));
        assert_eq!(
            config.session_settings().slow_operation_warning,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_toml() {
        let err = DaemonConfig::from_toml("max_connections = \"lots\"", Path::new("bad.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = DaemonConfig {
            check_unused_sessions_ms: 0,
            ..DaemonConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("check_unused_sessions_ms"));
    }
}
