//! Agent and client configuration parsing and validation.
//!
//! Both binaries read an optional TOML file. Every field has a default so
//! an empty file (or no file at all) yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_http_port() -> u16 {
    3001
}

fn default_log_port() -> u16 {
    3002
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_workspace_dir() -> PathBuf {
    home_dir().join(".tether").join("workspaces")
}

fn default_bootstrap_dir() -> PathBuf {
    PathBuf::from("/image_scripts")
}

fn default_relay_buffer() -> usize {
    256
}

fn default_db_path() -> PathBuf {
    home_dir().join(".tether").join("tether.db")
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_upload_attempts() -> u32 {
    1000
}

fn default_upload_backoff_ms() -> u64 {
    50
}

fn default_stream_retry_ms() -> u64 {
    1000
}

fn default_ignore_file() -> String {
    ".tetherignore".into()
}

/// Home directory of the current user, falling back to the working directory.
#[must_use]
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Remote agent configuration parsed from `agent.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// HTTP port for the sync endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// TCP port for the log stream.
    #[serde(default = "default_log_port")]
    pub log_port: u16,
    /// Interface both listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Parent directory for workspaces uploaded without an explicit remote path.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Directory of executables launched before every build.
    #[serde(default = "default_bootstrap_dir")]
    pub bootstrap_dir: PathBuf,
    /// Per-subscriber buffer size of the log relay.
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            log_port: default_log_port(),
            bind_address: default_bind_address(),
            workspace_dir: default_workspace_dir(),
            bootstrap_dir: default_bootstrap_dir(),
            relay_buffer: default_relay_buffer(),
        }
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.http_port != 0 && self.http_port == self.log_port {
            return Err(AppError::Config(
                "http_port and log_port must differ".into(),
            ));
        }
        if self.relay_buffer == 0 {
            return Err(AppError::Config(
                "relay_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Local client configuration parsed from `tether.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// `SQLite` file holding workspace definitions.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Delay between two watcher passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum full-upload attempts before giving up.
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
    /// Pause between two full-upload attempts.
    #[serde(default = "default_upload_backoff_ms")]
    pub upload_backoff_ms: u64,
    /// Pause between two log-stream connection attempts.
    #[serde(default = "default_stream_retry_ms")]
    pub stream_retry_ms: u64,
    /// Agent log port the client connects to.
    #[serde(default = "default_log_port")]
    pub log_port: u16,
    /// Ignore file name, relative to each workspace root.
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_ms: default_poll_interval_ms(),
            upload_attempts: default_upload_attempts(),
            upload_backoff_ms: default_upload_backoff_ms(),
            stream_retry_ms: default_stream_retry_ms(),
            log_port: default_log_port(),
            ignore_file: default_ignore_file(),
        }
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Watcher polling interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause between full-upload attempts.
    #[must_use]
    pub fn upload_backoff(&self) -> Duration {
        Duration::from_millis(self.upload_backoff_ms)
    }

    /// Pause between log-stream reconnect attempts.
    #[must_use]
    pub fn stream_retry(&self) -> Duration {
        Duration::from_millis(self.stream_retry_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.upload_attempts == 0 {
            return Err(AppError::Config(
                "upload_attempts must be greater than zero".into(),
            ));
        }
        if self.ignore_file.trim().is_empty() {
            return Err(AppError::Config("ignore_file must not be empty".into()));
        }
        Ok(())
    }
}
