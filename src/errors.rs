//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Error text the agent returns when an update names a workspace it does
/// not know (typically because the agent process restarted).
pub const INVALID_WORKSPACE_ID: &str = "invalid workspace id";

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Local file vanished before it could be read (lost a race with a delete).
    Vanished(String),
    /// Directory walk or ignore-list failure in the local watcher.
    Watch(String),
    /// Network-level failure talking to the remote agent.
    Transport {
        /// Workspace the request was made for.
        workspace_id: String,
        /// Underlying failure description.
        message: String,
    },
    /// The remote agent answered with a non-success status.
    Rejected {
        /// Workspace the request was made for.
        workspace_id: String,
        /// Status string returned by the agent.
        status: String,
        /// Error text returned by the agent, if any.
        message: String,
    },
    /// Malformed or incomplete request received by the agent.
    Protocol(String),
    /// Managed command could not be started or waited on.
    Process(String),
    /// Process tree enumeration or kill failure.
    Kill(String),
    /// File system path failed validation against workspace root.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AppError {
    /// Whether the agent rejected a request because it has no record of
    /// the workspace id.
    #[must_use]
    pub fn is_invalid_workspace(&self) -> bool {
        matches!(self, Self::Rejected { message, .. } if message == INVALID_WORKSPACE_ID)
    }

    /// Workspace the error is attributed to, when known.
    #[must_use]
    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::Transport { workspace_id, .. } | Self::Rejected { workspace_id, .. } => {
                Some(workspace_id)
            }
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Vanished(msg) => write!(f, "vanished: {msg}"),
            Self::Watch(msg) => write!(f, "watch: {msg}"),
            Self::Transport {
                workspace_id,
                message,
            } => write!(f, "transport [{workspace_id}]: {message}"),
            Self::Rejected {
                workspace_id,
                status,
                message,
            } => write!(f, "rejected [{workspace_id}] ({status}): {message}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Kill(msg) => write!(f, "kill: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}
