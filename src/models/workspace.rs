//! Workspace definition and its command set.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered pipeline of shell commands run remotely for a workspace.
///
/// An empty string means "no command" for that role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CommandSet {
    /// Long-running process started only on a full upload.
    #[serde(default)]
    pub init: String,
    /// Run to completion before anything else starts.
    #[serde(default)]
    pub build: String,
    /// Background test command.
    #[serde(default)]
    pub test: String,
    /// Background main process.
    #[serde(default)]
    pub start: String,
}

impl CommandSet {
    /// Build a command set from its four role strings.
    #[must_use]
    pub fn new(
        init: impl Into<String>,
        build: impl Into<String>,
        test: impl Into<String>,
        start: impl Into<String>,
    ) -> Self {
        Self {
            init: init.into(),
            build: build.into(),
            test: test.into(),
            start: start.into(),
        }
    }

    /// Whether every role is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [&self.init, &self.build, &self.test, &self.start]
            .iter()
            .all(|cmd| cmd.trim().is_empty())
    }

    /// Form field pairs in wire order.
    #[must_use]
    pub fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("init", self.init.as_str()),
            ("build", self.build.as_str()),
            ("test", self.test.as_str()),
            ("start", self.start.as_str()),
        ]
    }
}

/// Local directory bound to a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Workspace {
    /// Unique identifier (uuid v4) shared with the agent.
    pub id: String,
    /// Directory watched on this machine.
    pub local_path: PathBuf,
    /// Directory on the agent host; `None` lets the agent choose.
    pub remote_path: Option<String>,
    /// Commands run by the agent after each sync.
    pub commands: CommandSet,
    /// Environment variables injected into every remote command.
    pub env: BTreeMap<String, String>,
    /// `host:port` of the agent's HTTP endpoint.
    pub address: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Construct a new workspace with a generated identifier.
    #[must_use]
    pub fn new(local_path: PathBuf, address: impl Into<String>, commands: CommandSet) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            remote_path: None,
            commands,
            env: BTreeMap::new(),
            address: address.into(),
            created_at: Utc::now(),
        }
    }

    /// Value of the upload `path` field, `"<local>::<remote>"`, when a
    /// remote path is configured.
    #[must_use]
    pub fn path_field(&self) -> Option<String> {
        self.remote_path
            .as_deref()
            .filter(|remote| !remote.trim().is_empty())
            .map(|remote| format!("{}::{remote}", self.local_path.display()))
    }

    /// Base URL of the agent's HTTP endpoint.
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_owned()
        } else {
            format!("http://{}", self.address.trim_end_matches('/'))
        }
    }

    /// Host part of the agent address, used to reach the log port.
    #[must_use]
    pub fn host(&self) -> &str {
        let without_scheme = self
            .address
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        match authority.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => authority,
        }
    }
}
