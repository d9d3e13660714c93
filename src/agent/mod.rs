//! Remote agent: HTTP sync endpoint and workspace bookkeeping.

pub mod apply;
pub mod path_safety;
pub mod routes;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::orchestrator::WorkspaceRegistry;
use crate::process::ProcessInspector;
use crate::relay::Relay;

pub use routes::{router, serve_http};

/// Shared state behind every agent route.
pub struct AgentState {
    /// Parsed agent configuration.
    pub config: Arc<AgentConfig>,
    /// Live workspaces.
    pub registry: WorkspaceRegistry,
    /// Output relay feeding the log port.
    pub relay: Relay,
    /// Process tree strategy for kills.
    pub inspector: Arc<dyn ProcessInspector>,
    /// Directory `~` expands to in remote paths.
    pub home: PathBuf,
}

impl AgentState {
    /// Build agent state with an empty registry.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        relay: Relay,
        inspector: Arc<dyn ProcessInspector>,
        home: PathBuf,
    ) -> Self {
        Self {
            config,
            registry: WorkspaceRegistry::new(),
            relay,
            inspector,
            home,
        }
    }
}
