//! Set of watchers sharing one event channel and one error channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::models::{ChangeRecord, WatchError, Workspace};
use crate::sync::ignore::IgnoreProvider;
use crate::sync::watcher::{ChangeSink, LocalWatcher, WatchChannels};

/// Owns one [`LocalWatcher`] per workspace id.
pub struct Syncer {
    watchers: HashMap<String, LocalWatcher>,
    channels: WatchChannels,
    ignore: Arc<dyn IgnoreProvider>,
    interval: Duration,
}

impl Syncer {
    /// Create an empty syncer and the receiving ends of its channels.
    #[must_use]
    pub fn new(
        ignore: Arc<dyn IgnoreProvider>,
        interval: Duration,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<ChangeRecord>, mpsc::Receiver<WatchError>) {
        let (events, events_rx) = mpsc::channel(buffer.max(1));
        let (errors, errors_rx) = mpsc::channel(buffer.max(1));
        let syncer = Self {
            watchers: HashMap::new(),
            channels: WatchChannels { events, errors },
            ignore,
            interval,
        };
        (syncer, events_rx, errors_rx)
    }

    /// Start watching `workspace`, replacing any watcher it already had.
    pub fn watch(&mut self, workspace: &Workspace, sink: Arc<dyn ChangeSink>) {
        let watcher = LocalWatcher::new(
            workspace.id.clone(),
            workspace.local_path.clone(),
            Arc::clone(&self.ignore),
            sink,
            self.interval,
        );
        watcher.start(self.channels.clone());
        if let Some(previous) = self.watchers.insert(workspace.id.clone(), watcher) {
            previous.close();
        }
        info!(workspace_id = %workspace.id, "workspace watched");
    }

    /// Watcher of a workspace, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LocalWatcher> {
        self.watchers.get(id)
    }

    /// Stop and drop a workspace's watcher. Returns `false` if unknown.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.watchers.remove(id) {
            Some(watcher) => {
                watcher.close();
                true
            }
            None => false,
        }
    }

    /// Number of watched workspaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Whether no workspace is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Stop every watcher.
    pub fn close(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.close();
        }
    }
}
