//! Polling watcher for one workspace.
//!
//! A watcher runs one background task that alternates classification
//! passes and sleeps of [`POLL_INTERVAL`]. Every detected change is handed
//! to a [`ChangeSink`]; delivered changes are then published on the event
//! channel and failures on the error channel. All events of one pass are
//! delivered before the next pass begins.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::{ChangeRecord, WatchError};
use crate::sync::classifier::{ChangeClassifier, Pass};
use crate::sync::ignore::{IgnoreList, IgnoreProvider};
use crate::{AppError, Result};

/// Default delay between two passes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Receives each detected change, typically forwarding it to the agent.
pub trait ChangeSink: Send + Sync {
    /// Deliver one change.
    ///
    /// # Errors
    ///
    /// `AppError::Vanished` means the file disappeared before it could be
    /// read; the watcher drops the path silently. Any other error is
    /// reported on the error channel.
    fn deliver<'a>(
        &'a self,
        change: &'a ChangeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Channels a running watcher reports into.
#[derive(Clone)]
pub struct WatchChannels {
    /// Delivered changes.
    pub events: mpsc::Sender<ChangeRecord>,
    /// Failures tagged with their workspace.
    pub errors: mpsc::Sender<WatchError>,
}

#[derive(Default)]
struct Control {
    closed: bool,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Polls a workspace directory for changes.
pub struct LocalWatcher {
    workspace_id: String,
    root: PathBuf,
    ignore: Arc<dyn IgnoreProvider>,
    sink: Arc<dyn ChangeSink>,
    interval: Duration,
    control: Mutex<Control>,
}

impl LocalWatcher {
    /// Create a stopped watcher for `root`.
    #[must_use]
    pub fn new(
        workspace_id: impl Into<String>,
        root: impl Into<PathBuf>,
        ignore: Arc<dyn IgnoreProvider>,
        sink: Arc<dyn ChangeSink>,
        interval: Duration,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            root: root.into(),
            ignore,
            sink,
            interval,
            control: Mutex::new(Control::default()),
        }
    }

    /// Workspace being watched.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Whether the polling task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.control()
            .running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start polling with a fresh snapshot. Returns `false` if already
    /// running.
    pub fn start(&self, channels: WatchChannels) -> bool {
        let mut control = self.control();
        if control
            .running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
        {
            return false;
        }

        let ct = CancellationToken::new();
        let task = PollLoop {
            workspace_id: self.workspace_id.clone(),
            classifier: ChangeClassifier::new(self.workspace_id.clone(), self.root.clone()),
            ignore: Arc::clone(&self.ignore),
            sink: Arc::clone(&self.sink),
            interval: self.interval,
            channels,
        };
        let span = info_span!("watcher", workspace_id = %self.workspace_id);
        let handle = tokio::spawn(task.run(ct.clone()).instrument(span));
        control.closed = false;
        control.running = Some((ct, handle));
        true
    }

    /// Stop polling. Safe to call any number of times.
    pub fn close(&self) {
        let mut control = self.control();
        if control.closed {
            return;
        }
        control.closed = true;
        if let Some((ct, _handle)) = control.running.take() {
            ct.cancel();
        }
        debug!(workspace_id = %self.workspace_id, "watcher closed");
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

struct PollLoop {
    workspace_id: String,
    classifier: ChangeClassifier,
    ignore: Arc<dyn IgnoreProvider>,
    sink: Arc<dyn ChangeSink>,
    interval: Duration,
    channels: WatchChannels,
}

impl PollLoop {
    async fn run(mut self, ct: CancellationToken) {
        info!(root = %self.classifier.root().display(), "watching");

        // ── Initial scan ───────────────────────────────
        let ignores = self.load_ignores().await;
        let scanned = self
            .with_classifier(move |classifier| classifier.initial_scan(&ignores))
            .await;
        match scanned {
            Some(errors) => {
                for err in errors {
                    self.report(err).await;
                }
            }
            None => return,
        }

        // ── Polling ────────────────────────────────────
        loop {
            if ct.is_cancelled() {
                break;
            }

            let ignores = self.load_ignores().await;
            let Some(pass) = self.classify(ignores).await else {
                break;
            };
            self.deliver(pass).await;

            tokio::select! {
                () = ct.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("watcher stopped");
    }

    async fn load_ignores(&self) -> IgnoreList {
        match self.ignore.load(self.classifier.root()) {
            Ok(list) => list,
            Err(err) => {
                self.report(err).await;
                IgnoreList::default()
            }
        }
    }

    async fn classify(&mut self, ignores: IgnoreList) -> Option<Pass> {
        self.with_classifier(move |classifier| classifier.classify(&ignores))
            .await
    }

    /// Run `work` on the blocking pool, moving the classifier in and back out.
    async fn with_classifier<T, F>(&mut self, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ChangeClassifier) -> T + Send + 'static,
    {
        let placeholder = ChangeClassifier::new(String::new(), PathBuf::new());
        let mut classifier = std::mem::replace(&mut self.classifier, placeholder);
        let outcome = tokio::task::spawn_blocking(move || {
            let value = work(&mut classifier);
            (classifier, value)
        })
        .await;

        match outcome {
            Ok((classifier, value)) => {
                self.classifier = classifier;
                Some(value)
            }
            Err(err) => {
                self.report(AppError::Watch(format!("directory scan failed: {err}")))
                    .await;
                None
            }
        }
    }

    async fn deliver(&mut self, pass: Pass) {
        let Pass {
            changes,
            deletes,
            errors,
        } = pass;
        for err in errors {
            self.report(err).await;
        }

        // Deletes follow every create and update of the pass.
        for change in changes.into_iter().chain(deletes) {
            match self.sink.deliver(&change.record).await {
                Ok(()) => {
                    let record = change.record.clone();
                    self.classifier.commit(change);
                    self.publish(record).await;
                }
                Err(AppError::Vanished(reason)) => {
                    debug!(path = %change.record.path.display(), %reason, "skipping vanished path");
                    self.classifier.forget(&change);
                }
                // Left uncommitted so the next pass reports it again.
                Err(err) => self.report(err).await,
            }
        }
    }

    async fn publish(&self, record: ChangeRecord) {
        debug!(path = %record.path.display(), kind = record.kind.as_str(), "change delivered");
        // Nobody listening is not a watcher failure.
        let _ = self.channels.events.send(record).await;
    }

    async fn report(&self, error: AppError) {
        warn!(%error, "watch error");
        let _ = self
            .channels
            .errors
            .send(WatchError {
                workspace_id: self.workspace_id.clone(),
                error,
            })
            .await;
    }
}
