//! Single-resolution promise reporting how a restart ended.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Result of a restart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Build succeeded and the background commands were launched.
    Started,
    /// Build failed; nothing after it was started.
    BuildFailed(String),
    /// The restart was dropped before reporting an outcome.
    Abandoned,
}

impl RestartOutcome {
    /// Whether the pipeline came up.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Create a linked resolver/token pair.
#[must_use]
pub fn restart_token() -> (RestartResolver, RestartToken) {
    let (tx, rx) = oneshot::channel();
    (RestartResolver { tx: Some(tx) }, RestartToken { rx })
}

/// Writing side of a [`RestartToken`].
///
/// Only the first resolution counts. Dropping an unresolved resolver makes
/// the token yield [`RestartOutcome::Abandoned`].
#[derive(Debug)]
pub struct RestartResolver {
    tx: Option<oneshot::Sender<RestartOutcome>>,
}

impl RestartResolver {
    /// Resolve the token. Returns `false` (and does nothing) if it was
    /// already resolved.
    pub fn resolve(&mut self, outcome: RestartOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // The receiver may be gone; the resolution still counts.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether [`resolve`](Self::resolve) has already been called.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// Awaitable outcome of one restart.
#[derive(Debug)]
pub struct RestartToken {
    rx: oneshot::Receiver<RestartOutcome>,
}

impl Future for RestartToken {
    type Output = RestartOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(RestartOutcome::Abandoned))
    }
}
