//! Fan-out relay for command output.
//!
//! A single coordinator task owns the subscriber map. Producers hand it
//! messages through a channel; the coordinator forwards each one to every
//! subscriber with `try_send`, dropping any subscriber whose buffer is full
//! or whose receiver is gone. A slow reader therefore never stalls the
//! producers.

pub mod tcp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::{AppError, Result};

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output (also used for lifecycle notices).
    Stdout,
    /// Standard error (also used for failures).
    Stderr,
}

/// One line of workspace output as pushed over the log port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    /// Frame type, always `"log"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Workspace the output belongs to.
    pub workspace: String,
    /// Originating stream.
    pub stream: OutputStream,
    /// Line content without its trailing newline.
    pub message: String,
}

impl LogLine {
    /// Build a log frame.
    #[must_use]
    pub fn new(workspace: impl Into<String>, stream: OutputStream, message: impl Into<String>) -> Self {
        Self {
            kind: "log".into(),
            workspace: workspace.into(),
            stream,
            message: message.into(),
        }
    }

    /// Encode as one newline-terminated JSON frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut raw = serde_json::to_vec(self).unwrap_or_default();
        raw.push(b'\n');
        Bytes::from(raw)
    }

    /// Decode a JSON frame (with or without its trailing newline).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the frame is not a valid log line.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw.trim_ascii_end())?)
    }
}

struct Registration {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

/// Cloneable handle to a running relay coordinator.
#[derive(Clone)]
pub struct Relay {
    register_tx: mpsc::Sender<Registration>,
    deregister_tx: mpsc::Sender<u64>,
    message_tx: mpsc::Sender<Bytes>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Relay {
    /// Start a coordinator task. Each subscriber gets a buffer of `buffer`
    /// messages.
    ///
    /// The coordinator stops when `ct` fires or every handle is dropped.
    #[must_use]
    pub fn spawn(buffer: usize, ct: CancellationToken) -> (Self, JoinHandle<()>) {
        let buffer = buffer.max(1);
        let (register_tx, register_rx) = mpsc::channel(64);
        let (deregister_tx, deregister_rx) = mpsc::channel(64);
        let (message_tx, message_rx) = mpsc::channel(buffer);

        let handle = tokio::spawn(
            coordinate(register_rx, deregister_rx, message_rx, ct)
                .instrument(info_span!("relay_coordinator")),
        );

        let relay = Self {
            register_tx,
            deregister_tx,
            message_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer,
        };
        (relay, handle)
    }

    /// Register a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the coordinator has stopped.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.register_tx
            .send(Registration { id, sender })
            .await
            .map_err(|_| AppError::Io("relay stopped".into()))?;
        Ok(Subscription {
            id,
            receiver,
            deregister_tx: self.deregister_tx.clone(),
        })
    }

    /// Hand a message to the coordinator for broadcast.
    ///
    /// Waits only for room in the coordinator's inbox, never for a subscriber.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the coordinator has stopped.
    pub async fn publish(&self, message: Bytes) -> Result<()> {
        self.message_tx
            .send(message)
            .await
            .map_err(|_| AppError::Io("relay stopped".into()))
    }

    /// Publish a structured log line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the coordinator has stopped.
    pub async fn publish_line(&self, line: &LogLine) -> Result<()> {
        self.publish(line.encode()).await
    }
}

/// Receiving side of one relay subscriber. Dropping it deregisters.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Bytes>,
    deregister_tx: mpsc::Sender<u64>,
}

impl Subscription {
    /// Subscriber identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the relay dropped this subscriber or
    /// stopped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A full deregister queue is harmless: the closed receiver is
        // pruned on the next broadcast.
        let _ = self.deregister_tx.try_send(self.id);
    }
}

async fn coordinate(
    mut register_rx: mpsc::Receiver<Registration>,
    mut deregister_rx: mpsc::Receiver<u64>,
    mut message_rx: mpsc::Receiver<Bytes>,
    ct: CancellationToken,
) {
    let mut subscribers: HashMap<u64, mpsc::Sender<Bytes>> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            () = ct.cancelled() => {
                info!("relay shutting down");
                break;
            }
            Some(registration) = register_rx.recv() => {
                debug!(subscriber = registration.id, "subscriber registered");
                subscribers.insert(registration.id, registration.sender);
            }
            Some(id) = deregister_rx.recv() => {
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, "subscriber deregistered");
                }
            }
            message = message_rx.recv() => {
                let Some(message) = message else {
                    debug!("all relay handles dropped");
                    break;
                };
                subscribers.retain(|id, sender| match sender.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(subscriber = id, %err, "dropping subscriber");
                        false
                    }
                });
            }
        }
    }
}
