//! Log port: the agent pushes relay output to TCP clients and the client
//! side reconnects until shut down.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::Relay;

/// Longest accepted log frame on the client side.
const MAX_FRAME: usize = 1024 * 1024;

/// Accept log clients on `listener`, each fed by its own relay subscription.
#[must_use]
pub fn serve_logs(listener: TcpListener, relay: Relay, ct: CancellationToken) -> JoinHandle<()> {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!(addr = %local, "log server listening");

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("log server shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "log client connected");
                                tokio::spawn(
                                    push_logs(stream, relay.clone(), ct.child_token())
                                        .instrument(info_span!("log_client", %peer)),
                                );
                            }
                            Err(err) => warn!(%err, "log accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("log_server", addr = %local)),
    )
}

async fn push_logs(mut stream: TcpStream, relay: Relay, ct: CancellationToken) {
    let mut subscription = match relay.subscribe().await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(%err, "log client could not subscribe");
            return;
        }
    };

    loop {
        let message = tokio::select! {
            () = ct.cancelled() => break,
            message = subscription.recv() => message,
        };
        let Some(message) = message else {
            debug!("log client dropped by relay");
            break;
        };
        if let Err(err) = stream.write_all(&message).await {
            debug!(%err, "log client disconnected");
            break;
        }
    }
}

/// Client side of the log port: connects to the agent, retrying forever,
/// and forwards each received line into a local relay.
pub struct LogStream {
    addr: String,
    retry: Duration,
    relay: Relay,
}

impl LogStream {
    /// Create a stream reader for `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, retry: Duration, relay: Relay) -> Self {
        Self {
            addr: addr.into(),
            retry,
            relay,
        }
    }

    /// Run the connect/read loop on a background task until `ct` fires.
    #[must_use]
    pub fn spawn(self, ct: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("log_stream", addr = %self.addr);
        tokio::spawn(self.run(ct).instrument(span))
    }

    async fn run(self, ct: CancellationToken) {
        loop {
            let connected = tokio::select! {
                () = ct.cancelled() => return,
                connected = TcpStream::connect(&self.addr) => connected,
            };

            match connected {
                Ok(stream) => {
                    info!("log stream connected");
                    if self.forward(stream, &ct).await {
                        return;
                    }
                    info!("log stream lost, reconnecting");
                }
                Err(err) => debug!(%err, "log stream connect failed"),
            }

            tokio::select! {
                () = ct.cancelled() => return,
                () = tokio::time::sleep(self.retry) => {}
            }
        }
    }

    /// Forward lines until the connection ends. Returns true when cancelled.
    async fn forward(&self, stream: TcpStream, ct: &CancellationToken) -> bool {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        loop {
            let next = tokio::select! {
                () = ct.cancelled() => return true,
                next = lines.next() => next,
            };
            match next {
                Some(Ok(line)) => {
                    let mut raw = line.into_bytes();
                    raw.push(b'\n');
                    if self.relay.publish(Bytes::from(raw)).await.is_err() {
                        return true;
                    }
                }
                Some(Err(err)) => {
                    warn!(%err, "log stream read failed");
                    return false;
                }
                None => return false,
            }
        }
    }
}
