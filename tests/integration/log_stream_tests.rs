//! Integration tests for the TCP log port.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tether::relay::tcp::{serve_logs, LogStream};
use tether::relay::{LogLine, OutputStream, Relay, Subscription};

const LIMIT: Duration = Duration::from_secs(10);

/// Publish `line` on `agent` until `client` sees it (the remote
/// subscription only exists once the connection is accepted).
async fn deliver(agent: &Relay, client: &mut Subscription, line: &LogLine) -> LogLine {
    tokio::time::timeout(LIMIT, async {
        loop {
            agent.publish_line(line).await.expect("publish");
            if let Ok(Some(raw)) =
                tokio::time::timeout(Duration::from_millis(100), client.recv()).await
            {
                return LogLine::decode(&raw).expect("decode");
            }
        }
    })
    .await
    .expect("line forwarded in time")
}

#[tokio::test]
async fn lines_flow_from_agent_relay_to_client_relay() {
    let ct = CancellationToken::new();
    let (agent_relay, _agent) = Relay::spawn(32, ct.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = serve_logs(listener, agent_relay.clone(), ct.clone());

    let (client_relay, _client) = Relay::spawn(32, ct.clone());
    let mut printer = client_relay.subscribe().await.expect("subscribe");
    let stream = LogStream::new(addr.to_string(), Duration::from_millis(50), client_relay)
        .spawn(ct.clone());

    let line = LogLine::new("ws-log", OutputStream::Stdout, "listening on :8080");
    let got = deliver(&agent_relay, &mut printer, &line).await;
    assert_eq!(got, line);

    ct.cancel();
    server.await.expect("server stops");
    stream.await.expect("stream stops");
}

#[tokio::test]
async fn client_retries_until_agent_appears() {
    let ct = CancellationToken::new();
    let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = probe.local_addr().expect("addr");
    drop(probe);

    let (client_relay, _client) = Relay::spawn(32, ct.clone());
    let mut printer = client_relay.subscribe().await.expect("subscribe");
    let stream = LogStream::new(addr.to_string(), Duration::from_millis(50), client_relay)
        .spawn(ct.clone());

    // Nothing listens yet; let a few attempts fail.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (agent_relay, _agent) = Relay::spawn(32, ct.clone());
    let listener = TcpListener::bind(addr).await.expect("rebind");
    let _server = serve_logs(listener, agent_relay.clone(), ct.clone());

    let line = LogLine::new("ws-late", OutputStream::Stderr, "panic: boom");
    assert_eq!(deliver(&agent_relay, &mut printer, &line).await, line);

    ct.cancel();
    stream.await.expect("stream stops");
}
