//! Unit tests for the output relay.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use tether::relay::{LogLine, OutputStream, Relay};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn every_subscriber_receives_published_messages() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(8, ct.clone());
    let mut first = relay.subscribe().await.expect("subscribe");
    let mut second = relay.subscribe().await.expect("subscribe");
    assert_ne!(first.id(), second.id());

    relay.publish(Bytes::from_static(b"one\n")).await.expect("publish");

    for sub in [&mut first, &mut second] {
        let got = tokio::time::timeout(WAIT, sub.recv()).await.expect("in time");
        assert_eq!(got.as_deref(), Some(&b"one\n"[..]));
    }
    ct.cancel();
}

#[tokio::test]
async fn full_subscriber_is_dropped_without_blocking_producer() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(2, ct.clone());
    let mut stalled = relay.subscribe().await.expect("subscribe");

    // Far more than the subscriber buffer; must not block.
    tokio::time::timeout(WAIT, async {
        for n in 0..20u8 {
            relay.publish(Bytes::from(vec![n])).await.expect("publish");
        }
    })
    .await
    .expect("producer never blocks on a stalled subscriber");

    let mut received = Vec::new();
    while let Some(msg) = tokio::time::timeout(WAIT, stalled.recv())
        .await
        .expect("stream ends in time")
    {
        received.push(msg[0]);
    }
    assert_eq!(received, vec![0, 1]);
    ct.cancel();
}

#[tokio::test]
async fn dropped_subscriber_can_subscribe_again() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(2, ct.clone());
    let mut stalled = relay.subscribe().await.expect("subscribe");
    for n in 0..10u8 {
        relay.publish(Bytes::from(vec![n])).await.expect("publish");
    }
    while tokio::time::timeout(WAIT, stalled.recv())
        .await
        .expect("stream ends in time")
        .is_some()
    {}

    let mut fresh = relay.subscribe().await.expect("resubscribe");
    relay.publish(Bytes::from_static(b"after")).await.expect("publish");
    let got = tokio::time::timeout(WAIT, fresh.recv()).await.expect("in time");
    assert_eq!(got.as_deref(), Some(&b"after"[..]));
    ct.cancel();
}

#[tokio::test]
async fn dropped_subscription_deregisters() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(4, ct.clone());
    let gone = relay.subscribe().await.expect("subscribe");
    let mut kept = relay.subscribe().await.expect("subscribe");
    drop(gone);

    relay.publish(Bytes::from_static(b"still here")).await.expect("publish");
    let got = tokio::time::timeout(WAIT, kept.recv()).await.expect("in time");
    assert_eq!(got.as_deref(), Some(&b"still here"[..]));
    ct.cancel();
}

#[tokio::test]
async fn cancelled_relay_refuses_publish() {
    let ct = CancellationToken::new();
    let (relay, handle) = Relay::spawn(4, ct.clone());
    ct.cancel();
    handle.await.expect("coordinator exits");
    assert!(relay.publish(Bytes::from_static(b"late")).await.is_err());
    assert!(relay.subscribe().await.is_err());
}

#[tokio::test]
async fn publish_line_encodes_json_frame() {
    let ct = CancellationToken::new();
    let (relay, _handle) = Relay::spawn(4, ct.clone());
    let mut sub = relay.subscribe().await.expect("subscribe");

    let line = LogLine::new("ws-9", OutputStream::Stderr, "build failed: exit status: 1");
    relay.publish_line(&line).await.expect("publish");

    let raw = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("in time")
        .expect("open");
    assert!(raw.ends_with(b"\n"));
    assert_eq!(LogLine::decode(&raw).expect("decode"), line);
    ct.cancel();
}
