//! Contract tests for the log frame format.

use serde_json::{json, Value};

use tether::relay::{LogLine, OutputStream};

#[test]
fn log_frame_is_newline_terminated_json() {
    let frame = LogLine::new("ws-1", OutputStream::Stdout, "ready").encode();
    assert_eq!(frame.last(), Some(&b'\n'));

    let value: Value = serde_json::from_slice(&frame).expect("json");
    assert_eq!(
        value,
        json!({"type": "log", "workspace": "ws-1", "stream": "stdout", "message": "ready"})
    );
}

#[test]
fn frames_from_other_writers_decode() {
    let raw = br#"{"type":"log","workspace":"w","stream":"stderr","message":"boom"}"#;
    let line = LogLine::decode(raw).expect("decode");
    assert_eq!(line.stream, OutputStream::Stderr);
    assert_eq!(line.message, "boom");
}

#[test]
fn garbage_frame_is_protocol_error() {
    let err = LogLine::decode(b"not json\n").expect_err("garbage");
    assert!(err.to_string().starts_with("protocol:"));
}
