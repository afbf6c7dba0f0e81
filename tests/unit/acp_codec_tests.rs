//! Unit tests for the NDJSON codec.
//!
//! Covers:
//! - single and batched lines decode into messages
//! - partial delivery is buffered until the newline
//! - blank lines are skipped
//! - invalid UTF-8, invalid JSON and oversized lines become `Frame::Malformed`
//! - outbound messages are framed as one compact line

use bytes::BytesMut;
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

use acp_bridge::acp::codec::{AcpCodec, Frame, MAX_LINE_BYTES};
use acp_bridge::acp::message::{Message, MessageKind, RequestId};

fn expect_message(frame: Option<Frame>) -> Message {
    match frame {
        Some(Frame::Message(message)) => message,
        other => panic!("expected a message frame, got {other:?}"),
    }
}

/// A complete line decodes into a message.
#[test]
fn single_line_decodes_into_message() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(
        "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"sessionId\":\"s\"}}\n",
    );

    let message = expect_message(codec.decode(&mut buf).expect("decode must succeed"));
    assert_eq!(message.kind(), MessageKind::Notification);
    assert_eq!(message.method.as_deref(), Some("session/update"));
    assert_eq!(message.params, Some(json!({ "sessionId": "s" })));
}

/// Two lines in one buffer decode as two frames.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(concat!(
        "{\"id\":1,\"result\":{}}\n",
        "{\"id\":\"a\",\"method\":\"session/request_permission\",\"params\":{}}\n",
    ));

    let first = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(first.kind(), MessageKind::Response);
    assert_eq!(first.id, Some(RequestId::Number(1)));

    let second = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(second.kind(), MessageKind::Request);
    assert_eq!(second.id, Some(RequestId::Str("a".into())));

    assert!(codec.decode(&mut buf).unwrap().is_none());
}

/// Nothing is emitted until the terminating newline arrives.
#[test]
fn partial_delivery_is_buffered_until_newline() {
    let mut codec = AcpCodec::new();

    let mut buf = BytesMut::from("{\"id\":3,");
    assert!(codec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(b"\"result\":null}\n");
    let message = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(message.id, Some(RequestId::Number(3)));
}

/// Blank and whitespace-only lines are skipped.
#[test]
fn blank_lines_are_skipped() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("\n   \n\r\n{\"method\":\"x\"}\n");

    let message = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(message.method.as_deref(), Some("x"));
}

/// Invalid JSON yields a malformed frame and decoding continues.
#[test]
fn invalid_json_is_malformed_not_fatal() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{not json}\n{\"method\":\"ok\"}\n");

    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Malformed { line, reason }) => {
            assert_eq!(line, "{not json}");
            assert!(!reason.is_empty());
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }

    let message = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(message.method.as_deref(), Some("ok"));
}

/// A line with invalid UTF-8 yields a malformed frame and decoding continues.
#[test]
fn invalid_utf8_is_malformed_not_fatal() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(&b"{\"method\":\"bad\",\"params\":\"\xFF\"}\n"[..]);
    buf.extend_from_slice(b"{\"method\":\"ok\"}\n");

    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Malformed { line, reason }) => {
            assert!(line.is_empty());
            assert!(reason.starts_with("invalid UTF-8"), "reason: {reason}");
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }

    let message = expect_message(codec.decode(&mut buf).unwrap());
    assert_eq!(message.method.as_deref(), Some("ok"));
}

/// A line longer than the limit yields a malformed frame.
#[test]
fn oversized_line_is_malformed() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("x".repeat(MAX_LINE_BYTES + 1).as_str());
    buf.extend_from_slice(b"\n");

    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Malformed { reason, .. }) => {
            assert!(reason.contains("line too long"), "reason: {reason}");
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }
}

/// A final line without newline is still decoded at EOF.
#[test]
fn trailing_line_decodes_at_eof() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"method\":\"last\"}");

    assert!(codec.decode(&mut buf).unwrap().is_none());
    let message = expect_message(codec.decode_eof(&mut buf).unwrap());
    assert_eq!(message.method.as_deref(), Some("last"));
}

/// Outbound messages are one compact JSON line.
#[test]
fn encoder_writes_one_line_per_message() {
    let mut codec = AcpCodec::new();
    let mut dst = BytesMut::new();

    codec
        .encode(
            Message::notification("session/cancel", json!({ "sessionId": "s-1" })),
            &mut dst,
        )
        .unwrap();

    let text = std::str::from_utf8(&dst).unwrap();
    assert!(text.ends_with('\n'));
    assert_eq!(text.matches('\n').count(), 1);
    let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
    assert_eq!(
        value,
        json!({ "jsonrpc": "2.0", "method": "session/cancel", "params": { "sessionId": "s-1" } })
    );
}
