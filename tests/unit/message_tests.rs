//! Unit tests for the JSON-RPC envelope: classification, constructors and
//! response outcomes.

use serde_json::{json, Value};

use acp_bridge::acp::message::{
    Message, MessageKind, RequestId, JSONRPC_VERSION, METHOD_NOT_FOUND,
};
use acp_bridge::AppError;

fn parse(value: Value) -> Message {
    serde_json::from_value(value).expect("valid envelope")
}

#[test]
fn messages_are_classified_by_id_and_method() {
    assert_eq!(
        parse(json!({ "id": 1, "method": "session/request_permission" })).kind(),
        MessageKind::Request
    );
    assert_eq!(
        parse(json!({ "id": 1, "result": {} })).kind(),
        MessageKind::Response
    );
    assert_eq!(
        parse(json!({ "method": "session/update", "params": {} })).kind(),
        MessageKind::Notification
    );
    assert_eq!(parse(json!({ "result": {} })).kind(), MessageKind::Invalid);
}

#[test]
fn string_and_numeric_ids_are_distinct() {
    let numeric = parse(json!({ "id": 7, "result": null }));
    let string = parse(json!({ "id": "7", "result": null }));

    assert_eq!(numeric.id, Some(RequestId::Number(7)));
    assert_eq!(string.id, Some(RequestId::Str("7".into())));
    assert_ne!(numeric.id, string.id);
    assert_eq!(RequestId::Number(7).to_string(), "7");
}

#[test]
fn missing_jsonrpc_is_tolerated_inbound() {
    let message = parse(json!({ "id": 2, "result": { "ok": true } }));
    assert_eq!(message.jsonrpc, None);
    assert_eq!(message.into_outcome().unwrap(), json!({ "ok": true }));
}

#[test]
fn error_payload_wins_over_result() {
    let message = parse(json!({
        "id": 3,
        "result": { "ignored": true },
        "error": { "code": -32000, "message": "rate limited", "data": { "retryAfter": 2 } }
    }));

    match message.into_outcome() {
        Err(AppError::Remote {
            code,
            message,
            data,
        }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "rate limited");
            assert_eq!(data, Some(json!({ "retryAfter": 2 })));
        }
        other => panic!("expected Remote error, got {other:?}"),
    }
}

#[test]
fn absent_result_is_null() {
    let message = parse(json!({ "id": 4 }));
    assert_eq!(message.into_outcome().unwrap(), Value::Null);
}

#[test]
fn outbound_constructors_stamp_version() {
    let request = Message::request(RequestId::Number(1), "initialize", json!({}));
    let notification = Message::notification("session/cancel", json!({}));
    let response = Message::response(RequestId::Str("p".into()), json!({}));
    let error = Message::error_response(RequestId::Number(9), METHOD_NOT_FOUND, "nope");

    for message in [&request, &notification, &response, &error] {
        assert_eq!(message.jsonrpc.as_deref(), Some(JSONRPC_VERSION));
    }
    assert_eq!(request.kind(), MessageKind::Request);
    assert_eq!(notification.kind(), MessageKind::Notification);
    assert_eq!(response.kind(), MessageKind::Response);

    let wire = serde_json::to_value(&error).unwrap();
    assert_eq!(
        wire,
        json!({
            "jsonrpc": "2.0",
            "id": 9,
            "error": { "code": -32601, "message": "nope" }
        })
    );
}
