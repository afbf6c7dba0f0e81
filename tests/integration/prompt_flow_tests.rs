//! Integration tests for prompt turns: update streaming, stale-session
//! filtering, turn exclusivity, completion waiting and cancellation.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use acp_bridge::driver::acp_driver::AcpBackend;
use acp_bridge::driver::update::ConversationEvent;
use acp_bridge::driver::{AgentBackend, PromptContent};
use acp_bridge::AppError;

use super::test_helpers::{fake_backend, fast_options, ready_backend, STEP_TIMEOUT};

type Turn = (
    JoinHandle<acp_bridge::Result<()>>,
    UnboundedReceiver<ConversationEvent>,
);

fn spawn_prompt(backend: &AcpBackend, session_id: &str, text: &str) -> Turn {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = backend.clone();
    let session_id = session_id.to_owned();
    let content = vec![PromptContent::text(text)];
    let handle = tokio::spawn(async move { backend.prompt(&session_id, content, tx).await });
    (handle, rx)
}

fn drain(rx: &mut UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn text(chunk: &str) -> serde_json::Value {
    json!({
        "sessionUpdate": "agent_message_chunk",
        "content": { "type": "text", "text": chunk }
    })
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// Three updates then `end_turn`: four events in order, the last being
/// `TurnComplete`.
#[tokio::test]
async fn prompt_streams_updates_then_turn_complete() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "list the files");

    let (id, params) = agent.expect_request("session/prompt").await;
    assert_eq!(params["sessionId"], "sess-1");
    assert_eq!(
        params["prompt"],
        json!([{ "type": "text", "text": "list the files" }])
    );

    agent.update("sess-1", text("Looking")).await;
    agent
        .update(
            "sess-1",
            json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "call-1",
                "title": "List directory",
                "kind": "read",
                "status": "pending"
            }),
        )
        .await;
    agent
        .update(
            "sess-1",
            json!({
                "sessionUpdate": "plan",
                "entries": [{ "content": "read dir", "status": "in_progress", "priority": "high" }]
            }),
        )
        .await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;

    turn.await.unwrap().unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 4, "events: {events:?}");
    assert_eq!(
        events[0],
        ConversationEvent::TextDelta {
            text: "Looking".into()
        }
    );
    assert!(matches!(
        &events[1],
        ConversationEvent::ToolCall { tool_call_id, title, .. }
            if tool_call_id == "call-1" && title == "List directory"
    ));
    assert!(matches!(&events[2], ConversationEvent::Plan { entries } if entries.len() == 1));
    assert_eq!(
        events[3],
        ConversationEvent::TurnComplete {
            stop_reason: "end_turn".into()
        }
    );
    assert!(!backend.processing_message().await);
}

/// Updates tagged with another session id never reach the sink.
#[tokio::test]
async fn updates_for_other_sessions_are_dropped() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "hello");

    let (id, _) = agent.expect_request("session/prompt").await;
    agent.update("sess-stale", text("ghost")).await;
    agent.update("sess-1", text("real")).await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;

    turn.await.unwrap().unwrap();
    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            ConversationEvent::TextDelta {
                text: "real".into()
            },
            ConversationEvent::TurnComplete {
                stop_reason: "end_turn".into()
            },
        ]
    );
}

/// Unknown update kinds and unusable payloads are skipped without ending the turn.
#[tokio::test]
async fn unsupported_updates_are_skipped() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "hello");

    let (id, _) = agent.expect_request("session/prompt").await;
    agent
        .update(
            "sess-1",
            json!({ "sessionUpdate": "available_commands_update", "availableCommands": [] }),
        )
        .await;
    agent.update("sess-1", json!({ "sessionUpdate": "tool_call" })).await;
    agent.update("sess-1", text("after")).await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;

    turn.await.unwrap().unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 2, "events: {events:?}");
    assert_eq!(
        events[0],
        ConversationEvent::TextDelta {
            text: "after".into()
        }
    );
}

/// Updates arriving between turns are dropped.
#[tokio::test]
async fn updates_outside_a_turn_are_dropped() {
    let (backend, mut agent) = ready_backend("sess-1").await;

    agent.update("sess-1", text("too early")).await;
    agent.sync().await;

    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "hello");
    let (id, _) = agent.expect_request("session/prompt").await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;
    turn.await.unwrap().unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![ConversationEvent::TurnComplete {
            stop_reason: "end_turn".into()
        }]
    );
}

// ── Turn lifecycle ───────────────────────────────────────────────────────────

/// Only one turn may run at a time.
#[tokio::test]
async fn second_prompt_during_turn_is_rejected() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, _rx) = spawn_prompt(&backend, "sess-1", "first");
    let (id, _) = agent.expect_request("session/prompt").await;

    let (tx, _rx2) = mpsc::unbounded_channel();
    let second = backend
        .prompt("sess-1", vec![PromptContent::text("second")], tx)
        .await;
    assert!(
        matches!(second, Err(AppError::TurnInProgress(_))),
        "got {second:?}"
    );

    agent.respond(id, json!({ "stopReason": "end_turn" })).await;
    turn.await.unwrap().unwrap();
}

/// `wait_for_response_complete` resolves only once the turn ends.
#[tokio::test]
async fn wait_for_response_complete_tracks_the_turn() {
    let (backend, mut agent) = ready_backend("sess-1").await;

    tokio::time::timeout(STEP_TIMEOUT, backend.wait_for_response_complete())
        .await
        .expect("idle backend resolves immediately");

    let (turn, _rx) = spawn_prompt(&backend, "sess-1", "work");
    let (id, _) = agent.expect_request("session/prompt").await;
    assert!(backend.processing_message().await);

    let waiter = tokio::spawn({
        let backend = backend.clone();
        async move { backend.wait_for_response_complete().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "waiter must block while the turn runs");

    agent.respond(id, json!({ "stopReason": "end_turn" })).await;
    tokio::time::timeout(STEP_TIMEOUT, waiter)
        .await
        .expect("waiter released at turn end")
        .unwrap();
    turn.await.unwrap().unwrap();
    assert!(!backend.processing_message().await);
}

/// An error answer fails the prompt without a `TurnComplete` event.
#[tokio::test]
async fn failed_prompt_emits_no_turn_complete() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "hello");

    let (id, _) = agent.expect_request("session/prompt").await;
    agent.respond_error(id, -32603, "model crashed").await;

    let result = turn.await.unwrap();
    assert!(
        matches!(result, Err(AppError::Remote { code: -32603, .. })),
        "got {result:?}"
    );
    assert!(drain(&mut rx).is_empty());
    assert!(!backend.processing_message().await);
}

/// A failed turn leaves the session usable: the next prompt on it completes.
#[tokio::test]
async fn session_survives_failed_prompt() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, _rx) = spawn_prompt(&backend, "sess-1", "first");
    let (id, _) = agent.expect_request("session/prompt").await;
    agent.respond_error(id, -32603, "model crashed").await;
    assert!(turn.await.unwrap().is_err());

    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "second");
    let (id, params) = agent.expect_request("session/prompt").await;
    assert_eq!(params["sessionId"], "sess-1");
    agent.update("sess-1", text("recovered")).await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;

    turn.await.unwrap().unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            ConversationEvent::TextDelta {
                text: "recovered".into()
            },
            ConversationEvent::TurnComplete {
                stop_reason: "end_turn".into()
            },
        ]
    );
    assert!(!backend.processing_message().await);
}

/// An update line with invalid UTF-8 is skipped; the turn carries on.
#[tokio::test]
async fn invalid_utf8_update_does_not_abort_turn() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "hello");
    let (id, _) = agent.expect_request("session/prompt").await;

    let mut line = br#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"bad "#.to_vec();
    line.push(0xFF);
    line.extend_from_slice(br#""}}}}"#);
    agent.send_bytes(&line).await;
    agent.update("sess-1", text("good")).await;
    agent.respond(id, json!({ "stopReason": "end_turn" })).await;

    let result = tokio::time::timeout(STEP_TIMEOUT, turn)
        .await
        .expect("turn must complete")
        .unwrap();
    assert!(result.is_ok(), "got {result:?}");
    assert!(backend.is_initialized().await);
    assert_eq!(
        drain(&mut rx),
        vec![
            ConversationEvent::TextDelta {
                text: "good".into()
            },
            ConversationEvent::TurnComplete {
                stop_reason: "end_turn".into()
            },
        ]
    );
}

/// Prompting is never retried: one failure means one request on the wire.
#[tokio::test]
async fn prompt_is_not_retried() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, _rx) = spawn_prompt(&backend, "sess-1", "hello");

    let (id, _) = agent.expect_request("session/prompt").await;
    agent.respond_error(id, -32000, "busy").await;

    assert!(turn.await.unwrap().is_err());
    agent.assert_silent(Duration::from_millis(100)).await;
}

/// Prompting before `initialize` fails with `NotInitialized`.
#[tokio::test]
async fn prompt_requires_initialize() {
    let (backend, _agent) = fake_backend(fast_options());
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = backend
        .prompt("sess-1", vec![PromptContent::text("hi")], tx)
        .await;
    assert!(matches!(result, Err(AppError::NotInitialized)));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// `cancel_prompt` sends `session/cancel`; the turn still ends through the
/// agent's reply.
#[tokio::test]
async fn cancel_prompt_sends_notification_and_turn_completes() {
    let (backend, mut agent) = ready_backend("sess-1").await;
    let (turn, mut rx) = spawn_prompt(&backend, "sess-1", "long task");
    let (id, _) = agent.expect_request("session/prompt").await;

    backend.cancel_prompt("sess-1").await.unwrap();
    let params = agent.expect_notification("session/cancel").await;
    assert_eq!(params, json!({ "sessionId": "sess-1" }));
    assert!(backend.processing_message().await, "cancel is advisory");

    agent.respond(id, json!({ "stopReason": "cancelled" })).await;
    turn.await.unwrap().unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![ConversationEvent::TurnComplete {
            stop_reason: "cancelled".into()
        }]
    );
}

/// Cancelling without a connection is a no-op.
#[tokio::test]
async fn cancel_without_transport_is_noop() {
    let (backend, mut agent) = fake_backend(fast_options());

    backend.cancel_prompt("sess-1").await.unwrap();
    agent.assert_silent(Duration::from_millis(50)).await;
}
