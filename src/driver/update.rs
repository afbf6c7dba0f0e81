//! `session/update` normalization.
//!
//! Converts the opaque `update` payload of one `session/update` notification
//! into zero or more [`ConversationEvent`]s. Nothing is kept between calls.
//! A payload that cannot be understood yields no events: one bad update must
//! not abort the turn it belongs to.
//!
//! | `sessionUpdate`        | Event                                  |
//! |------------------------|----------------------------------------|
//! | `agent_message_chunk`  | [`ConversationEvent::TextDelta`]       |
//! | `agent_thought_chunk`  | [`ConversationEvent::ThoughtDelta`]    |
//! | `tool_call`            | [`ConversationEvent::ToolCall`]        |
//! | `tool_call_update`     | [`ConversationEvent::ToolCallUpdate`]  |
//! | `plan`                 | [`ConversationEvent::Plan`]            |
//! | *(anything else)*      | none; logged at `DEBUG`                |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-turn destination for normalized events.
pub type UpdateSink = mpsc::UnboundedSender<ConversationEvent>;

/// One entry of an agent plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    /// Task description.
    pub content: String,
    /// `pending`, `in_progress`, `completed`, …
    #[serde(default)]
    pub status: Option<String>,
    /// `high`, `medium`, `low`, …
    #[serde(default)]
    pub priority: Option<String>,
}

/// Normalized conversation output handed to the host for the active turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// Incremental assistant text.
    TextDelta {
        /// Text fragment.
        text: String,
    },
    /// Incremental reasoning text.
    ThoughtDelta {
        /// Text fragment.
        text: String,
    },
    /// A tool call started.
    ToolCall {
        /// Agent-assigned tool call identifier.
        tool_call_id: String,
        /// Human-readable title.
        title: String,
        /// Tool category (`read`, `edit`, `execute`, …).
        kind: Option<String>,
        /// Lifecycle status (`pending`, `in_progress`, …).
        status: Option<String>,
        /// Raw tool input.
        raw_input: Option<Value>,
    },
    /// A running tool call changed.
    ToolCallUpdate {
        /// Agent-assigned tool call identifier.
        tool_call_id: String,
        /// New lifecycle status.
        status: Option<String>,
        /// New title.
        title: Option<String>,
        /// Concatenated text produced so far.
        text: Option<String>,
        /// Raw tool output.
        raw_output: Option<Value>,
    },
    /// The agent published or revised its plan.
    Plan {
        /// Plan entries, in order.
        entries: Vec<PlanEntry>,
    },
    /// The turn ended.
    TurnComplete {
        /// Why the agent stopped (`end_turn`, `cancelled`, …).
        stop_reason: String,
    },
}

// ── Inbound payload shapes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
enum RawUpdate {
    AgentMessageChunk {
        content: Value,
    },
    AgentThoughtChunk {
        content: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        kind: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        raw_input: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        content: Option<Vec<Value>>,
        #[serde(default)]
        raw_output: Option<Value>,
    },
    Plan {
        #[serde(default)]
        entries: Vec<Value>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolCallContent {
    Content { content: ContentBlock },
    #[serde(other)]
    Other,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Normalize one `update` payload.
#[must_use]
pub fn normalize_update(update: &Value) -> Vec<ConversationEvent> {
    let raw = match RawUpdate::deserialize(update) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "update normalizer: malformed session update, dropping");
            return Vec::new();
        }
    };

    match raw {
        RawUpdate::AgentMessageChunk { content } => text_of(&content)
            .map(|text| ConversationEvent::TextDelta { text })
            .into_iter()
            .collect(),
        RawUpdate::AgentThoughtChunk { content } => text_of(&content)
            .map(|text| ConversationEvent::ThoughtDelta { text })
            .into_iter()
            .collect(),
        RawUpdate::ToolCall {
            tool_call_id,
            title,
            kind,
            status,
            raw_input,
        } => vec![ConversationEvent::ToolCall {
            title: title.unwrap_or_else(|| tool_call_id.clone()),
            tool_call_id,
            kind,
            status,
            raw_input,
        }],
        RawUpdate::ToolCallUpdate {
            tool_call_id,
            status,
            title,
            content,
            raw_output,
        } => vec![ConversationEvent::ToolCallUpdate {
            tool_call_id,
            status,
            title,
            text: content.as_deref().and_then(tool_text),
            raw_output,
        }],
        RawUpdate::Plan { entries } => vec![ConversationEvent::Plan {
            entries: entries
                .iter()
                .filter_map(|entry| PlanEntry::deserialize(entry).ok())
                .collect(),
        }],
        RawUpdate::Unsupported => {
            let kind = update.get("sessionUpdate").and_then(Value::as_str);
            debug!(
                kind,
                "update normalizer: unsupported session update kind, skipping"
            );
            Vec::new()
        }
    }
}

/// Normalize `update` and push every resulting event into `sink`.
///
/// Returns the number of events delivered; a closed sink counts as zero.
pub fn forward_update(update: &Value, sink: &UpdateSink) -> usize {
    let mut delivered = 0;
    for event in normalize_update(update) {
        if sink.send(event).is_err() {
            debug!("update normalizer: sink closed, dropping remaining events");
            break;
        }
        delivered += 1;
    }
    delivered
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn text_of(content: &Value) -> Option<String> {
    match ContentBlock::deserialize(content) {
        Ok(ContentBlock::Text { text }) => Some(text),
        _ => None,
    }
}

fn tool_text(items: &[Value]) -> Option<String> {
    let parts: Vec<String> = items
        .iter()
        .filter_map(|item| match ToolCallContent::deserialize(item) {
            Ok(ToolCallContent::Content {
                content: ContentBlock::Text { text },
            }) => Some(text),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
