//! JSON-RPC 2.0 envelope exchanged with the agent.
//!
//! Every line on the stream is one [`Message`]. Its shape decides its role:
//!
//! | `id` | `method` | Kind                                   |
//! |------|----------|----------------------------------------|
//! | yes  | yes      | [`MessageKind::Request`] (agent → host) |
//! | yes  | no       | [`MessageKind::Response`]              |
//! | no   | yes      | [`MessageKind::Notification`]          |
//! | no   | no       | [`MessageKind::Invalid`]               |

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppError;

/// Protocol version tag written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code for an inbound method with no registered handler.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code for a handler that failed while producing its result.
pub const INTERNAL_ERROR: i64 = -32603;

/// Request correlation identifier. Agents may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id; the host always allocates these.
    Number(u64),
    /// String id.
    Str(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// Structured error payload carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    #[serde(default)]
    pub code: i64,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Role of a decoded [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Agent-initiated request that needs a host answer.
    Request,
    /// Answer to a host request.
    Response,
    /// One-way message.
    Notification,
    /// Neither `id` nor `method`.
    Invalid,
}

/// One framed message in either direction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Always `"2.0"` on outbound messages; tolerated when absent inbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failed response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    /// Host → agent request.
    #[must_use]
    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            id: Some(id),
            method: Some(method.to_owned()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Host → agent notification.
    #[must_use]
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            method: Some(method.to_owned()),
            params: Some(params),
            ..Self::default()
        }
    }

    /// Successful answer to an agent-initiated request.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Failed answer to an agent-initiated request.
    #[must_use]
    pub fn error_response(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            id: Some(id),
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::default()
        }
    }

    /// Classify the message by the presence of `id` and `method`.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match (self.id.is_some(), self.method.is_some()) {
            (true, true) => MessageKind::Request,
            (true, false) => MessageKind::Response,
            (false, true) => MessageKind::Notification,
            (false, false) => MessageKind::Invalid,
        }
    }

    /// Outcome carried by a response: the error payload wins over `result`,
    /// and a missing `result` reads as `null`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`] when the agent answered with an error.
    pub fn into_outcome(self) -> crate::Result<Value> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
