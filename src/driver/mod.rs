//! Host-facing agent backend abstraction.
//!
//! The [`AgentBackend`] trait is the surface a host application drives:
//! handshake, session creation, prompting, cancellation and permission
//! mediation. [`acp_driver::AcpBackend`] implements it over a
//! [`Transport`](crate::acp::transport::Transport).

pub mod acp_driver;
pub mod update;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::acp::spawner::{spawn_agent, SpawnConfig};
use crate::acp::transport::{ProcessError, Transport};
use crate::driver::update::UpdateSink;
use crate::Result;

/// Default option kind when the agent omits one.
pub const DEFAULT_OPTION_KIND: &str = "allow_once";

/// Subscriber notified of every permission request the agent raises.
pub type PermissionHandler = Arc<dyn Fn(PermissionRequest) + Send + Sync>;

/// Subscriber for out-of-band agent process failures.
pub type StderrErrorHandler = Arc<dyn Fn(ProcessError) + Send + Sync>;

/// Settings forwarded to `session/new`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Working directory the agent operates in.
    pub cwd: PathBuf,
    /// Auxiliary MCP server descriptors, forwarded verbatim.
    pub mcp_servers: Vec<Value>,
}

/// One item of a `session/prompt` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Reference to a resource the agent may read.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Display name.
        name: String,
    },
}

impl PromptContent {
    /// Text prompt item.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Resource link item.
    #[must_use]
    pub fn resource_link(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ResourceLink {
            uri: uri.into(),
            name: name.into(),
        }
    }
}

/// One selectable answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back when selected.
    pub option_id: String,
    /// Display name.
    pub name: String,
    /// Disposition tag (`allow_once`, `allow_always`, `reject_once`, …).
    pub kind: String,
}

/// A permission request raised by the agent in the middle of a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Correlation key for [`AgentBackend::respond_to_permission`]; equal to
    /// `tool_call_id`.
    pub id: String,
    /// Session the request belongs to.
    pub session_id: String,
    /// Tool call awaiting permission.
    pub tool_call_id: String,
    /// Human-readable title.
    pub title: Option<String>,
    /// Tool category.
    pub kind: Option<String>,
    /// Raw tool input.
    pub raw_input: Option<Value>,
    /// Raw tool output.
    pub raw_output: Option<Value>,
    /// Selectable options, in agent order.
    pub options: Vec<PermissionOption>,
    /// When the host received the request.
    pub received_at: DateTime<Utc>,
}

impl PermissionRequest {
    /// Build a request from raw `session/request_permission` params.
    ///
    /// Extraction is best-effort: a missing tool call id becomes
    /// `tool-<uuid>`, a missing session id becomes `fallback_session_id`,
    /// non-object option entries are dropped and the remaining ones get
    /// positional fallbacks for any missing field.
    #[must_use]
    pub fn from_params(params: &Value, fallback_session_id: &str) -> Self {
        let empty = Map::new();
        let tool_call = params
            .get("toolCall")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let tool_call_id = string_field(tool_call.get("toolCallId"))
            .unwrap_or_else(|| format!("tool-{}", Uuid::new_v4()));
        let session_id = string_field(params.get("sessionId"))
            .unwrap_or_else(|| fallback_session_id.to_owned());

        let options = params
            .get("options")
            .and_then(Value::as_array)
            .map(|raw| parse_options(raw.as_slice()))
            .unwrap_or_default();

        Self {
            id: tool_call_id.clone(),
            session_id,
            tool_call_id,
            title: string_field(tool_call.get("title")),
            kind: string_field(tool_call.get("kind")),
            raw_input: tool_call.get("rawInput").cloned(),
            raw_output: tool_call.get("rawOutput").cloned(),
            options,
            received_at: Utc::now(),
        }
    }
}

/// The host's decision on a [`PermissionRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionResponse {
    /// Dismissed without choosing an option.
    Cancelled,
    /// One of the offered options was chosen.
    Selected {
        /// The chosen [`PermissionOption::option_id`].
        option_id: String,
    },
}

impl PermissionResponse {
    /// Wire form of the decision, as sent back to the agent.
    #[must_use]
    pub fn to_outcome(&self) -> Value {
        match self {
            Self::Cancelled => json!({ "outcome": { "outcome": "cancelled" } }),
            Self::Selected { option_id } => {
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
            }
        }
    }
}

/// Produces a fresh [`Transport`] each time the backend initializes.
pub trait AgentConnector: Send + Sync {
    /// Connect to (usually: spawn) the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started.
    fn connect(&self) -> Result<Transport>;
}

impl<F> AgentConnector for F
where
    F: Fn() -> Result<Transport> + Send + Sync,
{
    fn connect(&self) -> Result<Transport> {
        self()
    }
}

/// Connector that spawns the agent as a child process.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    config: SpawnConfig,
}

impl ProcessConnector {
    /// Connector for the process described by `config`.
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

impl AgentConnector for ProcessConnector {
    fn connect(&self) -> Result<Transport> {
        Ok(spawn_agent(&self.config)?.into_transport())
    }
}

/// Protocol surface between a host application and one agent.
pub trait AgentBackend: Send + Sync {
    /// Perform the handshake. Returns immediately when already initialized.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InitializationFailed`](crate::AppError::InitializationFailed)
    /// when the response is malformed or every attempt failed.
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Create a session and make it the active one.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotInitialized`](crate::AppError::NotInitialized) before
    /// `initialize`, or [`AppError::SessionCreationFailed`](crate::AppError::SessionCreationFailed).
    fn new_session<'a>(
        &'a self,
        config: &'a SessionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Run one turn, streaming normalized events into `on_update`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotInitialized`](crate::AppError::NotInitialized),
    /// [`AppError::TurnInProgress`](crate::AppError::TurnInProgress), or the
    /// transport error that failed the request.
    fn prompt(
        &self,
        session_id: &str,
        content: Vec<PromptContent>,
        on_update: UpdateSink,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Ask the agent to end the current turn early. Advisory only.
    ///
    /// # Errors
    ///
    /// Never fails; a missing transport is a no-op.
    fn cancel_prompt(&self, session_id: &str)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Answer a pending permission request. Late or duplicate answers are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Never fails for unknown requests.
    fn respond_to_permission<'a>(
        &'a self,
        request: &'a PermissionRequest,
        response: PermissionResponse,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Register the permission subscriber, replacing any previous one.
    fn on_permission_request(
        &self,
        handler: PermissionHandler,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Register the process-error subscriber, replacing any previous one.
    fn on_stderr_error(
        &self,
        handler: StderrErrorHandler,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Resolve once no turn is in flight.
    fn wait_for_response_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Close the transport. Later operations fail with `NotInitialized`.
    ///
    /// # Errors
    ///
    /// Never fails; disconnecting twice is a no-op.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_owned)
}

fn parse_options(raw: &[Value]) -> Vec<PermissionOption> {
    raw.iter()
        .filter(|option| option.is_object())
        .enumerate()
        .map(|(index, option)| {
            let position = index + 1;
            PermissionOption {
                option_id: string_field(option.get("optionId"))
                    .unwrap_or_else(|| format!("option-{position}")),
                name: string_field(option.get("name"))
                    .unwrap_or_else(|| format!("Option {position}")),
                kind: string_field(option.get("kind"))
                    .unwrap_or_else(|| DEFAULT_OPTION_KIND.to_owned()),
            }
        })
        .collect()
}
