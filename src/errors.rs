//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use serde_json::Value;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Framing failure or malformed protocol data on the agent stream.
    Acp(String),
    /// A request exceeded its deadline.
    Timeout(String),
    /// The agent answered a request with a structured error payload.
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message supplied by the agent.
        message: String,
        /// Optional structured detail.
        data: Option<Value>,
    },
    /// The stream ended or was closed while a call was outstanding.
    TransportClosed,
    /// The `initialize` handshake was malformed or exhausted its retries.
    InitializationFailed(String),
    /// `session/new` was malformed or exhausted its retries.
    SessionCreationFailed(String),
    /// An operation was attempted before `initialize` or after `disconnect`.
    NotInitialized,
    /// A prompt was submitted while another turn was still in flight.
    TurnInProgress(String),
    /// Out-of-band failure of the agent process.
    Process(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Remote { code, message, .. } => write!(f, "remote error {code}: {message}"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::SessionCreationFailed(msg) => write!(f, "session creation failed: {msg}"),
            Self::NotInitialized => write!(f, "acp transport not initialized"),
            Self::TurnInProgress(msg) => write!(f, "turn in progress: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Acp(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
