//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::retry::RetryPolicy;
use crate::{AppError, Result};

/// How the agent executable is launched.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent binary (e.g., `gemini`, `claude-code-acp`).
    pub command: String,
    /// Arguments passed to the agent binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables injected on top of the allowlist.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Defaults forwarded to `session/new`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionDefaults {
    /// Working directory the agent operates in.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Auxiliary MCP server descriptors, forwarded verbatim.
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            cwd: default_cwd(),
            mcp_servers: Vec::new(),
        }
    }
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

/// Retry settings for the two handshake calls.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

/// Configurable timeout values (seconds).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for each `initialize` / `session/new` attempt; 0 means no timeout.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_seconds: default_handshake_seconds(),
        }
    }
}

fn default_handshake_seconds() -> u64 {
    30
}

/// How the CLI answers permission requests raised by the agent.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// Answer every request with `cancelled`.
    #[default]
    Cancel,
    /// Select the first option whose kind is `allow_once`, else cancel.
    AllowOnce,
    /// Select whatever option the agent listed first.
    FirstOption,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent process settings.
    pub agent: AgentConfig,
    /// Session defaults.
    #[serde(default)]
    pub session: SessionDefaults,
    /// Handshake retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Request deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Automatic answer policy for permission requests.
    #[serde(default)]
    pub permission_policy: PermissionPolicy,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy for `initialize` and `session/new`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            min_delay: Duration::from_millis(self.retry.min_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Per-attempt handshake deadline, `None` when disabled.
    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.timeouts.handshake_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.min_delay_ms {
            return Err(AppError::Config(
                "retry.max_delay_ms must not be less than retry.min_delay_ms".into(),
            ));
        }

        let canonical_cwd = self
            .session
            .cwd
            .canonicalize()
            .map_err(|err| AppError::Config(format!("session.cwd invalid: {err}")))?;
        self.session.cwd = canonical_cwd;

        Ok(())
    }
}
