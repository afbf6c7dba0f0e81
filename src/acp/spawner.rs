//! ACP agent process spawner.
//!
//! Spawns the agent executable with:
//! - `kill_on_drop(true)` so the process never outlives its handle.
//! - `env_clear()` + a safe variable allowlist, plus the variables listed in
//!   the agent configuration.
//! - All three stdio streams piped: stdin/stdout carry the protocol, stderr
//!   feeds the transport's process-error side channel.
//!
//! [`AgentProcess::into_transport`] hands the pipes to a [`Transport`] and
//! starts an exit monitor that reports the child's exit and kills it if it
//! outlives the transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::acp::transport::{ProcessError, ProcessErrorKind, Transport};
use crate::config::GlobalConfig;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable is stripped via `env_clear()` before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TERM",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for spawning an ACP agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent binary.
    pub command: String,
    /// Arguments passed to the agent binary.
    pub args: Vec<String>,
    /// Extra variables set after the allowlist is applied.
    pub env: HashMap<String, String>,
    /// Directory the child process starts in.
    pub working_dir: PathBuf,
}

impl SpawnConfig {
    /// Build the spawn settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            command: config.agent.command.clone(),
            args: config.agent.args.clone(),
            env: config.agent.env.clone(),
            working_dir: config.session.cwd.clone(),
        }
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// A running agent with its stdio captured.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child process handle (`kill_on_drop`).
    pub child: Child,
    /// Protocol input.
    pub stdin: ChildStdin,
    /// Protocol output.
    pub stdout: ChildStdout,
    /// Diagnostic output.
    pub stderr: ChildStderr,
}

impl AgentProcess {
    /// Wire the process into a [`Transport`].
    ///
    /// Starts the reader/writer tasks over stdout/stdin, forwards stderr to
    /// the side channel and spawns [`monitor_exit`].
    #[must_use]
    pub fn into_transport(self) -> Transport {
        let transport = Transport::spawn(self.stdout, self.stdin);
        transport.attach_stderr(self.stderr);
        drop(monitor_exit(self.child, transport.clone()));
        transport
    }
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the agent process described by `config`.
///
/// # Errors
///
/// - `AppError::Process("failed to spawn agent: …")`: OS spawn failure.
/// - `AppError::Process("failed to capture agent …")`: a pipe is missing.
pub fn spawn_agent(config: &SpawnConfig) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&config.env);

    cmd.current_dir(&config.working_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Process(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Process("failed to capture agent stderr".into()))?;

    info!(
        command = %config.command,
        pid = child.id(),
        "agent process spawned"
    );

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

// ── Exit monitor ─────────────────────────────────────────────────────────────

/// How long a child may take to exit on its own after the transport closes.
///
/// Closing the transport closes the agent's stdin, which most agents treat
/// as a shutdown request.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Spawn a background task that waits for the child to exit.
///
/// Whenever the child exits on its own, the exit is reported as
/// [`ProcessErrorKind::Exited`] and the transport is closed. If the transport
/// closes first, the child gets [`EXIT_GRACE`] to exit before it is killed.
pub fn monitor_exit(mut child: Child, transport: Transport) -> JoinHandle<()> {
    let cancel = transport.cancellation_token();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => {
                if let Ok(status) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    status
                } else {
                    warn!(grace = ?EXIT_GRACE, "agent did not exit after transport close, killing");
                    if let Err(err) = child.kill().await {
                        warn!(%err, "failed to kill agent process");
                    }
                    return;
                }
            }
        };

        let (code, reason) = match status {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                (code, reason)
            }
            Err(err) => (None, format!("wait error: {err}")),
        };

        info!(?code, "agent process exited");
        transport
            .report_process_error(ProcessError::new(ProcessErrorKind::Exited { code }, reason))
            .await;
        transport.close().await;
    })
}
