#![forbid(unsafe_code)]

//! `acp-bridge`: run one prompt against an ACP agent from the terminal.
//!
//! Spawns the configured agent, performs the handshake, opens a session,
//! sends the prompt and streams the turn to stdout. Permission requests are
//! answered according to `permission_policy`; Ctrl-C asks the agent to
//! cancel the turn.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_bridge::acp::transport::ProcessError;
use acp_bridge::config::{GlobalConfig, PermissionPolicy};
use acp_bridge::driver::acp_driver::AcpBackend;
use acp_bridge::driver::update::ConversationEvent;
use acp_bridge::driver::{
    AgentBackend, PermissionRequest, PermissionResponse, PromptContent, SessionConfig,
    DEFAULT_OPTION_KIND,
};
use acp_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    /// Assistant text as it streams, tool activity as short lines.
    Text,
    /// One JSON object per conversation event.
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-bridge", about = "Drive an ACP agent for one prompt", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json). Logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Conversation output format on stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Override the session working directory.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Attach a local file to the prompt as a resource link. Repeatable.
    #[arg(long = "resource", value_name = "PATH")]
    resources: Vec<PathBuf>,

    /// Prompt text sent to the agent.
    #[arg(required = true)]
    prompt: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(cwd) = args.cwd {
        config.session.cwd = cwd
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid cwd override: {err}")))?;
    }
    info!(agent = %config.agent.command, "configuration loaded");

    let backend = AcpBackend::from_config(&config);

    backend
        .on_stderr_error(Arc::new(|err: ProcessError| warn!(%err, "agent process error")))
        .await;

    let policy = config.permission_policy;
    let responder = backend.clone();
    backend
        .on_permission_request(Arc::new(move |request: PermissionRequest| {
            let responder = responder.clone();
            tokio::spawn(async move {
                let response = decide_permission(policy, &request);
                info!(
                    tool_call_id = request.tool_call_id,
                    title = request.title.as_deref().unwrap_or(""),
                    ?response,
                    "answering permission request"
                );
                if let Err(err) = responder.respond_to_permission(&request, response).await {
                    error!(%err, "failed to answer permission request");
                }
            });
        }))
        .await;

    backend.initialize().await?;
    let session_id = backend
        .new_session(&SessionConfig {
            cwd: config.session.cwd.clone(),
            mcp_servers: config.session.mcp_servers.clone(),
        })
        .await?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let output = args.output;
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(output, &event);
        }
    });

    let prompt = build_prompt(&args.prompt.join(" "), &args.resources)?;
    let turn = backend.prompt(&session_id, prompt, event_tx);
    tokio::pin!(turn);

    let outcome = tokio::select! {
        outcome = &mut turn => outcome,
        () = shutdown_signal() => {
            info!(session_id, "interrupt received, cancelling turn");
            backend.cancel_prompt(&session_id).await?;
            turn.await
        }
    };

    if let Err(err) = printer.await {
        warn!(%err, "output task failed");
    }
    backend.disconnect().await?;
    outcome
}

/// Pick an answer for `request` under `policy`.
fn decide_permission(policy: PermissionPolicy, request: &PermissionRequest) -> PermissionResponse {
    let chosen = match policy {
        PermissionPolicy::Cancel => None,
        PermissionPolicy::AllowOnce => request
            .options
            .iter()
            .find(|option| option.kind == DEFAULT_OPTION_KIND),
        PermissionPolicy::FirstOption => request.options.first(),
    };

    chosen.map_or(PermissionResponse::Cancelled, |option| {
        PermissionResponse::Selected {
            option_id: option.option_id.clone(),
        }
    })
}

fn print_event(format: OutputFormat, event: &ConversationEvent) {
    let mut stdout = std::io::stdout().lock();
    let written = match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => writeln!(stdout, "{line}"),
            Err(err) => {
                warn!(%err, "failed to serialise event");
                Ok(())
            }
        },
        OutputFormat::Text => match event {
            ConversationEvent::TextDelta { text } => write!(stdout, "{text}"),
            ConversationEvent::ThoughtDelta { .. } => Ok(()),
            ConversationEvent::ToolCall { title, status, .. } => writeln!(
                stdout,
                "\n[tool] {title} ({})",
                status.as_deref().unwrap_or("pending")
            ),
            ConversationEvent::ToolCallUpdate {
                tool_call_id,
                status: Some(status),
                ..
            } => writeln!(stdout, "[tool {tool_call_id}] {status}"),
            ConversationEvent::ToolCallUpdate { .. } => Ok(()),
            ConversationEvent::Plan { entries } => entries.iter().try_for_each(|entry| {
                writeln!(
                    stdout,
                    "[plan] {} ({})",
                    entry.content,
                    entry.status.as_deref().unwrap_or("pending")
                )
            }),
            ConversationEvent::TurnComplete { stop_reason } => {
                writeln!(stdout, "\n[turn complete: {stop_reason}]")
            }
        },
    };

    if let Err(err) = written.and_then(|()| stdout.flush()) {
        warn!(%err, "failed to write to stdout");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c signal handler failed");
        // Never resolve: without a handler the turn simply runs to completion.
        std::future::pending::<()>().await;
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

/// Prompt text followed by one resource link per attached file.
fn build_prompt(text: &str, resources: &[PathBuf]) -> Result<Vec<PromptContent>> {
    let mut prompt = vec![PromptContent::text(text)];
    for path in resources {
        let path = path.canonicalize().map_err(|err| {
            AppError::Config(format!("invalid resource {}: {err}", path.display()))
        })?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        prompt.push(PromptContent::resource_link(
            format!("file://{}", path.display()),
            name,
        ));
    }
    Ok(prompt)
}
