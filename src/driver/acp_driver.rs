//! ACP protocol implementation of [`AgentBackend`].
//!
//! [`AcpBackend`] owns one [`Transport`] at a time and layers the session
//! protocol on top of it:
//!
//! 1. `initialize` connects, registers the inbound handlers and performs the
//!    handshake under the configured [`RetryPolicy`].
//! 2. `new_session` creates a session and records it as the active one.
//! 3. `prompt` installs the caller's sink, sends `session/prompt` with no
//!    deadline and forwards matching `session/update` notifications through
//!    the update normalizer until the agent answers.
//! 4. `session/request_permission` requests are parked in an inbound slot
//!    keyed by tool call id until [`AgentBackend::respond_to_permission`].
//!
//! Updates carrying any session id other than the active one are dropped.
//!
//! The active session, the per-turn sink and the turn-in-progress flag live
//! together behind one mutex, so completion waiters are released atomically
//! with the flag.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::acp::spawner::SpawnConfig;
use crate::acp::transport::Transport;
use crate::config::GlobalConfig;
use crate::driver::update::{forward_update, ConversationEvent, UpdateSink};
use crate::driver::{
    AgentBackend, AgentConnector, PermissionHandler, PermissionRequest, PermissionResponse,
    ProcessConnector, PromptContent, SessionConfig, StderrErrorHandler,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::{AppError, Result};

/// Protocol version announced in `initialize`.
pub const PROTOCOL_VERSION: u64 = 1;

const METHOD_INITIALIZE: &str = "initialize";
const METHOD_SESSION_NEW: &str = "session/new";
const METHOD_SESSION_PROMPT: &str = "session/prompt";
const METHOD_SESSION_CANCEL: &str = "session/cancel";
const METHOD_SESSION_UPDATE: &str = "session/update";
const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

/// Tunables for [`AcpBackend`].
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Retry policy for `initialize` and `session/new`.
    pub retry: RetryPolicy,
    /// Deadline for each handshake attempt; `None` disables it.
    pub handshake_timeout: Option<Duration>,
    /// `clientInfo.name` sent in `initialize`.
    pub client_name: String,
    /// `clientInfo.version` sent in `initialize`.
    pub client_version: String,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            handshake_timeout: Some(Duration::from_secs(30)),
            client_name: env!("CARGO_PKG_NAME").to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl BackendOptions {
    /// Options derived from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            handshake_timeout: config.handshake_timeout(),
            ..Self::default()
        }
    }
}

/// Turn bookkeeping guarded as one unit.
#[derive(Default)]
struct TurnState {
    active_session_id: Option<String>,
    sink: Option<UpdateSink>,
    in_progress: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

struct BackendInner {
    connector: Box<dyn AgentConnector>,
    options: BackendOptions,
    transport: RwLock<Option<Transport>>,
    init_lock: Mutex<()>,
    permission_handler: RwLock<Option<PermissionHandler>>,
    stderr_handler: RwLock<Option<StderrErrorHandler>>,
    turn: Mutex<TurnState>,
}

/// ACP backend driving a single agent connection. At most one turn runs at a time.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct AcpBackend {
    inner: Arc<BackendInner>,
}

impl std::fmt::Debug for AcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpBackend")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl AcpBackend {
    /// Create a backend that obtains its transport from `connector`.
    #[must_use]
    pub fn new(connector: impl AgentConnector + 'static, options: BackendOptions) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                connector: Box::new(connector),
                options,
                transport: RwLock::new(None),
                init_lock: Mutex::new(()),
                permission_handler: RwLock::new(None),
                stderr_handler: RwLock::new(None),
                turn: Mutex::new(TurnState::default()),
            }),
        }
    }

    /// Backend that spawns the agent described by `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            ProcessConnector::new(SpawnConfig::from_config(config)),
            BackendOptions::from_config(config),
        )
    }

    /// Whether a turn is currently in flight.
    pub async fn processing_message(&self) -> bool {
        self.inner.turn.lock().await.in_progress
    }

    /// Session that inbound updates are currently routed for.
    pub async fn active_session_id(&self) -> Option<String> {
        self.inner.turn.lock().await.active_session_id.clone()
    }

    /// Whether `initialize` has completed and the connection is still open.
    pub async fn is_initialized(&self) -> bool {
        self.inner
            .transport
            .read()
            .await
            .as_ref()
            .is_some_and(|transport| !transport.is_closed())
    }
}

impl BackendInner {
    /// The live transport. One the agent has hung up on counts as absent.
    async fn transport(&self) -> Result<Transport> {
        self.transport
            .read()
            .await
            .clone()
            .filter(|transport| !transport.is_closed())
            .ok_or(AppError::NotInitialized)
    }

    async fn initialize(self: &Arc<Self>) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        {
            let mut current = self.transport.write().await;
            match current.as_ref() {
                Some(transport) if !transport.is_closed() => return Ok(()),
                Some(_) => {
                    warn!("acp backend: agent connection lost, reconnecting");
                    *current = None;
                }
                None => {}
            }
        }

        let transport = self
            .connector
            .connect()
            .map_err(|e| AppError::InitializationFailed(format!("failed to connect: {e}")))?;
        self.register_handlers(&transport).await;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": false, "writeTextFile": false },
                "terminal": false
            },
            "clientInfo": {
                "name": self.options.client_name,
                "version": self.options.client_version
            }
        });

        let timeout = self.options.handshake_timeout;
        let outcome = with_retry(&self.options.retry, METHOD_INITIALIZE, || {
            transport.send_request(METHOD_INITIALIZE, params.clone(), timeout)
        })
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                transport.close().await;
                return Err(AppError::InitializationFailed(e.to_string()));
            }
        };

        let Some(version) = response.get("protocolVersion").filter(|v| v.is_number()) else {
            transport.close().await;
            return Err(AppError::InitializationFailed(
                "invalid initialize response: missing numeric protocolVersion".into(),
            ));
        };

        info!(protocol_version = %version, "acp backend: initialized");
        *self.transport.write().await = Some(transport);
        Ok(())
    }

    async fn register_handlers(self: &Arc<Self>, transport: &Transport) {
        let weak = Arc::downgrade(self);
        transport
            .on_notification(move |method, params| {
                let weak = Weak::clone(&weak);
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if method == METHOD_SESSION_UPDATE {
                        inner.handle_session_update(&params).await;
                    } else {
                        debug!(method, "acp backend: ignoring notification");
                    }
                }
            })
            .await;

        let weak = Arc::downgrade(self);
        transport
            .register_request_handler(METHOD_REQUEST_PERMISSION, move |params, _id| {
                let weak = Weak::clone(&weak);
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.handle_permission_request(params).await,
                        None => Ok(PermissionResponse::Cancelled.to_outcome()),
                    }
                }
            })
            .await;

        if let Some(handler) = self.stderr_handler.read().await.clone() {
            transport.on_stderr_error(move |err| handler(err)).await;
        }
    }

    async fn new_session(&self, config: &SessionConfig) -> Result<String> {
        let transport = self.transport().await?;

        let params = json!({
            "cwd": config.cwd.to_string_lossy(),
            "mcpServers": config.mcp_servers,
        });

        let timeout = self.options.handshake_timeout;
        let response = with_retry(&self.options.retry, METHOD_SESSION_NEW, || {
            transport.send_request(METHOD_SESSION_NEW, params.clone(), timeout)
        })
        .await
        .map_err(|e| AppError::SessionCreationFailed(e.to_string()))?;

        let session_id = response
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| {
                AppError::SessionCreationFailed(
                    "invalid session/new response: missing sessionId".into(),
                )
            })?;

        self.turn.lock().await.active_session_id = Some(session_id.clone());
        info!(session_id, "acp backend: session created");
        Ok(session_id)
    }

    async fn prompt(
        &self,
        session_id: String,
        content: Vec<PromptContent>,
        on_update: UpdateSink,
    ) -> Result<()> {
        let transport = self.transport().await?;

        {
            let mut turn = self.turn.lock().await;
            if turn.in_progress {
                return Err(AppError::TurnInProgress(format!(
                    "cannot prompt session {session_id} while another turn is running"
                )));
            }
            turn.active_session_id = Some(session_id.clone());
            turn.sink = Some(on_update.clone());
            turn.in_progress = true;
        }

        debug!(session_id, items = content.len(), "acp backend: prompt sent");
        // No deadline: a turn may run for as long as the agent keeps working.
        let outcome = transport
            .send_request(
                METHOD_SESSION_PROMPT,
                json!({ "sessionId": session_id, "prompt": content }),
                None,
            )
            .await;

        let waiters = {
            let mut turn = self.turn.lock().await;
            // `disconnect` clears the sink; a late stop reason is then dropped.
            let sink_live = turn.sink.take().is_some();
            turn.in_progress = false;

            if let (true, Ok(response)) = (sink_live, &outcome) {
                if let Some(stop_reason) = response.get("stopReason").and_then(Value::as_str) {
                    let event = ConversationEvent::TurnComplete {
                        stop_reason: stop_reason.to_owned(),
                    };
                    if on_update.send(event).is_err() {
                        debug!(session_id, "acp backend: sink closed before turn_complete");
                    }
                }
            }
            std::mem::take(&mut turn.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }

        match &outcome {
            Ok(_) => debug!(session_id, "acp backend: turn complete"),
            Err(e) => warn!(session_id, error = %e, "acp backend: turn failed"),
        }
        outcome.map(|_| ())
    }

    async fn handle_session_update(&self, params: &Value) {
        if !params.is_object() {
            debug!("acp backend: session/update params not an object, dropping");
            return;
        }

        let turn = self.turn.lock().await;
        let update_session = params.get("sessionId").and_then(Value::as_str);
        if let (Some(active), Some(incoming)) = (turn.active_session_id.as_deref(), update_session)
        {
            if active != incoming {
                debug!(
                    active,
                    incoming, "acp backend: dropping update for inactive session"
                );
                return;
            }
        }

        let Some(sink) = turn.sink.as_ref() else {
            debug!("acp backend: no turn in flight, dropping update");
            return;
        };

        let update = params.get("update").unwrap_or(&Value::Null);
        forward_update(update, sink);
    }

    async fn handle_permission_request(&self, params: Value) -> Result<Value> {
        if !params.is_object() {
            return Ok(PermissionResponse::Cancelled.to_outcome());
        }

        let fallback_session = self
            .turn
            .lock()
            .await
            .active_session_id
            .clone()
            .unwrap_or_else(|| "unknown".to_owned());
        let request = PermissionRequest::from_params(&params, &fallback_session);

        let Some(handler) = self.permission_handler.read().await.clone() else {
            debug!(
                tool_call_id = request.tool_call_id,
                "acp backend: no permission handler registered; cancelling request"
            );
            return Ok(PermissionResponse::Cancelled.to_outcome());
        };

        let transport = self.transport.read().await.clone();
        let Some(transport) = transport else {
            return Ok(PermissionResponse::Cancelled.to_outcome());
        };

        // The slot must exist before the subscriber can answer it.
        let slot = transport.open_slot(&request.id).await;
        let closed = transport.cancellation_token();
        debug!(
            tool_call_id = request.tool_call_id,
            options = request.options.len(),
            "acp backend: permission requested"
        );
        handler(request);

        tokio::select! {
            answer = slot => Ok(answer.unwrap_or_else(|_| PermissionResponse::Cancelled.to_outcome())),
            () = closed.cancelled() => Err(AppError::TransportClosed),
        }
    }

    async fn respond_to_permission(
        &self,
        request: &PermissionRequest,
        response: PermissionResponse,
    ) -> Result<()> {
        let transport = self.transport.read().await.clone();
        let resolved = match transport {
            Some(transport) => transport.resolve_slot(&request.id, response.to_outcome()).await,
            None => false,
        };

        if resolved {
            debug!(request_id = request.id, ?response, "acp backend: permission answered");
        } else {
            debug!(
                request_id = request.id,
                "acp backend: no pending permission request for id"
            );
        }
        Ok(())
    }

    async fn wait_for_response_complete(&self) {
        let rx = {
            let mut turn = self.turn.lock().await;
            if !turn.in_progress {
                return;
            }
            let (tx, rx) = oneshot::channel();
            turn.waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    async fn disconnect(&self) {
        let transport = self.transport.write().await.take();
        let Some(transport) = transport else {
            return;
        };
        self.turn.lock().await.sink = None;
        transport.close().await;
        info!("acp backend: disconnected");
    }
}

// ── AgentBackend implementation ──────────────────────────────────────────────

impl AgentBackend for AcpBackend {
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.inner.initialize().await })
    }

    fn new_session<'a>(
        &'a self,
        config: &'a SessionConfig,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move { self.inner.new_session(config).await })
    }

    fn prompt(
        &self,
        session_id: &str,
        content: Vec<PromptContent>,
        on_update: UpdateSink,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.inner.prompt(session_id, content, on_update).await })
    }

    /// Sends `session/cancel`; the in-flight `prompt` still completes through
    /// the agent's normal reply.
    fn cancel_prompt(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let transport = self.inner.transport.read().await.clone();
            let Some(transport) = transport else {
                debug!(session_id, "acp backend: cancel without transport, no-op");
                return Ok(());
            };
            transport
                .send_notification(METHOD_SESSION_CANCEL, json!({ "sessionId": session_id }))
                .await;
            info!(session_id, "acp backend: cancel requested");
            Ok(())
        })
    }

    fn respond_to_permission<'a>(
        &'a self,
        request: &'a PermissionRequest,
        response: PermissionResponse,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.inner.respond_to_permission(request, response).await })
    }

    fn on_permission_request(
        &self,
        handler: PermissionHandler,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            *self.inner.permission_handler.write().await = Some(handler);
        })
    }

    fn on_stderr_error(
        &self,
        handler: StderrErrorHandler,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            *self.inner.stderr_handler.write().await = Some(Arc::clone(&handler));
            let transport = self.inner.transport.read().await.clone();
            if let Some(transport) = transport {
                transport.on_stderr_error(move |err| handler(err)).await;
            }
        })
    }

    fn wait_for_response_complete(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move { self.inner.wait_for_response_complete().await })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.inner.disconnect().await;
            Ok(())
        })
    }
}
