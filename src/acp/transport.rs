//! Bidirectional JSON-RPC transport over one agent byte stream.
//!
//! A [`Transport`] owns two background tasks per agent:
//!
//! - **reader**: drives a [`FramedRead`] over the agent's stdout and
//!   dispatches each decoded [`Message`] strictly in arrival order:
//!   responses resolve the matching pending call, agent-initiated requests
//!   are handed to a registered handler on their own task, and notifications
//!   are delivered to the single subscriber before the next line is read.
//! - **writer**: drains an [`mpsc`] queue of outbound messages into a
//!   [`FramedWrite`] over the agent's stdin.
//!
//! Pending host requests and inbound request slots live in identifier-keyed
//! tables, so any number of each may be outstanding at once.
//!
//! Failures that are not part of the framed exchange (malformed output,
//! stream loss, stderr diagnostics, process exit) are reported through the
//! [`Transport::on_stderr_error`] side channel.

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::{AcpCodec, Frame};
use crate::acp::message::{Message, MessageKind, RequestId, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::{AppError, Result};

/// Capacity of the outbound message queue.
const OUTBOUND_CAPACITY: usize = 64;

/// Substrings (lower-case) that mark a stderr line as a diagnostic failure.
const STDERR_ERROR_MARKERS: &[&str] = &["error", "fatal", "panic", "exception"];

/// Subscriber for inbound notifications: `(method, params)`.
pub type NotificationHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for one agent-initiated request method: `(params, id)`.
pub type RequestHandler =
    Arc<dyn Fn(Value, RequestId) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Subscriber for out-of-band process failures.
pub type ProcessErrorHandler = Arc<dyn Fn(ProcessError) + Send + Sync>;

type PendingCalls = HashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// Category of an out-of-band failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessErrorKind {
    /// The agent wrote an error-looking diagnostic line to stderr.
    Stderr,
    /// The agent wrote a line that is not a valid protocol message.
    MalformedOutput,
    /// The agent's stdout ended or failed without a local `close()`.
    StreamClosed,
    /// An outbound message could not be written.
    WriteFailed,
    /// The agent process exited.
    Exited {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
}

/// Out-of-band failure reported through [`Transport::on_stderr_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    /// What went wrong.
    pub kind: ProcessErrorKind,
    /// Human-readable detail (the stderr line, parser diagnostic, …).
    pub message: String,
    /// When the failure was observed.
    pub observed_at: DateTime<Utc>,
}

impl ProcessError {
    /// Build a report stamped with the current time.
    #[must_use]
    pub fn new(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            observed_at: Utc::now(),
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<ProcessError> for AppError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err.to_string())
    }
}

/// State shared between the [`Transport`] handle and its background tasks.
struct Inner {
    next_id: AtomicU64,
    closed: AtomicBool,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<PendingCalls>,
    slots: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    error_handler: RwLock<Option<ProcessErrorHandler>>,
    cancel: CancellationToken,
}

/// Cloneable handle to one agent connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Debug for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Start the reader and writer tasks over `reader` (agent stdout) and
    /// `writer` (agent stdin).
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            outbound,
            pending: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            notification_handler: RwLock::new(None),
            request_handlers: RwLock::new(HashMap::new()),
            error_handler: RwLock::new(None),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_writer(Arc::clone(&inner), writer, outbound_rx));
        tokio::spawn(run_reader(Arc::clone(&inner), reader));

        Self { inner }
    }

    /// Forward the agent's stderr into the process-error side channel.
    ///
    /// Every line is logged at `DEBUG`; lines that look like failures are
    /// additionally reported as [`ProcessErrorKind::Stderr`].
    pub fn attach_stderr<R>(&self, stderr: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    biased;

                    () = inner.cancel.cancelled() => break,

                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            debug!(stderr = %line, "acp transport: agent stderr");
                            if looks_like_error(&line) {
                                inner
                                    .report(ProcessError::new(ProcessErrorKind::Stderr, line))
                                    .await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "acp transport: stderr read failed, stopping");
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Send a request and wait for the matching response.
    ///
    /// `timeout = None` waits for as long as the agent takes.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`]: the agent answered with an error payload.
    /// - [`AppError::Timeout`]: `timeout` elapsed first.
    /// - [`AppError::TransportClosed`]: the stream closed first.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            // Checked under the lock so `shutdown` cannot miss this entry.
            if self.is_closed() {
                return Err(AppError::TransportClosed);
            }
            pending.insert(id.clone(), tx);
        }

        debug!(%id, method, "acp transport: sending request");
        if self
            .inner
            .outbound
            .send(Message::request(id.clone(), method, params))
            .await
            .is_err()
        {
            self.inner.pending.lock().await.remove(&id);
            return Err(AppError::TransportClosed);
        }

        let outcome = match timeout {
            None => rx.await,
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    self.inner.pending.lock().await.remove(&id);
                    warn!(%id, method, ?limit, "acp transport: request timed out");
                    return Err(AppError::Timeout(format!(
                        "{method} (id {id}) not answered within {limit:?}"
                    )));
                }
            }
        };

        outcome.map_err(|_| AppError::TransportClosed)?
    }

    /// Fire-and-forget notification.
    ///
    /// A closed stream is reported through the process-error side channel
    /// rather than returned, since nobody awaits a reply.
    pub async fn send_notification(&self, method: &str, params: Value) {
        let delivered = !self.is_closed()
            && self
                .inner
                .outbound
                .send(Message::notification(method, params))
                .await
                .is_ok();

        if delivered {
            debug!(method, "acp transport: notification queued");
        } else {
            self.inner
                .report(ProcessError::new(
                    ProcessErrorKind::WriteFailed,
                    format!("cannot send {method}: stream closed"),
                ))
                .await;
        }
    }

    /// Register the single subscriber for inbound notifications.
    ///
    /// The returned future is awaited before the next inbound message is
    /// read, so delivery order matches arrival order. Replaces any previous
    /// subscriber.
    pub async fn on_notification<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler =
            Arc::new(move |method: String, params: Value| -> BoxFuture<'static, ()> {
                Box::pin(handler(method, params))
            });
        *self.inner.notification_handler.write().await = Some(handler);
    }

    /// Register the handler for agent-initiated requests named `method`.
    ///
    /// Each request runs on its own task. `Ok` results are framed as the
    /// response `result`; errors are framed as an error response.
    pub async fn register_request_handler<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value, RequestId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler =
            Arc::new(move |params: Value, id: RequestId| -> BoxFuture<'static, Result<Value>> {
                Box::pin(handler(params, id))
            });
        self.inner
            .request_handlers
            .write()
            .await
            .insert(method.to_owned(), handler);
    }

    /// Register the subscriber for out-of-band process failures.
    pub async fn on_stderr_error<F>(&self, handler: F)
    where
        F: Fn(ProcessError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write().await = Some(Arc::new(handler));
    }

    /// Report an out-of-band failure observed outside the transport
    /// (e.g., by the process exit monitor).
    pub async fn report_process_error(&self, error: ProcessError) {
        self.inner.report(error).await;
    }

    /// Open an inbound request slot keyed by `key` and return the receiving
    /// half. A slot already open under the same key is dropped, which its
    /// waiter observes as a closed channel.
    pub async fn open_slot(&self, key: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .slots
            .lock()
            .await
            .insert(key.to_owned(), tx)
            .is_some()
        {
            debug!(key, "acp transport: replaced an open inbound slot");
        }
        rx
    }

    /// Resolve the slot `key` with `value`, exactly once.
    ///
    /// Returns `false` when no slot is open under `key`.
    pub async fn resolve_slot(&self, key: &str, value: Value) -> bool {
        // Removed before sending so a second resolve finds nothing.
        let Some(tx) = self.inner.slots.lock().await.remove(key) else {
            return false;
        };
        if tx.send(value).is_err() {
            debug!(key, "acp transport: slot waiter already gone");
        }
        true
    }

    /// Drop the slot `key` without answering it.
    ///
    /// Returns `false` when no slot is open under `key`.
    pub async fn cancel_slot(&self, key: &str) -> bool {
        self.inner.slots.lock().await.remove(key).is_some()
    }

    /// Whether a slot is currently open under `key`.
    pub async fn has_slot(&self, key: &str) -> bool {
        self.inner.slots.lock().await.contains_key(key)
    }

    /// Whether the stream has been closed, locally or by the agent.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the transport shuts down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Terminate the stream and fail every pending call with
    /// [`AppError::TransportClosed`]. Idempotent.
    ///
    /// Open inbound slots are left untouched; their handlers are never
    /// answered synthetically.
    pub async fn close(&self) {
        if self.inner.shutdown().await {
            debug!("acp transport: closed");
        }
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed, stop the tasks, fail pending calls.
    ///
    /// Returns `false` if the transport was already shut down.
    async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();

        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "acp transport: failing pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(AppError::TransportClosed));
        }
        true
    }

    async fn report(&self, error: ProcessError) {
        warn!(kind = ?error.kind, message = %error.message, "acp transport: process error");
        let handler = self.error_handler.read().await.clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    async fn enqueue(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            debug!("acp transport: outbound queue closed, dropping message");
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        match message.kind() {
            MessageKind::Response => self.dispatch_response(message).await,
            MessageKind::Request => self.dispatch_request(message).await,
            MessageKind::Notification => self.dispatch_notification(message).await,
            MessageKind::Invalid => {
                self.report(ProcessError::new(
                    ProcessErrorKind::MalformedOutput,
                    "message carries neither id nor method",
                ))
                .await;
            }
        }
    }

    async fn dispatch_response(&self, message: Message) {
        let Some(id) = message.id.clone() else {
            return;
        };
        let Some(tx) = self.pending.lock().await.remove(&id) else {
            debug!(%id, "acp transport: no pending call for response, discarding");
            return;
        };
        if tx.send(message.into_outcome()).is_err() {
            debug!(%id, "acp transport: caller stopped waiting for response");
        }
    }

    async fn dispatch_request(self: &Arc<Self>, message: Message) {
        let (Some(id), Some(method)) = (message.id, message.method) else {
            return;
        };
        let params = message.params.unwrap_or(Value::Null);

        let handler = self.request_handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            debug!(%id, method, "acp transport: no handler for inbound request");
            self.enqueue(Message::error_response(
                id,
                METHOD_NOT_FOUND,
                format!("method not supported: {method}"),
            ))
            .await;
            return;
        };

        debug!(%id, method, "acp transport: dispatching inbound request");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let reply = match handler(params, id.clone()).await {
                Ok(result) => Message::response(id, result),
                Err(AppError::Remote { code, message, .. }) => {
                    Message::error_response(id, code, message)
                }
                Err(e) => Message::error_response(id, INTERNAL_ERROR, e.to_string()),
            };
            inner.enqueue(reply).await;
        });
    }

    async fn dispatch_notification(&self, message: Message) {
        let Some(method) = message.method else {
            return;
        };
        let params = message.params.unwrap_or(Value::Null);

        let handler = self.notification_handler.read().await.clone();
        match handler {
            Some(handler) => handler(method, params).await,
            None => debug!(method, "acp transport: no notification subscriber, skipping"),
        }
    }
}

/// Reader task: decode frames and dispatch them in arrival order.
async fn run_reader<R>(inner: Arc<Inner>, reader: R)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = inner.cancel.cancelled() => {
                debug!("acp reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => match item {
                None => {
                    debug!("acp reader: EOF detected");
                    if !inner.is_closed() {
                        inner
                            .report(ProcessError::new(
                                ProcessErrorKind::StreamClosed,
                                "agent stdout closed",
                            ))
                            .await;
                    }
                    break;
                }

                Some(Err(e)) => {
                    warn!(error = %e, "acp reader: IO error, stopping");
                    inner
                        .report(ProcessError::new(
                            ProcessErrorKind::StreamClosed,
                            format!("stream error: {e}"),
                        ))
                        .await;
                    break;
                }

                Some(Ok(Frame::Malformed { line, reason })) => {
                    warn!(error = %reason, raw_line = %line, "acp reader: malformed line, skipping");
                    inner
                        .report(ProcessError::new(
                            ProcessErrorKind::MalformedOutput,
                            format!("{reason}: {line}"),
                        ))
                        .await;
                }

                Some(Ok(Frame::Message(message))) => inner.dispatch(message).await,
            },
        }
    }

    inner.shutdown().await;
}

/// Writer task: frame queued messages onto the agent's stdin.
async fn run_writer<W>(inner: Arc<Inner>, writer: W, mut outbound_rx: mpsc::Receiver<Message>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(writer, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = inner.cancel.cancelled() => {
                debug!("acp writer: cancellation received, stopping");
                break;
            }

            msg = outbound_rx.recv() => {
                let Some(msg) = msg else {
                    debug!("acp writer: message channel closed, stopping");
                    break;
                };

                if let Err(e) = framed.send(msg).await {
                    warn!(error = %e, "acp writer: write to stdin failed");
                    inner
                        .report(ProcessError::new(
                            ProcessErrorKind::WriteFailed,
                            format!("write failed: {e}"),
                        ))
                        .await;
                    inner.shutdown().await;
                    break;
                }
            }
        }
    }

    // Dropping the sink closes the agent's stdin.
    let _ = framed.close().await;
}

/// Whether a stderr line should be reported rather than only logged.
#[must_use]
pub fn looks_like_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    STDERR_ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
