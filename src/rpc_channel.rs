//! Frames JSON lines over a [`Transport`], correlates requests to
//! responses, and routes un-correlated inbound messages to a notification
//! stream.
//!
//! A JSON-RPC-2.0-shaped client would correlate by integer id and dispatch
//! on `method`/`result`/`error`; this channel instead correlates by
//! `id`/`reply_to` and treats anything without `reply_to` as a
//! notification, with a single reader task as the sole mutator of the
//! pending-request map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{ProcworkError, Result};
use crate::message::Message;
use crate::output_stream::OutputStream;
use crate::transport::Transport;

type PendingMap = HashMap<String, oneshot::Sender<Option<Message>>>;

/// Value of the reserved `action` payload key that requests graceful
/// shutdown.
pub const SHUTDOWN_ACTION: &str = "__shutdown__";

/// Frames JSON lines over one [`Transport`] and correlates requests to
/// responses by `id`/`reply_to`.
///
/// Holds a non-owning reference to its `Transport`: closing the channel
/// does not close the transport (the owning [`crate::managed_process::ManagedProcess`]
/// closes both, in order).
pub struct RpcChannel {
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingMap>>,
    notifications: Arc<OutputStream<Message>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    cancellation: CancellationToken,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    malformed_line_count: Arc<AtomicU64>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field(
                "closed",
                &self.closed.load(std::sync::atomic::Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl RpcChannel {
    /// Construct a channel over `transport`. Call [`RpcChannel::start`] to
    /// launch the reader task before issuing requests.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications: Arc::new(OutputStream::new()),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            cancellation: CancellationToken::new(),
            reader_handle: Mutex::new(None),
            malformed_line_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An `OutputStream` of inbound messages without `reply_to`
    /// (child-to-parent notifications).
    pub fn notifications(&self) -> Arc<OutputStream<Message>> {
        Arc::clone(&self.notifications)
    }

    /// Convenience forwarding to `notifications().on_data`.
    pub async fn on_notification<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.notifications.on_data(callback).await;
    }

    /// Count of inbound lines that failed to parse as JSON, logged and
    /// swallowed rather than crashing the reader loop.
    pub fn malformed_line_count(&self) -> u64 {
        self.malformed_line_count.load(Ordering::SeqCst)
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Launch the reader task, which owns the single ingress path for
    /// inbound lines: it parses, routes, and closes the channel on
    /// end-of-stream or I/O error. The reader is the single authority over
    /// `pending`, so correlation state is mutated under one lock and
    /// requests never race with it on the same entry.
    pub fn start(self: &Arc<Self>) {
        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = channel.cancellation.cancelled() => break,
                    line = channel.transport.read_line() => {
                        match line {
                            Ok(Some(raw)) => channel.dispatch_line(&raw).await,
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }
            channel.close().await;
        });
        // `start` may be called more than once only by programmer error;
        // replacing any prior handle here would orphan it, so this is a
        // single-shot launch in practice.
        if let Ok(mut guard) = self.reader_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn dispatch_line(&self, raw: &str) {
        let message = match Message::parse_line(raw) {
            Ok(m) => m,
            Err(e) => {
                self.malformed_line_count.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("RpcChannel: failed to parse inbound line: {e}");
                return;
            }
        };

        match message.reply_to() {
            Some(reply_to) => {
                let tx = {
                    let mut pending = self.pending.lock().await;
                    pending.remove(reply_to)
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Some(message));
                    }
                    None => {
                        tracing::debug!(
                            "RpcChannel: response for unknown request id {reply_to}; dropping"
                        );
                    }
                }
            }
            None => {
                self.notifications.emit(message).await;
            }
        }
    }

    /// Send a request and block until the correlated response arrives, the
    /// channel closes, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::ChannelClosed`] if the channel is already
    /// closed or closes before a response arrives. Returns
    /// [`ProcworkError::Timeout`] if `timeout` elapses first, in which case
    /// the pending-request entry is removed before returning.
    pub async fn request(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        if self.is_closed() {
            return Err(ProcworkError::ChannelClosed);
        }

        let message = Message::new_request(payload);
        let id = message
            .id()
            .expect("Message::new_request always assigns an id")
            .to_string();

        // Register before sending so the response can never arrive before
        // we are ready to receive it.
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let line = message.to_line()?;
        if let Err(e) = self.transport.write_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Some(response))) => Ok(response.into_value()),
            Ok(Ok(None)) => Err(ProcworkError::ChannelClosed),
            Ok(Err(_)) => Err(ProcworkError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProcworkError::Timeout)
            }
        }
    }

    /// Send a fire-and-forget notification. Any `id`/`reply_to` keys the
    /// caller supplied in `payload` are stripped so the frame is
    /// unambiguously a notification.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::ChannelClosed`] if the channel is closed.
    pub async fn notify(&self, payload: Value) -> Result<()> {
        if self.is_closed() {
            return Err(ProcworkError::ChannelClosed);
        }
        let message = Message::new_notification(payload);
        let line = message.to_line()?;
        self.transport.write_line(line).await
    }

    /// Send `{"action": "__shutdown__"}` and await its response (or time
    /// out returning `None`). Does not itself close the channel or the
    /// process; the caller (`ManagedProcess::stop`) decides what happens
    /// next.
    pub async fn shutdown(&self, timeout: Duration) -> Option<Value> {
        self.request(
            serde_json::json!({"action": SHUTDOWN_ACTION}),
            Some(timeout),
        )
        .await
        .ok()
    }

    /// Idempotent close: signals every outstanding pending request with a
    /// `None` response, closes the notifications stream, and cancels the
    /// reader task. Does not close the transport.
    pub async fn close(&self) {
        if self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.cancellation.cancel();
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(None);
        }
        self.notifications.close().await;
    }
}
