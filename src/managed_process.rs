//! One child process: its transport, optional RPC channel, log streams, and
//! lifecycle state machine.
//!
//! Builds on the pipe transport's background reader tasks and
//! `libc::kill`-based signal delivery, generalized from "one fixed
//! transport with a SIGTERM-only `Drop`" into an explicit
//! `pending -> running -> stopping -> exited` state machine with a
//! three-phase graceful-then-forceful `stop`.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};

use crate::config::ChannelConfig;
use crate::error::{ProcworkError, Result};
use crate::output_stream::OutputStream;
use crate::rpc_channel::RpcChannel;
use crate::transport::pipe::{PipeMode, PipeTransport};
use crate::transport::socket::SocketTransport;
use crate::transport::{LineStream, SpawnSpec, Transport};

/// Where a `ManagedProcess` sits in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Constructed, not yet started.
    Pending,
    /// Spawned and believed alive.
    Running,
    /// `stop` or `kill` has been invoked; exit is pending.
    Stopping,
    /// The OS has reaped the child. Terminal.
    Exited,
}

struct ExitState {
    status: Option<ExitStatus>,
    callbacks: Vec<Box<dyn FnOnce(ExitStatus) + Send>>,
}

/// One child process, its transport, its optional RPC channel, and its
/// stderr/stdout log streams.
///
/// Owns its `Transport` and `RpcChannel` (if any) exclusively. Most
/// operations take `&self` because a `WorkerGroup` holds every
/// `ManagedProcess` behind a shared `Arc`.
pub struct ManagedProcess {
    spec: SpawnSpec,
    channel_config: ChannelConfig,
    stop_timeout: Duration,
    health_poll_interval: Duration,
    status: Mutex<ProcessStatus>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    rpc: Mutex<Option<Arc<RpcChannel>>>,
    stderr: Arc<OutputStream<String>>,
    stdout: Arc<OutputStream<String>>,
    exit: Mutex<ExitState>,
    exit_guard: AtomicBool,
    exit_watch_tx: watch::Sender<Option<ExitStatus>>,
    exit_watch_rx: watch::Receiver<Option<ExitStatus>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("channel_config", &self.channel_config)
            .finish_non_exhaustive()
    }
}

impl ManagedProcess {
    /// Construct an unstarted process. `request_timeout` is not stored here;
    /// it is only meaningful to the RPC channel's caller, who passes it
    /// explicitly to `rpc_channel().request`.
    pub fn new(
        spec: SpawnSpec,
        channel_config: ChannelConfig,
        stop_timeout: Duration,
        health_poll_interval: Duration,
    ) -> Self {
        let (exit_watch_tx, exit_watch_rx) = watch::channel(None);
        Self {
            spec,
            channel_config,
            stop_timeout,
            health_poll_interval,
            status: Mutex::new(ProcessStatus::Pending),
            transport: Mutex::new(None),
            rpc: Mutex::new(None),
            stderr: Arc::new(OutputStream::new()),
            stdout: Arc::new(OutputStream::new()),
            exit: Mutex::new(ExitState {
                status: None,
                callbacks: Vec::new(),
            }),
            exit_guard: AtomicBool::new(false),
            exit_watch_tx,
            exit_watch_rx,
        }
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> ProcessStatus {
        *self.status.lock().await
    }

    /// Diagnostic log lines from the child's stderr. Always populated.
    pub fn stderr(&self) -> Arc<OutputStream<String>> {
        Arc::clone(&self.stderr)
    }

    /// Log lines from the child's stdout, populated in every mode except
    /// `stdio-rpc` (where stdout carries the RPC wire).
    pub fn stdout(&self) -> Arc<OutputStream<String>> {
        Arc::clone(&self.stdout)
    }

    /// The RPC channel, if this process's `ChannelConfig` enables one.
    pub async fn rpc_channel(&self) -> Option<Arc<RpcChannel>> {
        self.rpc.lock().await.clone()
    }

    /// The child's PID, if spawned.
    pub async fn pid(&self) -> Option<u32> {
        match self.transport.lock().await.as_ref() {
            Some(t) => t.pid(),
            None => None,
        }
    }

    /// Spawn the child and launch its background tasks. May only be called
    /// from `ProcessStatus::Pending`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let status = self.status.lock().await;
            if *status != ProcessStatus::Pending {
                return Err(ProcworkError::Internal(
                    "ManagedProcess::start called outside the pending state".to_string(),
                ));
            }
        }

        let mut transport: Box<dyn Transport> = match self.channel_config {
            ChannelConfig::Stdio => {
                Box::new(PipeTransport::new(self.spec.clone(), PipeMode::StdioRpc))
            }
            ChannelConfig::Disabled => {
                Box::new(PipeTransport::new(self.spec.clone(), PipeMode::NoRpc))
            }
            ChannelConfig::Socket => Box::new(SocketTransport::new(self.spec.clone())),
        };
        transport.spawn().await?;

        let stdout_lines = transport.stdout_reader();
        let stderr_lines = transport.stderr_reader();

        let transport: Arc<dyn Transport> = Arc::from(transport);
        self.transport.lock().await.replace(Arc::clone(&transport));

        if self.channel_config.rpc_enabled() {
            let rpc = Arc::new(RpcChannel::new(Arc::clone(&transport)));
            rpc.start();
            self.rpc.lock().await.replace(rpc);
        }

        spawn_log_forwarder(Arc::clone(&self.stderr), stderr_lines);
        if let Some(stdout_lines) = stdout_lines {
            spawn_log_forwarder(Arc::clone(&self.stdout), stdout_lines);
        }

        *self.status.lock().await = ProcessStatus::Running;
        tracing::info!(worker.pid = self.pid().await, "process running");
        self.spawn_health_monitor();
        Ok(())
    }

    fn spawn_health_monitor(self: &Arc<Self>) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(process.health_poll_interval).await;
                if process.exit_guard.load(Ordering::SeqCst) {
                    break;
                }
                if !process.alive().await {
                    let transport = process.transport.lock().await.clone();
                    if let Some(transport) = transport {
                        match transport.wait_for_exit().await {
                            Ok(status) => process.run_exit_routine(status).await,
                            Err(e) => {
                                tracing::warn!("health monitor: wait_for_exit failed: {e}");
                            }
                        }
                    }
                    break;
                }
            }
        });
    }

    async fn run_exit_routine(self: &Arc<Self>, status: ExitStatus) {
        if self.exit_guard.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.pid().await;
        if let Some(rpc) = self.rpc.lock().await.take() {
            rpc.close().await;
        }
        if let Some(transport) = self.transport.lock().await.clone() {
            let _ = transport.close().await;
        }
        *self.status.lock().await = ProcessStatus::Exited;
        tracing::info!(worker.pid = pid, %status, "process exited");

        let callbacks = {
            let mut guard = self.exit.lock().await;
            guard.status = Some(status);
            std::mem::take(&mut guard.callbacks)
        };
        let _ = self.exit_watch_tx.send(Some(status));

        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(status)));
            if result.is_err() {
                tracing::error!("ManagedProcess exit callback panicked");
            }
        }
    }

    /// Register a callback invoked exactly once when this process enters
    /// `Exited`. If it has already exited, the callback runs immediately.
    pub async fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        let mut guard = self.exit.lock().await;
        match guard.status {
            Some(status) => {
                drop(guard);
                callback(status);
            }
            None => guard.callbacks.push(Box::new(callback)),
        }
    }

    /// Signal-zero liveness probe: true iff the OS reports `pid` as a
    /// running process owned by this user.
    pub async fn alive(&self) -> bool {
        match self.pid().await {
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
            None => false,
        }
    }

    /// Best-effort signal delivery. "No such process" is swallowed; the
    /// process may already have exited.
    pub async fn send_signal(&self, sig: i32) -> Result<()> {
        let pid = match self.pid().await {
            Some(pid) => pid,
            None => return Ok(()),
        };
        // SAFETY: `kill` with a plain integer signal and no side effects
        // beyond delivering it is always safe to call.
        let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!("send_signal({sig}) to pid {pid} failed: {err}");
            }
        }
        Ok(())
    }

    /// Block until `Exited`, or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::Timeout`] if `timeout` elapses first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ExitStatus> {
        let mut rx = self.exit_watch_rx.clone();
        if let Some(status) = *rx.borrow() {
            return Ok(status);
        }
        let wait_fut = async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(ProcworkError::ChannelClosed);
                }
                if let Some(status) = *rx.borrow() {
                    return Ok(status);
                }
            }
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, wait_fut)
                .await
                .map_err(|_| ProcworkError::Timeout)?,
            None => wait_fut.await,
        }
    }

    /// Graceful-then-forceful shutdown, budgeted by `timeout`: up to
    /// `timeout/2` for the RPC shutdown handshake and the exit it should
    /// cause, then up to `timeout/2` for SIGTERM, then unconditional
    /// SIGKILL. Returns as soon as any phase observes exit.
    pub async fn stop(&self, timeout: Duration) -> Result<ExitStatus> {
        {
            let mut status = self.status.lock().await;
            match *status {
                ProcessStatus::Pending => {
                    return Err(ProcworkError::Internal(
                        "ManagedProcess::stop called before start".to_string(),
                    ));
                }
                ProcessStatus::Exited => return self.wait(None).await,
                _ => *status = ProcessStatus::Stopping,
            }
        }
        tracing::info!(worker.pid = self.pid().await, "process stopping");

        let half = timeout / 2;

        let rpc = self.rpc.lock().await.clone();
        if let Some(rpc) = rpc {
            if !rpc.is_closed() {
                let phase = tokio::time::timeout(half, async {
                    rpc.shutdown(half).await;
                    self.wait(None).await
                })
                .await;
                if let Ok(Ok(status)) = phase {
                    return Ok(status);
                }
            }
        }

        if self.alive().await {
            self.send_signal(libc::SIGTERM).await?;
            if let Ok(status) = self.wait(Some(half)).await {
                return Ok(status);
            }
        }

        if self.alive().await {
            self.send_signal(libc::SIGKILL).await?;
        }
        self.wait(None).await
    }

    /// Immediate SIGKILL, then block for exit.
    pub async fn kill(&self) -> Result<ExitStatus> {
        {
            let mut status = self.status.lock().await;
            if *status == ProcessStatus::Pending {
                return Err(ProcworkError::Internal(
                    "ManagedProcess::kill called before start".to_string(),
                ));
            }
            if *status != ProcessStatus::Exited {
                *status = ProcessStatus::Stopping;
            }
        }
        tracing::info!(worker.pid = self.pid().await, "process killing");
        self.send_signal(libc::SIGKILL).await?;
        self.wait(None).await
    }
}

fn spawn_log_forwarder(stream: Arc<OutputStream<String>>, mut lines: LineStream) {
    tokio::spawn(async move {
        while let Some(line) = lines.next().await {
            stream.emit(line).await;
        }
        stream.close().await;
    });
}
