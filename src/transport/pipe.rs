//! Pipe-based transport: `stdio-rpc` and `no-rpc` modes.
//!
//! Three `Stdio::piped()` handles, a background writer task draining an
//! `mpsc::unbounded_channel` into the child's stdin, and two background
//! reader tasks draining stdout/stderr line-by-line into their own
//! channels.
//!
//! # Mode difference
//!
//! - `stdio-rpc`: stdin stays open for RPC writes; stdout is consumed
//!   internally by `read_line` (RPC reads) and is *not* exposed via
//!   `stdout_reader`.
//! - `no-rpc`: stdin is closed immediately after spawn, since a worker with
//!   no RPC channel has no way to consume further input on it; stdout is
//!   exposed via `stdout_reader` as a second log stream alongside stderr.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

use crate::error::{ProcworkError, Result};
use crate::transport::{LineStream, SpawnSpec, Transport};

/// Whether the pipe transport's stdin/stdout are dedicated to RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    /// stdin/stdout carry RPC; stderr is log-only.
    StdioRpc,
    /// stdin is closed after spawn; stdout and stderr are both log-only.
    NoRpc,
}

/// Pipe-based transport driving one child process over stdin/stdout/stderr.
#[derive(Debug)]
pub struct PipeTransport {
    spec: SpawnSpec,
    mode: PipeMode,
    pid: AtomicU32,
    closed: AtomicBool,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rpc_read_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    stdout_log_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    stderr_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    child: Mutex<Option<Child>>,
}

impl PipeTransport {
    /// Construct an unspawned transport. Call [`Transport::spawn`] before
    /// using it.
    pub fn new(spec: SpawnSpec, mode: PipeMode) -> Self {
        Self {
            spec,
            mode,
            pid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            stdin_tx: Mutex::new(None),
            rpc_read_rx: Mutex::new(None),
            stdout_log_rx: Mutex::new(None),
            stderr_rx: Mutex::new(None),
            child: Mutex::new(None),
        }
    }
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn stream_from_shared(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) -> LineStream {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let mut guard = rx.lock().await;
        let item = guard.recv().await?;
        drop(guard);
        Some((item, rx))
    }))
}

#[async_trait::async_trait]
impl Transport for PipeTransport {
    async fn spawn(&mut self) -> Result<u32> {
        let mut cmd = self.spec.to_command();
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcworkError::Spawn(format!("{}", e)))?;

        let pid = child.id().ok_or_else(|| {
            ProcworkError::Spawn("child exited before PID could be observed".to_string())
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcworkError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcworkError::Spawn("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcworkError::Spawn("child stderr unavailable".to_string()))?;

        self.stderr_rx
            .lock()
            .await
            .replace(Arc::new(Mutex::new(spawn_line_reader(stderr))));

        match self.mode {
            PipeMode::StdioRpc => {
                let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(async move {
                    let mut stdin = stdin;
                    while let Some(msg) = stdin_rx.recv().await {
                        let line = format!("{}\n", msg);
                        if stdin.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
                self.stdin_tx.lock().await.replace(stdin_tx);
                self.rpc_read_rx
                    .lock()
                    .await
                    .replace(Arc::new(Mutex::new(spawn_line_reader(stdout))));
            }
            PipeMode::NoRpc => {
                // Close stdin immediately to signal "no input coming".
                drop(stdin);
                self.stdout_log_rx
                    .lock()
                    .await
                    .replace(Arc::new(Mutex::new(spawn_line_reader(stdout))));
            }
        }

        self.pid.store(pid, Ordering::SeqCst);
        self.child.lock().await.replace(child);
        Ok(pid)
    }

    async fn write_line(&self, line: String) -> Result<()> {
        if self.is_closed() {
            return Err(ProcworkError::ChannelClosed);
        }
        let guard = self.stdin_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| ProcworkError::ChannelClosed),
            None => Err(ProcworkError::ChannelClosed),
        }
    }

    async fn read_line(&self) -> Result<Option<String>> {
        let rx = {
            let guard = self.rpc_read_rx.lock().await;
            guard.as_ref().cloned()
        };
        match rx {
            Some(rx) => {
                let mut guard = rx.lock().await;
                Ok(guard.recv().await)
            }
            None => Err(ProcworkError::ChannelClosed),
        }
    }

    fn stderr_reader(&mut self) -> LineStream {
        let rx = self
            .stderr_rx
            .get_mut()
            .clone()
            .expect("stderr_reader called before spawn");
        stream_from_shared(rx)
    }

    fn stdout_reader(&mut self) -> Option<LineStream> {
        self.stdout_log_rx
            .get_mut()
            .clone()
            .map(stream_from_shared)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stdin_tx.lock().await.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            None
        } else {
            Some(pid)
        }
    }

    async fn wait_for_exit(&self) -> Result<ExitStatus> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => Ok(child.wait().await?),
            None => Err(ProcworkError::Internal(
                "wait_for_exit called before spawn".to_string(),
            )),
        }
    }
}
