//! Socket-pair-based transport: `socket-rpc` mode.
//!
//! Before spawning, a connected bidirectional Unix socket-pair is created
//! atomically via `libc::socketpair`. The parent retains one end; the
//! child inherits the other with its numeric descriptor exported as
//! `RPC_SOCKET_FD` in its environment. The child's copy of the parent's end
//! is closed in a `pre_exec` hook (runs post-fork, pre-exec, so it only
//! affects the child); the parent's copy of the child's end is closed
//! after spawn. RPC reads and writes use the parent end, full-duplex on
//! one descriptor. stdout and stderr remain ordinary piped log streams.

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

use crate::config::RPC_SOCKET_FD_VAR;
use crate::error::{ProcworkError, Result};
use crate::transport::{LineStream, SpawnSpec, Transport};

/// Create a connected `SOCK_STREAM` pair. Returns `(parent_fd, child_fd)`.
fn create_socket_pair() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid 2-element array; socketpair populates both
    // slots or returns -1 without touching `fds`.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(ProcworkError::Spawn(format!(
            "socketpair() failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((fds[0], fds[1]))
}

/// Socket-pair transport driving one child process over an inherited fd.
#[derive(Debug)]
pub struct SocketTransport {
    spec: SpawnSpec,
    pid: AtomicU32,
    closed: AtomicBool,
    write_half: Mutex<Option<WriteHalf<UnixStream>>>,
    rpc_read_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    stdout_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    stderr_rx: Mutex<Option<Arc<Mutex<mpsc::UnboundedReceiver<String>>>>>,
    child: Mutex<Option<Child>>,
}

impl SocketTransport {
    /// Construct an unspawned transport. Call [`Transport::spawn`] before
    /// using it.
    pub fn new(spec: SpawnSpec) -> Self {
        Self {
            spec,
            pid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            write_half: Mutex::new(None),
            rpc_read_rx: Mutex::new(None),
            stdout_rx: Mutex::new(None),
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

fn spawn_rpc_reader(read_half: ReadHalf<UnixStream>) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn stream_from_shared(rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>) -> LineStream {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let mut guard = rx.lock().await;
        let item = guard.recv().await?;
        drop(guard);
        Some((item, rx))
    }))
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    async fn spawn(&mut self) -> Result<u32> {
        let (parent_fd, child_fd) = create_socket_pair()?;

        let mut cmd = self.spec.to_command();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env(RPC_SOCKET_FD_VAR, child_fd.to_string());

        // SAFETY: `pre_exec` runs in the forked child before exec; it must
        // only perform async-signal-safe operations. Closing our copy of
        // the parent's end of the socket pair satisfies that.
        unsafe {
            cmd.pre_exec(move || {
                libc::close(parent_fd);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcworkError::Spawn(format!("{}", e)))?;

        // The parent no longer needs its copy of the child's end.
        // SAFETY: `child_fd` was obtained from `socketpair` above and has
        // not been closed yet.
        unsafe {
            libc::close(child_fd);
        }

        let pid = child.id().ok_or_else(|| {
            ProcworkError::Spawn("child exited before PID could be observed".to_string())
        })?;

        let std_socket = unsafe { std::os::unix::net::UnixStream::from_raw_fd(parent_fd) };
        std_socket.set_nonblocking(true)?;
        let socket = UnixStream::from_std(std_socket)?;
        let (read_half, write_half) = split(socket);

        self.write_half.lock().await.replace(write_half);
        self.rpc_read_rx
            .lock()
            .await
            .replace(Arc::new(Mutex::new(spawn_rpc_reader(read_half))));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcworkError::Spawn("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcworkError::Spawn("child stderr unavailable".to_string()))?;
        self.stdout_rx
            .lock()
            .await
            .replace(Arc::new(Mutex::new(spawn_line_reader(stdout))));
        self.stderr_rx
            .lock()
            .await
            .replace(Arc::new(Mutex::new(spawn_line_reader(stderr))));

        self.pid.store(pid, Ordering::SeqCst);
        self.child.lock().await.replace(child);
        Ok(pid)
    }

    async fn write_line(&self, line: String) -> Result<()> {
        if self.is_closed() {
            return Err(ProcworkError::ChannelClosed);
        }
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(w) => {
                let framed = format!("{}\n", line);
                w.write_all(framed.as_bytes())
                    .await
                    .map_err(|_| ProcworkError::ChannelClosed)?;
                w.flush().await.map_err(|_| ProcworkError::ChannelClosed)
            }
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
        self.stdout_rx.get_mut().clone().map(stream_from_shared)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.write_half.lock().await;
        if let Some(mut w) = guard.take() {
            let _ = w.shutdown().await;
        }
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

// Quiet an unused-import warning on platforms where AsRawFd isn't otherwise
// exercised directly (kept for documentation of the fd relationship above).
#[allow(dead_code)]
fn _assert_as_raw_fd<T: AsRawFd>(_: &T) {}
