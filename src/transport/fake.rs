//! In-process fake transport for RpcChannel and ManagedProcess unit tests.
//!
//! A pair of unbounded channels stand in for the write and read sides of a
//! real transport, so tests can drive [`crate::rpc_channel::RpcChannel`]
//! without spawning a real child process.
//!
//! ```text
//! write_line() -----> written_tx -----> written_rx (handle reads)
//! handle inject_tx -> inbound_tx  -----> read_line() (transport reads)
//! ```

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{ProcworkError, Result};
use crate::transport::{LineStream, Transport};

/// In-process fake transport for use in tests.
#[derive(Debug)]
pub struct FakeTransport {
    written_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    closed: AtomicBool,
    exit_rx: Mutex<Option<oneshot::Receiver<ExitStatus>>>,
}

/// Test-side handle paired with a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Receives lines the code under test wrote via `write_line`.
    pub written_rx: mpsc::UnboundedReceiver<String>,
    /// Sends lines that `read_line` will yield next.
    pub inbound_tx: mpsc::UnboundedSender<String>,
    /// Completes the fake exit once sent, unblocking `wait_for_exit`.
    pub exit_tx: oneshot::Sender<ExitStatus>,
}

impl FakeTransport {
    /// Create a new `(FakeTransport, FakeTransportHandle)` pair with the
    /// given fake PID.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (written_tx, written_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = oneshot::channel();

        let transport = Self {
            written_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            closed: AtomicBool::new(false),
            exit_rx: Mutex::new(Some(exit_rx)),
        };
        let handle = FakeTransportHandle {
            written_rx,
            inbound_tx,
            exit_tx,
        };
        (transport, handle)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn spawn(&mut self) -> Result<u32> {
        Ok(4242)
    }

    async fn write_line(&self, line: String) -> Result<()> {
        if self.is_closed() {
            return Err(ProcworkError::ChannelClosed);
        }
        self.written_tx
            .send(line)
            .map_err(|_| ProcworkError::ChannelClosed)
    }

    async fn read_line(&self) -> Result<Option<String>> {
        let mut guard = self.inbound_rx.lock().await;
        Ok(guard.recv().await)
    }

    fn stderr_reader(&mut self) -> LineStream {
        Box::pin(futures::stream::empty())
    }

    fn stdout_reader(&mut self) -> Option<LineStream> {
        None
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait_for_exit(&self) -> Result<ExitStatus> {
        let rx = self.exit_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.map_err(|_| ProcworkError::ChannelClosed),
            None => Err(ProcworkError::Internal(
                "wait_for_exit called more than once on FakeTransport".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_line_delivers_to_handle() {
        let (t, mut h) = FakeTransport::new();
        t.write_line("hello".to_string()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), h.written_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "hello");
    }

    #[tokio::test]
    async fn test_read_line_yields_injected_value() {
        let (t, h) = FakeTransport::new();
        h.inbound_tx.send("world".to_string()).unwrap();
        let got = t.read_line().await.unwrap();
        assert_eq!(got, Some("world".to_string()));
    }

    #[tokio::test]
    async fn test_write_line_after_close_fails() {
        let (t, _h) = FakeTransport::new();
        t.close().await.unwrap();
        assert!(t.write_line("x".to_string()).await.is_err());
    }
}
