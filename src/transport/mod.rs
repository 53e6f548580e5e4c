//! Transport abstraction and implementations
//!
//! A [`Transport`] spawns one child process and moves newline-delimited
//! text to and from it; it is ignorant of JSON framing or request/response
//! correlation (that's [`crate::rpc_channel::RpcChannel`]'s job). Two
//! variants exist:
//!
//! - [`pipe::PipeTransport`] -- three OS pipes (stdin/stdout/stderr). Used
//!   for both `stdio-rpc` (stdout carries RPC, stderr is log-only) and
//!   `no-rpc` (both are log-only, stdin is closed).
//! - [`socket::SocketTransport`] -- a full-duplex Unix socket-pair inherited
//!   by the child via a numeric fd exported in its environment. Used for
//!   `socket-rpc`; stdout and stderr are both log-only.
//!
//! # Canonical Import Path
//!
//! ```no_run
//! use procwork::transport::Transport;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitStatus;

use futures::Stream;

use crate::error::Result;

/// A stream of log lines produced by a child's stdout or stderr.
pub type LineStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Abstraction over the two transport variants.
///
/// All methods are `async` (or return a pinned [`Stream`]) so that
/// implementations can drive I/O without blocking the Tokio executor.
/// `write_line`/`read_line` are undefined before `spawn` and after `close`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Spawn the child process, wiring up whatever descriptors this
    /// variant needs. Returns the child's PID.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ProcworkError::Spawn`] if the executable
    /// cannot be spawned or required descriptors are unavailable.
    async fn spawn(&mut self) -> Result<u32>;

    /// Write one line to the RPC write side, appending a newline and
    /// flushing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ProcworkError::ChannelClosed`] if the
    /// transport is closed.
    async fn write_line(&self, line: String) -> Result<()>;

    /// Read the next newline-terminated line from the RPC read side, with
    /// the terminator stripped. Returns `Ok(None)` at end-of-stream (the
    /// peer closed its write end).
    async fn read_line(&self) -> Result<Option<String>>;

    /// A stream of diagnostic lines from the child's stderr. Always
    /// available, regardless of RPC mode.
    fn stderr_reader(&mut self) -> LineStream;

    /// A stream of lines from the child's stdout, if this mode exposes
    /// stdout as a log (i.e. RPC is not using it). `None` in `stdio-rpc`
    /// mode, where stdout carries the RPC wire.
    fn stdout_reader(&mut self) -> Option<LineStream>;

    /// Idempotent close of all owned descriptors. Safe to call twice.
    async fn close(&self) -> Result<()>;

    /// True once `close` has run (or the transport was never spawned).
    fn is_closed(&self) -> bool;

    /// The child's PID, valid after `spawn` and until the transport is
    /// dropped.
    fn pid(&self) -> Option<u32>;

    /// Block until the OS reaps the child, returning its exit status. Safe
    /// to call after `close`.
    async fn wait_for_exit(&self) -> Result<ExitStatus>;
}

/// Parameters common to both transport variants, used to build a `Command`.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Command argv; `argv[0]` is the executable.
    pub argv: Vec<String>,
    /// Environment variables for the child. The parent environment is
    /// cleared before these are applied (`cmd.env_clear().envs(&env)`), so
    /// a worker's environment is exactly `env`, nothing inherited.
    pub env: HashMap<String, String>,
    /// Optional working directory.
    pub working_dir: Option<PathBuf>,
}

impl SpawnSpec {
    /// Build a `tokio::process::Command` from this spec. Panics (via
    /// `expect`) only if `argv` is empty, which `WorkerGroupConfig::validate`
    /// already rules out before a `SpawnSpec` is constructed.
    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let (exe, args) = self
            .argv
            .split_first()
            .expect("SpawnSpec::argv must not be empty");
        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(args);
        cmd.env_clear().envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

pub mod pipe;
pub mod socket;

#[cfg(test)]
pub mod fake;
