//! Configuration surface for procwork
//!
//! `ChannelConfig` selects how RPC is carried between a parent process and
//! one child worker; `WorkerGroupConfig` bundles everything a `WorkerGroup`
//! needs to spawn `size` identical children.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcworkError, Result};

/// Default budget for `WorkerGroup::stop` / `ManagedProcess::stop`.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling period for the health-monitor task. Not a heartbeat --
/// it only bounds exit-detection latency.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-request timeout applied when a caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable exporting the inherited RPC socket descriptor to
/// the child in `socket-rpc` mode.
pub const RPC_SOCKET_FD_VAR: &str = "RPC_SOCKET_FD";

/// Environment variable exporting the zero-based worker index to every
/// child spawned by a `WorkerGroup`.
pub const WORKER_INDEX_VAR: &str = "WORKER_INDEX";

/// Selects one of the three RPC transport modes for a child process.
///
/// - `Stdio`: RPC is carried over the child's stdin/stdout; stderr is
///   log-only; stdout is not independently observable as a log.
/// - `Socket`: RPC is carried over an inherited Unix socket-pair fd; both
///   stdout and stderr are observable as logs.
/// - `Disabled`: no RPC channel is constructed; both stdout and stderr are
///   observable as logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelConfig {
    /// `stdio-rpc` mode.
    Stdio,
    /// `socket-rpc` mode.
    Socket,
    /// `no-rpc` mode.
    Disabled,
}

impl ChannelConfig {
    /// True unless this is `Disabled`.
    pub fn rpc_enabled(self) -> bool {
        !matches!(self, ChannelConfig::Disabled)
    }

    /// True iff this is `Stdio`.
    pub fn is_stdio(self) -> bool {
        matches!(self, ChannelConfig::Stdio)
    }

    /// True iff this is `Socket`.
    pub fn is_socket(self) -> bool {
        matches!(self, ChannelConfig::Socket)
    }

    /// True iff the child's stdout is observable as a log stream under
    /// this mode (false only for `Stdio`, which consumes stdout for RPC).
    pub fn stdout_is_log(self) -> bool {
        !matches!(self, ChannelConfig::Stdio)
    }
}

/// Bundled configuration for a `WorkerGroup` of `size` identical children.
#[derive(Debug, Clone)]
pub struct WorkerGroupConfig {
    /// Number of workers to spawn.
    pub size: usize,
    /// Command argv; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Base environment applied to every child, before `WORKER_INDEX` (and,
    /// in `socket-rpc` mode, `RPC_SOCKET_FD`) are injected.
    pub env: HashMap<String, String>,
    /// Optional working directory for every child.
    pub working_dir: Option<PathBuf>,
    /// RPC transport mode shared by every child in the group.
    pub channel: ChannelConfig,
    /// Budget passed to `ManagedProcess::stop` / `WorkerGroup::stop`.
    pub stop_timeout: Duration,
    /// Health-monitor poll period.
    pub health_poll_interval: Duration,
    /// Default per-request timeout for `RpcChannel::request`.
    pub request_timeout: Duration,
}

impl WorkerGroupConfig {
    /// Build a config with default timers and an empty base environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::Internal`] if `command` is empty.
    pub fn new(
        size: usize,
        command: Vec<String>,
        channel: ChannelConfig,
    ) -> Result<Self> {
        let config = Self {
            size,
            command,
            env: HashMap::new(),
            working_dir: None,
            channel,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate internal invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::Internal`] if `command` is empty. `size ==
    /// 0` is explicitly legal: every operation on an empty group is a
    /// no-op.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(ProcworkError::Internal(
                "WorkerGroupConfig::command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Environment for worker `index`: base env plus `WORKER_INDEX`.
    /// `RPC_SOCKET_FD` is injected separately by the socket transport once
    /// the socket pair exists.
    pub fn env_for_worker(&self, index: usize) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.insert(WORKER_INDEX_VAR.to_string(), index.to_string());
        env
    }
}
