//! procwork - a process-based parallel work coordinator
//!
//! Spawns N long-lived child worker processes, exchanges JSON-line RPC
//! messages with each, streams their stdout/stderr asynchronously, monitors
//! their health, and coordinates them as a fail-fast group.
//!
//! # Architecture
//!
//! The crate is a five-layer stack, composed leaves-first:
//!
//! - `transport`: raw line I/O to one child (pipe-based or socket-pair-based)
//! - `output_stream`: multi-subscriber broadcast primitive
//! - `message`: the `id`/`reply_to` RPC envelope
//! - `rpc_channel`: JSON-line framing, request/response correlation, notifications
//! - `managed_process`: one child's lifecycle state machine
//! - `worker_group`: fan-out of N identical processes with fail-fast coordination
//! - `config`: channel mode selection and group configuration
//! - `error`: error types and result alias
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use procwork::config::{ChannelConfig, WorkerGroupConfig};
//! use procwork::worker_group::WorkerGroup;
//!
//! # #[tokio::main]
//! # async fn main() -> procwork::error::Result<()> {
//! let config = WorkerGroupConfig::new(3, vec!["my-worker".into()], ChannelConfig::Stdio)?;
//! let group = Arc::new(WorkerGroup::new(config)?);
//! group.start().await?;
//! group.stop(std::time::Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod managed_process;
pub mod message;
pub mod output_stream;
pub mod rpc_channel;
pub mod transport;
pub mod worker_group;

pub use config::{ChannelConfig, WorkerGroupConfig};
pub use error::{ProcworkError, Result};
pub use managed_process::{ManagedProcess, ProcessStatus};
pub use message::{Message, MessageKind};
pub use output_stream::OutputStream;
pub use rpc_channel::RpcChannel;
pub use worker_group::{WorkerFailure, WorkerGroup, WorkerHandle};
