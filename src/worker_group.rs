//! Fan-out of N identical `ManagedProcess`es with fail-fast coordination.
//!
//! Uses the same `futures::future::join_all` concurrent fan-out pattern as
//! other per-task spawns in this crate, generalized from "run N independent
//! tasks and collect all results" to "run N peer processes and kill every
//! sibling the moment one fails."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::WorkerGroupConfig;
use crate::error::{ProcworkError, Result};
use crate::managed_process::{ManagedProcess, ProcessStatus};
use crate::transport::SpawnSpec;

/// The first worker failure observed by a `WorkerGroup`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    /// Zero-based index of the failing worker.
    pub index: usize,
    /// Human-readable rendering of the platform exit status.
    pub exit_status: String,
}

/// A thin, `Clone`-able, read-only view of one worker, for callers that
/// should observe but not control a single worker from outside
/// `WorkerGroup`.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    process: Arc<ManagedProcess>,
}

impl WorkerHandle {
    /// This worker's zero-based index within the group.
    pub fn index(&self) -> usize {
        self.index
    }

    /// This worker's `ManagedProcess`.
    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    /// This worker's PID, if spawned.
    pub async fn pid(&self) -> Option<u32> {
        self.process.pid().await
    }

    /// Signal-zero liveness probe for this worker.
    pub async fn alive(&self) -> bool {
        self.process.alive().await
    }

    /// This worker's current lifecycle state.
    pub async fn status(&self) -> ProcessStatus {
        self.process.status().await
    }
}

/// N identical `ManagedProcess`es spawned from one `WorkerGroupConfig`,
/// coordinated as a fail-fast group: the first worker to exit non-success
/// kills every other worker still alive.
///
/// `size = 0` is legal; every operation on an empty group is a no-op that
/// returns immediately.
pub struct WorkerGroup {
    workers: Vec<WorkerHandle>,
    stopping: AtomicBool,
    failure_guard: AtomicBool,
    failure_tx: watch::Sender<Option<WorkerFailure>>,
    failure_rx: watch::Receiver<Option<WorkerFailure>>,
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("size", &self.workers.len())
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl WorkerGroup {
    /// Build `config.size` unstarted `ManagedProcess`es, each tagged with
    /// its zero-based index via `WORKER_INDEX` in its environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::Internal`] if `config` fails validation.
    pub fn new(config: WorkerGroupConfig) -> Result<Self> {
        config.validate()?;
        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let spec = SpawnSpec {
                argv: config.command.clone(),
                env: config.env_for_worker(index),
                working_dir: config.working_dir.clone(),
            };
            let process = Arc::new(ManagedProcess::new(
                spec,
                config.channel,
                config.stop_timeout,
                config.health_poll_interval,
            ));
            workers.push(WorkerHandle { index, process });
        }
        let (failure_tx, failure_rx) = watch::channel(None);
        Ok(Self {
            workers,
            stopping: AtomicBool::new(false),
            failure_guard: AtomicBool::new(false),
            failure_tx,
            failure_rx,
        })
    }

    /// Number of workers in this group.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The worker at `index`, if any.
    pub fn worker(&self, index: usize) -> Option<&Arc<ManagedProcess>> {
        self.workers.get(index).map(WorkerHandle::process)
    }

    /// A `Clone`-able, read-only handle to the worker at `index`, if any.
    pub fn handle(&self, index: usize) -> Option<WorkerHandle> {
        self.workers.get(index).cloned()
    }

    /// `Clone`-able, read-only handles to every worker in the group.
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.clone()
    }

    /// Iterate over every worker's process handle.
    pub fn each<F: FnMut(&Arc<ManagedProcess>)>(&self, mut f: F) {
        for handle in &self.workers {
            f(handle.process());
        }
    }

    /// Map every worker's process handle to a value.
    pub fn map<T, F: FnMut(&Arc<ManagedProcess>) -> T>(&self, mut f: F) -> Vec<T> {
        self.workers.iter().map(|h| f(h.process())).collect()
    }

    /// Register each worker's fail-fast exit handler, then start every
    /// worker. Handlers are registered before any worker starts so an exit
    /// during start is never lost.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for handle in &self.workers {
            let group = Arc::clone(self);
            let index = handle.index;
            handle
                .process
                .on_exit(move |status| {
                    tokio::spawn(async move {
                        group.handle_worker_exit(index, status).await;
                    });
                })
                .await;
        }
        for handle in &self.workers {
            handle.process.start().await?;
            tracing::info!(
                worker.index = handle.index,
                worker.pid = handle.pid().await,
                "worker started"
            );
        }
        Ok(())
    }

    async fn handle_worker_exit(self: &Arc<Self>, index: usize, status: std::process::ExitStatus) {
        if self.stopping.load(Ordering::SeqCst) || status.success() {
            return;
        }
        if self.failure_guard.swap(true, Ordering::SeqCst) {
            return;
        }
        let failure = WorkerFailure {
            index,
            exit_status: format!("{status}"),
        };
        self.stopping.store(true, Ordering::SeqCst);
        tracing::warn!(
            worker.index = index,
            worker.pid = self.workers[index].pid().await,
            %status,
            "worker failed, killing siblings"
        );
        let _ = self.failure_tx.send(Some(failure));

        let kills = self.workers.iter().filter(|h| h.index != index).map(|h| {
            let process = Arc::clone(&h.process);
            async move {
                if process.alive().await {
                    let _ = process.kill().await;
                }
            }
        });
        join_all(kills).await;
    }

    /// Set `stopping` and stop every worker concurrently, each with budget
    /// `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!(group.size = self.workers.len(), "group stopping");
        let stops = self.workers.iter().map(|h| {
            let process = Arc::clone(&h.process);
            let index = h.index;
            async move {
                let _ = process.stop(timeout).await;
                tracing::info!(worker.index = index, "worker stopped");
            }
        });
        join_all(stops).await;
        Ok(())
    }

    /// Set `stopping` and kill every worker concurrently.
    pub async fn kill(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!(group.size = self.workers.len(), "group killing");
        let kills = self.workers.iter().map(|h| {
            let process = Arc::clone(&h.process);
            let index = h.index;
            async move {
                let _ = process.kill().await;
                tracing::info!(worker.index = index, "worker killed");
            }
        });
        join_all(kills).await;
        Ok(())
    }

    /// Block until every worker has exited, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProcworkError::Timeout`] if `timeout` elapses first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let waits = self.workers.iter().map(|h| h.process.wait(None));
        let all = join_all(waits);
        match timeout {
            Some(d) => {
                tokio::time::timeout(d, all)
                    .await
                    .map_err(|_| ProcworkError::Timeout)?;
            }
            None => {
                all.await;
            }
        }
        Ok(())
    }

    /// Block until the group-wide failure signal fires, returning the
    /// first recorded failure.
    pub async fn wait_for_failure(&self) -> WorkerFailure {
        let mut rx = self.failure_rx.clone();
        if let Some(failure) = rx.borrow().clone() {
            return failure;
        }
        loop {
            if rx.changed().await.is_err() {
                continue;
            }
            if let Some(failure) = rx.borrow().clone() {
                return failure;
            }
        }
    }

    /// True iff at least one worker is currently alive. Always false for
    /// an empty group.
    pub async fn alive(&self) -> bool {
        for handle in &self.workers {
            if handle.process().alive().await {
                return true;
            }
        }
        false
    }

    /// True once a failure has been recorded.
    pub fn failed(&self) -> bool {
        self.failure_rx.borrow().is_some()
    }

    /// The first recorded failure, if any.
    pub fn failure(&self) -> Option<WorkerFailure> {
        self.failure_rx.borrow().clone()
    }
}

impl std::ops::Index<usize> for WorkerGroup {
    type Output = Arc<ManagedProcess>;

    fn index(&self, index: usize) -> &Self::Output {
        self.workers[index].process()
    }
}
