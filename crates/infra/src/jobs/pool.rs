//! Worker pool: owns the worker tasks and the retry sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use queuectl_core::QueueError;

use super::runner::CommandRunner;
use super::store::{JobStore, StoreError};
use super::worker::{wait_or_stop, Worker, WorkerId, WorkerReport, WorkerSettings};

/// Error surfaced by `stop_workers()`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{id} stopped on a store failure: {source}")]
    Store {
        id: WorkerId,
        #[source]
        source: StoreError,
    },
    #[error("{0} panicked")]
    Panicked(WorkerId),
}

impl From<PoolError> for QueueError {
    fn from(err: PoolError) -> Self {
        QueueError::WorkerFailed(err.to_string())
    }
}

/// Summary of a `stop_workers()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StopSummary {
    /// Workers that were joined.
    pub workers: usize,
    /// Counters summed over workers that stopped cleanly.
    pub jobs: WorkerReport,
}

type WorkerTask = JoinHandle<Result<WorkerReport, StoreError>>;

struct Registry {
    shutdown: watch::Sender<bool>,
    next_id: u64,
    workers: BTreeMap<WorkerId, WorkerTask>,
    sweeper: Option<JoinHandle<()>>,
}

/// Set of workers sharing one store.
///
/// Workers are tokio tasks; they must be started from within a runtime.
pub struct WorkerPool<S: JobStore + ?Sized + 'static> {
    store: Arc<S>,
    runner: CommandRunner,
    settings: WorkerSettings,
    registry: Mutex<Registry>,
}

impl<S: JobStore + ?Sized + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>, settings: WorkerSettings) -> Self {
        Self::with_runner(store, CommandRunner::new(), settings)
    }

    pub fn with_runner(store: Arc<S>, runner: CommandRunner, settings: WorkerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            runner,
            settings,
            registry: Mutex::new(Registry {
                shutdown,
                next_id: 1,
                workers: BTreeMap::new(),
                sweeper: None,
            }),
        }
    }

    /// Spawn `count` more workers, plus the retry sweeper if it is not running.
    pub async fn start_workers(&self, count: usize) -> Vec<WorkerId> {
        let mut registry = self.registry.lock().await;
        let mut started = Vec::with_capacity(count);

        for _ in 0..count {
            let id = WorkerId(registry.next_id);
            registry.next_id += 1;

            let worker = Worker::new(
                id,
                self.store.clone(),
                self.runner.clone(),
                self.settings.clone(),
            );
            let handle = tokio::spawn(worker.run(registry.shutdown.subscribe()));
            registry.workers.insert(id, handle);
            started.push(id);
        }

        if registry.sweeper.is_none() && !registry.workers.is_empty() {
            let store = self.store.clone();
            let interval = self.settings.retry_sweep_interval;
            let stop = registry.shutdown.subscribe();
            registry.sweeper = Some(tokio::spawn(sweep_loop(store, interval, stop)));
        }

        info!(
            started = started.len(),
            active = registry.workers.len(),
            "workers started"
        );
        started
    }

    /// Signal every worker to stop and wait for all of them.
    ///
    /// Workers finish their current command first. Every task is joined before
    /// an error is returned; the first failure wins.
    pub async fn stop_workers(&self) -> Result<StopSummary, PoolError> {
        let mut registry = self.registry.lock().await;
        registry.shutdown.send_replace(true);

        let workers = std::mem::take(&mut registry.workers);
        let mut summary = StopSummary {
            workers: workers.len(),
            ..Default::default()
        };
        let mut first_error = None;

        for (id, handle) in workers {
            match handle.await {
                Ok(Ok(report)) => summary.jobs.merge(&report),
                Ok(Err(source)) => {
                    error!(worker_id = %id, error = %source, "worker exited on store failure");
                    first_error.get_or_insert(PoolError::Store { id, source });
                }
                Err(join_err) => {
                    error!(worker_id = %id, error = %join_err, "worker task panicked");
                    first_error.get_or_insert(PoolError::Panicked(id));
                }
            }
        }

        if let Some(sweeper) = registry.sweeper.take() {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "retry sweeper task failed");
            }
        }

        // Fresh channel so a later start_workers() is not born stopped.
        registry.shutdown = watch::channel(false).0;

        info!(
            workers = summary.workers,
            processed = summary.jobs.processed,
            "workers stopped"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Resolves once no registered worker task is still running.
    ///
    /// Workers only end on their own after repeated store failures or a panic;
    /// the caller still has to `stop_workers()` to collect the outcome.
    pub async fn workers_exited(&self) {
        loop {
            {
                let registry = self.registry.lock().await;
                if registry.workers.values().all(|handle| handle.is_finished()) {
                    return;
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Workers currently registered (started and not yet stopped).
    pub async fn active_worker_count(&self) -> usize {
        self.registry.lock().await.workers.len()
    }
}

/// Periodically move `failed` jobs whose backoff has elapsed back to `pending`.
async fn sweep_loop<S: JobStore + ?Sized>(
    store: Arc<S>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    debug!(interval_ms = interval.as_millis() as u64, "retry sweeper started");
    loop {
        match store.promote_due_retries(Utc::now()).await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "promoted due retries"),
            Err(e) => warn!(error = %e, "retry sweep failed"),
        }
        if wait_or_stop(&mut stop, interval).await {
            break;
        }
    }
    debug!("retry sweeper stopped");
}
