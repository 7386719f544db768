//! Worker loop: claim, run, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use queuectl_core::{Job, JobId, JobState, RetryPolicy};

use super::runner::CommandRunner;
use super::store::{JobStore, StoreError};

/// Identifier of a worker within one pool. Never reused by that pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Idle sleep between empty claims (also the pause after a store failure).
    pub poll_interval: Duration,
    /// Period of the retry sweeper.
    pub retry_sweep_interval: Duration,
    /// Consecutive store failures after which a worker gives up.
    pub max_store_failures: u32,
    /// Attempts to write a job's result back before giving up on it.
    pub store_retry_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_sweep_interval: Duration::from_secs(1),
            max_store_failures: 5,
            store_retry_attempts: 3,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_sweep_interval(mut self, interval: Duration) -> Self {
        self.retry_sweep_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_store_failures(mut self, n: u32) -> Self {
        self.max_store_failures = n;
        self
    }
}

/// Per-worker counters, returned when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerReport {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl WorkerReport {
    fn record(&mut self, job: &Job) {
        self.processed += 1;
        match job.state {
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::Dead => self.dead += 1,
            JobState::Pending | JobState::Processing => {}
        }
    }

    pub fn merge(&mut self, other: &WorkerReport) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.dead += other.dead;
    }
}

/// What a single iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing was eligible.
    Idle,
    /// A job ran and its result was recorded.
    Ran(Job),
    /// A job ran but left `processing` by other means before the result was
    /// written, so the result was dropped.
    Discarded(JobId),
}

/// A single worker: one job in flight at a time.
pub struct Worker<S: JobStore + ?Sized> {
    id: WorkerId,
    store: Arc<S>,
    runner: CommandRunner,
    settings: WorkerSettings,
}

impl<S: JobStore + ?Sized> Worker<S> {
    pub fn new(
        id: WorkerId,
        store: Arc<S>,
        runner: CommandRunner,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            store,
            runner,
            settings,
        }
    }

    /// Claim one job, run it, record the outcome.
    ///
    /// Only store failures are errors; a failing command is a normal result.
    pub async fn run_once(&self) -> Result<Step, StoreError> {
        let Some(job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(Step::Idle);
        };

        debug!(
            worker_id = %self.id,
            job_id = %job.id,
            attempts = job.attempts,
            command = %job.command,
            "running job"
        );

        let outcome = self.runner.run(&job.command, job.timeout_duration()).await;
        let patch = job.resolve(&outcome, &self.settings.retry_policy, Utc::now());

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .store
                .transition(&job.id, JobState::Processing, &patch)
                .await
            {
                Ok(updated) => {
                    self.log_result(&updated);
                    return Ok(Step::Ran(updated));
                }
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    warn!(worker_id = %self.id, job_id = %job.id, error = %e, "job result discarded");
                    return Ok(Step::Discarded(job.id));
                }
                Err(e) if attempt < self.settings.store_retry_attempts => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "failed to record job result, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %e,
                        "failed to record job result; job stays processing until the next recovery"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Loop until `stop` turns true (or its sender is dropped).
    ///
    /// A command in flight always runs to completion before the stop is
    /// observed. Exits with the last error after `max_store_failures`
    /// consecutive store failures.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<WorkerReport, StoreError> {
        info!(worker_id = %self.id, "worker started");

        let mut report = WorkerReport::default();
        let mut consecutive_failures = 0u32;

        loop {
            let stopping = *stop.borrow();
            if stopping {
                break;
            }

            match self.run_once().await {
                Ok(step) => {
                    consecutive_failures = 0;
                    match step {
                        Step::Ran(job) => report.record(&job),
                        Step::Discarded(_) => {}
                        Step::Idle => {
                            if wait_or_stop(&mut stop, self.settings.poll_interval).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.settings.max_store_failures {
                        error!(
                            worker_id = %self.id,
                            failures = consecutive_failures,
                            error = %e,
                            "worker giving up after repeated store failures"
                        );
                        return Err(e);
                    }
                    warn!(
                        worker_id = %self.id,
                        failures = consecutive_failures,
                        error = %e,
                        "store failure"
                    );
                    if wait_or_stop(&mut stop, self.settings.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.id,
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            dead = report.dead,
            "worker stopped"
        );
        Ok(report)
    }

    fn log_result(&self, job: &Job) {
        match job.state {
            JobState::Completed => info!(
                worker_id = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                "job completed"
            ),
            JobState::Failed => warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                next_retry_at = ?job.next_retry_at,
                error = job.last_error.as_deref().unwrap_or_default(),
                "job failed, retry scheduled"
            ),
            JobState::Dead => warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                error = job.last_error.as_deref().unwrap_or_default(),
                "job moved to dead-letter queue"
            ),
            state => debug!(worker_id = %self.id, job_id = %job.id, %state, "job recorded"),
        }
    }
}

/// Sleep for `period`, waking early on stop. Returns true if the caller should stop.
pub(crate) async fn wait_or_stop(stop: &mut watch::Receiver<bool>, period: Duration) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(period) => Ok(()),
        res = stop.changed() => res,
    };
    changed.is_err() || *stop.borrow()
}
