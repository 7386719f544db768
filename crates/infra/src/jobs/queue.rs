//! `JobQueue`: the public entry point over a store and its worker pool.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use queuectl_core::{EnqueueRequest, Job, JobId, JobPatch, JobState, QueueError, QueueResult};

use crate::config::QueueConfig;

use super::pool::{StopSummary, WorkerPool};
use super::sqlite::SqliteJobStore;
use super::store::{JobStore, ReapReport, StoreError};
use super::worker::WorkerId;

/// Queue facade: enqueue, inspect, requeue, and run workers.
pub struct JobQueue<S: JobStore + ?Sized + 'static> {
    store: Arc<S>,
    config: QueueConfig,
    pool: WorkerPool<S>,
}

impl JobQueue<SqliteJobStore> {
    /// Open the SQLite database at `path`.
    pub async fn open(path: impl AsRef<Path>, config: QueueConfig) -> QueueResult<Self> {
        let store = SqliteJobStore::connect(path.as_ref()).await?;
        Ok(Self::new(Arc::new(store), config))
    }
}

impl<S: JobStore + ?Sized + 'static> JobQueue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        let pool = WorkerPool::new(store.clone(), config.worker_settings());
        Self {
            store,
            config,
            pool,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate and persist a new `pending` job.
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId> {
        let job = request.into_job(self.config.max_retries, Utc::now())?;
        let job = self.store.create(job).await?;
        info!(
            job_id = %job.id,
            max_retries = job.max_retries,
            priority = job.priority,
            "job enqueued"
        );
        Ok(job.id)
    }

    pub async fn get_job(&self, id: &JobId) -> QueueResult<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> QueueResult<Vec<Job>> {
        Ok(self.store.list(state, limit).await?)
    }

    /// Contents of the dead-letter queue.
    pub async fn dead_letters(&self) -> QueueResult<Vec<Job>> {
        self.list_jobs(Some(JobState::Dead), None).await
    }

    /// Move a dead job back to `pending` with a fresh attempt budget.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn requeue_from_dlq(&self, id: &JobId) -> QueueResult<Job> {
        let job = self.get_job(id).await?;
        if job.state != JobState::Dead {
            return Err(QueueError::NotInDlq {
                id: id.clone(),
                state: job.state,
            });
        }

        match self
            .store
            .transition(id, JobState::Dead, &JobPatch::requeue())
            .await
        {
            Ok(job) => {
                info!(job_id = %job.id, "job requeued from dead-letter queue");
                Ok(job)
            }
            // Someone else requeued it between the read and the write.
            Err(StoreError::Conflict { id, actual, .. }) => {
                Err(QueueError::NotInDlq { id, state: actual })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn counts_by_state(&self) -> QueueResult<BTreeMap<JobState, u64>> {
        Ok(self.store.count_by_state().await?)
    }

    /// Reconcile jobs a previous run left in `processing`.
    ///
    /// Call once before starting workers.
    pub async fn recover(&self) -> QueueResult<ReapReport> {
        let report = self
            .store
            .reap_stale(&self.config.retry_policy(), Utc::now())
            .await?;
        if report.total() > 0 {
            warn!(
                failed = report.failed,
                dead = report.dead,
                "recovered jobs interrupted by a previous run"
            );
        }
        Ok(report)
    }

    pub async fn start_workers(&self, count: usize) -> Vec<WorkerId> {
        self.pool.start_workers(count).await
    }

    pub async fn stop_workers(&self) -> QueueResult<StopSummary> {
        Ok(self.pool.stop_workers().await?)
    }

    /// Resolves once every started worker has exited on its own.
    pub async fn workers_exited(&self) {
        self.pool.workers_exited().await
    }

    pub async fn active_worker_count(&self) -> usize {
        self.pool.active_worker_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn queue() -> JobQueue<InMemoryJobStore> {
        JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default())
    }

    #[tokio::test]
    async fn enqueue_applies_configured_default_retries() {
        let mut config = QueueConfig::default();
        config.set("max-retries", "6").unwrap();
        let queue = JobQueue::new(InMemoryJobStore::arc(), config);

        let id = queue.enqueue(EnqueueRequest::new("true")).await.unwrap();
        let job = queue.get_job(&id).await.unwrap();
        assert_eq!(job.max_retries, 6);
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_requests() {
        let queue = queue();
        assert!(matches!(
            queue.enqueue(EnqueueRequest::new("")).await,
            Err(QueueError::InvalidInput(_))
        ));
        assert!(matches!(
            queue.enqueue(EnqueueRequest::new("sleep 1").timeout(0)).await,
            Err(QueueError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let queue = queue();
        let request: EnqueueRequest =
            serde_json::from_str(r#"{"id": "job1", "command": "true"}"#).unwrap();

        queue.enqueue(request.clone()).await.unwrap();
        assert_eq!(
            queue.enqueue(request).await,
            Err(QueueError::DuplicateId(JobId::from("job1")))
        );
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let id = JobId::from("missing");
        assert_eq!(queue().get_job(&id).await, Err(QueueError::NotFound(id)));
    }

    #[tokio::test]
    async fn requeue_resets_dead_job() {
        let queue = queue();
        let id = queue.enqueue(EnqueueRequest::new("exit 1")).await.unwrap();
        queue
            .store()
            .update(
                &id,
                &JobPatch::state(JobState::Dead)
                    .with_attempts(3)
                    .with_last_error(Some("boom".into())),
            )
            .await
            .unwrap();
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);

        let job = queue.requeue_from_dlq(&id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.next_retry_at, None);
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_rejects_jobs_outside_the_dlq() {
        let queue = queue();
        let id = queue.enqueue(EnqueueRequest::new("true")).await.unwrap();

        assert_eq!(
            queue.requeue_from_dlq(&id).await,
            Err(QueueError::NotInDlq {
                id: id.clone(),
                state: JobState::Pending,
            })
        );

        let missing = JobId::from("nope");
        assert_eq!(
            queue.requeue_from_dlq(&missing).await,
            Err(QueueError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn counts_cover_every_state() {
        let queue = queue();
        queue.enqueue(EnqueueRequest::new("true")).await.unwrap();
        queue.enqueue(EnqueueRequest::new("true")).await.unwrap();

        let counts = queue.counts_by_state().await.unwrap();
        assert_eq!(counts.len(), JobState::ALL.len());
        assert_eq!(counts[&JobState::Pending], 2);
        assert_eq!(counts[&JobState::Dead], 0);
    }
}
