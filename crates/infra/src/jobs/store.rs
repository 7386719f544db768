//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use queuectl_core::{Job, JobId, JobPatch, JobState, QueueError, RetryPolicy};

/// Durable keyed storage for job records; the single source of truth shared
/// by every worker.
///
/// # Contract
///
/// - `claim_next()` MUST be atomic: concurrent callers never receive the same
///   job.
/// - `update()` and `transition()` bump `updated_at`.
/// - `reap_stale()` treats every `processing` record as orphaned; only call it
///   before any worker of this process has started.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    ///
    /// Rejects with `Invalid` anything but a `pending` record with no attempts
    /// and timestamps in years 0000-9999.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Point lookup.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a partial update.
    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<Job, StoreError>;

    /// Apply a partial update only if the job is currently in `from`.
    ///
    /// Fails with `Conflict` when the job exists in another state.
    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        patch: &JobPatch,
    ) -> Result<Job, StoreError>;

    /// Jobs ordered by `created_at`, optionally filtered by state.
    async fn list(
        &self,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Claim the best eligible pending job: priority descending, then oldest.
    ///
    /// The job comes back in `processing` with one more attempt. Returns `None`
    /// when nothing is eligible at `now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Reconcile jobs left in `processing` by a crashed run.
    async fn reap_stale(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError>;

    /// Move `failed` jobs whose backoff has elapsed back to `pending`.
    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Number of jobs per state; every state is present.
    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Gate for `create`: only fresh pending records with storable timestamps.
    pub(crate) fn check_new(job: &Job) -> Result<(), StoreError> {
        job.check_new().map_err(|err| match err {
            QueueError::InvalidInput(msg) => StoreError::Invalid(msg),
            other => StoreError::Storage(other.to_string()),
        })
    }
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            StoreError::AlreadyExists(id) => QueueError::DuplicateId(id),
            StoreError::Invalid(msg) => QueueError::InvalidInput(msg),
            err @ StoreError::Conflict { .. } => QueueError::Storage(err.to_string()),
            StoreError::Storage(msg) => QueueError::Storage(msg),
        }
    }
}

/// Result of a stale-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReapReport {
    /// Orphans scheduled for another attempt.
    pub failed: u64,
    /// Orphans that had exhausted their retries.
    pub dead: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.failed + self.dead
    }
}

pub(crate) fn empty_counts() -> BTreeMap<JobState, u64> {
    JobState::ALL.iter().map(|s| (*s, 0)).collect()
}

/// In-memory job store for tests/dev.
///
/// Every read-modify-write runs under a single write lock, which is what makes
/// `claim_next` atomic here.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        StoreError::check_new(&job)?;
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.apply(patch, Utc::now());
        Ok(job.clone())
    }

    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        patch: &JobPatch,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if job.state != from {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected: from,
                actual: job.state,
            });
        }
        job.apply(patch, Utc::now());
        Ok(job.clone())
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.write()?;

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|j| j.id.clone());

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_processing(now);
                job.clone()
            })
        }))
    }

    async fn reap_stale(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError> {
        let mut jobs = self.write()?;
        let mut report = ReapReport::default();

        for job in jobs.values_mut().filter(|j| j.state == JobState::Processing) {
            let patch = job.reap(policy, now);
            job.apply(&patch, now);
            match job.state {
                JobState::Dead => report.dead += 1,
                _ => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let mut promoted = 0;

        for job in jobs.values_mut().filter(|j| {
            j.state == JobState::Failed && j.next_retry_at.map_or(true, |at| at <= now)
        }) {
            job.apply(&JobPatch::promote(), now);
            promoted += 1;
        }

        Ok(promoted)
    }

    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>, StoreError> {
        let jobs = self.read()?;
        let mut counts = empty_counts();
        for job in jobs.values() {
            *counts.entry(job.state).or_default() += 1;
        }
        Ok(counts)
    }
}
