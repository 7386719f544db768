//! Store double that fails on demand, for exercising worker error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use queuectl_core::{Job, JobId, JobPatch, JobState, RetryPolicy};

use super::store::{InMemoryJobStore, JobStore, ReapReport, StoreError};

/// In-memory store whose claims and result writes can be made to fail.
#[derive(Default)]
pub(crate) struct FailingStore {
    inner: InMemoryJobStore,
    fail_claims: AtomicBool,
    transition_error: Mutex<Option<StoreError>>,
    pub(crate) claim_calls: AtomicU32,
}

impl FailingStore {
    /// Every `claim_next` fails with a storage error.
    pub(crate) fn failing_claims() -> Self {
        let store = Self::default();
        store.fail_claims.store(true, Ordering::SeqCst);
        store
    }

    /// Every `transition` fails with `err`.
    pub(crate) fn failing_transitions(err: StoreError) -> Self {
        let store = Self::default();
        if let Ok(mut slot) = store.transition_error.lock() {
            *slot = Some(err);
        }
        store
    }
}

#[async_trait]
impl JobStore for FailingStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<Job, StoreError> {
        self.inner.update(id, patch).await
    }

    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        patch: &JobPatch,
    ) -> Result<Job, StoreError> {
        let injected = self.transition_error.lock().ok().and_then(|slot| slot.clone());
        match injected {
            Some(err) => Err(err),
            None => self.inner.transition(id, from, patch).await,
        }
    }

    async fn list(
        &self,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list(state, limit).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("database is locked".to_string()));
        }
        self.inner.claim_next(now).await
    }

    async fn reap_stale(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError> {
        self.inner.reap_stale(policy, now).await
    }

    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.promote_due_retries(now).await
    }

    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>, StoreError> {
        self.inner.count_by_state().await
    }
}
