//! End-to-end tests for the queue on a real SQLite file.
//!
//! Tests: enqueue → claim → run → record → retry sweep → dead-letter → requeue
//!
//! Verifies:
//! - Successful and failing commands end in the documented states
//! - Retries are spaced by the backoff policy and end in the DLQ
//! - Jobs interrupted by a crash are recovered on the next start
//! - Many workers never run the same job twice

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use queuectl_core::{EnqueueRequest, JobId, JobState, QueueError};

    use crate::config::QueueConfig;
    use crate::jobs::{
        CommandRunner, JobQueue, JobStore, SqliteJobStore, Step, Worker, WorkerId, WorkerSettings,
    };

    /// Database file inside a temporary directory, removed on drop.
    struct TempDb {
        _dir: tempfile::TempDir,
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("jobs.db");
            Self { _dir: dir, path }
        }
    }

    fn fast_config() -> QueueConfig {
        let mut config = QueueConfig::default();
        config.set("poll-interval-ms", "20").unwrap();
        config.set("retry-sweep-interval-ms", "20").unwrap();
        config
    }

    async fn wait_for_state(
        queue: &JobQueue<SqliteJobStore>,
        id: &JobId,
        state: JobState,
        limit: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if queue.get_job(id).await.unwrap().state == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_job_completes_with_output() {
        let db = TempDb::new();
        let queue = JobQueue::open(&db.path, fast_config()).await.unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("echo hello"))
            .await
            .unwrap();
        queue.start_workers(1).await;

        assert!(wait_for_state(&queue, &id, JobState::Completed, Duration::from_secs(5)).await);
        queue.stop_workers().await.unwrap();

        let job = queue.get_job(&id).await.unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.output.as_deref(), Some("hello"));
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn failing_job_backs_off_then_dies() {
        let db = TempDb::new();
        let store = Arc::new(SqliteJobStore::connect(&db.path).await.unwrap());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let worker = Worker::new(
            WorkerId(1),
            store.clone(),
            CommandRunner::new(),
            queue.config().worker_settings(),
        );

        let id = queue
            .enqueue(EnqueueRequest::new("exit 1").max_retries(2))
            .await
            .unwrap();

        let before = Utc::now();
        let Step::Ran(first) = worker.run_once().await.unwrap() else {
            panic!("expected the job to run");
        };
        assert_eq!(first.state, JobState::Failed);
        assert_eq!(first.attempts, 1);
        let retry_at = first.next_retry_at.unwrap();
        assert!(retry_at >= before + chrono::Duration::seconds(2));

        // Not due yet: nothing to promote, nothing to claim.
        assert_eq!(store.promote_due_retries(Utc::now()).await.unwrap(), 0);
        assert_eq!(worker.run_once().await.unwrap(), Step::Idle);

        assert_eq!(store.promote_due_retries(retry_at).await.unwrap(), 1);
        let Step::Ran(second) = worker.run_once().await.unwrap() else {
            panic!("expected the retry to run");
        };
        assert_eq!(second.state, JobState::Dead);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.last_error.as_deref(), Some("exited with status 1"));

        let dlq = queue.dead_letters().await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, id);

        let requeued = queue.requeue_from_dlq(&id).await.unwrap();
        assert_eq!(requeued.state, JobState::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_retries_through_the_sweeper() {
        let db = TempDb::new();
        let mut config = fast_config();
        config.set("backoff-base", "1").unwrap();
        let queue = JobQueue::open(&db.path, config).await.unwrap();

        let id = queue
            .enqueue(EnqueueRequest::new("echo nope >&2; exit 1").max_retries(2))
            .await
            .unwrap();
        queue.start_workers(2).await;

        assert!(wait_for_state(&queue, &id, JobState::Dead, Duration::from_secs(10)).await);
        let summary = queue.stop_workers().await.unwrap();
        assert_eq!(summary.workers, 2);
        assert_eq!(summary.jobs.processed, 2);
        assert_eq!(summary.jobs.dead, 1);

        let job = queue.get_job(&id).await.unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_workers_run_each_job_once() {
        let db = TempDb::new();
        let queue = JobQueue::open(&db.path, fast_config()).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(
                queue
                    .enqueue(EnqueueRequest::new(format!("echo {i}")))
                    .await
                    .unwrap(),
            );
        }

        queue.start_workers(4).await;
        for id in &ids {
            assert!(wait_for_state(&queue, id, JobState::Completed, Duration::from_secs(10)).await);
        }
        let summary = queue.stop_workers().await.unwrap();
        assert_eq!(summary.jobs.completed, 12);

        for id in &ids {
            assert_eq!(queue.get_job(id).await.unwrap().attempts, 1);
        }
    }

    #[tokio::test]
    async fn timeout_counts_as_a_failure() {
        let db = TempDb::new();
        let store = Arc::new(SqliteJobStore::connect(&db.path).await.unwrap());
        let queue = JobQueue::new(store.clone(), QueueConfig::default());
        let worker = Worker::new(
            WorkerId(1),
            store,
            CommandRunner::new(),
            WorkerSettings::default(),
        );

        let id = queue
            .enqueue(EnqueueRequest::new("sleep 10").timeout(1).max_retries(1))
            .await
            .unwrap();

        let Step::Ran(job) = worker.run_once().await.unwrap() else {
            panic!("expected the job to run");
        };
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.last_error.as_deref(), Some("timed out after 1s"));
    }

    #[tokio::test]
    async fn interrupted_jobs_are_recovered_on_restart() {
        let db = TempDb::new();

        let (retryable, exhausted) = {
            let queue = JobQueue::open(&db.path, QueueConfig::default()).await.unwrap();
            let retryable = queue.enqueue(EnqueueRequest::new("true")).await.unwrap();
            let exhausted = queue
                .enqueue(EnqueueRequest::new("true").max_retries(1))
                .await
                .unwrap();

            // Claimed, then the process "crashes" before recording a result.
            queue.store().claim_next(Utc::now()).await.unwrap();
            queue.store().claim_next(Utc::now()).await.unwrap();
            queue.store().close().await;
            (retryable, exhausted)
        };

        let queue = JobQueue::open(&db.path, QueueConfig::default()).await.unwrap();
        let report = queue.recover().await.unwrap();
        assert_eq!(report.total(), 2);

        let job = queue.get_job(&retryable).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.next_retry_at.is_some());

        assert_eq!(queue.get_job(&exhausted).await.unwrap().state, JobState::Dead);
        assert_eq!(queue.counts_by_state().await.unwrap()[&JobState::Processing], 0);
    }

    #[tokio::test]
    async fn requeue_of_live_job_is_rejected() {
        let db = TempDb::new();
        let queue = JobQueue::open(&db.path, QueueConfig::default()).await.unwrap();
        let id = queue.enqueue(EnqueueRequest::new("true")).await.unwrap();

        assert!(matches!(
            queue.requeue_from_dlq(&id).await,
            Err(QueueError::NotInDlq { state: JobState::Pending, .. })
        ));
    }
}
