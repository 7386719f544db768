//! SQLite-backed job store.
//!
//! One row per job in the `jobs` table. Timestamps are stored as fixed-width
//! RFC 3339 UTC text with microsecond precision, so comparing the text
//! compares the instants.
//!
//! ## Atomic claim
//!
//! `claim_next()` is a single statement:
//!
//! ```sql
//! UPDATE jobs SET state = 'processing', attempts = attempts + 1, ...
//! WHERE id = (SELECT id FROM jobs WHERE <eligible> ORDER BY ... LIMIT 1)
//!   AND state = 'pending'
//! RETURNING ...
//! ```
//!
//! SQLite takes the write lock before evaluating the subquery, so two
//! connections can never claim the same row. Partial updates use the same
//! shape (`UPDATE ... RETURNING`) instead of read-then-write.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (unique violation) on insert | `AlreadyExists` |
//! | Database (other) | `Storage` |
//! | PoolClosed / Io / other | `Storage` |

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use tracing::{debug, instrument};

use queuectl_core::{Job, JobId, JobPatch, JobState, RetryPolicy};

use super::store::{empty_counts, JobStore, ReapReport, StoreError};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
     next_retry_at, last_error, run_at, priority, output, timeout";

/// SQLite-backed job store.
///
/// This struct is cheap to clone and is safe to share across threads.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the database file at `path` and ensure the schema.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection that never expires).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the `jobs` table and claim index if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                command       TEXT NOT NULL,
                state         TEXT NOT NULL,
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_retries   INTEGER NOT NULL DEFAULT 3,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                next_retry_at TEXT NULL,
                last_error    TEXT NULL,
                run_at        TEXT NULL,
                priority      INTEGER NOT NULL DEFAULT 0,
                output        TEXT NULL,
                timeout       INTEGER NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS jobs_claim_idx
                ON jobs (state, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Single-statement conditional patch. `from = None` patches regardless of state.
    async fn patch(
        &self,
        id: &JobId,
        from: Option<JobState>,
        patch: &JobPatch,
    ) -> Result<Option<Job>, StoreError> {
        let now = ts(Utc::now());
        let sql = format!(
            r#"
            UPDATE jobs SET
                state = COALESCE(?2, state),
                attempts = COALESCE(?3, attempts),
                next_retry_at = CASE WHEN ?4 THEN ?5 ELSE next_retry_at END,
                last_error = CASE WHEN ?6 THEN ?7 ELSE last_error END,
                output = CASE WHEN ?8 THEN ?9 ELSE output END,
                updated_at = ?10
            WHERE id = ?1
              AND (?11 IS NULL OR state = ?11)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(patch.state.map(|s| s.as_str()))
            .bind(patch.attempts.map(i64::from))
            .bind(patch.next_retry_at.is_some())
            .bind(patch.next_retry_at.flatten().map(ts))
            .bind(patch.last_error.is_some())
            .bind(patch.last_error.clone().flatten())
            .bind(patch.output.is_some())
            .bind(patch.output.clone().flatten())
            .bind(&now)
            .bind(from.map(|s| s.as_str()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("patch", e))?;

        row.as_ref().map(row_to_job).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        StoreError::check_new(&job)?;
        let job = normalize(job);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                command,
                state,
                attempts,
                max_retries,
                created_at,
                updated_at,
                next_retry_at,
                last_error,
                run_at,
                priority,
                output,
                timeout
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(ts(job.created_at))
        .bind(ts(job.updated_at))
        .bind(job.next_retry_at.map(ts))
        .bind(&job.last_error)
        .bind(job.run_at.map(ts))
        .bind(i64::from(job.priority))
        .bind(&job.output)
        .bind(job.timeout.map(|t| t as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    async fn update(&self, id: &JobId, patch: &JobPatch) -> Result<Job, StoreError> {
        self.patch(id, None, patch)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    #[instrument(skip(self, patch), fields(job_id = %id, from = %from), err)]
    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        patch: &JobPatch,
    ) -> Result<Job, StoreError> {
        if let Some(job) = self.patch(id, Some(from), patch).await? {
            return Ok(job);
        }

        match self.get(id).await? {
            Some(current) => Err(StoreError::Conflict {
                id: id.clone(),
                expected: from,
                actual: current.state,
            }),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        state: Option<JobState>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY created_at ASC, id ASC
            LIMIT ?2
            "#
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                attempts = attempts + 1,
                updated_at = ?1
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE state = 'pending'
                  AND (run_at IS NULL OR run_at <= ?1)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
              AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let job = row.as_ref().map(row_to_job).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
        }
        Ok(job)
    }

    #[instrument(skip(self, policy), err)]
    async fn reap_stale(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let now_ts = ts(now);
        let reason = "interrupted: worker exited before the job finished";

        // Write first so the transaction holds the write lock before reading.
        let dead = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead',
                next_retry_at = NULL,
                last_error = ?2,
                updated_at = ?1
            WHERE state = 'processing'
              AND attempts >= max_retries
            "#,
        )
        .bind(&now_ts)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_dead", e))?
        .rows_affected();

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'processing'"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_select", e))?;

        let mut failed = 0;
        for row in &rows {
            let job = row_to_job(row)?;
            let patch = job.reap(policy, now);

            sqlx::query(
                r#"
                UPDATE jobs
                SET state = ?2,
                    next_retry_at = ?3,
                    last_error = ?4,
                    updated_at = ?5
                WHERE id = ?1
                  AND state = 'processing'
                "#,
            )
            .bind(job.id.as_str())
            .bind(patch.state.unwrap_or(JobState::Failed).as_str())
            .bind(patch.next_retry_at.flatten().map(ts))
            .bind(patch.last_error.clone().flatten())
            .bind(&now_ts)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reap_failed", e))?;

            failed += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(ReapReport { failed, dead })
    }

    #[instrument(skip(self), err)]
    async fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                next_retry_at = NULL,
                updated_at = ?1
            WHERE state = 'failed'
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            "#,
        )
        .bind(ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote_due_retries", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut counts = empty_counts();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("count_by_state", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_by_state", e))?;
            counts.insert(parse_state(&state)?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

/// Canonical text form of a timestamp.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("invalid {column} '{raw}' in jobs: {e}")))
}

fn parse_state(raw: &str) -> Result<JobState, StoreError> {
    raw.parse::<JobState>()
        .map_err(|_| StoreError::Storage(format!("unknown job state '{raw}' in jobs")))
}

/// Drop sub-microsecond precision so the returned job matches what a later read sees.
fn normalize(mut job: Job) -> Job {
    job.created_at = job.created_at.trunc_subsecs(6);
    job.updated_at = job.updated_at.trunc_subsecs(6);
    job.next_retry_at = job.next_retry_at.map(|t| t.trunc_subsecs(6));
    job.run_at = job.run_at.map(|t| t.trunc_subsecs(6));
    job
}

/// Map a database row into a `Job`.
fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let get_err = |e: sqlx::Error| map_sqlx_error("decode_row", e);

    let id: String = row.try_get("id").map_err(get_err)?;
    let state: String = row.try_get("state").map_err(get_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(get_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(get_err)?;
    let created_at: String = row.try_get("created_at").map_err(get_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(get_err)?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at").map_err(get_err)?;
    let run_at: Option<String> = row.try_get("run_at").map_err(get_err)?;
    let priority: i64 = row.try_get("priority").map_err(get_err)?;
    let timeout: Option<i64> = row.try_get("timeout").map_err(get_err)?;

    Ok(Job {
        id: JobId::from(id),
        command: row.try_get("command").map_err(get_err)?,
        state: parse_state(&state)?,
        attempts: attempts.clamp(0, u32::MAX as i64) as u32,
        max_retries: max_retries.clamp(0, u32::MAX as i64) as u32,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        next_retry_at: next_retry_at
            .as_deref()
            .map(|s| parse_ts("next_retry_at", s))
            .transpose()?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        run_at: run_at.as_deref().map(|s| parse_ts("run_at", s)).transpose()?,
        priority: priority.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        output: row.try_get("output").map_err(get_err)?,
        timeout: timeout.map(|t| t.max(0) as u64),
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out waiting for a connection in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}
