//! Job record and lifecycle state machine.
//!
//! ```text
//!   enqueue ──→ pending ──claim──→ processing ──success──→ completed
//!                 ▲  ▲                 │
//!                 │  │                 ├──failure, attempts < max──→ failed
//!                 │  │                 │                                │
//!                 │  │                 └──failure, attempts >= max──→ dead
//!                 │  │                                                  │
//!                 │  └──────────── retry due (next_retry_at elapsed) ───┤ (failed)
//!                 └─────────────── manual requeue, attempts reset ──────┘ (dead)
//! ```
//!
//! **Invariants:**
//! - `attempts` grows by one per claim and is only reset by a DLQ requeue.
//! - `dead` implies `attempts >= max_retries`.
//! - `next_retry_at` is only set while the job is `failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::retry::RetryPolicy;
use crate::time;

/// Default `max-retries` for jobs that do not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker; the command is running.
    Processing,
    /// The command exited with status 0.
    Completed,
    /// The last run failed; eligible again after `next_retry_at`.
    Failed,
    /// Retries exhausted. Lives in the dead-letter queue until requeued.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Failed, Pending)
                | (Dead, Pending)
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::invalid_input(format!("unknown job state '{other}'"))),
        }
    }
}

/// A shell-command job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Earliest time of the first run (scheduled jobs).
    pub run_at: Option<DateTime<Utc>>,
    /// Higher runs first among eligible jobs.
    pub priority: i32,
    pub output: Option<String>,
    /// Wall-clock limit for the command, in seconds.
    pub timeout: Option<u64>,
}

impl Job {
    /// Create a pending job with default settings.
    pub fn new(command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            last_error: None,
            run_at: None,
            priority: 0,
            output: None,
            timeout: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Accept the record for insertion: a fresh pending job whose timestamps
    /// are all storable.
    pub fn check_new(&self) -> QueueResult<()> {
        if self.state != JobState::Pending || self.attempts != 0 {
            return Err(QueueError::invalid_input(format!(
                "new job {} must be pending with no attempts (got {}, {} attempts)",
                self.id, self.state, self.attempts
            )));
        }
        let stamps = [
            ("created_at", Some(self.created_at)),
            ("updated_at", Some(self.updated_at)),
            ("next_retry_at", self.next_retry_at),
            ("run_at", self.run_at),
        ];
        for (field, at) in stamps {
            if let Some(at) = at.filter(|at| !time::is_storable(*at)) {
                return Err(QueueError::invalid_input(format!(
                    "{field} {} is outside years 0000-9999",
                    at.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// A worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at.map_or(true, |at| at <= now)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    /// The claim transition: `pending -> processing`, one more attempt.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
    }

    /// Apply a partial update and bump `updated_at`.
    pub fn apply(&mut self, patch: &JobPatch, now: DateTime<Utc>) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            self.next_retry_at = next_retry_at;
        }
        if let Some(last_error) = &patch.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(output) = &patch.output {
            self.output = output.clone();
        }
        self.updated_at = now;
    }

    /// Map the outcome of a run to the update that records it.
    ///
    /// Every failure kind (non-zero exit, timeout, spawn error) goes through the
    /// same ceiling check: `attempts >= max_retries` is dead, anything below is
    /// failed with a backoff deadline.
    pub fn resolve(
        &self,
        outcome: &ExecutionOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> JobPatch {
        match outcome {
            ExecutionOutcome::Succeeded { stdout } => JobPatch::state(JobState::Completed)
                .with_output(Some(stdout.trim().to_string()))
                .with_last_error(None)
                .with_next_retry_at(None),
            ExecutionOutcome::Exited {
                code,
                stdout,
                stderr,
            } => {
                let error = match (stderr.trim(), code) {
                    ("", Some(code)) => format!("exited with status {code}"),
                    ("", None) => "terminated by signal".to_string(),
                    (stderr, _) => stderr.to_string(),
                };
                self.failure(error, non_empty(stdout), policy, now)
            }
            ExecutionOutcome::TimedOut { after, stdout } => self.failure(
                format!("timed out after {}s", after.as_secs()),
                non_empty(stdout),
                policy,
                now,
            ),
            ExecutionOutcome::SpawnFailed { error } => self.failure(
                format!("failed to start command: {error}"),
                None,
                policy,
                now,
            ),
        }
    }

    /// Update for a job found in `processing` after a crash.
    pub fn reap(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> JobPatch {
        self.failure(
            "interrupted: worker exited before the job finished".to_string(),
            None,
            policy,
            now,
        )
    }

    fn failure(
        &self,
        error: String,
        output: Option<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> JobPatch {
        let patch = if self.attempts >= self.max_retries {
            JobPatch::state(JobState::Dead).with_next_retry_at(None)
        } else {
            JobPatch::state(JobState::Failed)
                .with_next_retry_at(Some(policy.next_retry_at(self.attempts, now)))
        };
        let patch = patch.with_last_error(Some(error));
        match output {
            Some(output) => patch.with_output(Some(output)),
            None => patch,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Partial update of a job record.
///
/// `None` leaves a field untouched; for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub output: Option<Option<String>>,
}

impl JobPatch {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// `dead -> pending` with a fresh attempt budget.
    pub fn requeue() -> Self {
        Self::state(JobState::Pending)
            .with_attempts(0)
            .with_last_error(None)
            .with_next_retry_at(None)
    }

    /// `failed -> pending` once the backoff has elapsed.
    pub fn promote() -> Self {
        Self::state(JobState::Pending).with_next_retry_at(None)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = Some(output);
        self
    }
}

/// How a run of the job's command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit status 0.
    Succeeded { stdout: String },
    /// Non-zero exit status, or killed by a signal (`code == None`).
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// The command exceeded its timeout and was killed.
    TimedOut { after: Duration, stdout: String },
    /// The command could not be started at all.
    SpawnFailed { error: String },
}

/// Request to add a job to the queue.
///
/// Deserializes from the JSON object accepted on the command line, e.g.
/// `{"command": "echo hi", "max_retries": 5, "priority": 2}`. Unknown fields
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub id: Option<JobId>,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl EnqueueRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Validate and build the pending job.
    pub fn into_job(self, default_max_retries: u32, now: DateTime<Utc>) -> QueueResult<Job> {
        if self.command.trim().is_empty() {
            return Err(QueueError::invalid_input("command must not be empty"));
        }
        if self.timeout == Some(0) {
            return Err(QueueError::invalid_input("timeout must be at least 1 second"));
        }
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(QueueError::invalid_input("job id must not be empty"));
            }
        }

        let job = Job {
            id: self.id.unwrap_or_default(),
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            last_error: None,
            run_at: self.run_at,
            priority: self.priority.unwrap_or(0),
            output: None,
            timeout: self.timeout,
        };
        job.check_new()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(max_retries: u32, attempts: u32) -> Job {
        let mut job = Job::new("exit 1").with_max_retries(max_retries);
        job.state = JobState::Processing;
        job.attempts = attempts;
        job
    }

    fn exit_failure(stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome::Exited {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn new_job_is_pending_with_no_attempts() {
        let job = Job::new("echo test");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use JobState::*;
        let allowed = [
            (Pending, Processing),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Dead),
            (Failed, Pending),
            (Dead, Pending),
        ];
        for from in JobState::ALL {
            for to in JobState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn future_run_at_is_not_eligible() {
        let now = Utc::now();
        let job = Job::new("true").with_run_at(now + chrono::Duration::minutes(5));
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn success_completes_with_trimmed_output() {
        let job = claimed(3, 1);
        let patch = job.resolve(
            &ExecutionOutcome::Succeeded {
                stdout: "hello\n".into(),
            },
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(patch.state, Some(JobState::Completed));
        assert_eq!(patch.output, Some(Some("hello".to_string())));
    }

    #[test]
    fn failure_below_ceiling_schedules_retry() {
        let now = Utc::now();
        let job = claimed(2, 1);
        let patch = job.resolve(&exit_failure("boom\n"), &RetryPolicy::new(2), now);

        assert_eq!(patch.state, Some(JobState::Failed));
        assert_eq!(patch.last_error, Some(Some("boom".to_string())));
        assert_eq!(
            patch.next_retry_at,
            Some(Some(now + chrono::Duration::seconds(2)))
        );
        assert!(JobState::Processing.can_transition_to(JobState::Failed));
    }

    #[test]
    fn failure_at_ceiling_is_dead() {
        let job = claimed(2, 2);
        let patch = job.resolve(&exit_failure(""), &RetryPolicy::default(), Utc::now());

        assert_eq!(patch.state, Some(JobState::Dead));
        assert_eq!(patch.next_retry_at, Some(None));
        assert_eq!(patch.last_error, Some(Some("exited with status 1".to_string())));
    }

    #[test]
    fn spawn_failure_respects_the_same_ceiling() {
        let outcome = ExecutionOutcome::SpawnFailed {
            error: "no such file".into(),
        };
        let policy = RetryPolicy::default();

        let below = claimed(3, 1).resolve(&outcome, &policy, Utc::now());
        assert_eq!(below.state, Some(JobState::Failed));

        let at = claimed(3, 3).resolve(&outcome, &policy, Utc::now());
        assert_eq!(at.state, Some(JobState::Dead));
    }

    #[test]
    fn timeout_records_a_timeout_message() {
        let patch = claimed(1, 1).resolve(
            &ExecutionOutcome::TimedOut {
                after: Duration::from_secs(5),
                stdout: String::new(),
            },
            &RetryPolicy::default(),
            Utc::now(),
        );
        assert_eq!(patch.state, Some(JobState::Dead));
        assert_eq!(patch.last_error, Some(Some("timed out after 5s".to_string())));
    }

    #[test]
    fn failure_keeps_previous_output_when_run_printed_nothing() {
        let mut job = claimed(3, 1);
        job.output = Some("earlier".into());

        let patch = job.resolve(&exit_failure("x"), &RetryPolicy::default(), Utc::now());
        assert_eq!(patch.output, None);
        job.apply(&patch, Utc::now());
        assert_eq!(job.output.as_deref(), Some("earlier"));
    }

    #[test]
    fn reap_follows_retry_ceiling() {
        let now = Utc::now();
        let policy = RetryPolicy::new(2);

        let patch = claimed(3, 1).reap(&policy, now);
        assert_eq!(patch.state, Some(JobState::Failed));
        assert_eq!(
            patch.next_retry_at,
            Some(Some(now + chrono::Duration::seconds(2)))
        );

        let patch = claimed(3, 3).reap(&policy, now);
        assert_eq!(patch.state, Some(JobState::Dead));
    }

    #[test]
    fn requeue_resets_attempts_and_error() {
        let mut job = claimed(2, 2);
        job.state = JobState::Dead;
        job.last_error = Some("boom".into());

        let later = Utc::now() + chrono::Duration::seconds(1);
        job.apply(&JobPatch::requeue(), later);

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.updated_at, later);
    }

    #[test]
    fn mark_processing_counts_an_attempt() {
        let mut job = Job::new("true");
        job.mark_processing(Utc::now());
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn enqueue_rejects_empty_command() {
        let err = EnqueueRequest::new("   ")
            .into_job(DEFAULT_MAX_RETRIES, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[test]
    fn enqueue_rejects_zero_timeout() {
        let err = EnqueueRequest::new("sleep 1")
            .timeout(0)
            .into_job(DEFAULT_MAX_RETRIES, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[test]
    fn enqueue_rejects_run_at_past_year_9999() {
        let far = chrono::TimeZone::with_ymd_and_hms(&Utc, 10000, 1, 1, 0, 0, 0).unwrap();
        let err = EnqueueRequest::new("true")
            .run_at(far)
            .into_job(DEFAULT_MAX_RETRIES, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(msg) if msg.contains("run_at")));
    }

    #[test]
    fn enqueue_accepts_run_at_in_year_9999() {
        let job = EnqueueRequest::new("true")
            .run_at(time::latest_storable())
            .into_job(DEFAULT_MAX_RETRIES, Utc::now())
            .unwrap();
        assert_eq!(job.run_at, Some(time::latest_storable()));
    }

    #[test]
    fn check_new_rejects_records_that_are_not_fresh() {
        let mut job = Job::new("true");
        job.state = JobState::Completed;
        assert!(matches!(job.check_new(), Err(QueueError::InvalidInput(_))));

        let mut job = Job::new("true");
        job.attempts = 2;
        assert!(matches!(job.check_new(), Err(QueueError::InvalidInput(_))));

        assert_eq!(Job::new("true").check_new(), Ok(()));
    }

    #[test]
    fn enqueue_request_parses_from_json() {
        let req: EnqueueRequest = serde_json::from_str(
            r#"{"id": "job1", "command": "sleep 2", "max_retries": 5, "priority": 9, "state": "ignored"}"#,
        )
        .unwrap();
        let job = req.into_job(DEFAULT_MAX_RETRIES, Utc::now()).unwrap();

        assert_eq!(job.id.as_str(), "job1");
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.priority, 9);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn enqueue_uses_configured_default_retries() {
        let job = EnqueueRequest::new("true").into_job(7, Utc::now()).unwrap();
        assert_eq!(job.max_retries, 7);
        assert_eq!(job.priority, 0);
    }
}
