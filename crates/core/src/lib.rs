//! `queuectl-core` — job lifecycle building blocks.
//!
//! This crate contains the **pure** parts of the queue: the job record, its
//! state machine, and the retry policy. Storage, process execution and worker
//! scheduling live in `queuectl-infra`.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod time;

pub use error::{QueueError, QueueResult};
pub use id::JobId;
pub use job::{EnqueueRequest, ExecutionOutcome, Job, JobPatch, JobState, DEFAULT_MAX_RETRIES};
pub use retry::{RetryPolicy, DEFAULT_BACKOFF_BASE};
