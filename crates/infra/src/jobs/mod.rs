//! Persistent shell-command job queue.
//!
//! ## Design
//!
//! - One store is the single source of truth shared by every worker
//! - Claiming is one atomic store operation, so a job runs on at most one worker
//! - Failures retry with exponential backoff; exhausted jobs land in the
//!   dead-letter queue (state `dead`) until requeued by hand
//! - A retry sweeper owned by the pool moves due `failed` jobs back to `pending`
//! - Startup recovery reconciles jobs left in `processing` by a crash
//!
//! ## Components
//!
//! - `JobStore`: persistence contract (`SqliteJobStore`, `InMemoryJobStore`)
//! - `CommandRunner`: runs `sh -c <command>` with an optional timeout
//! - `Worker`: claim, run, record loop
//! - `WorkerPool`: owns workers and the retry sweeper
//! - `JobQueue`: facade used by the CLI

pub mod pool;
pub mod queue;
pub mod runner;
pub mod sqlite;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use pool::{PoolError, StopSummary, WorkerPool};
pub use queue::JobQueue;
pub use runner::CommandRunner;
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, ReapReport, StoreError};
pub use worker::{Step, Worker, WorkerId, WorkerReport, WorkerSettings};
