//! Subcommand handlers.

use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use queuectl_core::{EnqueueRequest, JobId, QueueError};
use queuectl_infra::config::{ConfigFile, QueueConfig};
use queuectl_infra::jobs::{JobQueue, SqliteJobStore};

use crate::args::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use crate::output;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_file = ConfigFile::locate()?;

    match cli.command {
        Command::Config(cmd) => config(&config_file, &cmd, cli.json),
        command => {
            let config = config_file.load_or_init()?;
            let path = match cli.db {
                Some(path) => path,
                None => config.database_path()?,
            };
            let queue = open_queue(path, config).await?;
            execute(&queue, command, cli.json).await
        }
    }
}

async fn execute(
    queue: &JobQueue<SqliteJobStore>,
    command: Command,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Command::Enqueue { job } => enqueue(queue, &job, json).await,
        Command::Worker(WorkerCommand::Start { count }) => start_workers(queue, count).await,
        Command::Status => status(queue, json).await,
        Command::List { state, limit } => {
            let jobs = queue.list_jobs(state, limit).await?;
            if json {
                print_json(&jobs)
            } else if jobs.is_empty() {
                println!("no jobs found");
                Ok(())
            } else {
                print!("{}", output::jobs_table(&jobs));
                Ok(())
            }
        }
        Command::Dlq(DlqCommand::List) => {
            let jobs = queue.dead_letters().await?;
            if json {
                print_json(&jobs)
            } else if jobs.is_empty() {
                println!("dead-letter queue is empty");
                Ok(())
            } else {
                print!("{}", output::dlq_table(&jobs));
                Ok(())
            }
        }
        Command::Dlq(DlqCommand::Retry { id }) => {
            let job = queue.requeue_from_dlq(&JobId::from(id)).await?;
            if json {
                print_json(&job)
            } else {
                println!("job {} moved back to pending", job.id);
                Ok(())
            }
        }
        Command::Config(_) => anyhow::bail!("config commands do not use the job database"),
    }
}

async fn open_queue(path: PathBuf, config: QueueConfig) -> anyhow::Result<JobQueue<SqliteJobStore>> {
    JobQueue::open(&path, config)
        .await
        .with_context(|| format!("failed to open job database {}", path.display()))
}

async fn enqueue(queue: &JobQueue<SqliteJobStore>, raw: &str, json: bool) -> anyhow::Result<()> {
    let request: EnqueueRequest = serde_json::from_str(raw)
        .map_err(|e| QueueError::invalid_input(format!("job must be a JSON object with a \"command\": {e}")))?;

    let id = queue.enqueue(request).await?;
    if json {
        print_json(&serde_json::json!({ "id": id }))
    } else {
        println!("job {id} enqueued");
        Ok(())
    }
}

async fn start_workers(queue: &JobQueue<SqliteJobStore>, count: u16) -> anyhow::Result<()> {
    let report = queue.recover().await?;
    if report.total() > 0 {
        println!(
            "recovered {} interrupted job(s): {} scheduled for retry, {} dead",
            report.total(),
            report.failed,
            report.dead
        );
    }

    let ids = queue.start_workers(usize::from(count)).await;
    println!("started {} worker(s); press Ctrl-C to stop", ids.len());

    tokio::select! {
        _ = wait_for_shutdown() => {
            println!("stopping workers (waiting for running jobs to finish)...");
        }
        _ = queue.workers_exited() => {
            warn!("every worker has exited; shutting down");
        }
    }

    let summary = queue.stop_workers().await?;
    println!(
        "stopped {} worker(s): {} job(s) processed, {} completed, {} failed, {} dead",
        summary.workers,
        summary.jobs.processed,
        summary.jobs.completed,
        summary.jobs.failed,
        summary.jobs.dead
    );
    Ok(())
}

async fn status(queue: &JobQueue<SqliteJobStore>, json: bool) -> anyhow::Result<()> {
    let counts = queue.counts_by_state().await?;
    let active = queue.active_worker_count().await;

    if json {
        #[derive(Serialize)]
        struct Status<'a> {
            jobs: &'a std::collections::BTreeMap<queuectl_core::JobState, u64>,
            active_workers: usize,
        }
        print_json(&Status {
            jobs: &counts,
            active_workers: active,
        })
    } else {
        print!("{}", output::status_table(&counts, active));
        Ok(())
    }
}

fn config(file: &ConfigFile, cmd: &ConfigCommand, json: bool) -> anyhow::Result<()> {
    let mut config = file.load_or_init()?;

    match cmd {
        ConfigCommand::Get { key } => {
            let value = config.get(key)?;
            if json {
                print_json(&value)
            } else {
                println!("{key}: {}", display_value(&value));
                Ok(())
            }
        }
        ConfigCommand::Set { key, value } => {
            config.set(key, value)?;
            file.save(&config)?;
            info!(key = %key, path = %file.path().display(), "config updated");
            println!("{key} set to {}", display_value(&config.get(key)?));
            Ok(())
        }
        ConfigCommand::List => {
            if json {
                return print_json(&config);
            }
            for key in QueueConfig::keys() {
                println!("{key}: {}", display_value(&config.get(&key)?));
            }
            Ok(())
        }
    }
}

/// Strings without quotes, everything else as JSON.
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    info!("received SIGTERM");
                    return;
                }
            }
            std::future::pending::<()>().await
        } => {}
    }
}
