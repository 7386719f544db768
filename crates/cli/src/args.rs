use std::path::PathBuf;

use clap::{Parser, Subcommand};

use queuectl_core::JobState;

/// queuectl - persistent background job queue for shell commands
#[derive(Parser, Debug)]
#[command(name = "queuectl", version)]
#[command(about = "Enqueue shell commands and run them with retrying workers", long_about = None)]
pub struct Cli {
    /// SQLite database path (overrides QUEUECTL_DB and the `db-path` setting)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a job, e.g. '{"command": "echo hi", "max_retries": 3}'
    Enqueue {
        /// Job as a JSON object
        job: String,
    },

    /// Run workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Job counts per state
    Status,

    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(long, value_parser = parse_state)]
        state: Option<JobState>,

        /// Show at most this many jobs
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Inspect and replay the dead-letter queue
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Read or change settings
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Start workers in the foreground until Ctrl-C or SIGTERM
    Start {
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        count: u16,
    },
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List dead jobs
    List,
    /// Move a dead job back to pending with its attempts reset
    Retry {
        /// Job id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
    /// Print every setting
    List,
}

fn parse_state(raw: &str) -> Result<JobState, String> {
    raw.parse::<JobState>().map_err(|e| e.to_string())
}
