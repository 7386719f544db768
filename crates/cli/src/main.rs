//! `queuectl` command-line entrypoint.

mod args;
mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;

use queuectl_core::QueueError;
use queuectl_infra::config::ConfigError;

use crate::args::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    queuectl_observability::init();

    let cli = Cli::parse();

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Distinct exit status per failure kind, so scripts can branch on it.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<QueueError>() {
        return match err {
            QueueError::InvalidInput(_) => 2,
            QueueError::NotFound(_) => 3,
            QueueError::NotInDlq { .. } => 4,
            QueueError::DuplicateId(_) => 5,
            QueueError::Storage(_) => 10,
            QueueError::WorkerFailed(_) => 11,
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 6;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::JobId;

    #[test]
    fn exit_codes_follow_error_kind() {
        let not_found = anyhow::Error::new(QueueError::NotFound(JobId::from("x")));
        assert_eq!(exit_code(&not_found), 3);

        let wrapped = anyhow::Error::new(QueueError::storage("disk")).context("opening database");
        assert_eq!(exit_code(&wrapped), 10);

        let config = anyhow::Error::new(ConfigError::UnknownKey("nope".into()));
        assert_eq!(exit_code(&config), 6);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
