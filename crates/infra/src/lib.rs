//! Infrastructure layer: job storage, workers, configuration.

pub mod config;
pub mod jobs;

#[cfg(test)]
mod integration_tests;
