//! Plain-text rendering of jobs and counts.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use queuectl_core::{Job, JobState};

const COMMAND_WIDTH: usize = 50;
const ERROR_WIDTH: usize = 50;

/// Shorten `s` to `width` characters, marking the cut with "...".
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let kept: String = s.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Left-aligned columns sized to their widest cell.
fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, &w)| format!("{c:<w$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };

    line(headers.iter().map(|h| h.to_string()).collect());
    line(widths.iter().map(|w| "-".repeat(*w)).collect());
    for row in rows {
        line(row.clone());
    }
    out
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                job.id.to_string(),
                truncate(&job.command, COMMAND_WIDTH),
                job.state.to_string(),
                format!("{}/{}", job.attempts, job.max_retries),
                job.priority.to_string(),
                job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    table(
        &["ID", "COMMAND", "STATE", "ATTEMPTS", "PRIORITY", "CREATED"],
        &rows,
    )
}

pub fn dlq_table(jobs: &[Job]) -> String {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                job.id.to_string(),
                truncate(&job.command, COMMAND_WIDTH),
                job.attempts.to_string(),
                truncate(job.last_error.as_deref().unwrap_or(""), ERROR_WIDTH),
            ]
        })
        .collect();
    table(&["ID", "COMMAND", "ATTEMPTS", "LAST ERROR"], &rows)
}

pub fn status_table(counts: &BTreeMap<JobState, u64>, active_workers: usize) -> String {
    let rows: Vec<Vec<String>> = JobState::ALL
        .iter()
        .map(|state| {
            vec![
                state.to_string(),
                counts.get(state).copied().unwrap_or(0).to_string(),
            ]
        })
        .collect();

    let mut out = table(&["STATE", "COUNT"], &rows);
    let _ = writeln!(out, "\nactive workers: {active_workers}");
    out
}
