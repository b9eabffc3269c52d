//! Subcommand implementations. Each one opens the queue, runs one engine
//! operation and prints the result.

pub mod config;
pub mod dlq;
pub mod worker;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use queuectl_core::JobQueue;
use queuectl_core::app::Supervisor;
use queuectl_core::domain::payload::parse_run_at;
use queuectl_core::domain::{EnqueueRequest, JobFilter, JobState};
use serde::Serialize;

pub(crate) fn open(home: &Path) -> anyhow::Result<JobQueue> {
    JobQueue::open(home).with_context(|| format!("opening queue at {}", home.display()))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn enqueue(
    home: &Path,
    input: &str,
    run_at: Option<&str>,
    max_retries: Option<u32>,
) -> anyhow::Result<ExitCode> {
    let run_at = run_at.map(parse_run_at).transpose()?;
    let request = EnqueueRequest::from_input(input, run_at, max_retries)?;

    let job = open(home)?.enqueue(request).await?;
    println!("{}", job.id);
    Ok(ExitCode::SUCCESS)
}

pub async fn status(home: &Path) -> anyhow::Result<ExitCode> {
    let report = Supervisor::new(open(home)?).status().await?;
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

pub async fn list(
    home: &Path,
    state: Option<&str>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<ExitCode> {
    let state = state.map(str::parse::<JobState>).transpose()?;
    let queue = open(home)?;

    let jobs = match state {
        // dead jobs come from the DLQ view (most recent first)
        Some(JobState::Dead) => queue
            .dlq_list()
            .await?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect(),
        Some(state) => queue.list_jobs(JobFilter::state(state), limit, offset).await?,
        None => queue.list_jobs(JobFilter::all(), limit, offset).await?,
    };
    print_json(&jobs)?;
    Ok(ExitCode::SUCCESS)
}
