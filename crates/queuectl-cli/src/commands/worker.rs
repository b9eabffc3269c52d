use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use queuectl_core::app::{Registration, Supervisor, WorkerLaunch, run_worker};
use queuectl_core::domain::WorkerId;
use queuectl_core::impls::ShellExecutor;
use tracing::info;

use super::open;

pub async fn start(home: &Path, count: usize, poll_interval: Option<u64>) -> anyhow::Result<ExitCode> {
    anyhow::ensure!(count > 0, "--count must be at least 1");

    let launch = WorkerLaunch::current_exe().context("locating the queuectl executable")?;
    let supervisor = Supervisor::new(open(home)?).with_launch(launch);

    for worker in supervisor.start(count, poll_interval).await? {
        match worker.pid {
            Some(pid) => println!("{} pid={pid}", worker.id),
            None => println!("{}", worker.id),
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn stop(home: &Path) -> anyhow::Result<ExitCode> {
    let stopped = Supervisor::new(open(home)?).stop().await?;
    println!("stopped {}", stopped.len());
    Ok(ExitCode::SUCCESS)
}

/// Foreground worker. Also the entry point of workers spawned by `start`,
/// which arrive with `QUEUECTL_WORKER_ID` set.
pub async fn run(
    home: &Path,
    poll_interval: Option<u64>,
    worker_id: Option<String>,
) -> anyhow::Result<ExitCode> {
    let registration = match worker_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => Registration::Attach(WorkerId::new(id)),
        None => Registration::SelfRegister(WorkerId::from_pid()),
    };

    let stats = run_worker(
        open(home)?,
        Arc::new(ShellExecutor::new()),
        registration,
        poll_interval,
        shutdown_signal(),
    )
    .await?;

    info!(
        claimed = stats.claimed,
        completed = stats.completed,
        dead = stats.dead,
        "worker exited"
    );
    Ok(ExitCode::SUCCESS)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
