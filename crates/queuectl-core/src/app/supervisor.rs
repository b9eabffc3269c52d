//! Supervisor - ワーカープロセスの起動・停止・登録管理
//!
//! # 方針
//! - ワーカーは独立した OS プロセス。調整はすべて SQLite 経由
//! - registry の行が「生存報告」と「停止シグナル」を兼ねる
//!   - `start`: 先に行を登録してから子プロセスを起動（起動直後の stop と競合しないように）
//!   - `stop`: 行を消すだけ。各ワーカーの heartbeat タスクが行の消失に気づいて
//!     shutdown を立て、実行中のジョブを終えてから抜ける
//! - フォアグラウンド実行は自分の pid で自己登録する（Ctrl-C でも止まる）

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::worker_loop::{WorkerLoop, WorkerStats};
use crate::config::{HOME_ENV, POLL_ENV, WORKER_ID_ENV};
use crate::domain::WorkerId;
use crate::error::QueueError;
use crate::observability::StatusReport;
use crate::ports::CommandExecutor;
use crate::queue::JobQueue;
use crate::store::{StoreError, WorkerEntry};

const LOG_DIR: &str = "logs";

/// Floor for the idle sleep between empty polls.
const MIN_POLL_MS: u64 = 10;

/// Floor for the registry heartbeat period.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// How to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerLaunch {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-invoke the running binary as `<exe> worker run`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, ["worker", "run"]))
    }
}

pub struct Supervisor {
    queue: JobQueue,
    /// `None` = resolve [`WorkerLaunch::current_exe`] at `start`.
    launch: Option<WorkerLaunch>,
}

impl Supervisor {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue, launch: None }
    }

    pub fn with_launch(mut self, launch: WorkerLaunch) -> Self {
        self.launch = Some(launch);
        self
    }

    /// Spawn `count` background worker processes.
    ///
    /// `poll_interval_ms` of `None` uses the stored config value. Returns the
    /// registry entries of the spawned workers.
    pub async fn start(
        &self,
        count: usize,
        poll_interval_ms: Option<u64>,
    ) -> Result<Vec<WorkerEntry>, QueueError> {
        let launch = match &self.launch {
            Some(launch) => launch.clone(),
            None => WorkerLaunch::current_exe()?,
        };
        let poll = match poll_interval_ms {
            Some(ms) => ms,
            None => self.queue.config().await?.poll_interval_ms,
        }
        .max(MIN_POLL_MS);

        let pruned = self.queue.prune_stale_workers().await?;
        if pruned > 0 {
            debug!(pruned, "removed stale worker entries");
        }

        let log_dir = self.queue.home().join(LOG_DIR);
        std::fs::create_dir_all(&log_dir)?;

        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            let id = WorkerId::generate();
            let mut entry = WorkerEntry::new(id.clone(), None, poll, self.queue.now());
            self.queue.register_worker(entry.clone()).await?;

            let pid = match self.spawn_child(&launch, &id, poll, &log_dir) {
                Ok(pid) => pid,
                Err(err) => {
                    self.queue.deregister_worker(&id).await?;
                    return Err(err.into());
                }
            };
            if let Some(pid) = pid {
                self.queue.attach_worker(&id, pid).await?;
            }
            entry.pid = pid;

            info!(worker_id = %id, pid = ?pid, poll_interval_ms = poll, "worker spawned");
            started.push(entry);
        }
        Ok(started)
    }

    fn spawn_child(
        &self,
        launch: &WorkerLaunch,
        id: &WorkerId,
        poll: u64,
        log_dir: &std::path::Path,
    ) -> std::io::Result<Option<u32>> {
        let log_path = log_dir.join(format!("{id}.log"));
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let child = tokio::process::Command::new(&launch.program)
            .args(&launch.args)
            .env(HOME_ENV, self.queue.home())
            .env(WORKER_ID_ENV, id.as_str())
            .env(POLL_ENV, poll.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()?;
        // 子は待たない（detach）。終了したら registry から自分で抜ける
        Ok(child.id())
    }

    /// Ask every registered worker to stop after its current job.
    ///
    /// Returns the entries that were signalled. Does not wait for exit.
    pub async fn stop(&self) -> Result<Vec<WorkerEntry>, QueueError> {
        let removed = self.queue.clear_workers().await?;
        for entry in &removed {
            info!(worker_id = %entry.id, pid = ?entry.pid, "stop requested");
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Result<StatusReport, QueueError> {
        self.queue.status().await
    }
}

/// How a worker process relates to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Foreground run: register under this id, replacing a stale row.
    SelfRegister(WorkerId),

    /// Spawned by `Supervisor::start`: the row must already exist.
    Attach(WorkerId),
}

impl Registration {
    pub fn worker_id(&self) -> &WorkerId {
        match self {
            Registration::SelfRegister(id) | Registration::Attach(id) => id,
        }
    }
}

/// Run one worker loop in this process until stopped.
///
/// Stops when the registry row disappears (`queuectl worker stop`), when
/// `interrupt` resolves (Ctrl-C), or on a store error. The row is removed on
/// the way out.
pub async fn run_worker<F>(
    queue: JobQueue,
    executor: Arc<dyn CommandExecutor>,
    registration: Registration,
    poll_interval_ms: Option<u64>,
    interrupt: F,
) -> Result<WorkerStats, QueueError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let poll = match poll_interval_ms {
        Some(ms) => ms,
        None => queue.config().await?.poll_interval_ms,
    }
    .max(MIN_POLL_MS);
    let id = registration.worker_id().clone();
    let pid = std::process::id();

    match &registration {
        Registration::Attach(id) => {
            if !queue.attach_worker(id, pid).await? {
                info!(worker_id = %id, "no registry entry (already stopped), exiting");
                return Ok(WorkerStats::default());
            }
        }
        Registration::SelfRegister(id) => {
            let entry = WorkerEntry::new(id.clone(), Some(pid), poll, queue.now());
            match queue.register_worker(entry.clone()).await {
                Ok(()) => {}
                Err(QueueError::Store(StoreError::Conflict(_))) => {
                    warn!(worker_id = %id, "replacing existing registry entry");
                    queue.deregister_worker(id).await?;
                    queue.register_worker(entry).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let heartbeat = tokio::spawn(heartbeat_task(
        queue.clone(),
        id.clone(),
        heartbeat_period(poll),
        Arc::clone(&shutdown_tx),
        shutdown_rx.clone(),
    ));

    let interrupt_tx = Arc::clone(&shutdown_tx);
    let interrupt_id = id.clone();
    let interrupter = tokio::spawn(async move {
        interrupt.await;
        info!(worker_id = %interrupt_id, "interrupt received, finishing current job");
        let _ = interrupt_tx.send(true);
    });

    let worker = WorkerLoop::new(id.clone(), queue.clone(), executor)
        .with_poll_interval(Duration::from_millis(poll));
    let result = worker.run(shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    interrupter.abort();
    if let Err(err) = heartbeat.await {
        debug!(worker_id = %id, error = %err, "heartbeat task ended abnormally");
    }

    if let Err(err) = queue.deregister_worker(&id).await {
        warn!(worker_id = %id, error = %err, "failed to remove registry entry");
    }
    result
}

/// Refresh the registry row every `every`. A missing row is the stop signal.
fn heartbeat_period(poll_ms: u64) -> Duration {
    Duration::from_millis(poll_ms).max(MIN_HEARTBEAT)
}

async fn heartbeat_task(
    queue: JobQueue,
    id: WorkerId,
    every: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        }

        match queue.heartbeat(&id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(worker_id = %id, "registry entry removed, stopping");
                let _ = shutdown_tx.send(true);
                return;
            }
            // transient (e.g. database busy): try again next tick
            Err(err) => warn!(worker_id = %id, error = %err, "heartbeat failed"),
        }
    }
}
