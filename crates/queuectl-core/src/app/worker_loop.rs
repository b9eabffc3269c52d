//! WorkerLoop - ジョブ実行ループ
//!
//! # フロー（1 iteration）
//! 1. shutdown が来ていたら抜ける
//! 2. `claim_next` でジョブを 1 件確保
//!    - なければ（lease が有効なら reaper を回して）poll interval だけ待つ
//! 3. 外部コマンドを実行 → `ExecutionOutcome`
//! 4. `record_outcome` で completed / pending(backoff) / dead に遷移
//! 5. すぐ 1 に戻る（backlog を早く捌くため、処理した直後は sleep しない）
//!
//! # 停止
//! - shutdown は iteration の間でだけ見る。実行中のコマンドは中断しない
//! - 実行失敗（ExecutionFailure）ではループは止まらない
//! - ストアのエラーだけが `Err` でループを終わらせる

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::reaper_loop::ReaperLoop;
use crate::config::QueueConfig;
use crate::domain::{JobRecord, JobState, WorkerId};
use crate::error::QueueError;
use crate::ports::CommandExecutor;
use crate::queue::JobQueue;
use crate::store::StoreError;

/// Counters for one loop's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
}

pub struct WorkerLoop {
    id: WorkerId,
    queue: JobQueue,
    executor: Arc<dyn CommandExecutor>,
    reaper: ReaperLoop,

    /// `None` follows `poll_interval_ms` from the stored config.
    poll_interval: Option<Duration>,
}

impl WorkerLoop {
    pub fn new(id: WorkerId, queue: JobQueue, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            id,
            reaper: ReaperLoop::new(queue.clone()),
            queue,
            executor,
            poll_interval: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, QueueError> {
        info!(worker_id = %self.id, poll_interval = ?self.poll_interval, "worker started");
        let mut stats = WorkerStats::default();

        let result = loop {
            if *shutdown.borrow() {
                break Ok(stats);
            }

            // config は毎回読み直す（`config set` を再起動なしで反映するため）
            let config = match self.queue.config().await {
                Ok(config) => config,
                Err(err) => break Err(err),
            };

            match self.queue.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    if let Err(err) = self.process(job, &config, &mut stats).await {
                        break Err(err);
                    }
                }
                Ok(None) => {
                    if let Err(err) = self.reaper.sweep(&config).await {
                        break Err(err);
                    }
                    let wait = self
                        .poll_interval
                        .unwrap_or(Duration::from_millis(config.poll_interval_ms));
                    if !idle(wait, &mut shutdown).await {
                        break Ok(stats);
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match &result {
            Ok(stats) => info!(
                worker_id = %self.id,
                claimed = stats.claimed,
                completed = stats.completed,
                retried = stats.retried,
                dead = stats.dead,
                "worker stopped"
            ),
            Err(err) => warn!(worker_id = %self.id, error = %err, "worker stopped on store error"),
        }
        result
    }

    async fn process(
        &self,
        job: JobRecord,
        config: &QueueConfig,
        stats: &mut WorkerStats,
    ) -> Result<(), QueueError> {
        stats.claimed += 1;
        info!(worker_id = %self.id, job_id = %job.id, attempts = job.attempts, "job claimed");

        let timeout = (config.job_timeout_ms > 0).then(|| Duration::from_millis(config.job_timeout_ms));
        let outcome = self.executor.execute(&job, timeout).await;

        let recorded = match self.queue.record_outcome(&job, &self.id, &outcome).await {
            Ok(recorded) => recorded,
            // lock was taken from us (reaper); someone else owns the job now
            Err(QueueError::Store(StoreError::Conflict(reason))) => {
                warn!(worker_id = %self.id, job_id = %job.id, reason = %reason, "outcome discarded");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match recorded.state {
            JobState::Completed => {
                stats.completed += 1;
                info!(worker_id = %self.id, job_id = %recorded.id, "job completed");
            }
            JobState::Pending => {
                stats.retried += 1;
                warn!(
                    worker_id = %self.id,
                    job_id = %recorded.id,
                    attempts = recorded.attempts,
                    run_at = %recorded.run_at,
                    error = recorded.last_error.as_deref().unwrap_or_default(),
                    "job failed, retry scheduled"
                );
            }
            JobState::Dead => {
                stats.dead += 1;
                warn!(
                    worker_id = %self.id,
                    job_id = %recorded.id,
                    attempts = recorded.attempts,
                    error = recorded.last_error.as_deref().unwrap_or_default(),
                    "job moved to dead-letter queue"
                );
            }
            other => debug!(job_id = %recorded.id, state = %other, "unexpected state after outcome"),
        }
        Ok(())
    }
}

/// Sleep for `wait` unless shutdown arrives first. `false` means stop.
async fn idle(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
