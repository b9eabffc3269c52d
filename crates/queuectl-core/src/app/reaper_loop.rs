//! ReaperLoop - 持ち主のいなくなった processing ジョブの回収
//!
//! `lease_timeout_ms > 0` のときだけ動きます（デフォルトは off）。
//! 回収は「失敗した 1 attempt」として扱い、通常の retry/DLQ 判定に流します。
//! 専用のタスクは持たず、WorkerLoop が空振りした poll のついでに `sweep` を呼びます。

use std::time::Duration;

use tracing::warn;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct ReaperLoop {
    queue: JobQueue,
}

impl ReaperLoop {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Run one pass if the lease is enabled. Returns how many jobs were released.
    pub async fn sweep(&self, config: &QueueConfig) -> Result<usize, QueueError> {
        if config.lease_timeout_ms == 0 {
            return Ok(0);
        }
        let reaped = self
            .queue
            .reap_orphans(Duration::from_millis(config.lease_timeout_ms))
            .await?;
        if !reaped.is_empty() {
            warn!(
                count = reaped.len(),
                lease_timeout_ms = config.lease_timeout_ms,
                "released jobs held by unresponsive workers"
            );
        }
        Ok(reaped.len())
    }
}
