//! CommandExecutor port - ジョブの外部コマンド実行
//!
//! 実行結果は常に `ExecutionOutcome` として返します（Err は返さない）。
//! 起動失敗・非ゼロ終了・タイムアウトはすべて Failure として記録され、
//! retry/DLQ の判定に使われます。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ExecutionOutcome, JobRecord};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the job's command to completion.
    ///
    /// `timeout` of `None` waits forever; a hung command then holds its
    /// claim until it exits.
    async fn execute(&self, job: &JobRecord, timeout: Option<Duration>) -> ExecutionOutcome;
}
