//! App - アプリケーション層
//!
//! queue（ストア操作）と ports（外部コマンド実行）を組み合わせて、
//! ワーカーの実行ループとプロセス管理を実装します。
//!
//! # 主要コンポーネント
//! - **WorkerLoop**: ジョブ実行ループ（claim→execute→record→sleep）
//! - **ReaperLoop**: 持ち主のいない processing ジョブの回収（opt-in）
//! - **Supervisor**: ワーカープロセスの起動・停止と registry 管理

pub mod reaper_loop;
pub mod supervisor;
pub mod worker_loop;

pub use self::reaper_loop::ReaperLoop;
pub use self::supervisor::{Registration, Supervisor, WorkerLaunch, run_worker};
pub use self::worker_loop::{WorkerLoop, WorkerStats};
