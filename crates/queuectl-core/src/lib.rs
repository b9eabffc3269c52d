//! queuectl-core
//!
//! Single-node persistent job queue engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, payload, job, outcome, decision）
//! - **config**: 設定キーとデフォルト値、ホームディレクトリの解決
//! - **store**: SQLite ストア（jobs / config / workers テーブル、atomic claim）
//! - **queue**: エンジンの公開操作（`JobQueue`）と retry policy
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, CommandExecutor）
//! - **impls**: 実装（シェル経由のコマンド実行）
//! - **app**: ワーカーループ、reaper、ワーカープロセスの supervisor
//! - **observability**: status 用の集計ビュー

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod store;

pub use crate::error::QueueError;
pub use crate::queue::JobQueue;
