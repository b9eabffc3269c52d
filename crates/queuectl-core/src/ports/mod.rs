//! Ports - 抽象化レイヤー
//!
//! エンジンが外部（時刻、ID 生成、外部コマンド）に依存する箇所を trait で切り出します。
//! 永続化は SQLite の `SqliteStore` が正本（source of truth）なので trait にはしていません。

pub mod clock;
pub mod executor;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::CommandExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
