//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **ShellExecutor**: `sh -c`（Windows では `cmd /C`）でジョブのコマンドを実行

pub mod shell;

pub use self::shell::ShellExecutor;
