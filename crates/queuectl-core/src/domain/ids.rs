//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! Job ID は ULID (Universally Unique Lexicographically Sortable Identifier) を使用します。
//!
//! - **時刻でソート可能**: `job-<ULID>` の文字列表現のままソートしても生成順になる
//! - **分散生成可能**: 複数のワーカープロセスが調整なしで生成できる
//!
//! Phantom type パターン（`Id<T>`）で共通実装を提供し、
//! マーカー型 `T` で ID の種類を区別します。
//!
//! Worker の識別子は ULID とは限らない（pid や外部から与えられた論理 ID）ので、
//! 文字列の newtype `WorkerId` として別に定義しています。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display / FromStr で使うプレフィックス（"job-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// 文字列表現は `{prefix}{ULID}`。永続化・JSON 出力ともにこの形を使います。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a string is not a valid `{prefix}{ULID}` identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id `{0}`")]
pub struct ParseIdError(pub String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let body = raw.strip_prefix(T::prefix()).unwrap_or(raw);
        Ulid::from_string(body)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Job のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Identifier of a queued job.
pub type JobId = Id<Job>;

/// Identity of a worker holding (or having held) a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Identity of the current OS process (foreground mode).
    pub fn from_pid() -> Self {
        Self(std::process::id().to_string())
    }

    /// Logical identity handed out by the supervisor for spawned workers.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_display_has_prefix() {
        let id = JobId::from_ulid(Ulid::new());
        assert!(id.to_string().starts_with("job-"));
    }

    #[test]
    fn job_id_parses_with_and_without_prefix() {
        let ulid = Ulid::new();
        let id = JobId::from_ulid(ulid);

        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: JobId = ulid.to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("job-not-a-ulid".parse::<JobId>().is_err());
        assert!("".parse::<JobId>().is_err());
    }

    #[test]
    fn ulid_ids_sort_as_strings() {
        // 文字列のまま ORDER BY しても生成順になることを確認
        let id1 = JobId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id1.to_string() < id2.to_string());
    }

    #[test]
    fn job_id_serializes_as_display_string() {
        let id = JobId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<JobId>(), std::mem::size_of::<Ulid>());
    }
}
