//! Outcome model: the result of running a job's command once.
//!
//! An execution failure is a value, not an error. It drives the retry/DLQ
//! transition and is never thrown back to whoever enqueued the job.

use serde::{Deserialize, Serialize};

/// Longest `last_error` kept in the store.
pub const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,

    /// Exit code when the process ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            exit_code: Some(0),
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            exit_code: None,
            reason: Some(truncate(reason.into())),
        }
    }

    /// Non-zero exit. `stderr` is folded into the reason when present.
    pub fn exited(code: i32, stderr: &str) -> Self {
        let stderr = stderr.trim();
        let reason = if stderr.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {stderr}")
        };
        Self {
            kind: OutcomeKind::Failure,
            exit_code: Some(code),
            reason: Some(truncate(reason)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    /// Text recorded as `last_error`.
    pub fn error_text(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "execution failed".to_string())
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_folds_stderr_into_reason() {
        let o = ExecutionOutcome::exited(2, "no such file\n");
        assert!(!o.is_success());
        assert_eq!(o.exit_code, Some(2));
        assert_eq!(o.error_text(), "exit code 2: no such file");
    }

    #[test]
    fn exited_without_stderr() {
        assert_eq!(ExecutionOutcome::exited(1, "").error_text(), "exit code 1");
    }

    #[test]
    fn long_reasons_are_truncated_on_char_boundary() {
        let o = ExecutionOutcome::failure("é".repeat(MAX_ERROR_LEN));
        let reason = o.reason.unwrap();
        assert!(reason.len() <= MAX_ERROR_LEN);
        assert!(reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn kind_serializes_as_screaming_snake() {
        let s = serde_json::to_string(&OutcomeKind::Failure).unwrap();
        assert_eq!(s, "\"FAILURE\"");
    }
}
