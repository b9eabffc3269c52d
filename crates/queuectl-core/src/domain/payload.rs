//! Job payloads and enqueue input resolution.
//!
//! Input is resolved once, at enqueue time, into a [`JobPayload`]. Everything
//! downstream (store, worker loop, executor) only ever sees the resolved value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a job runs.
///
/// Persisted as JSON: a raw command is a JSON string, a structured job is the
/// caller's object kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobPayload {
    RawCommand(String),
    Structured(StructuredJob),
}

/// A structured job object. `command` is required; every other field is kept
/// as the caller sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredJob {
    pub command: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("job input is empty")]
    Empty,

    #[error("job object must carry a non-empty string `command`")]
    MissingCommand,

    #[error("job JSON must be an object or a string, got {0}")]
    UnsupportedJson(&'static str),

    #[error("invalid run_at `{0}` (expected RFC 3339, e.g. 2026-01-01T12:00:00Z)")]
    InvalidRunAt(String),

    #[error("invalid max_retries `{0}` (expected a non-negative integer)")]
    InvalidMaxRetries(String),
}

impl JobPayload {
    /// Resolve user input.
    ///
    /// Input that is not JSON at all is taken as a literal command line, so
    /// `queuectl enqueue 'echo hi'` works without quoting gymnastics.
    pub fn parse(input: &str) -> Result<Self, PayloadError> {
        if input.trim().is_empty() {
            return Err(PayloadError::Empty);
        }

        let value = match serde_json::from_str::<Value>(input) {
            Ok(value) => value,
            Err(_) => return Ok(JobPayload::RawCommand(input.to_string())),
        };

        match value {
            Value::String(command) if !command.trim().is_empty() => {
                Ok(JobPayload::RawCommand(command))
            }
            Value::String(_) => Err(PayloadError::Empty),
            Value::Object(mut fields) => {
                let command = match fields.remove("command") {
                    Some(Value::String(command)) if !command.trim().is_empty() => command,
                    _ => return Err(PayloadError::MissingCommand),
                };
                Ok(JobPayload::Structured(StructuredJob { command, fields }))
            }
            Value::Null => Err(PayloadError::UnsupportedJson("null")),
            Value::Bool(_) => Err(PayloadError::UnsupportedJson("a boolean")),
            Value::Number(_) => Err(PayloadError::UnsupportedJson("a number")),
            Value::Array(_) => Err(PayloadError::UnsupportedJson("an array")),
        }
    }

    pub fn command(&self) -> &str {
        match self {
            JobPayload::RawCommand(command) => command,
            JobPayload::Structured(job) => &job.command,
        }
    }

    /// Scheduled time carried inside a structured payload.
    pub fn run_at(&self) -> Result<Option<DateTime<Utc>>, PayloadError> {
        let JobPayload::Structured(job) = self else {
            return Ok(None);
        };
        match job.fields.get("run_at") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => parse_run_at(raw).map(Some),
            Some(other) => Err(PayloadError::InvalidRunAt(other.to_string())),
        }
    }

    /// Retry ceiling override carried inside a structured payload.
    pub fn max_retries(&self) -> Result<Option<u32>, PayloadError> {
        let JobPayload::Structured(job) = self else {
            return Ok(None);
        };
        match job.fields.get("max_retries") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| PayloadError::InvalidMaxRetries(value.to_string())),
        }
    }
}

pub fn parse_run_at(raw: &str) -> Result<DateTime<Utc>, PayloadError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PayloadError::InvalidRunAt(raw.to_string()))
}

/// A fully resolved enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub payload: JobPayload,
    pub run_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            run_at: None,
            max_retries: None,
        }
    }

    /// Resolve raw input plus optional caller overrides. Explicit arguments win
    /// over fields found inside a structured payload.
    pub fn from_input(
        input: &str,
        run_at: Option<DateTime<Utc>>,
        max_retries: Option<u32>,
    ) -> Result<Self, PayloadError> {
        let payload = JobPayload::parse(input)?;
        let run_at = match run_at {
            Some(at) => Some(at),
            None => payload.run_at()?,
        };
        let max_retries = match max_retries {
            Some(n) => Some(n),
            None => payload.max_retries()?,
        };
        Ok(Self {
            payload,
            run_at,
            max_retries,
        })
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
