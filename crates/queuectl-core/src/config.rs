//! Engine configuration.
//!
//! Values live as strings in the store's `config` table. Reads fall back to the
//! built-in defaults below whenever a key has never been set.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Environment variable that relocates the queue home (isolated test runs).
pub const HOME_ENV: &str = "QUEUECTL_HOME";

/// Environment variable carrying the identity the supervisor assigned.
pub const WORKER_ID_ENV: &str = "QUEUECTL_WORKER_ID";

/// Environment variable overriding the poll interval of a worker process.
pub const POLL_ENV: &str = "QUEUECTL_POLL";

const HOME_DIR_NAME: &str = ".queuectl";

/// Recognized configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    PollIntervalMs,
    MaxRetries,
    BackoffBaseMs,
    BackoffMultiplier,
    JobTimeoutMs,
    LeaseTimeoutMs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::PollIntervalMs,
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBaseMs,
        ConfigKey::BackoffMultiplier,
        ConfigKey::JobTimeoutMs,
        ConfigKey::LeaseTimeoutMs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::PollIntervalMs => "poll_interval_ms",
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBaseMs => "backoff_base_ms",
            ConfigKey::BackoffMultiplier => "backoff_multiplier",
            ConfigKey::JobTimeoutMs => "job_timeout_ms",
            ConfigKey::LeaseTimeoutMs => "lease_timeout_ms",
        }
    }

    pub fn default_value(self) -> u64 {
        match self {
            ConfigKey::PollIntervalMs => 500,
            ConfigKey::MaxRetries => 3,
            ConfigKey::BackoffBaseMs => 1000,
            ConfigKey::BackoffMultiplier => 2,
            // 0 = disabled
            ConfigKey::JobTimeoutMs => 0,
            ConfigKey::LeaseTimeoutMs => 0,
        }
    }

    fn max_value(self) -> u64 {
        match self {
            ConfigKey::MaxRetries | ConfigKey::BackoffMultiplier => u64::from(u32::MAX),
            _ => i64::MAX as u64,
        }
    }

    /// Normalize a value for storage, rejecting anything that is not a
    /// non-negative integer in range.
    pub fn validate(self, raw: &str) -> Result<String, ConfigError> {
        let parsed = raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n <= self.max_value())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: self.as_str(),
                value: raw.to_string(),
            })?;
        let zero_forbidden = matches!(self, ConfigKey::BackoffMultiplier | ConfigKey::PollIntervalMs);
        if zero_forbidden && parsed == 0 {
            return Err(ConfigError::InvalidValue {
                key: self.as_str(),
                value: raw.to_string(),
            });
        }
        Ok(parsed.to_string())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown config key `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}` (expected a non-negative integer)")]
    InvalidValue { key: &'static str, value: String },

    #[error("config key must not be empty")]
    EmptyKey,
}

/// Typed snapshot of the recognized keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
    pub job_timeout_ms: u64,
    pub lease_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: ConfigKey::PollIntervalMs.default_value(),
            max_retries: ConfigKey::MaxRetries.default_value() as u32,
            backoff_base_ms: ConfigKey::BackoffBaseMs.default_value(),
            backoff_multiplier: ConfigKey::BackoffMultiplier.default_value() as u32,
            job_timeout_ms: ConfigKey::JobTimeoutMs.default_value(),
            lease_timeout_ms: ConfigKey::LeaseTimeoutMs.default_value(),
        }
    }
}

impl QueueConfig {
    /// Build a snapshot from stored entries. Values that fail validation are
    /// logged and replaced by the default.
    pub fn from_lookup<F>(mut lookup: F) -> Self
    where
        F: FnMut(ConfigKey) -> Option<String>,
    {
        let mut read = |key: ConfigKey| -> u64 {
            match lookup(key) {
                None => key.default_value(),
                Some(raw) => match key.validate(&raw) {
                    Ok(valid) => valid.parse().unwrap_or(key.default_value()),
                    Err(err) => {
                        warn!(key = %key, error = %err, "ignoring stored config value");
                        key.default_value()
                    }
                },
            }
        };

        Self {
            poll_interval_ms: read(ConfigKey::PollIntervalMs),
            max_retries: read(ConfigKey::MaxRetries) as u32,
            backoff_base_ms: read(ConfigKey::BackoffBaseMs),
            backoff_multiplier: read(ConfigKey::BackoffMultiplier) as u32,
            job_timeout_ms: read(ConfigKey::JobTimeoutMs),
            lease_timeout_ms: read(ConfigKey::LeaseTimeoutMs),
        }
    }
}

/// Resolve the queue home: `$QUEUECTL_HOME`, else `~/.queuectl`, else
/// `./.queuectl` when no home directory is known.
pub fn queue_home() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(HOME_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(HOME_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backoff_base_ms, 1000);
        assert_eq!(cfg.backoff_multiplier, 2);
        assert_eq!(cfg.job_timeout_ms, 0);
        assert_eq!(cfg.lease_timeout_ms, 0);
    }

    #[test]
    fn keys_round_trip_through_names() {
        for key in ConfigKey::ALL {
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), key);
        }
        assert!("poll_interval".parse::<ConfigKey>().is_err());
    }

    #[rstest]
    #[case(ConfigKey::PollIntervalMs, " 250 ", "250")]
    #[case(ConfigKey::MaxRetries, "0", "0")]
    #[case(ConfigKey::BackoffMultiplier, "3", "3")]
    fn validate_normalizes(#[case] key: ConfigKey, #[case] raw: &str, #[case] expected: &str) {
        assert_eq!(key.validate(raw).unwrap(), expected);
    }

    #[rstest]
    #[case(ConfigKey::PollIntervalMs, "-1")]
    #[case(ConfigKey::MaxRetries, "three")]
    #[case(ConfigKey::MaxRetries, "4294967296")]
    #[case(ConfigKey::BackoffBaseMs, "1.5")]
    #[case(ConfigKey::BackoffMultiplier, "0")]
    #[case(ConfigKey::PollIntervalMs, "0")]
    fn validate_rejects(#[case] key: ConfigKey, #[case] raw: &str) {
        assert!(key.validate(raw).is_err());
    }

    #[test]
    fn snapshot_reads_stored_values_and_ignores_garbage() {
        let stored: HashMap<&str, &str> =
            HashMap::from([("poll_interval_ms", "250"), ("max_retries", "nope")]);
        let cfg = QueueConfig::from_lookup(|key| stored.get(key.as_str()).map(|v| v.to_string()));
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backoff_base_ms, 1000);
    }
}
