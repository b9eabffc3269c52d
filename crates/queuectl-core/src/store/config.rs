use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{SqliteStore, StoreError, ms};
use crate::config::{ConfigKey, QueueConfig};

impl SqliteStore {
    pub fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Upsert a raw value. Validation is the caller's concern.
    pub fn config_set(&mut self, key: &str, value: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO config(key, value, updated_at_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
            params![key, value, ms(now)],
        )?;
        Ok(())
    }

    /// Every stored entry, sorted by key.
    pub fn config_entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM config ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Typed snapshot of the recognized keys, defaults filled in.
    pub fn load_config(&self) -> Result<QueueConfig, StoreError> {
        let entries = self.config_entries()?;
        Ok(QueueConfig::from_lookup(|key: ConfigKey| {
            entries
                .iter()
                .find(|(k, _)| k == key.as_str())
                .map(|(_, v)| v.clone())
        }))
    }
}
