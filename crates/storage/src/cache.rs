#![forbid(unsafe_code)]

use crate::StoreError;
use crate::schema::install_schema;
use crate::support::{DB_FILE_NAME, open_connection};
use quarry_core::clock::{duration_ms, now_ms};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// TTL key-value store shared by every process of a deployment, plus the lock rows behind
/// single-flight execution.
pub trait CacheDriver: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// `expiration` of `None` keeps the value until it is removed.
    fn set(&self, key: &str, value: &Value, expiration: Option<Duration>)
    -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    fn keys_starting_with(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Drops expired values and locks.
    fn cleanup(&self) -> Result<usize, StoreError>;

    /// Set-if-absent with TTL. An expired lock counts as absent.
    fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        expiration: Duration,
    ) -> Result<bool, StoreError>;

    /// Releases the lock only if `token` still owns it.
    fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}

#[derive(Debug)]
pub struct SqliteCacheDriver {
    conn: Mutex<Connection>,
}

impl SqliteCacheDriver {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref();
        std::fs::create_dir_all(storage_dir)?;
        let conn = open_connection(&storage_dir.join(DB_FILE_NAME))?;
        install_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CacheDriver for SqliteCacheDriver {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value_json FROM cache_entries \
                 WHERE key=?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set(
        &self,
        key: &str,
        value: &Value,
        expiration: Option<Duration>,
    ) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(value)?;
        let expires_at_ms = expiration.map(|ttl| now_ms().saturating_add(duration_ms(ttl)));
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cache_entries(key, value_json, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              value_json=excluded.value_json,
              expires_at_ms=excluded.expires_at_ms
            "#,
            params![key, value_json, expires_at_ms],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM cache_entries WHERE key=?1", params![key])?;
        Ok(removed == 1)
    }

    fn keys_starting_with(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM cache_entries \
             WHERE substr(key, 1, length(?1))=?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2) \
             ORDER BY key ASC",
        )?;
        let mut rows = stmt.query(params![prefix, now_ms()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    fn cleanup(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let conn = self.conn()?;
        let values = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now],
        )?;
        let locks = conn.execute(
            "DELETE FROM cache_locks WHERE expires_at_ms <= ?1",
            params![now],
        )?;
        Ok(values + locks)
    }

    fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        expiration: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            INSERT INTO cache_locks(key, token, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              token=excluded.token,
              expires_at_ms=excluded.expires_at_ms
            WHERE cache_locks.expires_at_ms <= ?4
            "#,
            params![key, token, now.saturating_add(duration_ms(expiration)), now],
        )?;
        Ok(changed == 1)
    }

    fn release_lock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let released = conn.execute(
            "DELETE FROM cache_locks WHERE key=?1 AND token=?2",
            params![key, token],
        )?;
        Ok(released == 1)
    }
}
