#![forbid(unsafe_code)]

use crate::StoreError;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::time::Duration;

pub(crate) const DB_FILE_NAME: &str = "quarry.db";

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn next_counter_tx(
    tx: &Transaction<'_>,
    scope: &str,
    name: &str,
) -> Result<i64, StoreError> {
    let current: i64 = tx
        .query_row(
            "SELECT value FROM counters WHERE scope=?1 AND name=?2",
            params![scope, name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    let next = current + 1;
    tx.execute(
        r#"
        INSERT INTO counters(scope, name, value) VALUES (?1, ?2, ?3)
        ON CONFLICT(scope, name) DO UPDATE SET value=excluded.value
        "#,
        params![scope, name, next],
    )?;
    Ok(next)
}

pub(crate) fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}
