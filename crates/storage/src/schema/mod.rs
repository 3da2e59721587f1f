#![forbid(unsafe_code)]

mod cache;
mod counters;
mod queue;

use crate::StoreError;
use rusqlite::Connection;

const PRAGMAS: &str = r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
"#;

fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(queue::SQL);
    sql.push_str(counters::SQL);
    sql.push_str(cache::SQL);
    sql
}

pub(crate) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(&full_schema_sql())?;
    Ok(())
}
