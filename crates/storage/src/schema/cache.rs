#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS cache_entries (
          key TEXT PRIMARY KEY,
          value_json TEXT NOT NULL,
          expires_at_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS cache_locks (
          key TEXT PRIMARY KEY,
          token TEXT NOT NULL,
          expires_at_ms INTEGER NOT NULL
        );
"#;
