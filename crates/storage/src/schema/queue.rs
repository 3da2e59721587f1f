#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS queue_entries (
          queue TEXT NOT NULL,
          hash TEXT NOT NULL,
          stage TEXT NOT NULL CHECK (stage IN ('PENDING', 'ACTIVE')),
          score INTEGER NOT NULL,
          def_json TEXT NOT NULL,
          persistent INTEGER NOT NULL DEFAULT 0,
          added_at_ms INTEGER NOT NULL,
          orphaned_timeout_ms INTEGER NOT NULL,
          orphaned_at_ms INTEGER NOT NULL,
          processing_id INTEGER,
          heartbeat_at_ms INTEGER,
          activated_at_ms INTEGER,
          stall_count INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (queue, hash)
        );

        CREATE INDEX IF NOT EXISTS idx_queue_entries_stage_score
          ON queue_entries(queue, stage, score);

        CREATE TABLE IF NOT EXISTS queue_results (
          queue TEXT NOT NULL,
          hash TEXT NOT NULL,
          result_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          expires_at_ms INTEGER NOT NULL,
          PRIMARY KEY (queue, hash)
        );
"#;
