#![forbid(unsafe_code)]

use super::{
    AddToQueueRequest, CancelReason, QueueDriver, QueueDriverConnection, QueueDriverOptions,
};
use crate::StoreError;
use crate::schema::install_schema;
use crate::support::{DB_FILE_NAME, next_counter_tx, open_connection, to_usize};
use quarry_core::{
    AddedToQueue, ExecutionResult, ProcessingId, QueryDef, QueryKeyHash, QueueEntry,
    QueueStageState, QueueStatus, RetrieveOutcome, StallOutcome,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const STALLED_FAILURE_MESSAGE: &str = "Query stalled: retry budget exhausted";
const PROCESSING_ID_COUNTER: &str = "processing_id";

#[derive(Debug)]
pub struct SqliteQueueDriver {
    db_path: PathBuf,
    options: QueueDriverOptions,
}

impl SqliteQueueDriver {
    pub fn open(
        storage_dir: impl AsRef<Path>,
        options: QueueDriverOptions,
    ) -> Result<Self, StoreError> {
        if options.queue.trim().is_empty() {
            return Err(StoreError::InvalidInput("queue name must not be empty"));
        }
        if options.concurrency == 0 {
            return Err(StoreError::InvalidInput("concurrency must be at least 1"));
        }

        let storage_dir = storage_dir.as_ref();
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = open_connection(&db_path)?;
        install_schema(&conn)?;

        Ok(Self { db_path, options })
    }

    pub fn connect(&self) -> Result<SqliteQueueConnection, StoreError> {
        Ok(SqliteQueueConnection {
            conn: open_connection(&self.db_path)?,
            options: self.options.clone(),
        })
    }
}

impl QueueDriver for SqliteQueueDriver {
    fn options(&self) -> &QueueDriverOptions {
        &self.options
    }

    fn create_connection(&self) -> Result<Box<dyn QueueDriverConnection>, StoreError> {
        Ok(Box::new(self.connect()?))
    }
}

#[derive(Debug)]
pub struct SqliteQueueConnection {
    conn: Connection,
    options: QueueDriverOptions,
}

impl QueueDriverConnection for SqliteQueueConnection {
    fn add_to_queue(&mut self, request: AddToQueueRequest) -> Result<AddedToQueue, StoreError> {
        let queue = self.options.queue.as_str();
        let hash = request.query_key_hash.as_str();
        let def_json = serde_json::to_string(&request.def)?;
        let orphaned_at_ms = request.now_ms.saturating_add(request.orphaned_timeout_ms);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO queue_entries(queue, hash, stage, score, def_json, persistent, added_at_ms, \
             orphaned_timeout_ms, orphaned_at_ms) \
             VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(queue, hash) DO NOTHING",
            params![
                queue,
                hash,
                request.key_score,
                def_json,
                request.def.query_key.persistent,
                request.now_ms,
                request.orphaned_timeout_ms,
                orphaned_at_ms,
            ],
        )?;
        let added = inserted == 1;
        if added {
            tx.execute(
                "DELETE FROM queue_results WHERE queue=?1 AND hash=?2",
                params![queue, hash],
            )?;
        } else {
            // A repeated submission proves the requester is still around.
            tx.execute(
                "UPDATE queue_entries SET orphaned_at_ms=MAX(orphaned_at_ms, ?3) \
                 WHERE queue=?1 AND hash=?2",
                params![queue, hash, orphaned_at_ms],
            )?;
        }

        let added_to_queue_time: i64 = tx.query_row(
            "SELECT added_at_ms FROM queue_entries WHERE queue=?1 AND hash=?2",
            params![queue, hash],
            |row| row.get(0),
        )?;
        let queue_size = count_entries(&tx, queue, None)?;
        tx.commit()?;

        Ok(AddedToQueue {
            added,
            query_key_hash: request.query_key_hash,
            queue_size,
            added_to_queue_time,
        })
    }

    fn get_to_process_queries(&mut self) -> Result<Vec<QueryKeyHash>, StoreError> {
        hashes_in_stage(&self.conn, &self.options.queue, QueueStatus::Pending)
    }

    fn get_active_queries(&mut self) -> Result<Vec<QueryKeyHash>, StoreError> {
        hashes_in_stage(&self.conn, &self.options.queue, QueueStatus::Active)
    }

    fn get_queue_size(&mut self) -> Result<usize, StoreError> {
        count_entries(&self.conn, &self.options.queue, None)
    }

    fn retrieve_for_processing(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<RetrieveOutcome, StoreError> {
        let queue = self.options.queue.as_str();
        let concurrency = self.options.concurrency;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT stage, def_json FROM queue_entries WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let active = hashes_in_stage(&tx, queue, QueueStatus::Active)?;

        let claimable = matches!(
            row.as_ref(),
            Some((stage, _)) if QueueStatus::from_db(stage) == Some(QueueStatus::Pending)
        );
        if !claimable || active.len() >= concurrency {
            let pending = count_entries(&tx, queue, Some(QueueStatus::Pending))?;
            return Ok(RetrieveOutcome::not_acquired(active, pending));
        }

        let changed = tx.execute(
            "UPDATE queue_entries \
             SET stage='ACTIVE', processing_id=?3, heartbeat_at_ms=?4, activated_at_ms=?4 \
             WHERE queue=?1 AND hash=?2 AND stage='PENDING'",
            params![queue, hash.as_str(), processing_id.get(), now_ms],
        )?;
        if changed != 1 {
            let pending = count_entries(&tx, queue, Some(QueueStatus::Pending))?;
            return Ok(RetrieveOutcome::not_acquired(active, pending));
        }

        let def = match row {
            Some((_, def_json)) => Some(decode_def(&def_json)?),
            None => None,
        };
        let active = hashes_in_stage(&tx, queue, QueueStatus::Active)?;
        let pending_count = count_entries(&tx, queue, Some(QueueStatus::Pending))?;
        tx.commit()?;

        Ok(RetrieveOutcome {
            lock_acquired: true,
            active,
            pending_count,
            def,
        })
    }

    fn update_heart_beat(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE queue_entries SET heartbeat_at_ms=?4 \
             WHERE queue=?1 AND hash=?2 AND stage='ACTIVE' AND processing_id=?3",
            params![
                self.options.queue,
                hash.as_str(),
                processing_id.get(),
                now_ms
            ],
        )?;
        Ok(changed == 1)
    }

    fn optimistic_query_update(
        &mut self,
        hash: &QueryKeyHash,
        patch: &Map<String, Value>,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<i64>)> = tx
            .query_row(
                "SELECT def_json, processing_id FROM queue_entries WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((def_json, holder)) = row else {
            return Ok(false);
        };
        if holder != Some(processing_id.get()) {
            return Ok(false);
        }

        let mut def: Value = serde_json::from_str(&def_json)?;
        let Some(fields) = def.as_object_mut() else {
            return Err(StoreError::InvalidInput("stored query def is not an object"));
        };
        for (name, value) in patch {
            fields.insert(name.clone(), value.clone());
        }
        let merged: QueryDef = serde_json::from_value(def)?;
        let merged_json = serde_json::to_string(&merged)?;

        tx.execute(
            "UPDATE queue_entries SET def_json=?4 \
             WHERE queue=?1 AND hash=?2 AND processing_id=?3",
            params![queue, hash.as_str(), processing_id.get(), merged_json],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn cancel_query(&mut self, hash: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let def_json: Option<String> = tx
            .query_row(
                "SELECT def_json FROM queue_entries \
                 WHERE queue=?1 AND hash=?2 AND stage='PENDING'",
                params![queue, hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(def_json) = def_json else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM queue_entries WHERE queue=?1 AND hash=?2 AND stage='PENDING'",
            params![queue, hash.as_str()],
        )?;
        tx.commit()?;
        Ok(Some(decode_def(&def_json)?))
    }

    fn set_result_and_remove_query(
        &mut self,
        hash: &QueryKeyHash,
        result: &ExecutionResult,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let queue = self.options.queue.as_str();
        let result_ttl_ms = self.options.result_ttl_ms;
        let result_json = serde_json::to_string(result)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM queue_entries \
             WHERE queue=?1 AND hash=?2 AND stage='ACTIVE' AND processing_id=?3",
            params![queue, hash.as_str(), processing_id.get()],
        )?;
        if removed != 1 {
            return Ok(false);
        }
        upsert_result_tx(&tx, queue, hash, &result_json, now_ms, result_ttl_ms)?;
        tx.commit()?;
        Ok(true)
    }

    fn get_query_and_remove(
        &mut self,
        hash: &QueryKeyHash,
    ) -> Result<Option<QueryDef>, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let def_json: Option<String> = tx
            .query_row(
                "SELECT def_json FROM queue_entries WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(def_json) = def_json else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM queue_entries WHERE queue=?1 AND hash=?2",
            params![queue, hash.as_str()],
        )?;
        tx.commit()?;
        Ok(Some(decode_def(&def_json)?))
    }

    fn free_processing_lock(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
        now_ms: i64,
    ) -> Result<Option<ProcessingId>, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<i64>)> = tx
            .query_row(
                "SELECT stage, processing_id FROM queue_entries WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stage, holder)) = row else {
            return Ok(None);
        };
        match holder {
            Some(current) if current == processing_id.get() => {}
            Some(current) => return Ok(Some(ProcessingId::new(current))),
            None => return Ok(None),
        }

        if activated && QueueStatus::from_db(&stage) == Some(QueueStatus::Active) {
            tx.execute(
                "UPDATE queue_entries \
                 SET stage='PENDING', processing_id=NULL, heartbeat_at_ms=NULL, activated_at_ms=NULL, \
                     orphaned_at_ms=MAX(orphaned_at_ms, ?3 + orphaned_timeout_ms) \
                 WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str(), now_ms],
            )?;
        } else {
            tx.execute(
                "UPDATE queue_entries SET processing_id=NULL WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(None)
    }

    fn get_stalled_queries(&mut self, now_ms: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        let cutoff = now_ms.saturating_sub(self.options.heart_beat_timeout_ms);
        query_hashes(
            &self.conn,
            "SELECT hash FROM queue_entries \
             WHERE queue=?1 AND stage='ACTIVE' AND heartbeat_at_ms < ?2 \
             ORDER BY heartbeat_at_ms ASC",
            &self.options.queue,
            cutoff,
        )
    }

    fn get_orphaned_queries(&mut self, now_ms: i64) -> Result<Vec<QueryKeyHash>, StoreError> {
        query_hashes(
            &self.conn,
            "SELECT hash FROM queue_entries \
             WHERE queue=?1 AND stage='PENDING' AND persistent=0 AND orphaned_at_ms < ?2 \
             ORDER BY score ASC",
            &self.options.queue,
            now_ms,
        )
    }

    fn get_queries_to_cancel(
        &mut self,
        now_ms: i64,
    ) -> Result<Vec<(QueryKeyHash, CancelReason)>, StoreError> {
        let mut out = self
            .get_stalled_queries(now_ms)?
            .into_iter()
            .map(|hash| (hash, CancelReason::Stalled))
            .collect::<Vec<_>>();
        out.extend(
            self.get_orphaned_queries(now_ms)?
                .into_iter()
                .map(|hash| (hash, CancelReason::Orphaned)),
        );
        Ok(out)
    }

    fn reclaim_stalled(
        &mut self,
        hash: &QueryKeyHash,
        retry_budget: u32,
        now_ms: i64,
    ) -> Result<StallOutcome, StoreError> {
        let queue = self.options.queue.as_str();
        let cutoff = now_ms.saturating_sub(self.options.heart_beat_timeout_ms);
        let result_ttl_ms = self.options.result_ttl_ms;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<i64>, i64)> = tx
            .query_row(
                "SELECT stage, heartbeat_at_ms, stall_count FROM queue_entries \
                 WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((stage, heartbeat_at_ms, stall_count)) = row else {
            return Ok(StallOutcome::Gone);
        };
        let stalled = QueueStatus::from_db(&stage) == Some(QueueStatus::Active)
            && heartbeat_at_ms.is_some_and(|at| at < cutoff);
        if !stalled {
            return Ok(StallOutcome::Gone);
        }

        let stall_count = u32::try_from(stall_count).unwrap_or(u32::MAX);
        if stall_count < retry_budget {
            tx.execute(
                "UPDATE queue_entries \
                 SET stage='PENDING', processing_id=NULL, heartbeat_at_ms=NULL, activated_at_ms=NULL, \
                     stall_count=stall_count + 1, orphaned_at_ms=?3 + orphaned_timeout_ms \
                 WHERE queue=?1 AND hash=?2",
                params![queue, hash.as_str(), now_ms],
            )?;
            tx.commit()?;
            return Ok(StallOutcome::Requeued {
                attempt: stall_count + 1,
            });
        }

        tx.execute(
            "DELETE FROM queue_entries WHERE queue=?1 AND hash=?2",
            params![queue, hash.as_str()],
        )?;
        let failure = serde_json::to_string(&ExecutionResult::error_message(
            STALLED_FAILURE_MESSAGE,
        ))?;
        upsert_result_tx(&tx, queue, hash, &failure, now_ms, result_ttl_ms)?;
        tx.commit()?;
        Ok(StallOutcome::Failed)
    }

    fn get_query_stage_state(&mut self, only_keys: bool) -> Result<QueueStageState, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self.conn.transaction()?;
        let active = hashes_in_stage(&tx, queue, QueueStatus::Active)?;
        let pending = hashes_in_stage(&tx, queue, QueueStatus::Pending)?;

        let mut state = QueueStageState {
            active,
            pending,
            defs: Default::default(),
        };
        if !only_keys {
            let mut raw = Vec::new();
            {
                let mut stmt =
                    tx.prepare("SELECT hash, def_json FROM queue_entries WHERE queue=?1")?;
                let mut rows = stmt.query(params![queue])?;
                while let Some(row) = rows.next()? {
                    raw.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
                }
            }
            for (hash, def_json) in raw {
                state
                    .defs
                    .insert(QueryKeyHash::from_stored(hash), decode_def(&def_json)?);
            }
        }
        tx.commit()?;
        Ok(state)
    }

    fn get_queries(&mut self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT hash, stage, def_json, processing_id, heartbeat_at_ms, stall_count \
             FROM queue_entries WHERE queue=?1 \
             ORDER BY CASE stage WHEN 'ACTIVE' THEN 0 ELSE 1 END, score ASC",
        )?;
        let mut rows = stmt.query(params![self.options.queue])?;
        let mut raw = Vec::new();
        while let Some(row) = rows.next()? {
            raw.push((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
            ));
        }

        let mut out = Vec::with_capacity(raw.len());
        for (hash, stage, def_json, processing_id, heartbeat_at_ms, stall_count) in raw {
            let status = QueueStatus::from_db(&stage)
                .ok_or(StoreError::InvalidInput("unknown queue stage"))?;
            out.push(QueueEntry {
                query_key_hash: QueryKeyHash::from_stored(hash),
                status,
                def: decode_def(&def_json)?,
                processing_id: processing_id.map(ProcessingId::new),
                heartbeat_at_ms,
                stall_count: u32::try_from(stall_count).unwrap_or(u32::MAX),
            });
        }
        Ok(out)
    }

    fn get_query_def(&mut self, hash: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError> {
        let def_json: Option<String> = self
            .conn
            .query_row(
                "SELECT def_json FROM queue_entries WHERE queue=?1 AND hash=?2",
                params![self.options.queue, hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        def_json.as_deref().map(decode_def).transpose()
    }

    fn get_result(
        &mut self,
        hash: &QueryKeyHash,
        now_ms: i64,
    ) -> Result<Option<ExecutionResult>, StoreError> {
        let result_json: Option<String> = self
            .conn
            .query_row(
                "SELECT result_json FROM queue_results \
                 WHERE queue=?1 AND hash=?2 AND expires_at_ms > ?3",
                params![self.options.queue, hash.as_str(), now_ms],
                |row| row.get(0),
            )
            .optional()?;
        match result_json {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn get_next_processing_id(&mut self) -> Result<ProcessingId, StoreError> {
        let queue = self.options.queue.as_str();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = next_counter_tx(&tx, queue, PROCESSING_ID_COUNTER)?;
        tx.commit()?;
        Ok(ProcessingId::new(next))
    }

    fn cleanup_results(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM queue_results WHERE queue=?1 AND expires_at_ms <= ?2",
            params![self.options.queue, now_ms],
        )?;
        Ok(removed)
    }
}

fn decode_def(raw: &str) -> Result<QueryDef, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn hashes_in_stage(
    conn: &Connection,
    queue: &str,
    stage: QueueStatus,
) -> Result<Vec<QueryKeyHash>, StoreError> {
    let order = match stage {
        QueueStatus::Pending => "score ASC",
        QueueStatus::Active => "activated_at_ms ASC, hash ASC",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT hash FROM queue_entries WHERE queue=?1 AND stage=?2 ORDER BY {order}"
    ))?;
    let mut rows = stmt.query(params![queue, stage.as_db()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(QueryKeyHash::from_stored(row.get::<_, String>(0)?));
    }
    Ok(out)
}

fn count_entries(
    conn: &Connection,
    queue: &str,
    stage: Option<QueueStatus>,
) -> Result<usize, StoreError> {
    let count: i64 = match stage {
        Some(stage) => conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE queue=?1 AND stage=?2",
            params![queue, stage.as_db()],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM queue_entries WHERE queue=?1",
            params![queue],
            |row| row.get(0),
        )?,
    };
    Ok(to_usize(count))
}

fn query_hashes(
    conn: &Connection,
    sql: &str,
    queue: &str,
    bound: i64,
) -> Result<Vec<QueryKeyHash>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![queue, bound])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(QueryKeyHash::from_stored(row.get::<_, String>(0)?));
    }
    Ok(out)
}

fn upsert_result_tx(
    conn: &Connection,
    queue: &str,
    hash: &QueryKeyHash,
    result_json: &str,
    now_ms: i64,
    result_ttl_ms: i64,
) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO queue_results(queue, hash, result_json, created_at_ms, expires_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(queue, hash) DO UPDATE SET
          result_json=excluded.result_json,
          created_at_ms=excluded.created_at_ms,
          expires_at_ms=excluded.expires_at_ms
        "#,
        params![
            queue,
            hash.as_str(),
            result_json,
            now_ms,
            now_ms.saturating_add(result_ttl_ms)
        ],
    )?;
    Ok(())
}
