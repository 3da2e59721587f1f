#![forbid(unsafe_code)]

use quarry_core::{
    ExecutionResult, Priority, ProcessingId, QueryDef, QueryKey, QueryKeyHash, StallOutcome,
    key_score,
};
use quarry_storage::{
    AddToQueueRequest, CancelReason, QueueDriverConnection, QueueDriverOptions,
    SqliteQueueDriver,
};
use rusqlite::{Connection, params};
use serde_json::{Map, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

const HEARTBEAT_TIMEOUT_MS: i64 = 120_000;
const ORPHANED_TIMEOUT_MS: i64 = 120_000;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let dir = base.join(format!("quarry_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open_driver(storage_dir: &Path, concurrency: usize) -> SqliteQueueDriver {
    SqliteQueueDriver::open(
        storage_dir,
        QueueDriverOptions {
            queue: "default".to_string(),
            concurrency,
            heart_beat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            result_ttl_ms: 60_000,
        },
    )
    .expect("open driver")
}

fn enqueue(
    conn: &mut dyn QueueDriverConnection,
    sql: &str,
    priority: i32,
    now_ms: i64,
) -> QueryKeyHash {
    enqueue_key(conn, QueryKey::text(sql), priority, now_ms)
}

fn enqueue_key(
    conn: &mut dyn QueueDriverConnection,
    key: QueryKey,
    priority: i32,
    now_ms: i64,
) -> QueryKeyHash {
    let hash = QueryKeyHash::of(&key, "proc-test");
    let priority = Priority::new(priority);
    let def = QueryDef {
        query_handler: "query".to_string(),
        query: json!({"sql": [key.canonical_json(), []]}),
        query_key: key,
        stage_query_key: None,
        priority,
        request_id: Some("req-1".to_string()),
        added_to_queue_time: now_ms,
        start_query_time: None,
        extra: Map::new(),
    };
    conn.add_to_queue(AddToQueueRequest {
        key_score: key_score(priority, now_ms),
        query_key_hash: hash.clone(),
        orphaned_timeout_ms: ORPHANED_TIMEOUT_MS,
        def,
        now_ms,
    })
    .expect("add to queue");
    hash
}

fn raw_def_json(storage_dir: &Path, hash: &QueryKeyHash) -> String {
    let conn = Connection::open(storage_dir.join("quarry.db")).expect("open raw db");
    conn.query_row(
        "SELECT def_json FROM queue_entries WHERE hash=?1",
        params![hash.as_str()],
        |row| row.get(0),
    )
    .expect("raw def")
}

#[test]
fn repeated_add_keeps_single_entry_and_reports_first_arrival() {
    let storage_dir = temp_dir("repeated_add");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let key = QueryKey::text("SELECT 1");
    let hash = QueryKeyHash::of(&key, "proc-test");
    enqueue(&mut conn, "SELECT 1", 0, 1_000);

    let def = conn
        .get_query_def(&hash)
        .expect("get def")
        .expect("def present");
    let again = conn
        .add_to_queue(AddToQueueRequest {
            key_score: key_score(Priority::new(0), 2_000),
            query_key_hash: hash.clone(),
            orphaned_timeout_ms: ORPHANED_TIMEOUT_MS,
            def,
            now_ms: 2_000,
        })
        .expect("add again");

    assert!(!again.added);
    assert_eq!(again.queue_size, 1);
    assert_eq!(again.added_to_queue_time, 1_000);
    // The repeated add pushed the orphan deadline forward.
    assert!(conn.get_orphaned_queries(1_000 + ORPHANED_TIMEOUT_MS + 1).expect("orphans").is_empty());
}

#[test]
fn pending_queries_are_ordered_by_priority_then_arrival() {
    let storage_dir = temp_dir("ordering");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let low_early = enqueue(&mut conn, "low early", -5, 1_000);
    let normal = enqueue(&mut conn, "normal", 0, 2_000);
    let high_late = enqueue(&mut conn, "high late", 5, 3_000);
    let normal_later = enqueue(&mut conn, "normal later", 0, 4_000);

    let order = conn.get_to_process_queries().expect("to process");
    assert_eq!(order, vec![high_late, normal, normal_later, low_early]);
}

#[test]
fn concurrent_retrieve_grants_exactly_one_lease() {
    let storage_dir = temp_dir("concurrent_retrieve");
    let driver = Arc::new(open_driver(&storage_dir, 4));
    let hash = {
        let mut conn = driver.connect().expect("connect");
        enqueue(&mut conn, "SELECT contended", 0, 1_000)
    };

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles = (0..workers)
        .map(|worker| {
            let driver = Arc::clone(&driver);
            let barrier = Arc::clone(&barrier);
            let hash = hash.clone();
            std::thread::spawn(move || {
                let mut conn = driver.connect().expect("connect");
                let processing_id = conn.get_next_processing_id().expect("processing id");
                barrier.wait();
                let outcome = conn
                    .retrieve_for_processing(&hash, processing_id, 2_000 + worker as i64)
                    .expect("retrieve");
                outcome.lock_acquired
            })
        })
        .collect::<Vec<_>>();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|acquired| *acquired)
        .count();
    assert_eq!(winners, 1);

    let mut conn = driver.connect().expect("connect");
    assert_eq!(conn.get_active_queries().expect("active"), vec![hash]);
    assert!(conn.get_to_process_queries().expect("pending").is_empty());
}

#[test]
fn retrieve_respects_concurrency_cap() {
    let storage_dir = temp_dir("concurrency_cap");
    let driver = open_driver(&storage_dir, 1);
    let mut conn = driver.connect().expect("connect");

    let first = enqueue(&mut conn, "first", 0, 1_000);
    let second = enqueue(&mut conn, "second", 0, 1_001);

    let lease = conn
        .retrieve_for_processing(&first, ProcessingId::new(1), 2_000)
        .expect("retrieve first");
    assert!(lease.lock_acquired);
    assert_eq!(lease.pending_count, 1);
    assert!(lease.def.is_some());

    let blocked = conn
        .retrieve_for_processing(&second, ProcessingId::new(2), 2_000)
        .expect("retrieve second");
    assert!(!blocked.lock_acquired);
    assert!(blocked.def.is_none());
    assert_eq!(blocked.active, vec![first]);
    assert_eq!(conn.get_to_process_queries().expect("pending"), vec![second.clone()]);

    // A refused lease leaves no holder behind on the pending row.
    let waiting = conn
        .get_queries()
        .expect("queries")
        .into_iter()
        .find(|entry| entry.query_key_hash == second)
        .expect("second still queued");
    assert_eq!(waiting.processing_id, None);
    assert_eq!(waiting.heartbeat_at_ms, None);
}

#[test]
fn missed_heartbeat_marks_query_stalled() {
    let storage_dir = temp_dir("stalled");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let hash = enqueue(&mut conn, "SELECT slow", 0, 1_000);
    let pid = ProcessingId::new(7);
    assert!(
        conn.retrieve_for_processing(&hash, pid, 10_000)
            .expect("retrieve")
            .lock_acquired
    );

    assert!(conn.get_stalled_queries(10_000 + HEARTBEAT_TIMEOUT_MS).expect("stalled").is_empty());
    assert_eq!(
        conn.get_stalled_queries(10_000 + HEARTBEAT_TIMEOUT_MS + 1)
            .expect("stalled"),
        vec![hash.clone()]
    );

    assert!(conn.update_heart_beat(&hash, pid, 100_000).expect("heartbeat"));
    assert!(conn.get_stalled_queries(100_000 + HEARTBEAT_TIMEOUT_MS).expect("stalled").is_empty());

    // A stale lease token cannot keep the key alive.
    assert!(!conn.update_heart_beat(&hash, ProcessingId::new(8), 200_000).expect("heartbeat"));

    let to_cancel = conn
        .get_queries_to_cancel(100_000 + HEARTBEAT_TIMEOUT_MS + 1)
        .expect("to cancel");
    assert_eq!(to_cancel, vec![(hash, CancelReason::Stalled)]);
}

#[test]
fn cancel_removes_pending_but_not_active_queries() {
    let storage_dir = temp_dir("cancel");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let pending = enqueue(&mut conn, "pending", 0, 1_000);
    let active = enqueue(&mut conn, "active", 0, 1_000);
    assert!(
        conn.retrieve_for_processing(&active, ProcessingId::new(1), 2_000)
            .expect("retrieve")
            .lock_acquired
    );

    let removed = conn.cancel_query(&pending).expect("cancel pending");
    assert_eq!(removed.map(|def| def.query_handler), Some("query".to_string()));
    assert!(!conn.get_to_process_queries().expect("pending").contains(&pending));
    assert!(conn.get_query_def(&pending).expect("def").is_none());

    assert!(conn.cancel_query(&active).expect("cancel active").is_none());
    assert!(conn.get_query_def(&active).expect("def").is_some());
    assert_eq!(conn.get_active_queries().expect("active"), vec![active]);
}

#[test]
fn optimistic_update_is_guarded_by_processing_id() {
    let storage_dir = temp_dir("optimistic_update");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let hash = enqueue(&mut conn, "SELECT progress", 0, 1_000);
    let holder = ProcessingId::new(11);
    assert!(
        conn.retrieve_for_processing(&hash, holder, 2_000)
            .expect("retrieve")
            .lock_acquired
    );

    let before = raw_def_json(&storage_dir, &hash);
    let mut patch = Map::new();
    patch.insert("startQueryTime".to_string(), json!(2_500));

    let stale = conn
        .optimistic_query_update(&hash, &patch, ProcessingId::new(10))
        .expect("stale update");
    assert!(!stale);
    assert_eq!(raw_def_json(&storage_dir, &hash), before);

    let applied = conn
        .optimistic_query_update(&hash, &patch, holder)
        .expect("update");
    assert!(applied);
    let def = conn.get_query_def(&hash).expect("def").expect("present");
    assert_eq!(def.start_query_time, Some(2_500));
}

#[test]
fn result_commit_requires_current_lease() {
    let storage_dir = temp_dir("result_commit");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let hash = enqueue(&mut conn, "SELECT 42", 0, 1_000);
    let holder = ProcessingId::new(3);
    assert!(
        conn.retrieve_for_processing(&hash, holder, 2_000)
            .expect("retrieve")
            .lock_acquired
    );

    let result = ExecutionResult::Result(json!([{"answer": 42}]));
    assert!(
        !conn
            .set_result_and_remove_query(&hash, &result, ProcessingId::new(2), 3_000)
            .expect("stale commit")
    );
    assert!(conn.get_result(&hash, 3_000).expect("result").is_none());

    assert!(
        conn.set_result_and_remove_query(&hash, &result, holder, 3_000)
            .expect("commit")
    );
    assert_eq!(conn.get_result(&hash, 3_001).expect("result"), Some(result));
    assert!(conn.get_query_def(&hash).expect("def").is_none());
    assert_eq!(conn.get_queue_size().expect("size"), 0);

    assert_eq!(conn.cleanup_results(3_000 + 60_000).expect("cleanup"), 1);
    assert!(conn.get_result(&hash, 3_001).expect("result").is_none());
}

#[test]
fn free_processing_lock_requeues_only_for_the_holder() {
    let storage_dir = temp_dir("free_lock");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let hash = enqueue(&mut conn, "SELECT free", 0, 1_000);
    let holder = ProcessingId::new(5);
    assert!(
        conn.retrieve_for_processing(&hash, holder, 2_000)
            .expect("retrieve")
            .lock_acquired
    );

    let other = conn
        .free_processing_lock(&hash, ProcessingId::new(6), true, 3_000)
        .expect("free by other");
    assert_eq!(other, Some(holder));
    assert_eq!(conn.get_active_queries().expect("active"), vec![hash.clone()]);

    assert_eq!(
        conn.free_processing_lock(&hash, holder, true, 50_000)
            .expect("free"),
        None
    );
    assert!(conn.get_active_queries().expect("active").is_empty());
    assert_eq!(conn.get_to_process_queries().expect("pending"), vec![hash.clone()]);

    // The orphan deadline restarts from the caller's clock, not the original enqueue time.
    assert!(
        conn.get_orphaned_queries(50_000 + ORPHANED_TIMEOUT_MS - 1)
            .expect("orphaned")
            .is_empty()
    );
    assert_eq!(
        conn.get_orphaned_queries(50_000 + ORPHANED_TIMEOUT_MS + 1)
            .expect("orphaned"),
        vec![hash]
    );
}

#[test]
fn orphan_sweep_skips_persistent_and_active_keys() {
    let storage_dir = temp_dir("orphans");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let plain = enqueue(&mut conn, "plain", 0, 1_000);
    let persistent = enqueue_key(
        &mut conn,
        QueryKey::text("scheduled refresh").into_persistent(),
        0,
        1_000,
    );
    let active = enqueue(&mut conn, "running", 0, 1_000);
    assert!(
        conn.retrieve_for_processing(&active, ProcessingId::new(1), 1_500)
            .expect("retrieve")
            .lock_acquired
    );

    assert!(conn.get_orphaned_queries(1_000 + ORPHANED_TIMEOUT_MS).expect("orphans").is_empty());
    let orphans = conn
        .get_orphaned_queries(1_000 + ORPHANED_TIMEOUT_MS + 1)
        .expect("orphans");
    assert_eq!(orphans, vec![plain]);
    assert_eq!(persistent.owner_process(), Some("proc-test"));
}

#[test]
fn reclaim_stalled_requeues_until_budget_then_fails() {
    let storage_dir = temp_dir("reclaim_stalled");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let hash = enqueue(&mut conn, "SELECT flaky", 0, 1_000);
    let mut now = 2_000;

    assert!(
        conn.retrieve_for_processing(&hash, ProcessingId::new(1), now)
            .expect("retrieve")
            .lock_acquired
    );
    now += HEARTBEAT_TIMEOUT_MS + 1;
    assert_eq!(
        conn.reclaim_stalled(&hash, 1, now).expect("reclaim"),
        StallOutcome::Requeued { attempt: 1 }
    );
    assert_eq!(conn.get_to_process_queries().expect("pending"), vec![hash.clone()]);

    assert!(
        conn.retrieve_for_processing(&hash, ProcessingId::new(2), now)
            .expect("retrieve again")
            .lock_acquired
    );
    // A fresh lease is not stalled yet.
    assert_eq!(
        conn.reclaim_stalled(&hash, 1, now + 1).expect("reclaim fresh"),
        StallOutcome::Gone
    );

    now += HEARTBEAT_TIMEOUT_MS + 1;
    assert_eq!(
        conn.reclaim_stalled(&hash, 1, now).expect("reclaim"),
        StallOutcome::Failed
    );
    assert!(conn.get_query_def(&hash).expect("def").is_none());
    let result = conn.get_result(&hash, now).expect("result").expect("failure stored");
    assert!(result.is_error());
}

#[test]
fn stage_state_and_processing_ids() {
    let storage_dir = temp_dir("stage_state");
    let driver = open_driver(&storage_dir, 2);
    let mut conn = driver.connect().expect("connect");

    let first = conn.get_next_processing_id().expect("id");
    let second = conn.get_next_processing_id().expect("id");
    assert!(second > first);

    let active = enqueue(&mut conn, "active", 0, 1_000);
    let pending = enqueue(&mut conn, "pending", 0, 1_001);
    assert!(
        conn.retrieve_for_processing(&active, second, 2_000)
            .expect("retrieve")
            .lock_acquired
    );

    let keys_only = conn.get_query_stage_state(true).expect("stage state");
    assert_eq!(keys_only.active, vec![active.clone()]);
    assert_eq!(keys_only.pending, vec![pending.clone()]);
    assert!(keys_only.defs.is_empty());

    let full = conn.get_query_stage_state(false).expect("stage state");
    assert_eq!(full.defs.len(), 2);
    assert!(full.defs.contains_key(&pending));

    let listing = conn.get_queries().expect("queries");
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].query_key_hash, active);
    assert_eq!(listing[0].processing_id, Some(second));
}
