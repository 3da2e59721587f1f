#![forbid(unsafe_code)]

use crate::OrchestratorError;
use crate::config::QueueConfig;
use crate::handler::{ExecutionContext, QueryHandler, QueryHandlers};
use crate::pool::ConnectionPool;
use quarry_core::clock::{duration_ms, now_ms};
use quarry_core::{
    ExecutionResult, Priority, ProcessingId, QueryDef, QueryKey, QueryKeyHash, QueryStage,
    QueueEntry, StallOutcome, key_score,
};
use quarry_storage::{AddToQueueRequest, CancelReason, QueueDriver};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound between two store reads while a caller waits for a result produced elsewhere.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of submitting a query: finished, failed, or still queued/running.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutcome {
    Done(Value),
    Failed(Value),
    Pending,
}

impl From<ExecutionResult> for QueryOutcome {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Result(value) => Self::Done(value),
            ExecutionResult::Error(value) => Self::Failed(value),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub priority: i32,
    pub request_id: Option<String>,
    pub stage_query_key: Option<Value>,
    /// Ignore a result retained from an earlier run and execute again.
    pub renew: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub orphaned: usize,
    pub requeued: usize,
    pub failed: usize,
    pub expired_results: usize,
}

/// Handle on an execution this process is running.
#[derive(Clone)]
struct LocalExecution {
    processing_id: ProcessingId,
    cancel: CancellationToken,
    lease_lost: Arc<AtomicBool>,
}

#[derive(Default)]
struct ReconcileState {
    running: bool,
    again: bool,
}

struct QueueInner {
    name: String,
    process_uid: String,
    config: QueueConfig,
    pool: Arc<ConnectionPool>,
    handlers: QueryHandlers,
    reconcile: Mutex<ReconcileState>,
    results: Notify,
    executions: Mutex<HashMap<QueryKeyHash, LocalExecution>>,
}

/// Per-process view of a shared query queue.
///
/// Every coordination decision goes through the store; the in-process state only avoids
/// redundant reconcile passes and wakes local waiters early.
#[derive(Clone)]
pub struct QueryQueue {
    inner: Arc<QueueInner>,
}

impl QueryQueue {
    pub fn new(
        name: impl Into<String>,
        driver: Arc<dyn QueueDriver>,
        config: QueueConfig,
        handlers: QueryHandlers,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                process_uid: uuid::Uuid::new_v4().to_string(),
                config,
                pool: ConnectionPool::new(driver),
                handlers,
                reconcile: Mutex::new(ReconcileState::default()),
                results: Notify::new(),
                executions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn process_uid(&self) -> &str {
        &self.inner.process_uid
    }

    pub fn hash_of(&self, key: &QueryKey) -> QueryKeyHash {
        QueryKeyHash::of(key, &self.inner.process_uid)
    }

    /// Submits `query` under `key` and waits up to `continue_wait_timeout` for its result.
    ///
    /// A query that is still queued or running yields [`QueryOutcome::Pending`]; calling again
    /// with the same key joins the same execution.
    pub async fn execute_in_queue(
        &self,
        handler: &str,
        key: QueryKey,
        query: Value,
        options: ExecuteOptions,
    ) -> Result<QueryOutcome, OrchestratorError> {
        if !self.inner.handlers.contains_key(handler) {
            return Err(OrchestratorError::UnknownHandler(handler.to_string()));
        }
        let hash = self.hash_of(&key);
        let pool = &self.inner.pool;

        let now = now_ms();
        if !options.renew {
            let lookup = hash.clone();
            if let Some(result) = pool.run(move |conn| conn.get_result(&lookup, now)).await? {
                return Ok(result.into());
            }
        }

        let priority = Priority::new(options.priority);
        let def = QueryDef {
            query_handler: handler.to_string(),
            query,
            query_key: key,
            stage_query_key: options.stage_query_key,
            priority,
            request_id: options.request_id.clone(),
            added_to_queue_time: now,
            start_query_time: None,
            extra: Map::new(),
        };
        let request = AddToQueueRequest {
            key_score: key_score(priority, now),
            query_key_hash: hash.clone(),
            orphaned_timeout_ms: duration_ms(self.inner.config.orphaned_timeout),
            def,
            now_ms: now,
        };
        let added = pool.run(move |conn| conn.add_to_queue(request)).await?;
        if added.added {
            info!(
                queue = %self.inner.name,
                query_key = %hash,
                queue_size = added.queue_size,
                request_id = options.request_id.as_deref().unwrap_or(""),
                "Added to queue"
            );
        }

        self.reconcile_queue().await?;
        self.wait_for_result(&hash, self.inner.config.continue_wait_timeout)
            .await
    }

    /// Long-poll read of a key's result, bounded by `timeout`.
    pub async fn wait_for_result(
        &self,
        hash: &QueryKeyHash,
        timeout: Duration,
    ) -> Result<QueryOutcome, OrchestratorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.results.notified();

            let lookup = hash.clone();
            let now = now_ms();
            if let Some(result) = self
                .inner
                .pool
                .run(move |conn| conn.get_result(&lookup, now))
                .await?
            {
                return Ok(result.into());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(QueryOutcome::Pending);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining.min(RESULT_POLL_INTERVAL)) => {}
            }
        }
    }

    /// Dispatches pending keys up to the free concurrency slots. Overlapping calls collapse
    /// into one extra pass.
    pub async fn reconcile_queue(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = self
                .inner
                .reconcile
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.running {
                state.again = true;
                return Ok(());
            }
            state.running = true;
        }

        loop {
            let outcome = self.reconcile_once().await;
            let mut state = self
                .inner
                .reconcile
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if outcome.is_err() || !state.again {
                state.running = false;
                state.again = false;
                return outcome;
            }
            state.again = false;
        }
    }

    async fn reconcile_once(&self) -> Result<(), OrchestratorError> {
        let stage = self
            .inner
            .pool
            .run(|conn| conn.get_query_stage_state(false))
            .await?;
        let free_slots = self
            .inner
            .config
            .concurrency
            .saturating_sub(stage.active.len());
        if free_slots == 0 {
            return Ok(());
        }

        let candidates = stage
            .pending
            .into_iter()
            .filter(|hash| {
                // Persistent keys are only run by the process that minted them.
                let foreign = stage.defs.get(hash).is_some_and(|def| def.query_key.persistent)
                    && hash.owner_process() != Some(self.inner.process_uid.as_str());
                !foreign
            })
            .take(free_slots)
            .collect::<Vec<_>>();

        for hash in candidates {
            let queue = self.clone();
            tokio::spawn(async move {
                if let Err(err) = queue.process_query(hash.clone()).await {
                    warn!(queue = %queue.inner.name, query_key = %hash, error = %err, "Query processing failed");
                }
                queue.spawn_reconcile();
            });
        }
        Ok(())
    }

    fn spawn_reconcile(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(err) = queue.reconcile_queue().await {
                warn!(queue = %queue.inner.name, error = %err, "Reconcile failed");
            }
        });
    }

    async fn process_query(&self, hash: QueryKeyHash) -> Result<(), OrchestratorError> {
        let pool = &self.inner.pool;
        let processing_id = pool.run(|conn| conn.get_next_processing_id()).await?;

        let lease_hash = hash.clone();
        let lease = pool
            .run(move |conn| conn.retrieve_for_processing(&lease_hash, processing_id, now_ms()))
            .await?;
        let Some(def) = lease.def.filter(|_| lease.lock_acquired) else {
            debug!(
                queue = %self.inner.name,
                query_key = %hash,
                processing_id = %processing_id,
                active = lease.active.len(),
                "Skip processing"
            );
            return Ok(());
        };

        let Some(handler) = self.inner.handlers.get(&def.query_handler).cloned() else {
            let result = ExecutionResult::error_message(format!(
                "Unknown query handler: {}",
                def.query_handler
            ));
            self.commit_result(&hash, result, processing_id).await?;
            return Ok(());
        };

        let started_at = now_ms();
        let mut patch = Map::new();
        patch.insert("startQueryTime".to_string(), json!(started_at));
        let patch_hash = hash.clone();
        let still_leased = pool
            .run(move |conn| conn.optimistic_query_update(&patch_hash, &patch, processing_id))
            .await?;
        if !still_leased {
            warn!(queue = %self.inner.name, query_key = %hash, "Lease lost before start");
            return Ok(());
        }

        info!(
            queue = %self.inner.name,
            query_key = %hash,
            processing_id = %processing_id,
            request_id = def.request_id.as_deref().unwrap_or(""),
            pending = lease.pending_count,
            "Performing query"
        );

        let cancel = CancellationToken::new();
        let lease_lost = Arc::new(AtomicBool::new(false));
        self.register_execution(
            &hash,
            LocalExecution {
                processing_id,
                cancel: cancel.clone(),
                lease_lost: Arc::clone(&lease_lost),
            },
        );
        let heartbeat = self.spawn_heartbeat(
            hash.clone(),
            processing_id,
            cancel.clone(),
            Arc::clone(&lease_lost),
        );

        let outcome = self
            .run_handler(handler, def.query, &hash, processing_id, cancel.clone())
            .await;
        heartbeat.abort();
        self.unregister_execution(&hash, processing_id);

        if lease_lost.load(Ordering::SeqCst) {
            info!(
                queue = %self.inner.name,
                query_key = %hash,
                processing_id = %processing_id,
                "Lease lost, dropping execution result"
            );
            return Ok(());
        }

        let result = match outcome {
            Ok(value) => ExecutionResult::Result(value),
            Err(err) => ExecutionResult::error_message(err.to_string()),
        };
        let failed = result.is_error();
        if self.commit_result(&hash, result, processing_id).await? {
            info!(
                queue = %self.inner.name,
                query_key = %hash,
                processing_id = %processing_id,
                duration_ms = now_ms().saturating_sub(started_at),
                failed,
                "Performing query completed"
            );
        }
        Ok(())
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn QueryHandler>,
        query: Value,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        cancel: CancellationToken,
    ) -> Result<Value, OrchestratorError> {
        let timeout = self.inner.config.execution_timeout;
        let ctx = ExecutionContext::new(
            cancel.clone(),
            hash.clone(),
            processing_id,
            Arc::clone(&self.inner.pool),
        );
        tokio::select! {
            outcome = tokio::time::timeout(timeout, handler.execute(query, ctx)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(queue = %self.inner.name, query_key = %hash, "Cancelling query due to timeout");
                    cancel.cancel();
                    Err(OrchestratorError::Timeout(timeout.as_secs()))
                }
            },
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        }
    }

    async fn commit_result(
        &self,
        hash: &QueryKeyHash,
        result: ExecutionResult,
        processing_id: ProcessingId,
    ) -> Result<bool, OrchestratorError> {
        let commit_hash = hash.clone();
        let committed = self
            .inner
            .pool
            .run(move |conn| {
                conn.set_result_and_remove_query(&commit_hash, &result, processing_id, now_ms())
            })
            .await?;
        if committed {
            self.inner.results.notify_waiters();
        } else {
            warn!(
                queue = %self.inner.name,
                query_key = %hash,
                processing_id = %processing_id,
                "Orphaned execution result"
            );
        }
        Ok(committed)
    }

    fn spawn_heartbeat(
        &self,
        hash: QueryKeyHash,
        processing_id: ProcessingId,
        cancel: CancellationToken,
        lease_lost: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(&self.inner.pool);
        let interval = self.inner.config.heart_beat_interval;
        let queue = self.inner.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let beat_hash = hash.clone();
                let beat = pool
                    .run(move |conn| conn.update_heart_beat(&beat_hash, processing_id, now_ms()))
                    .await;
                match beat {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            queue = %queue,
                            query_key = %hash,
                            processing_id = %processing_id,
                            "Heartbeat rejected, cancelling execution"
                        );
                        lease_lost.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(queue = %queue, query_key = %hash, error = %err, "Heartbeat failed");
                    }
                }
            }
        })
    }

    fn register_execution(&self, hash: &QueryKeyHash, execution: LocalExecution) {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.clone(), execution);
    }

    fn local_execution(&self, hash: &QueryKeyHash) -> Option<LocalExecution> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    /// Stops a local execution whose key was taken away in the store. Nothing is committed.
    fn drop_local_execution(&self, hash: &QueryKeyHash, reason: &str) {
        if let Some(execution) = self.local_execution(hash) {
            info!(
                queue = %self.inner.name,
                query_key = %hash,
                reason,
                "Cancelling running handler"
            );
            execution.lease_lost.store(true, Ordering::SeqCst);
            execution.cancel.cancel();
        }
    }

    fn unregister_execution(&self, hash: &QueryKeyHash, processing_id: ProcessingId) {
        let mut executions = self
            .inner
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A requeued key may already run again here under a newer lease.
        if executions
            .get(hash)
            .is_some_and(|execution| execution.processing_id == processing_id)
        {
            executions.remove(hash);
        }
    }

    /// Signals a locally running execution to stop. It commits a `Query cancelled` failure
    /// at its next safe point. Returns `false` when this process is not running the key.
    pub fn abort_execution(&self, key: &QueryKey) -> bool {
        match self.local_execution(&self.hash_of(key)) {
            Some(execution) => {
                execution.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes a key that no worker has started yet.
    pub async fn cancel_query(&self, key: &QueryKey) -> Result<Option<QueryDef>, OrchestratorError> {
        let hash = self.hash_of(key);
        let removed = self
            .inner
            .pool
            .run(move |conn| conn.cancel_query(&hash))
            .await?;
        if let Some(def) = removed.as_ref() {
            info!(
                queue = %self.inner.name,
                request_id = def.request_id.as_deref().unwrap_or(""),
                "Cancelled queued query"
            );
        }
        Ok(removed)
    }

    /// Drops a key in whatever stage it is in. A running execution loses its lease and its
    /// result is discarded; when it runs in this process its handler is cancelled right away.
    pub async fn remove_query(&self, key: &QueryKey) -> Result<Option<QueryDef>, OrchestratorError> {
        let hash = self.hash_of(key);
        let target = hash.clone();
        let removed = self
            .inner
            .pool
            .run(move |conn| conn.get_query_and_remove(&target))
            .await?;
        if removed.is_some() {
            self.drop_local_execution(&hash, "removed");
        }
        Ok(removed)
    }

    /// One sweep: purge orphaned pending keys, reclaim stalled active ones, expire results.
    pub async fn reap(&self) -> Result<ReapReport, OrchestratorError> {
        let pool = &self.inner.pool;
        let budget = self.inner.config.stall_retry_budget;
        let now = now_ms();
        let mut report = ReapReport::default();

        let to_cancel = pool.run(move |conn| conn.get_queries_to_cancel(now)).await?;
        for (hash, reason) in to_cancel {
            let target = hash.clone();
            match reason {
                CancelReason::Orphaned => {
                    let removed = pool.run(move |conn| conn.cancel_query(&target)).await?;
                    if let Some(def) = removed {
                        report.orphaned += 1;
                        self.drop_local_execution(&hash, "orphaned");
                        info!(
                            queue = %self.inner.name,
                            query_key = %hash,
                            request_id = def.request_id.as_deref().unwrap_or(""),
                            "Removing orphaned query"
                        );
                    }
                }
                CancelReason::Stalled => {
                    let outcome = pool
                        .run(move |conn| conn.reclaim_stalled(&target, budget, now))
                        .await?;
                    match outcome {
                        StallOutcome::Requeued { attempt } => {
                            report.requeued += 1;
                            self.drop_local_execution(&hash, "stalled");
                            warn!(
                                queue = %self.inner.name,
                                query_key = %hash,
                                attempt,
                                "Requeueing stalled query"
                            );
                        }
                        StallOutcome::Failed => {
                            report.failed += 1;
                            self.drop_local_execution(&hash, "stalled");
                            error!(
                                queue = %self.inner.name,
                                query_key = %hash,
                                "Stalled query failed"
                            );
                            self.inner.results.notify_waiters();
                        }
                        StallOutcome::Gone => {}
                    }
                }
            }
        }

        report.expired_results = pool.run(move |conn| conn.cleanup_results(now)).await?;
        Ok(report)
    }

    pub async fn get_queries(&self) -> Result<Vec<QueueEntry>, OrchestratorError> {
        self.inner.pool.run(|conn| conn.get_queries()).await
    }

    /// Where `key` currently is, or `None` when it is not queued.
    pub async fn get_query_stage(&self, key: &QueryKey) -> Result<Option<QueryStage>, OrchestratorError> {
        let hash = self.hash_of(key);
        self.inner
            .pool
            .run(move |conn| {
                let state = conn.get_query_stage_state(true)?;
                if state.active.contains(&hash) {
                    let started_at = conn.get_query_def(&hash)?.and_then(|def| def.start_query_time);
                    return Ok(Some(QueryStage::Executing { started_at }));
                }
                Ok(state
                    .pending
                    .iter()
                    .position(|pending| pending == &hash)
                    .map(|index| QueryStage::Queued { position: index + 1 }))
            })
            .await
    }

    pub fn queue_driver(&self) -> &dyn QueueDriver {
        self.inner.pool.driver()
    }
}
