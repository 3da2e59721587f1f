#![forbid(unsafe_code)]

use crate::OrchestratorError;
use crate::handler::SqlQueryHandler;
use crate::lock::with_lock;
use crate::queue::{ExecuteOptions, QueryOutcome, QueryQueue};
use quarry_core::QueryKey;
use quarry_core::clock::{duration_ms, now_ms};
use quarry_core::key::sha256_hex;
use quarry_storage::CacheDriver;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RESULT_KEY_PREFIX: &str = "SQL_QUERY_RESULT";

#[derive(Clone, Debug)]
pub struct QueryCacheOptions {
    /// Cached results older than this are served but refreshed in the background.
    pub renewal_threshold: Duration,
    pub default_expiration: Duration,
    /// Lifetime of the renewal lock row.
    pub lock_expiration: Duration,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            renewal_threshold: Duration::from_secs(120),
            default_expiration: Duration::from_secs(24 * 60 * 60),
            lock_expiration: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CachedQueryRequest {
    pub sql: String,
    pub params: Vec<Value>,
    /// Skip the cached value and execute again, refreshing the cache.
    pub renew_query: bool,
    /// Execute without reading or writing the cache.
    pub force_no_cache: bool,
    pub expiration: Option<Duration>,
    pub priority: i32,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CachedQueryResult {
    pub outcome: QueryOutcome,
    pub last_refresh_time: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    time: i64,
    result: Value,
}

/// Result cache in front of the queue.
#[derive(Clone)]
pub struct QueryCache {
    prefix: String,
    queue: QueryQueue,
    cache: Arc<dyn CacheDriver>,
    options: QueryCacheOptions,
}

impl QueryCache {
    pub fn new(
        prefix: impl Into<String>,
        queue: QueryQueue,
        cache: Arc<dyn CacheDriver>,
        options: QueryCacheOptions,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            queue,
            cache,
            options,
        }
    }

    pub fn queue(&self) -> &QueryQueue {
        &self.queue
    }

    pub fn result_key(&self, sql: &str, params: &[Value]) -> String {
        let canonical = QueryKey::sql(sql, params.to_vec()).canonical_json();
        format!(
            "{RESULT_KEY_PREFIX}_{}_{}",
            self.prefix,
            sha256_hex(canonical.as_bytes())
        )
    }

    pub async fn cached_query_result(
        &self,
        request: CachedQueryRequest,
    ) -> Result<CachedQueryResult, OrchestratorError> {
        let key = self.result_key(&request.sql, &request.params);

        if !request.force_no_cache && !request.renew_query {
            if let Some(entry) = self.read_entry(&key).await? {
                if now_ms().saturating_sub(entry.time) > duration_ms(self.options.renewal_threshold)
                {
                    self.renew_in_background(key.clone(), request.clone());
                }
                return Ok(CachedQueryResult {
                    outcome: QueryOutcome::Done(entry.result),
                    last_refresh_time: Some(entry.time),
                });
            }
        }

        self.fetch_new(key, request).await
    }

    async fn fetch_new(
        &self,
        key: String,
        request: CachedQueryRequest,
    ) -> Result<CachedQueryResult, OrchestratorError> {
        let outcome = self
            .queue
            .execute_in_queue(
                SqlQueryHandler::NAME,
                QueryKey::sql(request.sql.clone(), request.params.clone()),
                json!({"query": request.sql, "values": request.params}),
                ExecuteOptions {
                    priority: request.priority,
                    request_id: request.request_id.clone(),
                    stage_query_key: None,
                    renew: request.renew_query || request.force_no_cache,
                },
            )
            .await?;

        if request.force_no_cache {
            return Ok(CachedQueryResult {
                outcome,
                last_refresh_time: None,
            });
        }

        match &outcome {
            QueryOutcome::Done(result) => {
                let time = now_ms();
                let entry = serde_json::to_value(CacheEntry {
                    time,
                    result: result.clone(),
                })
                .map_err(quarry_storage::StoreError::from)?;
                let expiration = request.expiration.unwrap_or(self.options.default_expiration);
                let cache = Arc::clone(&self.cache);
                tokio::task::spawn_blocking(move || cache.set(&key, &entry, Some(expiration)))
                    .await??;
                Ok(CachedQueryResult {
                    outcome,
                    last_refresh_time: Some(time),
                })
            }
            QueryOutcome::Failed(_) => {
                let cache = Arc::clone(&self.cache);
                tokio::task::spawn_blocking(move || cache.remove(&key)).await??;
                Ok(CachedQueryResult {
                    outcome,
                    last_refresh_time: None,
                })
            }
            QueryOutcome::Pending => Ok(CachedQueryResult {
                outcome,
                last_refresh_time: None,
            }),
        }
    }

    /// One process in the cluster refreshes a stale entry; the rest keep serving it.
    fn renew_in_background(&self, key: String, request: CachedQueryRequest) {
        let this = self.clone();
        let lock_key = format!("LOCK:{key}");
        let handle = with_lock(
            Arc::clone(&self.cache),
            lock_key,
            self.options.lock_expiration,
            true,
            move |_release| async move {
                let renew = CachedQueryRequest {
                    renew_query: true,
                    ..request
                };
                if let Err(err) = this.fetch_new(key, renew).await {
                    warn!(error = %err, "Background cache renewal failed");
                }
            },
        );
        tokio::spawn(async move {
            match handle.join().await {
                Ok(Some(())) => debug!("Background cache renewal finished"),
                Ok(None) => debug!("Cache renewal already in progress elsewhere"),
                Err(err) => warn!(error = %err, "Cache renewal task failed"),
            }
        });
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, OrchestratorError> {
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        let raw = tokio::task::spawn_blocking(move || cache.get(&key)).await??;
        Ok(raw.and_then(|value| serde_json::from_value(value).ok()))
    }
}
