#![forbid(unsafe_code)]

use crate::ApiError;
use crate::auth::Authenticator;
use crate::compiler::{MetaSource, QueryCompiler};
use crate::query::{NormalizedQuery, normalize_query, parse_query_param};
use crate::transform::{prepare_annotation, transform_data};
use async_trait::async_trait;
use quarry_core::clock::ms_to_rfc3339;
use quarry_orchestrator::{CachedQueryRequest, QueryCache, QueryOutcome, Row};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-request identity threaded through compilation, metadata and the queue.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    /// Verified token claims; `None` when running unauthenticated outside production.
    pub auth_info: Option<Value>,
    pub is_subscription: bool,
}

/// State persisted between two re-polls of a subscription.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync {
    async fn subscription_state(&self) -> Result<Option<Value>, ApiError>;
    async fn subscribe(&self, state: Value) -> Result<(), ApiError>;
    async fn unsubscribe(&self) -> Result<(), ApiError>;
}

/// Query façade shared by the HTTP routes and the subscription server.
#[derive(Clone)]
pub struct ApiGateway {
    base_path: String,
    authenticator: Authenticator,
    compiler: Arc<dyn QueryCompiler>,
    meta_source: Arc<dyn MetaSource>,
    cache: QueryCache,
}

impl ApiGateway {
    pub fn new(
        base_path: impl Into<String>,
        authenticator: Authenticator,
        compiler: Arc<dyn QueryCompiler>,
        meta_source: Arc<dyn MetaSource>,
        cache: QueryCache,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            authenticator,
            compiler,
            meta_source,
            cache,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn normalize(&self, query: Value) -> Result<NormalizedQuery, ApiError> {
        normalize_query(parse_query_param(query)?)
    }

    /// Compiles, runs through the result cache and maps rows back to member names.
    ///
    /// A query still queued or running past the continue-wait window yields
    /// [`ApiError::ContinueWait`]; the caller is expected to retry.
    pub async fn load(
        &self,
        query: Value,
        query_type: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Value, ApiError> {
        let normalized = self.normalize(query)?;
        let (compiled, meta) = tokio::try_join!(
            self.compiler.compile(&normalized, ctx),
            self.meta_source.meta(ctx)
        )?;
        let annotation = prepare_annotation(&meta, &normalized);

        debug!(request_id = %ctx.request_id, sql = %compiled.sql, "Load request");
        let cached = self
            .cache
            .cached_query_result(CachedQueryRequest {
                sql: compiled.sql.clone(),
                params: compiled.params.clone(),
                renew_query: normalized.renew_query,
                request_id: Some(ctx.request_id.clone()),
                ..CachedQueryRequest::default()
            })
            .await?;

        let rows = match cached.outcome {
            QueryOutcome::Done(result) => serde_json::from_value::<Vec<Row>>(result)
                .map_err(|err| ApiError::Internal(format!("unexpected warehouse result: {err}")))?,
            QueryOutcome::Failed(payload) => return Err(ApiError::Orchestrator(payload)),
            QueryOutcome::Pending => return Err(ApiError::ContinueWait),
        };
        let data = transform_data(&compiled.alias_to_member, &annotation, rows, &normalized)?;
        let row_count = data.len();

        let response = json!({
            "query": normalized,
            "data": data,
            "lastRefreshTime": cached.last_refresh_time.map(ms_to_rfc3339),
            "annotation": annotation,
        });
        info!(
            request_id = %ctx.request_id,
            rows = row_count,
            "Load request success"
        );

        if query_type == Some("multi") {
            return Ok(json!({"queryType": "multi", "results": [response]}));
        }
        Ok(response)
    }

    pub async fn sql(&self, query: Value, ctx: &RequestContext) -> Result<Value, ApiError> {
        let normalized = self.normalize(query)?;
        let compiled = self.compiler.compile(&normalized, ctx).await?;
        Ok(json!({
            "sql": {
                "sql": [compiled.sql, compiled.params],
                "order": compiled.order,
            }
        }))
    }

    pub async fn meta(&self, ctx: &RequestContext) -> Result<Value, ApiError> {
        let cubes = self.meta_source.meta(ctx).await?;
        Ok(json!({"cubes": cubes}))
    }

    /// One re-poll of a live query.
    ///
    /// Returns the message to deliver, or `None` when the result is unchanged since the last
    /// poll. Errors (continue-wait included) are delivered on every poll.
    pub async fn subscribe(
        &self,
        query: Value,
        query_type: Option<&str>,
        ctx: &RequestContext,
        hooks: &dyn SubscriptionHooks,
    ) -> Result<Option<Value>, ApiError> {
        let state = hooks.subscription_state().await?;
        let outcome = self.load(query, query_type, ctx).await;

        let (result, error) = match &outcome {
            Ok(message) => (message.clone(), Value::Null),
            Err(err) => (
                Value::Null,
                json!({"message": err.body(), "status": err.status().as_u16()}),
            ),
        };
        hooks
            .subscribe(json!({"error": error, "result": result}))
            .await?;

        let message = outcome?;
        let unchanged = state
            .as_ref()
            .and_then(|state| state.get("result"))
            .is_some_and(|previous| *previous == message);
        Ok((!unchanged).then_some(message))
    }

    pub async fn unsubscribe(&self, hooks: &dyn SubscriptionHooks) -> Result<Value, ApiError> {
        hooks.unsubscribe().await?;
        Ok(json!({}))
    }

    /// Logs `err` by its class and returns the status and body the caller receives.
    pub fn error_reply(&self, err: &ApiError, ctx: &RequestContext) -> (u16, Value) {
        match err {
            ApiError::ContinueWait => {
                debug!(request_id = %ctx.request_id, "Continue wait");
            }
            ApiError::User(message) => {
                info!(request_id = %ctx.request_id, error = %message, "User Error");
            }
            ApiError::Orchestrator(payload) => {
                warn!(request_id = %ctx.request_id, error = %payload, "Orchestrator error");
            }
            ApiError::Forbidden(message) => {
                warn!(request_id = %ctx.request_id, error = %message, "Forbidden");
            }
            ApiError::Internal(message) => {
                error!(request_id = %ctx.request_id, error = %message, "Internal Server Error");
            }
        }
        (err.status().as_u16(), err.body())
    }
}
