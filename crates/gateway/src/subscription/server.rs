#![forbid(unsafe_code)]

use super::store::{AuthContext, SubscriptionStore};
use crate::ApiError;
use crate::gateway::{ApiGateway, RequestContext, SubscriptionHooks};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivers an outbound message to one connection, whatever the transport.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, connection_id: &str, message: Value);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Load,
    Sql,
    Meta,
    Subscribe,
    Unsubscribe,
}

impl Method {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "load" => Self::Load,
            "sql" => Self::Sql,
            "meta" => Self::Meta,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            _ => return None,
        })
    }

    /// Parameters a method accepts; anything else in `params` is dropped.
    fn params(self) -> &'static [&'static str] {
        match self {
            Self::Load | Self::Subscribe => &["query", "queryType"],
            Self::Sql => &["query"],
            Self::Meta | Self::Unsubscribe => &[],
        }
    }
}

struct ConnectionHooks<'a> {
    store: &'a dyn SubscriptionStore,
    connection_id: &'a str,
    message_id: &'a str,
    message: &'a Value,
}

#[async_trait]
impl SubscriptionHooks for ConnectionHooks<'_> {
    async fn subscription_state(&self) -> Result<Option<Value>, ApiError> {
        Ok(self
            .store
            .get_subscription(self.connection_id, self.message_id)
            .await?
            .map(|subscription| subscription.state))
    }

    async fn subscribe(&self, state: Value) -> Result<(), ApiError> {
        self.store
            .subscribe(self.connection_id, self.message_id, self.message.clone(), state)
            .await
    }

    async fn unsubscribe(&self) -> Result<(), ApiError> {
        self.store
            .unsubscribe(self.connection_id, self.message_id)
            .await
    }
}

const RPC_FIELDS: &[&str] = &["messageId", "method", "params", "requestId"];
const MAX_MESSAGE_ID_CHARS: usize = 16;
const MAX_REQUEST_ID_CHARS: usize = 64;

/// Text frames of one connection, handled strictly in arrival order.
pub struct InboundFrames {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl InboundFrames {
    pub fn push(&self, raw: String) {
        if self.tx.send(raw).is_err() {
            debug!("Dropping frame for a finished connection");
        }
    }

    /// Stops accepting frames and waits until the queued ones are handled.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.task.await {
            warn!(error = %err, "Frame processing task failed");
        }
    }
}

/// Message protocol over any bidirectional transport.
///
/// Inbound shapes: `{authorization}` (handshake), `{unsubscribe: id}` and
/// `{messageId, method, params, requestId?}`. Replies carry `{messageId, message, status}`;
/// every processed RPC is acknowledged with `{messageProcessedId}`.
#[derive(Clone)]
pub struct SubscriptionServer {
    gateway: ApiGateway,
    store: Arc<dyn SubscriptionStore>,
    sink: Arc<dyn MessageSink>,
}

impl SubscriptionServer {
    pub fn new(
        gateway: ApiGateway,
        store: Arc<dyn SubscriptionStore>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            gateway,
            store,
            sink,
        }
    }

    /// Starts the sequential frame loop of one connection.
    pub fn open_connection(&self, connection_id: &str) -> InboundFrames {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let server = self.clone();
        let connection_id = connection_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                server.process_raw(&connection_id, &raw).await;
            }
        });
        InboundFrames { tx, task }
    }

    /// Entry point for text frames.
    pub async fn process_raw(&self, connection_id: &str, raw: &str) {
        match serde_json::from_str::<Value>(raw) {
            Ok(message) => self.process_message(connection_id, message, false).await,
            Err(err) => {
                let err = ApiError::from(err);
                let ctx = RequestContext::default();
                self.send_error(connection_id, &Value::Null, &err, &ctx).await;
            }
        }
    }

    /// Handles one inbound message. Failures are replied to the connection, never returned.
    pub async fn process_message(&self, connection_id: &str, message: Value, is_subscription: bool) {
        if let Err(err) = validate_message(&message) {
            let reply_id = valid_message_id(&message).unwrap_or(Value::Null);
            self.send_error(connection_id, &reply_id, &err, &RequestContext::default())
                .await;
            return;
        }

        if let Some(authorization) = message.get("authorization") {
            self.handshake(connection_id, authorization).await;
            return;
        }

        if let Some(subscription_id) = message.get("unsubscribe") {
            let subscription_id = id_string(subscription_id);
            if let Err(err) = self.store.unsubscribe(connection_id, &subscription_id).await {
                warn!(connection_id, error = %err, "Unsubscribe failed");
            }
            return;
        }

        let reply_id = message.get("messageId").cloned().unwrap_or(Value::Null);
        if reply_id.is_null() {
            let err = ApiError::user("messageId is required");
            self.send_error(connection_id, &reply_id, &err, &RequestContext::default())
                .await;
            return;
        }
        let message_id = id_string(&reply_id);

        let auth_context = match self.store.get_auth_context(connection_id).await {
            Ok(auth_context) => auth_context,
            Err(err) => {
                let ctx = RequestContext::default();
                self.send_error(connection_id, &reply_id, &err, &ctx).await;
                return;
            }
        };
        let Some(auth_context) = auth_context else {
            self.sink
                .send(
                    connection_id,
                    json!({
                        "messageId": reply_id,
                        "message": {"error": "Not authorized"},
                        "status": 403,
                    }),
                )
                .await;
            return;
        };

        let method_name = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(method) = Method::parse(method_name) else {
            let err = ApiError::user(format!("Unsupported method: {method_name}"));
            let ctx = RequestContext::default();
            self.send_error(connection_id, &reply_id, &err, &ctx).await;
            return;
        };

        let base_request_id = message
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{connection_id}-{message_id}"));
        let ctx = RequestContext {
            request_id: format!("{base_request_id}-span-{}", Uuid::new_v4()),
            auth_info: auth_context.auth_info,
            is_subscription,
        };
        let params = allowed_params(&message, method);
        let hooks = ConnectionHooks {
            store: self.store.as_ref(),
            connection_id,
            message_id: &message_id,
            message: &message,
        };

        debug!(
            connection_id,
            request_id = %ctx.request_id,
            method = method_name,
            is_subscription,
            "Processing message"
        );
        let outcome = self.dispatch(method, params, &ctx, &hooks).await;
        match outcome {
            Ok(Some(result)) => self.send_result(connection_id, &reply_id, result).await,
            Ok(None) => {}
            Err(err) => self.send_error(connection_id, &reply_id, &err, &ctx).await,
        }
        self.sink
            .send(connection_id, json!({"messageProcessedId": reply_id}))
            .await;
    }

    async fn dispatch(
        &self,
        method: Method,
        mut params: Map<String, Value>,
        ctx: &RequestContext,
        hooks: &ConnectionHooks<'_>,
    ) -> Result<Option<Value>, ApiError> {
        let query = params.remove("query").unwrap_or(Value::Null);
        let query_type = params
            .get("queryType")
            .and_then(Value::as_str)
            .map(str::to_string);
        match method {
            Method::Load => self
                .gateway
                .load(query, query_type.as_deref(), ctx)
                .await
                .map(Some),
            Method::Sql => self.gateway.sql(query, ctx).await.map(Some),
            Method::Meta => self.gateway.meta(ctx).await.map(Some),
            Method::Subscribe => {
                self.gateway
                    .subscribe(query, query_type.as_deref(), ctx, hooks)
                    .await
            }
            Method::Unsubscribe => self.gateway.unsubscribe(hooks).await.map(Some),
        }
    }

    async fn handshake(&self, connection_id: &str, authorization: &Value) {
        let ctx = RequestContext::default();
        let checked = self
            .gateway
            .authenticator()
            .check(authorization.as_str());
        let stored = match checked {
            Ok(auth_info) => {
                self.store
                    .set_auth_context(connection_id, AuthContext { auth_info })
                    .await
            }
            Err(err) => Err(err),
        };
        match stored {
            Ok(()) => {
                info!(connection_id, "Subscription handshake");
                self.sink.send(connection_id, json!({"handshake": true})).await;
            }
            Err(err) => self.send_error(connection_id, &Value::Null, &err, &ctx).await,
        }
    }

    /// Re-polls every live subscription. One failing subscriber does not affect the rest.
    pub async fn process_subscriptions(&self) {
        let subscriptions = match self.store.get_all_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!(error = %err, "Listing subscriptions failed");
                return;
            }
        };
        join_all(subscriptions.into_iter().map(|subscription| async move {
            self.process_message(&subscription.connection_id, subscription.message, true)
                .await
        }))
        .await;
    }

    pub async fn disconnect(&self, connection_id: &str) {
        if let Err(err) = self.store.cleanup_subscriptions(connection_id).await {
            warn!(connection_id, error = %err, "Subscription cleanup failed");
        }
        debug!(connection_id, "Connection closed");
    }

    /// Drives [`Self::process_subscriptions`] every `interval` until `shutdown` fires.
    pub async fn run_ticks(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.process_subscriptions().await;
        }
        info!("Subscription ticks stopped");
    }

    async fn send_result(&self, connection_id: &str, message_id: &Value, message: Value) {
        self.sink
            .send(
                connection_id,
                json!({"messageId": message_id, "message": message, "status": 200}),
            )
            .await;
    }

    async fn send_error(
        &self,
        connection_id: &str,
        message_id: &Value,
        err: &ApiError,
        ctx: &RequestContext,
    ) {
        let (status, body) = self.gateway.error_reply(err, ctx);
        self.sink
            .send(
                connection_id,
                json!({"messageId": message_id, "message": body, "status": status}),
            )
            .await;
    }
}

/// Checks the envelope before anything is routed: known fields only, bounded ids.
fn validate_message(message: &Value) -> Result<(), ApiError> {
    let Some(fields) = message.as_object() else {
        return Err(ApiError::user("Invalid message format"));
    };
    let only = |name: &str| -> Result<(), ApiError> {
        match fields.keys().find(|key| key.as_str() != name) {
            Some(key) => Err(ApiError::user(format!("Unknown message field: {key}"))),
            None => Ok(()),
        }
    };

    if let Some(authorization) = fields.get("authorization") {
        only("authorization")?;
        if !authorization.is_string() {
            return Err(ApiError::user("authorization must be a string"));
        }
        return Ok(());
    }
    if let Some(subscription_id) = fields.get("unsubscribe") {
        only("unsubscribe")?;
        if !(subscription_id.is_string() || subscription_id.is_number()) {
            return Err(ApiError::user("unsubscribe must be a message id"));
        }
        return Ok(());
    }

    if let Some(key) = fields
        .keys()
        .find(|key| !RPC_FIELDS.contains(&key.as_str()))
    {
        return Err(ApiError::user(format!("Unknown message field: {key}")));
    }
    if fields.contains_key("messageId") && valid_message_id(message).is_none() {
        return Err(ApiError::user(format!(
            "messageId must be a number or a string of at most {MAX_MESSAGE_ID_CHARS} characters"
        )));
    }
    if let Some(request_id) = fields.get("requestId") {
        let bounded = request_id
            .as_str()
            .is_some_and(|id| id.chars().count() <= MAX_REQUEST_ID_CHARS);
        if !bounded {
            return Err(ApiError::user(format!(
                "requestId must be a string of at most {MAX_REQUEST_ID_CHARS} characters"
            )));
        }
    }
    match fields.get("params") {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(ApiError::user("params must be an object")),
    }
}

fn valid_message_id(message: &Value) -> Option<Value> {
    let id = message.get("messageId")?;
    let valid = match id {
        Value::Number(_) => true,
        Value::String(text) => text.chars().count() <= MAX_MESSAGE_ID_CHARS,
        _ => false,
    };
    valid.then(|| id.clone())
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

fn allowed_params(message: &Value, method: Method) -> Map<String, Value> {
    let params = message.get("params").and_then(Value::as_object);
    method
        .params()
        .iter()
        .filter_map(|name| {
            let value = params?.get(*name)?;
            Some((name.to_string(), value.clone()))
        })
        .collect()
}
