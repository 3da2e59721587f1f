#![forbid(unsafe_code)]

use crate::ApiError;
use async_trait::async_trait;
use quarry_core::clock::{duration_ms, now_ms};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Principal verified during a connection's handshake.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthContext {
    pub auth_info: Option<Value>,
}

/// Last inbound message of a live query plus what was delivered for it.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub message: Value,
    pub state: Value,
    pub timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LiveSubscription {
    pub connection_id: String,
    pub subscription_id: String,
    pub message: Value,
    pub state: Value,
}

/// Per-connection subscription registry. Swappable for a store shared between gateway nodes.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscribe(
        &self,
        connection_id: &str,
        subscription_id: &str,
        message: Value,
        state: Value,
    ) -> Result<(), ApiError>;

    async fn get_subscription(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, ApiError>;

    async fn unsubscribe(&self, connection_id: &str, subscription_id: &str)
    -> Result<(), ApiError>;

    /// Live subscriptions of every connection; stale ones are dropped first.
    async fn get_all_subscriptions(&self) -> Result<Vec<LiveSubscription>, ApiError>;

    async fn cleanup_subscriptions(&self, connection_id: &str) -> Result<(), ApiError>;

    async fn get_auth_context(&self, connection_id: &str) -> Result<Option<AuthContext>, ApiError>;

    async fn set_auth_context(
        &self,
        connection_id: &str,
        auth_context: AuthContext,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Default)]
struct Connection {
    subscriptions: BTreeMap<String, Subscription>,
    auth_context: Option<AuthContext>,
}

/// In-process store. A subscription not refreshed for four heartbeat intervals is pruned.
///
/// A connection is registered by its handshake and forgotten by
/// [`SubscriptionStore::cleanup_subscriptions`]; subscribing on an unknown connection is a no-op.
#[derive(Debug)]
pub struct LocalSubscriptionStore {
    heart_beat_interval: Duration,
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl LocalSubscriptionStore {
    pub fn new(heart_beat_interval: Duration) -> Self {
        Self {
            heart_beat_interval,
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    fn max_age_ms(&self) -> i64 {
        duration_ms(self.heart_beat_interval).saturating_mul(4)
    }

    async fn subscribe_at(
        &self,
        connection_id: &str,
        subscription_id: &str,
        message: Value,
        state: Value,
        now_ms: i64,
    ) -> bool {
        let mut connections = self.connections.lock().await;
        let Some(connection) = connections.get_mut(connection_id) else {
            return false;
        };
        connection.subscriptions.insert(
            subscription_id.to_string(),
            Subscription {
                message,
                state,
                timestamp_ms: now_ms,
            },
        );
        true
    }

    async fn get_all_subscriptions_at(&self, now_ms: i64) -> Vec<LiveSubscription> {
        let max_age = self.max_age_ms();
        let mut connections = self.connections.lock().await;
        let mut live = Vec::new();
        for (connection_id, connection) in connections.iter_mut() {
            connection
                .subscriptions
                .retain(|_, sub| now_ms.saturating_sub(sub.timestamp_ms) <= max_age);
            live.extend(connection.subscriptions.iter().map(|(id, sub)| {
                LiveSubscription {
                    connection_id: connection_id.clone(),
                    subscription_id: id.clone(),
                    message: sub.message.clone(),
                    state: sub.state.clone(),
                }
            }));
        }
        connections.retain(|_, connection| {
            connection.auth_context.is_some() || !connection.subscriptions.is_empty()
        });
        live
    }
}

#[async_trait]
impl SubscriptionStore for LocalSubscriptionStore {
    async fn subscribe(
        &self,
        connection_id: &str,
        subscription_id: &str,
        message: Value,
        state: Value,
    ) -> Result<(), ApiError> {
        let stored = self
            .subscribe_at(connection_id, subscription_id, message, state, now_ms())
            .await;
        if !stored {
            debug!(connection_id, subscription_id, "Subscribe on a closed connection ignored");
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, ApiError> {
        let connections = self.connections.lock().await;
        Ok(connections
            .get(connection_id)
            .and_then(|connection| connection.subscriptions.get(subscription_id))
            .cloned())
    }

    async fn unsubscribe(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<(), ApiError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.subscriptions.remove(subscription_id);
        }
        Ok(())
    }

    async fn get_all_subscriptions(&self) -> Result<Vec<LiveSubscription>, ApiError> {
        Ok(self.get_all_subscriptions_at(now_ms()).await)
    }

    async fn cleanup_subscriptions(&self, connection_id: &str) -> Result<(), ApiError> {
        self.connections.lock().await.remove(connection_id);
        Ok(())
    }

    async fn get_auth_context(&self, connection_id: &str) -> Result<Option<AuthContext>, ApiError> {
        let connections = self.connections.lock().await;
        Ok(connections
            .get(connection_id)
            .and_then(|connection| connection.auth_context.clone()))
    }

    async fn set_auth_context(
        &self,
        connection_id: &str,
        auth_context: AuthContext,
    ) -> Result<(), ApiError> {
        let mut connections = self.connections.lock().await;
        connections
            .entry(connection_id.to_string())
            .or_default()
            .auth_context = Some(auth_context);
        Ok(())
    }
}
