#![forbid(unsafe_code)]

use crate::OrchestratorError;
use quarry_storage::CacheDriver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Ownership of a cluster-wide lock row, handed to the `with_lock` callback.
#[derive(Clone)]
pub struct LockRelease {
    cache: Arc<dyn CacheDriver>,
    key: String,
    token: String,
}

impl LockRelease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Frees the lock if this holder still owns it.
    pub async fn release(&self) -> Result<bool, OrchestratorError> {
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        let token = self.token.clone();
        let released =
            tokio::task::spawn_blocking(move || cache.release_lock(&key, &token)).await??;
        Ok(released)
    }
}

/// Cancelable handle on a pending or running `with_lock` call.
pub struct LockHandle<T> {
    cancel: CancellationToken,
    task: JoinHandle<Result<Option<T>, OrchestratorError>>,
}

impl<T> LockHandle<T> {
    /// Abandons the call. A held lock is released; the callback is dropped at its next await.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `Ok(None)` when the lock was held elsewhere or the call was cancelled.
    pub async fn join(self) -> Result<Option<T>, OrchestratorError> {
        self.task.await?
    }
}

/// Runs `callback` only if no other caller in the cluster holds `key`.
///
/// With `free_after` the lock is released as soon as the callback settles. Without it the
/// callback owns the [`LockRelease`] and the row otherwise lapses after `expiration`.
pub fn with_lock<F, Fut, T>(
    cache: Arc<dyn CacheDriver>,
    key: impl Into<String>,
    expiration: Duration,
    free_after: bool,
    callback: F,
) -> LockHandle<T>
where
    F: FnOnce(LockRelease) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let release = LockRelease {
        cache,
        key: key.into(),
        token: uuid::Uuid::new_v4().to_string(),
    };
    let task = tokio::spawn(run_locked(
        release,
        expiration,
        free_after,
        cancel.clone(),
        callback,
    ));
    LockHandle { cancel, task }
}

async fn run_locked<F, Fut, T>(
    release: LockRelease,
    expiration: Duration,
    free_after: bool,
    cancel: CancellationToken,
    callback: F,
) -> Result<Option<T>, OrchestratorError>
where
    F: FnOnce(LockRelease) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let cache = Arc::clone(&release.cache);
    let key = release.key.clone();
    let token = release.token.clone();
    let acquired =
        tokio::task::spawn_blocking(move || cache.try_acquire_lock(&key, &token, expiration))
            .await??;
    if !acquired {
        return Ok(None);
    }
    if cancel.is_cancelled() {
        release.release().await?;
        return Ok(None);
    }

    let outcome = tokio::select! {
        value = callback(release.clone()) => Some(value),
        _ = cancel.cancelled() => None,
    };
    if free_after || outcome.is_none() {
        if let Err(err) = release.release().await {
            warn!(key = %release.key, error = %err, "Failed to release lock");
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_storage::SqliteCacheDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_cache(test_name: &str) -> Arc<dyn CacheDriver> {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!(
            "quarry_lock_{test_name}_{}_{nonce}",
            std::process::id()
        ));
        Arc::new(SqliteCacheDriver::open(dir).expect("open cache"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overlap() {
        let cache = temp_cache("overlap");
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let handles = (0..2)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let runs = Arc::clone(&runs);
                with_lock(
                    Arc::clone(&cache),
                    "renew:orders",
                    Duration::from_secs(30),
                    true,
                    move |_release| async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    },
                )
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().await.expect("join");
        }
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn free_after_releases_for_the_next_caller() {
        let cache = temp_cache("free_after");
        let first = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), true, |_| async { 1 });
        assert_eq!(first.join().await.expect("first"), Some(1));

        let second = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), true, |_| async { 2 });
        assert_eq!(second.join().await.expect("second"), Some(2));
    }

    #[tokio::test]
    async fn lock_kept_without_free_after_until_released() {
        let cache = temp_cache("keep");
        let holder = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), false, |release| async move {
            release
        });
        let release = holder.join().await.expect("join").expect("acquired");

        let blocked = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), true, |_| async {});
        assert_eq!(blocked.join().await.expect("blocked"), None);

        assert!(release.release().await.expect("release"));
        let after = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), true, |_| async {});
        assert_eq!(after.join().await.expect("after"), Some(()));
    }

    #[tokio::test]
    async fn cancel_releases_a_held_lock() {
        let cache = temp_cache("cancel");
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), false, |_| async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        started_rx.await.expect("callback started");
        slow.cancel();
        assert_eq!(slow.join().await.expect("cancelled"), None);

        let next = with_lock(Arc::clone(&cache), "k", Duration::from_secs(30), true, |_| async { 7 });
        assert_eq!(next.join().await.expect("next"), Some(7));
    }
}
