//! Quorum lease lock spanning one or more lease stores
//!
//! A lock is held when a majority of stores grant every requested key to the
//! same owner. While the protected future runs, a background task extends the
//! leases; if an extension cannot reach quorum the token handed to the future
//! is cancelled.

mod memory;
mod postgres;

pub use memory::InMemoryLeaseStore;
pub use postgres::PostgresLeaseStore;

use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DatabaseResult;

/// Storage for single-key leases with an owner and an expiry
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant `key` to `owner` if it is free or its lease has expired
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool>;

    /// Push the expiry forward if `owner` still holds an unexpired lease
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool>;

    /// Drop the lease if `owner` holds it
    async fn release(&self, key: &str, owner: &str) -> DatabaseResult<()>;

    /// Store name used in logs
    fn name(&self) -> &str;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock contention on {keys:?}")]
    Contention { keys: Vec<String> },

    #[error("No lease stores configured")]
    NoStores,

    #[error("Lock acquisition cancelled")]
    Cancelled,
}

/// Lock over a quorum of lease stores
#[derive(Clone)]
pub struct DistributedLock {
    stores: Vec<Arc<dyn LeaseStore>>,
    extension_threshold: f64,
}

impl DistributedLock {
    /// Create a lock over `stores`
    ///
    /// `extension_threshold` is the fraction of the TTL after which leases
    /// are extended.
    pub fn new(stores: Vec<Arc<dyn LeaseStore>>, extension_threshold: f64) -> Self {
        Self {
            stores,
            extension_threshold,
        }
    }

    /// Single-store lock, used when only one database is configured
    pub fn single(store: Arc<dyn LeaseStore>, extension_threshold: f64) -> Self {
        Self::new(vec![store], extension_threshold)
    }

    /// Number of stores that must grant a key
    pub const fn quorum(&self) -> usize {
        quorum_of(self.stores.len())
    }

    /// Run `f` while holding every key in `keys`
    ///
    /// The token passed to `f` is a child of `parent` and is also cancelled
    /// when the lock is lost. Fails fast with [`LockError::Contention`]
    /// without retrying. Leases are not released when `parent` was cancelled;
    /// they expire on their own. Dropping the returned future stops the
    /// extensions, so the leases also expire within one TTL.
    pub async fn with_lock<T, F, Fut>(
        &self,
        keys: &[String],
        ttl: Duration,
        parent: &CancellationToken,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        if self.stores.is_empty() {
            return Err(LockError::NoStores);
        }
        if parent.is_cancelled() {
            return Err(LockError::Cancelled);
        }

        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();
        let granted = self.acquire_all(&keys, &owner, ttl).await;

        let drift = ttl.mul_f64(0.01).saturating_add(Duration::from_millis(2));
        let validity = ttl.saturating_sub(started.elapsed()).saturating_sub(drift);

        if granted < self.quorum() || validity.is_zero() {
            tracing::debug!(
                keys = ?keys,
                granted,
                quorum = self.quorum(),
                "Lock not acquired"
            );
            release_all(&self.stores, &keys, &owner).await;
            return Err(LockError::Contention { keys });
        }

        let token = parent.child_token();
        let stop_extending = CancellationToken::new();
        let extender = tokio::spawn(extend_until_stopped(
            self.stores.clone(),
            keys.clone(),
            owner.clone(),
            ttl,
            ttl.mul_f64(self.extension_threshold),
            token.clone(),
            stop_extending.clone(),
        ));

        // Stops the extender even if this future is dropped mid-flight
        let stop_on_drop = stop_extending.drop_guard();
        let result = f(token).await;

        drop(stop_on_drop);
        if let Err(e) = extender.await {
            tracing::warn!(error = %e, "Lock extension task ended abnormally");
        }

        if !parent.is_cancelled() {
            release_all(&self.stores, &keys, &owner).await;
        }

        Ok(result)
    }

    /// Acquire every key on every store; returns how many stores granted all of them
    async fn acquire_all(&self, keys: &[String], owner: &str, ttl: Duration) -> usize {
        let mut granted: usize = 0;
        for store in &self.stores {
            let mut held = Vec::with_capacity(keys.len());
            for key in keys {
                match store.acquire(key, owner, ttl).await {
                    Ok(true) => held.push(key.as_str()),
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(store = store.name(), key, error = %e, "Lease acquire failed");
                        break;
                    }
                }
            }

            if held.len() == keys.len() {
                granted = granted.saturating_add(1);
            } else {
                for key in held {
                    if let Err(e) = store.release(key, owner).await {
                        tracing::warn!(store = store.name(), key, error = %e, "Lease release failed");
                    }
                }
            }
        }
        granted
    }
}

const fn quorum_of(stores: usize) -> usize {
    (stores / 2).saturating_add(1)
}

/// Release `keys` on every store concurrently, logging failures
async fn release_all(stores: &[Arc<dyn LeaseStore>], keys: &[String], owner: &str) {
    join_all(stores.iter().map(|store| async move {
        for key in keys {
            if let Err(e) = store.release(key, owner).await {
                tracing::warn!(store = store.name(), key = %key, error = %e, "Lease release failed");
            }
        }
    }))
    .await;
}

async fn extend_until_stopped(
    stores: Vec<Arc<dyn LeaseStore>>,
    keys: Vec<String>,
    owner: String,
    ttl: Duration,
    every: Duration,
    protected: CancellationToken,
    stop: CancellationToken,
) {
    let quorum = quorum_of(stores.len());
    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(every) => {}
        }

        let mut extended: usize = 0;
        for store in &stores {
            let mut all = true;
            for key in &keys {
                match store.extend(key, &owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        all = false;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(store = store.name(), key = %key, error = %e, "Lease extend failed");
                        all = false;
                        break;
                    }
                }
            }
            if all {
                extended = extended.saturating_add(1);
            }
        }

        if extended < quorum {
            tracing::warn!(keys = ?keys, extended, quorum, "Lock lost, cancelling holder");
            protected.cancel();
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TTL: Duration = Duration::from_millis(1000);

    fn keys(k: &str) -> Vec<String> {
        vec![k.to_string()]
    }

    /// Delegates to an in-memory store but can refuse extensions
    struct FlakyStore {
        inner: InMemoryLeaseStore,
        refuse_extend: AtomicBool,
    }

    #[async_trait]
    impl LeaseStore for FlakyStore {
        async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
            self.inner.acquire(key, owner, ttl).await
        }
        async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
            if self.refuse_extend.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.extend(key, owner, ttl).await
        }
        async fn release(&self, key: &str, owner: &str) -> DatabaseResult<()> {
            self.inner.release(key, owner).await
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_gets_contention() {
        let store = Arc::new(InMemoryLeaseStore::new("mem"));
        let lock = DistributedLock::single(store.clone(), 0.5);
        let parent = CancellationToken::new();

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |_| async {
                let inner = lock
                    .with_lock(&keys("repo:1"), TTL, &parent, |_| async { 2 })
                    .await;
                assert_eq!(
                    inner,
                    Err(LockError::Contention {
                        keys: keys("repo:1")
                    })
                );
                1
            })
            .await;

        assert_eq!(result, Ok(1));
        assert!(!store.is_held("repo:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_tolerates_minority_contention() {
        let stores: Vec<Arc<InMemoryLeaseStore>> = (0..3)
            .map(|i| Arc::new(InMemoryLeaseStore::new(&format!("mem-{i}"))))
            .collect();
        let dyn_stores: Vec<Arc<dyn LeaseStore>> =
            stores.iter().map(|s| s.clone() as Arc<dyn LeaseStore>).collect();
        let lock = DistributedLock::new(dyn_stores, 0.5);
        let parent = CancellationToken::new();

        stores[0].acquire("repo:1", "someone-else", TTL).await.unwrap();
        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |_| async { "ran" })
            .await;
        assert_eq!(result, Ok("ran"));

        stores[1].acquire("repo:1", "someone-else", TTL).await.unwrap();
        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |_| async { "ran" })
            .await;
        assert!(matches!(result, Err(LockError::Contention { .. })));
        // The partial grant on the third store was released
        assert!(!stores[2].is_held("repo:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_extended_while_running() {
        let store = Arc::new(InMemoryLeaseStore::new("mem"));
        let lock = DistributedLock::single(store.clone(), 0.5);
        let parent = CancellationToken::new();

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |token| {
                let store = store.clone();
                async move {
                    tokio::time::sleep(TTL * 3).await;
                    // Past the original TTL another owner still cannot take it
                    let stolen = store.acquire("repo:1", "thief", TTL).await.unwrap();
                    (stolen, token.is_cancelled())
                }
            })
            .await;

        assert_eq!(result, Ok((false, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_extension_cancels_holder() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryLeaseStore::new("mem"),
            refuse_extend: AtomicBool::new(true),
        });
        let lock = DistributedLock::single(store, 0.5);
        let parent = CancellationToken::new();

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |token| async move {
                tokio::select! {
                    () = token.cancelled() => "cancelled",
                    () = tokio::time::sleep(TTL * 5) => "finished",
                }
            })
            .await;

        assert_eq!(result, Ok("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_leases_to_expire() {
        let store = Arc::new(InMemoryLeaseStore::new("mem"));
        let lock = DistributedLock::single(store.clone(), 0.5);
        let parent = CancellationToken::new();

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |token| {
                let parent = parent.clone();
                async move {
                    parent.cancel();
                    token.is_cancelled()
                }
            })
            .await;

        assert_eq!(result, Ok(true));
        assert!(store.is_held("repo:1"));

        tokio::time::advance(TTL * 2).await;
        assert!(!store.is_held("repo:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_holder_lets_leases_expire() {
        let store = Arc::new(InMemoryLeaseStore::new("mem"));
        let lock = DistributedLock::single(store.clone(), 0.5);
        let parent = CancellationToken::new();

        let abandoned = tokio::time::timeout(
            TTL * 5,
            lock.with_lock(&keys("repo:1"), TTL, &parent, |_| {
                std::future::pending::<()>()
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(TTL * 3).await;
        assert!(!store.is_held("repo:1"));

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |_| async { "next" })
            .await;
        assert_eq!(result, Ok("next"));
    }

    #[tokio::test]
    async fn test_cancelled_parent_rejected_up_front() {
        let lock = DistributedLock::single(Arc::new(InMemoryLeaseStore::new("mem")), 0.5);
        let parent = CancellationToken::new();
        parent.cancel();

        let result = lock
            .with_lock(&keys("repo:1"), TTL, &parent, |_| async {})
            .await;
        assert_eq!(result, Err(LockError::Cancelled));
    }

    #[tokio::test]
    async fn test_no_stores() {
        let lock = DistributedLock::new(Vec::new(), 0.5);
        let result = lock
            .with_lock(&keys("repo:1"), TTL, &CancellationToken::new(), |_| async {})
            .await;
        assert_eq!(result, Err(LockError::NoStores));
    }
}
