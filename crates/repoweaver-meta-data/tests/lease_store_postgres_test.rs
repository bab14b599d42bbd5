//! Expiring leases in the `repo_locks` table

#![allow(clippy::unwrap_used)] // Tests can use unwrap for assertions

#[path = "test_utils.rs"]
mod test_utils;

use repoweaver_meta_data::{LeaseStore, PostgresLeaseStore};
use std::time::Duration;
use test_utils::{get_test_runtime, test_pools, unique_name};

const TTL: Duration = Duration::from_secs(30);

#[test]
fn test_lease_is_exclusive_until_released() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let store = PostgresLeaseStore::new("postgres", pools.write_pool().clone());
        let key = format!("repo:{}", unique_name("lease"));

        assert!(store.acquire(&key, "worker-a", TTL).await.unwrap());
        assert!(!store.acquire(&key, "worker-b", TTL).await.unwrap());
        assert!(!store.extend(&key, "worker-b", TTL).await.unwrap());
        assert!(store.extend(&key, "worker-a", TTL).await.unwrap());

        // Only the owner can release
        store.release(&key, "worker-b").await.unwrap();
        assert!(!store.acquire(&key, "worker-b", TTL).await.unwrap());

        store.release(&key, "worker-a").await.unwrap();
        assert!(store.acquire(&key, "worker-b", TTL).await.unwrap());
        store.release(&key, "worker-b").await.unwrap();
    });
}

#[test]
fn test_expired_lease_can_be_taken_over() {
    get_test_runtime().block_on(async {
        let Some(pools) = test_pools().await else {
            return;
        };
        let store = PostgresLeaseStore::new("postgres", pools.write_pool().clone());
        let key = format!("repo:{}", unique_name("lease"));
        let short = Duration::from_millis(100);

        assert!(store.acquire(&key, "worker-a", short).await.unwrap());
        assert!(!store.acquire(&key, "worker-b", TTL).await.unwrap());

        tokio::time::sleep(short * 4).await;

        assert!(store.acquire(&key, "worker-b", TTL).await.unwrap());
        assert!(!store.extend(&key, "worker-a", TTL).await.unwrap());

        // A late release by the previous owner leaves the new lease alone
        store.release(&key, "worker-a").await.unwrap();
        assert!(!store.acquire(&key, "worker-a", TTL).await.unwrap());
        store.release(&key, "worker-b").await.unwrap();
    });
}
