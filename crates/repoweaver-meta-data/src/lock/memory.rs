//! Process-local lease store

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;

use super::LeaseStore;
use crate::error::DatabaseResult;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Lease store for a single process and for tests
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    name: String,
    leases: DashMap<String, Lease>,
}

impl InMemoryLeaseStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            leases: DashMap::new(),
        }
    }

    /// Whether `key` is currently leased by anyone
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
        let now = Instant::now();
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };

        Ok(match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().expires_at <= now {
                    existing.insert(lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        })
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
        let now = Instant::now();
        Ok(match self.leases.get_mut(key) {
            Some(mut lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        })
    }

    async fn release(&self, key: &str, owner: &str) -> DatabaseResult<()> {
        self.leases.remove_if(key, |_, lease| lease.owner == owner);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
