// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leased snapshots ("batches").
//!
//! A batch pins a point-in-time snapshot of the leader so that a dump, a
//! tree summary and the range listings that follow it all describe the same
//! state. Batches are leased: each has a TTL, callers extend it while they
//! work, and expired batches are collected lazily on every operation (and by
//! [`BatchManager::gc_expired`] if the owner runs it periodically).
//!
//! ```text
//! create(ttl) ──► live ──extend(ttl)──► live ──destroy()──► gone
//!                   │
//!                   └──(ttl elapsed)──► expired ──gc──► gone
//! ```
//!
//! Using an expired batch yields [`ReplicationError::BatchExpired`];
//! destroying an unknown or expired one is a no-op.

use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Identity of a live batch, handed to the follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: u64,
    /// Tick the snapshot corresponds to; tailing resumes after it.
    pub tick: Tick,
}

struct Lease<T> {
    tick: Tick,
    snapshot: Arc<T>,
    expires_at: Instant,
}

/// Registry of leased snapshots of type `T`.
pub struct BatchManager<T> {
    leases: Mutex<HashMap<u64, Lease<T>>>,
    next_id: AtomicU64,
    max_batches: usize,
}

impl<T> BatchManager<T> {
    pub fn new(max_batches: usize) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_batches,
        }
    }

    /// Register a snapshot taken at `tick` with the given lease.
    pub async fn create(&self, tick: Tick, snapshot: T, ttl: Duration) -> Result<BatchInfo> {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        if leases.len() >= self.max_batches {
            return Err(ReplicationError::ResourceExhausted {
                resource: "batches".to_string(),
                limit: self.max_batches,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            id,
            Lease {
                tick,
                snapshot: Arc::new(snapshot),
                expires_at: Instant::now() + ttl,
            },
        );
        metrics::record_batch_created();
        debug!(batch_id = id, tick, ttl_ms = ttl.as_millis() as u64, "Batch created");
        Ok(BatchInfo { id, tick })
    }

    /// Push the expiry of a live batch to `now + ttl`.
    pub async fn extend(&self, id: u64, ttl: Duration) -> Result<()> {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        match leases.get_mut(&id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + ttl;
                Ok(())
            }
            None => Err(ReplicationError::BatchExpired { batch_id: id }),
        }
    }

    /// Release a batch. Returns whether it was live.
    pub async fn destroy(&self, id: u64) -> bool {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        let existed = leases.remove(&id).is_some();
        if existed {
            debug!(batch_id = id, "Batch destroyed");
        }
        existed
    }

    /// Snapshot and tick of a live batch.
    pub async fn get(&self, id: u64) -> Result<(Tick, Arc<T>)> {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        leases
            .get(&id)
            .map(|lease| (lease.tick, Arc::clone(&lease.snapshot)))
            .ok_or(ReplicationError::BatchExpired { batch_id: id })
    }

    /// Drop expired batches. Returns how many were dropped.
    pub async fn gc_expired(&self) -> usize {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases)
    }

    pub async fn live(&self) -> usize {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        leases.len()
    }

    /// Smallest tick pinned by a live batch.
    pub async fn oldest_tick(&self) -> Option<Tick> {
        let mut leases = self.leases.lock().await;
        Self::collect(&mut leases);
        leases.values().map(|l| l.tick).min()
    }

    fn collect(leases: &mut HashMap<u64, Lease<T>>) -> usize {
        let now = Instant::now();
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at > now);
        let expired = before - leases.len();
        if expired > 0 {
            debug!(expired, "Expired batches collected");
            metrics::record_batches_expired(expired);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_get_destroy() {
        let manager = BatchManager::new(4);
        let info = manager.create(10, "snapshot", Duration::from_secs(60)).await.unwrap();
        assert_eq!(info.tick, 10);

        let (tick, snapshot) = manager.get(info.id).await.unwrap();
        assert_eq!(tick, 10);
        assert_eq!(*snapshot, "snapshot");

        assert!(manager.destroy(info.id).await);
        assert!(matches!(
            manager.get(info.id).await,
            Err(ReplicationError::BatchExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_unknown_is_noop() {
        let manager: BatchManager<()> = BatchManager::new(4);
        assert!(!manager.destroy(999).await);
    }

    #[tokio::test]
    async fn test_limit_is_resource_exhaustion() {
        let manager = BatchManager::new(2);
        manager.create(1, (), Duration::from_secs(60)).await.unwrap();
        manager.create(1, (), Duration::from_secs(60)).await.unwrap();
        let err = manager.create(1, (), Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ResourceExhausted { limit: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_extension() {
        let manager = BatchManager::new(4);
        let a = manager.create(1, (), Duration::from_secs(10)).await.unwrap();
        let b = manager.create(2, (), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        manager.extend(a.id, Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.get(a.id).await.is_ok());
        assert!(matches!(
            manager.get(b.id).await,
            Err(ReplicationError::BatchExpired { .. })
        ));
        assert!(matches!(
            manager.extend(b.id, Duration::from_secs(10)).await,
            Err(ReplicationError::BatchExpired { .. })
        ));
        assert_eq!(manager.live().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_frees_capacity() {
        let manager = BatchManager::new(1);
        manager.create(1, (), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(manager.gc_expired().await, 1);
        assert!(manager.create(2, (), Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_oldest_tick() {
        let manager = BatchManager::new(4);
        assert_eq!(manager.oldest_tick().await, None);
        manager.create(30, (), Duration::from_secs(60)).await.unwrap();
        manager.create(12, (), Duration::from_secs(60)).await.unwrap();
        assert_eq!(manager.oldest_tick().await, Some(12));
    }
}
