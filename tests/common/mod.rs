// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - `FlakyLeader`: a [`LeaderRef`] wrapper with failure injection
//! - Seeding helpers for leaders and followers
//! - Convergence assertions

#![allow(dead_code)]

use collection_replication::batch::BatchInfo;
use collection_replication::leader::{DumpChunk, LeaderFuture};
use collection_replication::store::DumpCursor;
use collection_replication::tree::{KeyRange, TreeEntry, TreeSummary};
use collection_replication::{
    CollectionSpec, Document, DocumentStore, InMemoryLeader, IndexSpec, LeaderRef, MemoryStore,
    ReplicationConfig, ReplicationError, TailChunk, Tick,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COLLECTION: &str = "users";
pub const LEADER: &str = "leader-1";

/// Test config: in-memory progress, fast polling, small chunks.
pub fn test_config() -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(2);
    config.sync.dump_chunk_size = 100;
    config.sync.fetch_chunk_size = 50;
    config.applier.chunk_size = 50;
    config
}

/// `users` with a unique index on `email`.
pub fn users_spec() -> CollectionSpec {
    CollectionSpec::new(COLLECTION).with_index(IndexSpec::unique("email", &["email"]))
}

pub fn user_body(i: usize) -> serde_json::Value {
    json!({ "email": format!("user{i}@example.com"), "n": i })
}

pub fn user_key(i: usize) -> String {
    format!("u{i:06}")
}

/// Leader with `users` holding `n` documents.
pub async fn seeded_leader(n: usize) -> Arc<InMemoryLeader> {
    let leader = Arc::new(InMemoryLeader::new(LEADER, 1));
    leader.create_collection(users_spec()).await.unwrap();
    insert_users(&leader, 0..n).await;
    leader
}

pub async fn insert_users(leader: &InMemoryLeader, range: std::ops::Range<usize>) {
    for i in range {
        leader.insert(COLLECTION, &user_key(i), user_body(i)).await.unwrap();
    }
}

/// Follower store shaped like the leader.
pub fn follower_store() -> MemoryStore {
    MemoryStore::new(2)
}

/// Assert that the follower holds exactly the leader's documents.
pub async fn assert_converged(leader: &InMemoryLeader, store: &MemoryStore, collection: &str) {
    let expected = leader.checksum(collection, true).await.unwrap();
    let actual = store.checksum(collection, true).await.unwrap();
    assert_eq!(actual.count, expected.count, "document count differs");
    assert_eq!(actual, expected, "checksum differs");
}

/// Poll until `check` holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// FlakyLeader
// =============================================================================

/// Wraps an [`InMemoryLeader`] and injects failures per operation.
///
/// Operation names: `current_tick`, `collection_spec`, `create_batch`,
/// `extend_batch`, `dump`, `tail`, `tree_summary`, `range_revisions`,
/// `fetch_documents`.
pub struct FlakyLeader {
    inner: Arc<InMemoryLeader>,
    failures: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    /// Destroy the active batch once this many dump calls have succeeded.
    expire_after_dumps: AtomicU32,
    corrupt_summaries: AtomicBool,
    /// Log entries at these ticks are left out of tail pages.
    hidden_ticks: Mutex<HashSet<Tick>>,
}

impl FlakyLeader {
    pub fn new(inner: Arc<InMemoryLeader>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            expire_after_dumps: AtomicU32::new(0),
            corrupt_summaries: AtomicBool::new(false),
            hidden_ticks: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryLeader> {
        &self.inner
    }

    /// Fail the next `times` calls of `operation` with a transport error.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(operation, times);
    }

    /// Let the batch lapse after `dumps` successful dump pages.
    pub fn expire_batch_after_dumps(&self, dumps: u32) {
        self.expire_after_dumps.store(dumps, Ordering::SeqCst);
    }

    /// Report one extra document in the first leaf of every tree summary,
    /// without adjusting the totals.
    pub fn corrupt_summaries(&self, corrupt: bool) {
        self.corrupt_summaries.store(corrupt, Ordering::SeqCst);
    }

    /// Leave the entries at `ticks` out of tail pages, as if they were lost
    /// in transit. An empty slice restores the full log.
    pub fn hide_ticks(&self, ticks: &[Tick]) {
        *self.hidden_ticks.lock().unwrap() = ticks.iter().copied().collect();
    }

    pub fn calls(&self, operation: &'static str) -> u32 {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    fn check(&self, operation: &'static str) -> Result<(), ReplicationError> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ReplicationError::transport(self.inner.endpoint(), operation, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

impl LeaderRef for FlakyLeader {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn current_tick(&self) -> LeaderFuture<'_, Tick> {
        Box::pin(async move {
            self.check("current_tick")?;
            self.inner.current_tick().await
        })
    }

    fn collection_spec<'a>(&'a self, collection: &'a str) -> LeaderFuture<'a, CollectionSpec> {
        Box::pin(async move {
            self.check("collection_spec")?;
            self.inner.collection_spec(collection).await
        })
    }

    fn create_batch<'a>(&'a self, collection: &'a str, ttl: Duration) -> LeaderFuture<'a, BatchInfo> {
        Box::pin(async move {
            self.check("create_batch")?;
            self.inner.create_batch(collection, ttl).await
        })
    }

    fn extend_batch(&self, batch_id: u64, ttl: Duration) -> LeaderFuture<'_, ()> {
        Box::pin(async move {
            self.check("extend_batch")?;
            self.inner.extend_batch(batch_id, ttl).await
        })
    }

    fn destroy_batch(&self, batch_id: u64) -> LeaderFuture<'_, ()> {
        Box::pin(async move { self.inner.destroy_batch(batch_id).await })
    }

    fn dump<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        after: Option<DumpCursor>,
        limit: usize,
    ) -> LeaderFuture<'a, DumpChunk> {
        Box::pin(async move {
            self.check("dump")?;
            let chunk = self.inner.dump(collection, batch_id, after, limit).await?;
            let remaining = self.expire_after_dumps.load(Ordering::SeqCst);
            if remaining == 1 {
                self.inner.destroy_batch(batch_id).await?;
            }
            if remaining > 0 {
                self.expire_after_dumps.store(remaining - 1, Ordering::SeqCst);
            }
            Ok(chunk)
        })
    }

    fn tail<'a>(&'a self, collection: &'a str, after: Tick, limit: usize) -> LeaderFuture<'a, TailChunk> {
        Box::pin(async move {
            self.check("tail")?;
            let mut chunk = self.inner.tail(collection, after, limit).await?;
            let hidden = self.hidden_ticks.lock().unwrap().clone();
            chunk.entries.retain(|entry| !hidden.contains(&entry.tick()));
            Ok(chunk)
        })
    }

    fn tree_summary<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        only_populated: bool,
        verification: bool,
    ) -> LeaderFuture<'a, TreeSummary> {
        Box::pin(async move {
            self.check("tree_summary")?;
            let mut summary = self
                .inner
                .tree_summary(collection, batch_id, only_populated, verification)
                .await?;
            if self.corrupt_summaries.load(Ordering::SeqCst) {
                if let Some(leaf) = summary.leaves.first_mut() {
                    leaf.count += 1;
                }
            }
            Ok(summary)
        })
    }

    fn range_revisions<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        ranges: &'a [KeyRange],
    ) -> LeaderFuture<'a, Vec<TreeEntry>> {
        Box::pin(async move {
            self.check("range_revisions")?;
            self.inner.range_revisions(collection, batch_id, ranges).await
        })
    }

    fn fetch_documents<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        keys: &'a [String],
    ) -> LeaderFuture<'a, Vec<Document>> {
        Box::pin(async move {
            self.check("fetch_documents")?;
            self.inner.fetch_documents(collection, batch_id, keys).await
        })
    }
}
