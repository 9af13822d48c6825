// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process leader.
//!
//! Holds collections, an [`OperationLog`] and a [`BatchManager`] of
//! snapshots. Writes are stamped with a revision of this server and logged
//! with the next tick.
//!
//! # Transactions
//!
//! Operations issued through a [`LeaderTransaction`] are logged as they
//! happen (`TransactionBegin` lazily with the first one) but only become
//! visible when the transaction commits. A commit that hits a unique
//! conflict is turned into an abort.
//!
//! A batch created while a transaction is open on the synchronized
//! collection reports a tick just before that transaction's begin, so a
//! follower tailing from the batch tick sees the whole transaction.
//! Transactions on other collections do not hold the tick back. Entries between that tick and the snapshot may be
//! replayed; replaying is idempotent.

use super::{DumpChunk, LeaderFuture, LeaderRef};
use crate::batch::{BatchInfo, BatchManager};
use crate::config::ReplicationConfig;
use crate::document::{Checksum, CollectionSpec, Document, Tick};
use crate::error::{ReplicationError, Result};
use crate::oplog::{LogEntry, OperationLog, TailChunk};
use crate::store::{
    clock_seed, next_revision, ApplyOutcome, Collection, CollectionSnapshot, DumpCursor, LocalOp, StoreError,
    WriteOutcome,
};
use crate::tree::{KeyRange, TreeConfig, TreeEntry, TreeSummary};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Default cap on concurrently leased batches.
const DEFAULT_MAX_BATCHES: usize = 64;

struct LeaderState {
    collections: HashMap<String, Collection>,
    log: OperationLog,
    tick: Tick,
    /// tid -> tick of its `TransactionBegin`
    open_transactions: BTreeMap<u64, Tick>,
}

impl LeaderState {
    fn next_tick(&mut self) -> Tick {
        self.tick += 1;
        self.tick
    }

    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| ReplicationError::collection_not_found(name))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| ReplicationError::collection_not_found(name))
    }
}

struct LeaderSnapshot {
    collections: HashMap<String, CollectionSnapshot>,
}

impl LeaderSnapshot {
    fn collection(&self, name: &str) -> Result<&CollectionSnapshot> {
        self.collections
            .get(name)
            .ok_or_else(|| ReplicationError::collection_not_found(name))
    }
}

/// A leader living in the same process.
pub struct InMemoryLeader {
    endpoint: String,
    server_id: u16,
    tree_config: TreeConfig,
    state: RwLock<LeaderState>,
    batches: BatchManager<LeaderSnapshot>,
    next_tid: AtomicU64,
    clock: AtomicU64,
}

impl InMemoryLeader {
    pub fn new(endpoint: impl Into<String>, server_id: u16) -> Self {
        Self::with_config(endpoint, server_id, TreeConfig::default(), DEFAULT_MAX_BATCHES)
    }

    /// Leader using the server id, tree shape and batch cap of `config`.
    pub fn from_config(endpoint: impl Into<String>, config: &ReplicationConfig) -> Self {
        Self::with_config(endpoint, config.server_id, config.tree, config.batches.max_batches)
    }

    pub fn with_config(
        endpoint: impl Into<String>,
        server_id: u16,
        tree_config: TreeConfig,
        max_batches: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            server_id,
            tree_config,
            state: RwLock::new(LeaderState {
                collections: HashMap::new(),
                log: OperationLog::new(),
                tick: 0,
                open_transactions: BTreeMap::new(),
            }),
            batches: BatchManager::new(max_batches),
            next_tid: AtomicU64::new(1),
            clock: AtomicU64::new(clock_seed()),
        }
    }

    /// Create a collection. Returns `false` if it already existed.
    pub async fn create_collection(&self, spec: CollectionSpec) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.collections.contains_key(&spec.name) {
            return Ok(false);
        }
        let name = spec.name.clone();
        state
            .collections
            .insert(name.clone(), Collection::new(spec, self.tree_config)?);
        info!(endpoint = %self.endpoint, collection = %name, "Leader collection created");
        Ok(true)
    }

    /// Insert or replace a document.
    pub async fn insert(&self, collection: &str, key: &str, body: Value) -> Result<Document> {
        let mut state = self.state.write().await;
        let doc = Document::new(key, next_revision(&self.clock, self.server_id), body);
        let outcome = state.collection_mut(collection)?.put(doc.clone());
        let replaced = match outcome {
            WriteOutcome::Conflict(conflict) => {
                return Err(StoreError::UniqueViolation {
                    collection: collection.to_string(),
                    index: conflict.index,
                    key: key.to_string(),
                    conflicting_key: conflict.conflicting_key,
                }
                .into())
            }
            WriteOutcome::Replaced { .. } => true,
            _ => false,
        };
        let tick = state.next_tick();
        state.log.append(document_entry(tick, collection, None, doc.clone(), replaced));
        Ok(doc)
    }

    /// Remove a document. Returns whether it existed.
    pub async fn remove(&self, collection: &str, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let WriteOutcome::Removed { previous } = state.collection_mut(collection)?.remove(key) else {
            return Ok(false);
        };
        let tick = state.next_tick();
        state.log.append(LogEntry::Remove {
            tick,
            collection: collection.to_string(),
            tid: None,
            key: key.to_string(),
            revision: previous,
        });
        Ok(true)
    }

    /// Start a transaction. Nothing is logged until its first operation.
    pub fn begin_transaction(&self) -> LeaderTransaction<'_> {
        LeaderTransaction {
            leader: self,
            tid: self.next_tid.fetch_add(1, Ordering::Relaxed),
            begin_tick: None,
            ops: Vec::new(),
        }
    }

    /// Drop log entries up to `up_to`, never past what a live batch or an
    /// open transaction still needs. Returns how many entries went.
    pub async fn compact_log(&self, up_to: Tick) -> usize {
        let oldest_batch = self.batches.oldest_tick().await;
        let mut state = self.state.write().await;
        let mut limit = up_to.min(state.tick);
        if let Some(tick) = oldest_batch {
            limit = limit.min(tick);
        }
        if let Some(begin) = state.open_transactions.values().min() {
            limit = limit.min(begin.saturating_sub(1));
        }
        let removed = state.log.compact(limit);
        debug!(endpoint = %self.endpoint, requested = up_to, compacted_through = limit, removed, "Log compacted");
        removed
    }

    pub async fn document(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        let state = self.state.read().await;
        Ok(state.collection(collection)?.get(key).cloned())
    }

    pub async fn count(&self, collection: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.collection(collection)?.len())
    }

    pub async fn checksum(&self, collection: &str, with_data: bool) -> Result<Checksum> {
        let state = self.state.read().await;
        Ok(state.collection(collection)?.checksum(with_data))
    }

    /// Number of currently leased batches.
    pub async fn live_batches(&self) -> usize {
        self.batches.live().await
    }

    pub async fn gc_batches(&self) -> usize {
        self.batches.gc_expired().await
    }

    /// Collect expired batches every `interval` until shutdown.
    pub async fn run_batch_gc(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!(endpoint = %self.endpoint, "Batch GC stopping");
                        break;
                    }
                }

                _ = timer.tick() => {
                    self.batches.gc_expired().await;
                }
            }
        }
    }

    async fn snapshot(&self, batch_id: u64) -> Result<Arc<LeaderSnapshot>> {
        self.batches.get(batch_id).await.map(|(_, snapshot)| snapshot)
    }
}

fn document_entry(tick: Tick, collection: &str, tid: Option<u64>, document: Document, replaced: bool) -> LogEntry {
    let collection = collection.to_string();
    if replaced {
        LogEntry::Update {
            tick,
            collection,
            tid,
            document,
        }
    } else {
        LogEntry::Insert {
            tick,
            collection,
            tid,
            document,
        }
    }
}

/// An open leader transaction. Consumed by [`commit`](Self::commit) or
/// [`abort`](Self::abort); dropping it leaves it open.
pub struct LeaderTransaction<'a> {
    leader: &'a InMemoryLeader,
    tid: u64,
    begin_tick: Option<Tick>,
    ops: Vec<(String, LocalOp)>,
}

impl LeaderTransaction<'_> {
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Tick of the logged `TransactionBegin`, once there is one.
    pub fn begin_tick(&self) -> Option<Tick> {
        self.begin_tick
    }

    fn ensure_begun(&mut self, state: &mut LeaderState) {
        if self.begin_tick.is_none() {
            let tick = state.next_tick();
            state.log.append(LogEntry::TransactionBegin { tick, tid: self.tid });
            state.open_transactions.insert(self.tid, tick);
            self.begin_tick = Some(tick);
        }
    }

    /// Current view of `key` inside this transaction.
    fn pending(&self, state: &LeaderState, collection: &str, key: &str) -> Result<Option<Document>> {
        let own = self
            .ops
            .iter()
            .rev()
            .find(|(c, op)| c == collection && op.key() == key)
            .map(|(_, op)| match op {
                LocalOp::Put(doc) => Some(doc.clone()),
                LocalOp::Remove { .. } => None,
            });
        match own {
            Some(view) => Ok(view),
            None => Ok(state.collection(collection)?.get(key).cloned()),
        }
    }

    pub async fn insert(&mut self, collection: &str, key: &str, body: Value) -> Result<Document> {
        let leader = self.leader;
        let mut state = leader.state.write().await;
        let replaced = self.pending(&state, collection, key)?.is_some();
        self.ensure_begun(&mut state);
        let doc = Document::new(key, next_revision(&leader.clock, leader.server_id), body);
        let tick = state.next_tick();
        state
            .log
            .append(document_entry(tick, collection, Some(self.tid), doc.clone(), replaced));
        self.ops.push((collection.to_string(), LocalOp::Put(doc.clone())));
        Ok(doc)
    }

    /// Returns whether the document existed in the transaction's view.
    pub async fn remove(&mut self, collection: &str, key: &str) -> Result<bool> {
        let leader = self.leader;
        let mut state = leader.state.write().await;
        let Some(existing) = self.pending(&state, collection, key)? else {
            return Ok(false);
        };
        self.ensure_begun(&mut state);
        let tick = state.next_tick();
        state.log.append(LogEntry::Remove {
            tick,
            collection: collection.to_string(),
            tid: Some(self.tid),
            key: key.to_string(),
            revision: existing.revision,
        });
        self.ops.push((collection.to_string(), LocalOp::remove(key)));
        Ok(true)
    }

    /// Make every operation visible at once.
    pub async fn commit(self) -> Result<()> {
        if self.begin_tick.is_none() {
            return Ok(());
        }
        let mut state = self.leader.state.write().await;

        let mut by_collection: Vec<(String, Vec<LocalOp>)> = Vec::new();
        for (collection, op) in self.ops {
            match by_collection.iter_mut().find(|(c, _)| *c == collection) {
                Some((_, ops)) => ops.push(op),
                None => by_collection.push((collection, vec![op])),
            }
        }

        let mut backups: Vec<(String, Collection)> = Vec::new();
        let mut failure = None;
        for (collection, ops) in by_collection {
            let target = match state.collections.get_mut(&collection) {
                Some(target) => target,
                None => {
                    failure = Some(ReplicationError::collection_not_found(&collection));
                    break;
                }
            };
            backups.push((collection.clone(), target.clone()));
            if let ApplyOutcome::Conflict { key, conflict, .. } = target.apply(ops) {
                failure = Some(
                    StoreError::UniqueViolation {
                        collection,
                        index: conflict.index,
                        key,
                        conflicting_key: conflict.conflicting_key,
                    }
                    .into(),
                );
                break;
            }
        }

        state.open_transactions.remove(&self.tid);
        let tick = state.next_tick();
        match failure {
            None => {
                state.log.append(LogEntry::TransactionCommit { tick, tid: self.tid });
                debug!(tid = self.tid, tick, "Leader transaction committed");
                Ok(())
            }
            Some(err) => {
                for (name, backup) in backups {
                    state.collections.insert(name, backup);
                }
                state.log.append(LogEntry::TransactionAbort { tick, tid: self.tid });
                warn!(tid = self.tid, error = %err, "Leader transaction aborted on commit");
                Err(err)
            }
        }
    }

    /// Discard every operation.
    pub async fn abort(self) {
        if self.begin_tick.is_none() {
            return;
        }
        let mut state = self.leader.state.write().await;
        state.open_transactions.remove(&self.tid);
        let tick = state.next_tick();
        state.log.append(LogEntry::TransactionAbort { tick, tid: self.tid });
        debug!(tid = self.tid, tick, "Leader transaction aborted");
    }
}

impl LeaderRef for InMemoryLeader {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn current_tick(&self) -> LeaderFuture<'_, Tick> {
        Box::pin(async move { Ok(self.state.read().await.tick) })
    }

    fn collection_spec<'a>(&'a self, collection: &'a str) -> LeaderFuture<'a, CollectionSpec> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.collection(collection)?.spec().clone())
        })
    }

    fn create_batch<'a>(&'a self, collection: &'a str, ttl: Duration) -> LeaderFuture<'a, BatchInfo> {
        Box::pin(async move {
            let (tick, snapshot) = {
                let state = self.state.read().await;
                let mut tick = state.tick;
                let open_on_collection = state
                    .open_transactions
                    .iter()
                    .filter(|(tid, _)| state.log.touches(**tid, collection))
                    .map(|(_, begin)| *begin)
                    .min();
                if let Some(begin) = open_on_collection {
                    tick = tick.min(begin.saturating_sub(1));
                }
                let collections = state
                    .collections
                    .iter()
                    .map(|(name, c)| (name.clone(), c.snapshot()))
                    .collect();
                (tick, LeaderSnapshot { collections })
            };
            self.batches.create(tick, snapshot, ttl).await
        })
    }

    fn extend_batch(&self, batch_id: u64, ttl: Duration) -> LeaderFuture<'_, ()> {
        Box::pin(async move { self.batches.extend(batch_id, ttl).await })
    }

    fn destroy_batch(&self, batch_id: u64) -> LeaderFuture<'_, ()> {
        Box::pin(async move {
            self.batches.destroy(batch_id).await;
            Ok(())
        })
    }

    fn dump<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        after: Option<DumpCursor>,
        limit: usize,
    ) -> LeaderFuture<'a, DumpChunk> {
        Box::pin(async move {
            let snapshot = self.snapshot(batch_id).await?;
            let (documents, next) = snapshot.collection(collection)?.dump(after.as_ref(), limit);
            Ok(DumpChunk { documents, next })
        })
    }

    fn tail<'a>(&'a self, collection: &'a str, after: Tick, limit: usize) -> LeaderFuture<'a, TailChunk> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.collection(collection)?;
            Ok(state.log.read_after(collection, after, limit))
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
            let snapshot = self.snapshot(batch_id).await?;
            Ok(snapshot.collection(collection)?.summary(only_populated, verification))
        })
    }

    fn range_revisions<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        ranges: &'a [KeyRange],
    ) -> LeaderFuture<'a, Vec<TreeEntry>> {
        Box::pin(async move {
            let snapshot = self.snapshot(batch_id).await?;
            Ok(snapshot.collection(collection)?.range_revisions(ranges))
        })
    }

    fn fetch_documents<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        keys: &'a [String],
    ) -> LeaderFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let snapshot = self.snapshot(batch_id).await?;
            Ok(snapshot.collection(collection)?.fetch(keys))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::IndexSpec;
    use serde_json::json;

    async fn leader() -> InMemoryLeader {
        let leader = InMemoryLeader::new("leader-1", 1);
        leader
            .create_collection(CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"])))
            .await
            .unwrap();
        leader
    }

    #[tokio::test]
    async fn test_writes_are_logged() {
        let leader = leader().await;
        leader.insert("users", "a", json!({"email": "a"})).await.unwrap();
        leader.insert("users", "a", json!({"email": "a2"})).await.unwrap();
        assert!(leader.remove("users", "a").await.unwrap());
        assert!(!leader.remove("users", "a").await.unwrap());

        let chunk = leader.tail("users", 0, 100).await.unwrap();
        let kinds: Vec<_> = chunk
            .entries
            .iter()
            .map(|e| match e {
                LogEntry::Insert { .. } => "insert",
                LogEntry::Update { .. } => "update",
                LogEntry::Remove { .. } => "remove",
                _ => "marker",
            })
            .collect();
        assert_eq!(kinds, vec!["insert", "update", "remove"]);
        assert_eq!(leader.current_tick().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unique_violation_not_logged() {
        let leader = leader().await;
        leader.insert("users", "a", json!({"email": "x"})).await.unwrap();
        let err = leader.insert("users", "b", json!({"email": "x"})).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Store(StoreError::UniqueViolation { .. })));
        assert_eq!(leader.current_tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_snapshot_is_stable() {
        let leader = leader().await;
        for i in 0..10 {
            leader.insert("users", &format!("k{i}"), json!({"email": i})).await.unwrap();
        }
        let batch = leader.create_batch("users", Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.tick, 10);
        leader.insert("users", "late", json!({"email": "late"})).await.unwrap();

        let chunk = leader.dump("users", batch.id, None, 100).await.unwrap();
        assert_eq!(chunk.documents.len(), 10);
        assert!(chunk.next.is_none());

        let summary = leader.tree_summary("users", batch.id, true, false).await.unwrap();
        assert_eq!(summary.count, 10);
        leader.destroy_batch(batch.id).await.unwrap();
        assert!(matches!(
            leader.dump("users", batch.id, None, 100).await,
            Err(ReplicationError::BatchExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let leader = leader().await;
        assert!(matches!(
            leader.collection_spec("missing").await,
            Err(ReplicationError::CollectionNotFound { .. })
        ));
        assert!(matches!(
            leader.tail("missing", 0, 10).await,
            Err(ReplicationError::CollectionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_visible_only_on_commit() {
        let leader = leader().await;
        let mut tx = leader.begin_transaction();
        tx.insert("users", "a", json!({"email": "a"})).await.unwrap();
        tx.insert("users", "b", json!({"email": "b"})).await.unwrap();
        assert_eq!(leader.count("users").await.unwrap(), 0);

        // batch taken mid-transaction lands before its begin
        let batch = leader.create_batch("users", Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.tick, 0);

        tx.commit().await.unwrap();
        assert_eq!(leader.count("users").await.unwrap(), 2);

        let chunk = leader.tail("users", 0, 100).await.unwrap();
        assert!(matches!(chunk.entries.first(), Some(LogEntry::TransactionBegin { .. })));
        assert!(matches!(chunk.entries.last(), Some(LogEntry::TransactionCommit { .. })));
        assert_eq!(chunk.entries.len(), 4);
    }

    #[tokio::test]
    async fn test_batch_tick_ignores_transactions_on_other_collections() {
        let leader = leader().await;
        leader.create_collection(CollectionSpec::new("orders")).await.unwrap();
        leader.insert("users", "a", json!({"email": "a"})).await.unwrap();

        let mut tx = leader.begin_transaction();
        tx.insert("orders", "o1", json!({})).await.unwrap();
        leader.insert("users", "b", json!({"email": "b"})).await.unwrap();
        let tick = leader.current_tick().await.unwrap();

        let users = leader.create_batch("users", Duration::from_secs(60)).await.unwrap();
        assert_eq!(users.tick, tick);
        let orders = leader.create_batch("orders", Duration::from_secs(60)).await.unwrap();
        assert_eq!(orders.tick, 1);
        tx.abort().await;
    }

    #[tokio::test]
    async fn test_transaction_conflict_aborts() {
        let leader = leader().await;
        leader.insert("users", "a", json!({"email": "x"})).await.unwrap();
        let mut tx = leader.begin_transaction();
        tx.insert("users", "b", json!({"email": "y"})).await.unwrap();
        tx.insert("users", "c", json!({"email": "x"})).await.unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(leader.count("users").await.unwrap(), 1);
        let chunk = leader.tail("users", 0, 100).await.unwrap();
        assert!(matches!(chunk.entries.last(), Some(LogEntry::TransactionAbort { .. })));
    }

    #[tokio::test]
    async fn test_abort_logs_marker() {
        let leader = leader().await;
        let mut tx = leader.begin_transaction();
        tx.insert("users", "a", json!({"email": "a"})).await.unwrap();
        tx.abort().await;
        assert_eq!(leader.count("users").await.unwrap(), 0);
        assert_eq!(leader.current_tick().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_compaction_respects_batches() {
        let leader = leader().await;
        for i in 0..5 {
            leader.insert("users", &format!("k{i}"), json!({"email": i})).await.unwrap();
        }
        let batch = leader.create_batch("users", Duration::from_secs(60)).await.unwrap();
        for i in 5..10 {
            leader.insert("users", &format!("k{i}"), json!({"email": i})).await.unwrap();
        }
        assert_eq!(leader.compact_log(8).await, 5);
        assert!(leader.tail("users", batch.tick, 100).await.unwrap().from_present);

        leader.destroy_batch(batch.id).await.unwrap();
        leader.compact_log(8).await;
        assert!(!leader.tail("users", batch.tick, 100).await.unwrap().from_present);
    }

    #[tokio::test]
    async fn test_batch_gc_stops_on_shutdown() {
        let config = ReplicationConfig::for_testing(1);
        let leader = Arc::new(InMemoryLeader::from_config("leader-1", &config));
        leader.create_batch("users", Duration::from_millis(1)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&leader).run_batch_gc(Duration::from_millis(5), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(leader.live_batches().await, 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
