// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full synchronization by dump.

use super::{LeaseKeeper, SyncOutcome, SyncStats, Synchronizer};
use crate::batch::BatchInfo;
use crate::conflict::{apply_unit, ChunkWrites};
use crate::document::CollectionSpec;
use crate::error::Result;
use crate::leader::LeaderRef;
use crate::metrics;
use crate::store::{DocumentStore, DumpCursor, LocalOp};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

impl<L: LeaderRef, S: DocumentStore> Synchronizer<'_, L, S> {
    /// Replace the local collection with the leader's current snapshot.
    ///
    /// Local documents of the collection are disposable: the collection is
    /// recreated with the leader's definition before loading. If the dump is
    /// interrupted the partial copy is truncated and the error returned; a
    /// retry starts over.
    #[instrument(skip(self), fields(leader = %self.leader.endpoint()))]
    pub async fn full_sync(&self, collection: &str) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut stats = SyncStats::default();

        let result = self.full_sync_inner(collection, &mut stats).await;
        metrics::record_sync(collection, "full", result.is_ok(), started.elapsed());

        match result {
            Ok(resume_tick) => {
                metrics::record_sync_documents(collection, stats.documents_inserted, stats.documents_removed);
                info!(
                    resume_tick,
                    documents = stats.documents_inserted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Full sync complete"
                );
                Ok(SyncOutcome {
                    collection: collection.to_string(),
                    incremental: false,
                    resume_tick,
                    stats,
                    ranges_repaired: 0,
                    verification_rounds: 0,
                })
            }
            Err(e) => {
                warn!(error = %e, "Full sync failed");
                Err(e)
            }
        }
    }

    async fn full_sync_inner(&self, collection: &str, stats: &mut SyncStats) -> Result<u64> {
        let batch = self
            .timed(stats, self.leader.create_batch(collection, self.config.batch_ttl()))
            .await?;
        debug!(batch_id = batch.id, tick = batch.tick, "Pinned leader snapshot");

        let loaded = match self.timed(stats, self.leader.collection_spec(collection)).await {
            Ok(spec) => self.load_dump(spec, &batch, stats).await,
            Err(e) => {
                self.release(&batch).await;
                return Err(e);
            }
        };
        self.release(&batch).await;

        if let Err(e) = loaded {
            match self.circuit.write(|| self.store.truncate(collection)).await {
                Ok(discarded) => debug!(discarded, "Discarded partial dump"),
                Err(cleanup) => warn!(error = %cleanup, "Failed to discard partial dump"),
            }
            return Err(e);
        }
        Ok(batch.tick)
    }

    async fn load_dump(&self, spec: CollectionSpec, batch: &BatchInfo, stats: &mut SyncStats) -> Result<()> {
        let collection = spec.name.clone();
        self.circuit.write(|| self.store.recreate_collection(spec)).await?;

        let mut lease = LeaseKeeper::new(batch.id, self.config.batch_ttl());
        let mut cursor: Option<DumpCursor> = None;
        loop {
            if lease.keep_alive(self.leader).await? {
                stats.batch_extensions += 1;
            }

            let chunk = self
                .timed(
                    stats,
                    self.leader
                        .dump(&collection, batch.id, cursor.take(), self.config.dump_chunk_size),
                )
                .await?;
            stats.dump_requests += 1;

            let count = chunk.documents.len();
            if count > 0 {
                let ops: Vec<LocalOp> = chunk.documents.into_iter().map(LocalOp::Put).collect();
                let report = apply_unit(self.store, self.circuit, &collection, ops, 0, &ChunkWrites::new()).await?;
                stats.documents_inserted += count as u64;
                stats.conflicts_resolved += report.conflicts_resolved as u64;
            }
            debug!(documents = count, total = stats.documents_inserted, "Dump chunk loaded");

            match chunk.next {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::StoreCircuit;
    use crate::config::SyncConfig;
    use crate::document::IndexSpec;
    use crate::leader::InMemoryLeader;
    use crate::store::MemoryStore;
    use crate::ReplicationError;
    use serde_json::json;

    fn config() -> SyncConfig {
        SyncConfig {
            dump_chunk_size: 7,
            ..SyncConfig::default()
        }
    }

    async fn leader_with(n: usize) -> InMemoryLeader {
        let leader = InMemoryLeader::new("leader-1", 1);
        leader
            .create_collection(CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"])))
            .await
            .unwrap();
        for i in 0..n {
            leader
                .insert("users", &format!("u{i}"), json!({"email": format!("u{i}@x")}))
                .await
                .unwrap();
        }
        leader
    }

    #[tokio::test]
    async fn test_full_sync_converges_and_replaces_local_data() {
        let leader = leader_with(50).await;
        let store = MemoryStore::new(2);
        store.create_collection(CollectionSpec::new("users")).await.unwrap();
        store.write("users", "stale", json!({"email": "stale@x"})).await.unwrap();

        let circuit = StoreCircuit::new();
        let config = config();
        let outcome = Synchronizer::new(&leader, &store, &circuit, &config)
            .full_sync("users")
            .await
            .unwrap();

        assert_eq!(outcome.resume_tick, leader.current_tick().await.unwrap());
        assert_eq!(outcome.stats.documents_inserted, 50);
        assert_eq!(outcome.stats.dump_requests, 8);
        assert!(store.get("users", "stale").await.unwrap().is_none());
        assert_eq!(
            store.checksum("users", true).await.unwrap(),
            leader.checksum("users", true).await.unwrap()
        );
        // recreated with the leader's indexes
        let spec = store.collection_spec("users").await.unwrap().unwrap();
        assert_eq!(spec.indexes.len(), 1);
        assert_eq!(leader.live_batches().await, 0);
    }

    #[tokio::test]
    async fn test_full_sync_of_empty_collection() {
        let leader = leader_with(0).await;
        let store = MemoryStore::new(2);
        let circuit = StoreCircuit::new();
        let config = config();
        let outcome = Synchronizer::new(&leader, &store, &circuit, &config)
            .full_sync("users")
            .await
            .unwrap();
        assert_eq!(outcome.stats.documents_inserted, 0);
        assert_eq!(store.count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_sync_missing_leader_collection() {
        let leader = leader_with(0).await;
        let store = MemoryStore::new(2);
        let circuit = StoreCircuit::new();
        let config = config();
        let err = Synchronizer::new(&leader, &store, &circuit, &config)
            .full_sync("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::CollectionNotFound { .. }));
        assert!(!err.is_retryable());
        assert_eq!(leader.live_batches().await, 0);
    }
}
