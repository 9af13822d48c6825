// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Continuous applier: tails the leader's log for one collection.
//!
//! Each replicated collection has a dedicated task that:
//! 1. Tails the leader from its last processed tick (with retry on transport errors)
//! 2. Applies standalone document operations immediately, one unit each
//! 3. Buffers transactional operations until the commit marker arrives
//! 4. Publishes its state on a watch channel and into the progress store
//!
//! # Ticks
//!
//! `last_processed_tick` is how far the log has been read. `last_applied_tick`
//! trails it while a transaction is open: it never passes the tick before the
//! oldest open transaction's begin, so a restart from the persisted tick
//! replays that transaction in full.
//!
//! # Shutdown
//!
//! The task stops when the shutdown channel changes or on the first
//! non-retryable error. Either way open transactions are dropped, the final
//! state is published with `running == false` and the error (if any) is
//! recorded in `last_error`.

mod state;
mod transaction;

pub use state::{ApplierState, ApplierStats, ApplierStatus};
pub use transaction::{OpenTransaction, TransactionBuffer};

use crate::circuit_breaker::StoreCircuit;
use crate::config::ApplierConfig;
use crate::conflict::{apply_unit, ChunkWrites};
use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use crate::leader::LeaderRef;
use crate::metrics;
use crate::oplog::{LogEntry, TailChunk};
use crate::progress::{ProgressRecord, ProgressStore};
use crate::resilience::RateLimiter;
use crate::store::{DocumentStore, LocalOp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything an applier task needs.
pub struct ApplierContext<L: LeaderRef, S: DocumentStore> {
    pub collection: String,
    pub leader: Arc<L>,
    pub store: Arc<S>,
    pub circuit: Arc<StoreCircuit>,
    pub progress: Arc<ProgressStore>,
    pub config: ApplierConfig,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Run the applier for one collection until shutdown or failure.
///
/// The initial state (start tick, carried-over stats) is whatever
/// `state_tx` holds when the task starts.
pub async fn run_applier<L: LeaderRef, S: DocumentStore>(
    ctx: ApplierContext<L, S>,
    state_tx: Arc<watch::Sender<ApplierState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("applier", collection = %ctx.collection, leader = %ctx.leader.endpoint());

    async move {
        let mut state = state_tx.borrow().clone();
        state.running = true;
        state.last_processed_tick = state.last_processed_tick.max(state.last_applied_tick);

        let mut applier = Applier {
            ctx,
            state,
            buffer: TransactionBuffer::new(),
            chunk_writes: ChunkWrites::new(),
        };
        info!(from_tick = applier.state.last_applied_tick, "Starting applier");
        metrics::set_applier_running(&applier.ctx.collection, true);
        applier.publish(&state_tx).await;

        let result = applier.run(&state_tx, &mut shutdown_rx).await;
        applier.finish(result, &state_tx).await;
    }
    .instrument(span)
    .await
}

struct Applier<L: LeaderRef, S: DocumentStore> {
    ctx: ApplierContext<L, S>,
    state: ApplierState,
    buffer: TransactionBuffer,
    chunk_writes: ChunkWrites,
}

impl<L: LeaderRef, S: DocumentStore> Applier<L, S> {
    async fn run(&mut self, state_tx: &watch::Sender<ApplierState>, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let idle_min = self.ctx.config.idle_poll_interval();
        let idle_max = self.ctx.config.max_idle_poll_interval();
        let mut idle = idle_min;

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let chunk = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received during tail");
                    return Ok(());
                }

                result = self.fetch() => result?,
            };

            let drained = chunk.entries.is_empty() && !chunk.has_more;
            self.process(chunk).await?;
            self.publish(state_tx).await;

            if !drained {
                idle = idle_min;
                continue;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received while idle");
                    return Ok(());
                }

                _ = tokio::time::sleep(idle) => {}
            }
            idle = (idle * 2).min(idle_max);
        }
    }

    /// Tail once, retrying retryable failures with backoff.
    async fn fetch(&mut self) -> Result<TailChunk> {
        let retry = self.ctx.config.retry_config();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self
                .ctx
                .leader
                .tail(&self.ctx.collection, self.state.last_processed_tick, self.ctx.config.chunk_size)
                .await;
            let elapsed = started.elapsed();
            metrics::record_fetch_latency(&self.ctx.collection, elapsed);
            self.state.stats.fetch_requests += 1;
            self.state.stats.fetch_time_ms += millis(elapsed);

            match result {
                Ok(chunk) => return Ok(chunk),
                Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = millis(delay),
                        error = %e,
                        "Tail failed, retrying"
                    );
                    metrics::record_fetch_retry(&self.ctx.collection);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process(&mut self, chunk: TailChunk) -> Result<()> {
        if !chunk.from_present {
            if self.ctx.config.require_from_present {
                return Err(ReplicationError::TickNotPresent {
                    collection: self.ctx.collection.clone(),
                    requested: self.state.last_processed_tick,
                    compacted_through: chunk.compacted_through,
                });
            }
            warn!(
                requested = self.state.last_processed_tick,
                compacted_through = chunk.compacted_through,
                "Leader compacted entries past our position, continuing with a gap"
            );
            metrics::record_not_from_present(&self.ctx.collection);
        }

        self.state.leader_tick = chunk.leader_tick;
        let fetched = chunk.entries.len();
        self.state.stats.entries_fetched += fetched as u64;
        metrics::record_entries_fetched(&self.ctx.collection, fetched);

        let started = Instant::now();
        self.chunk_writes.clear();
        for entry in chunk.entries {
            if entry.collection().is_some_and(|c| c != self.ctx.collection) {
                continue;
            }
            let tick = entry.tick();
            self.apply_entry(entry).await?;
            self.state.last_processed_tick = self.state.last_processed_tick.max(tick);
            self.advance_applied();
        }
        self.state.last_processed_tick = self.state.last_processed_tick.max(chunk.scanned_to);
        self.advance_applied();

        if fetched > 0 {
            let elapsed = started.elapsed();
            self.state.stats.apply_time_ms += millis(elapsed);
            metrics::record_apply_latency(&self.ctx.collection, elapsed);
            if let Some(limiter) = &self.ctx.rate_limiter {
                limiter.acquire_many(u32::try_from(fetched).unwrap_or(u32::MAX)).await;
            }
        }
        Ok(())
    }

    async fn apply_entry(&mut self, entry: LogEntry) -> Result<()> {
        match entry {
            LogEntry::Insert { tick, tid, document, .. } | LogEntry::Update { tick, tid, document, .. } => {
                self.apply_op(tick, tid, LocalOp::Put(document)).await
            }
            LogEntry::Remove { tick, tid, key, .. } => self.apply_op(tick, tid, LocalOp::Remove { key }).await,
            LogEntry::TransactionBegin { tick, tid } => {
                self.buffer.begin(tid, tick);
                Ok(())
            }
            LogEntry::TransactionCommit { tick, tid } => self.commit(tid, tick).await,
            LogEntry::TransactionAbort { tid, .. } => {
                let dropped = self.buffer.discard(tid);
                debug!(tid, dropped, "Transaction aborted on leader");
                self.state.stats.transactions_aborted += 1;
                metrics::record_transaction(&self.ctx.collection, "aborted");
                Ok(())
            }
        }
    }

    async fn apply_op(&mut self, tick: Tick, tid: Option<u64>, op: LocalOp) -> Result<()> {
        match tid {
            Some(tid) => {
                self.buffer.push(tid, tick, op);
                Ok(())
            }
            None => self.apply(vec![op], tick).await,
        }
    }

    async fn commit(&mut self, tid: u64, tick: Tick) -> Result<()> {
        let Some(tx) = self.buffer.take(tid) else {
            // nothing of the transaction concerned us after our start tick
            debug!(tid, "Commit for unknown transaction");
            return Ok(());
        };
        debug!(tid, ops = tx.ops.len(), begin_tick = tx.begin_tick, "Applying transaction");
        self.apply(tx.ops, tick).await?;
        self.state.stats.transactions_committed += 1;
        metrics::record_transaction(&self.ctx.collection, "committed");
        Ok(())
    }

    async fn apply(&mut self, ops: Vec<LocalOp>, tick: Tick) -> Result<()> {
        let removals = ops.iter().filter(|op| matches!(op, LocalOp::Remove { .. })).count();
        let documents = ops.len() - removals;
        let report = apply_unit(
            self.ctx.store.as_ref(),
            &self.ctx.circuit,
            &self.ctx.collection,
            ops.clone(),
            tick,
            &self.chunk_writes,
        )
        .await?;
        self.chunk_writes.record(&ops);

        let stats = &mut self.state.stats;
        stats.documents_applied += documents as u64;
        stats.removals_applied += removals as u64;
        stats.conflicts_resolved += report.conflicts_resolved as u64;
        metrics::record_documents_applied(&self.ctx.collection, documents);
        metrics::record_removals_applied(&self.ctx.collection, removals);
        if report.conflicts_resolved > 0 {
            metrics::record_conflicts_resolved(&self.ctx.collection, report.conflicts_resolved);
        }
        Ok(())
    }

    fn advance_applied(&mut self) {
        let safe = match self.buffer.earliest_begin() {
            Some(begin) => begin.saturating_sub(1),
            None => self.state.last_processed_tick,
        };
        self.state.last_applied_tick = self.state.last_applied_tick.max(safe);
    }

    async fn publish(&self, state_tx: &watch::Sender<ApplierState>) {
        state_tx.send_replace(self.state.clone());

        let mut record = ProgressRecord::new(
            self.ctx.collection.clone(),
            self.ctx.leader.endpoint(),
            self.state.last_applied_tick,
        );
        record.last_error = self.state.last_error.clone();
        record.stats = self.state.stats.clone();
        self.ctx.progress.set(record).await;

        metrics::set_applied_tick(&self.ctx.collection, self.state.last_applied_tick);
        metrics::set_applier_lag(&self.ctx.collection, self.state.lag());
    }

    async fn finish(&mut self, result: Result<()>, state_tx: &watch::Sender<ApplierState>) {
        if !self.buffer.is_empty() {
            debug!(open = self.buffer.len(), "Dropping open transactions");
            self.buffer.clear();
        }
        self.state.running = false;

        match result {
            Ok(()) => info!(last_applied_tick = self.state.last_applied_tick, "Applier stopped"),
            Err(e) => {
                error!(
                    last_applied_tick = self.state.last_applied_tick,
                    error = %e,
                    "Applier failed"
                );
                metrics::record_error(&self.ctx.collection, &e.class().to_string());
                self.state.last_error = Some(e.to_string());
            }
        }

        metrics::set_applier_running(&self.ctx.collection, false);
        self.publish(state_tx).await;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProgressConfig, ReplicationConfig};
    use crate::document::{CollectionSpec, IndexSpec};
    use crate::leader::InMemoryLeader;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryStore>,
        progress: Arc<ProgressStore>,
        state_rx: watch::Receiver<ApplierState>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn users() -> CollectionSpec {
        CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"]))
    }

    async fn leader() -> Arc<InMemoryLeader> {
        let leader = Arc::new(InMemoryLeader::new("leader-1", 1));
        leader.create_collection(users()).await.unwrap();
        leader
    }

    async fn start(leader: Arc<InMemoryLeader>, from: Tick, config: ApplierConfig) -> Harness {
        let store = Arc::new(MemoryStore::new(2));
        store.create_collection(users()).await.unwrap();
        let progress = Arc::new(ProgressStore::open(&ProgressConfig::in_memory()).await.unwrap());

        let (state_tx, state_rx) = watch::channel(ApplierState::new("users", "leader-1", from));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ApplierContext {
            collection: "users".to_string(),
            leader,
            store: Arc::clone(&store),
            circuit: Arc::new(StoreCircuit::new()),
            progress: Arc::clone(&progress),
            config,
            rate_limiter: None,
        };
        let task = tokio::spawn(run_applier(ctx, Arc::new(state_tx), shutdown_rx));
        Harness {
            store,
            progress,
            state_rx,
            shutdown_tx,
            task,
        }
    }

    fn config() -> ApplierConfig {
        ReplicationConfig::for_testing(2).applier
    }

    async fn wait_until(state_rx: &mut watch::Receiver<ApplierState>, pred: impl FnMut(&ApplierState) -> bool) -> ApplierState {
        tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(pred))
            .await
            .expect("applier did not reach expected state")
            .expect("applier state channel closed")
            .clone()
    }

    #[tokio::test]
    async fn test_applies_standalone_operations() {
        let leader = leader().await;
        leader.insert("users", "a", json!({"email": "a@x"})).await.unwrap();
        leader.insert("users", "b", json!({"email": "b@x"})).await.unwrap();
        leader.remove("users", "a").await.unwrap();
        let target = leader.current_tick().await.unwrap();

        let mut h = start(leader, 0, config()).await;
        let state = wait_until(&mut h.state_rx, |s| s.last_applied_tick >= target).await;
        assert!(state.running);
        assert_eq!(state.stats.documents_applied, 2);
        assert_eq!(state.stats.removals_applied, 1);
        assert!(h.store.get("users", "a").await.unwrap().is_none());
        assert!(h.store.get("users", "b").await.unwrap().is_some());

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
        let final_state = h.state_rx.borrow().clone();
        assert!(!final_state.running);
        assert!(final_state.last_error.is_none());
        assert_eq!(h.progress.get("users").await.unwrap().last_applied_tick, target);
    }

    #[tokio::test]
    async fn test_transaction_applied_on_commit_only() {
        let leader = leader().await;
        let mut h = start(Arc::clone(&leader), 0, config()).await;

        let mut tx = leader.begin_transaction();
        tx.insert("users", "t1", json!({"email": "t1@x"})).await.unwrap();
        tx.insert("users", "t2", json!({"email": "t2@x"})).await.unwrap();
        let begin = tx.begin_tick().unwrap();

        let open = wait_until(&mut h.state_rx, |s| s.last_processed_tick >= begin + 1).await;
        assert_eq!(open.last_applied_tick, begin - 1);
        assert_eq!(h.store.count("users").await.unwrap(), 0);

        tx.commit().await.unwrap();
        let target = leader.current_tick().await.unwrap();
        let state = wait_until(&mut h.state_rx, |s| s.last_applied_tick >= target).await;
        assert_eq!(state.stats.transactions_committed, 1);
        assert_eq!(h.store.count("users").await.unwrap(), 2);

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_transaction_is_discarded() {
        let leader = leader().await;
        let mut tx = leader.begin_transaction();
        tx.insert("users", "t1", json!({"email": "t1@x"})).await.unwrap();
        tx.abort().await;
        leader.insert("users", "after", json!({"email": "after@x"})).await.unwrap();
        let target = leader.current_tick().await.unwrap();

        let mut h = start(leader, 0, config()).await;
        let state = wait_until(&mut h.state_rx, |s| s.last_applied_tick >= target).await;
        assert_eq!(state.stats.transactions_aborted, 1);
        assert!(h.store.get("users", "t1").await.unwrap().is_none());
        assert!(h.store.get("users", "after").await.unwrap().is_some());

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_compacted_start_fails_when_required() {
        let leader = leader().await;
        for i in 0..5 {
            leader.insert("users", &format!("k{i}"), json!({"email": format!("{i}@x")})).await.unwrap();
        }
        assert!(leader.compact_log(3).await > 0);

        let mut config = config();
        config.require_from_present = true;
        let mut h = start(leader, 1, config).await;
        h.task.await.unwrap();
        let state = h.state_rx.borrow_and_update().clone();
        assert!(!state.running);
        assert!(state.last_error.unwrap().contains("no longer present"));
    }

    #[tokio::test]
    async fn test_compacted_start_continues_when_allowed() {
        let leader = leader().await;
        for i in 0..5 {
            leader.insert("users", &format!("k{i}"), json!({"email": format!("{i}@x")})).await.unwrap();
        }
        leader.compact_log(3).await;
        let target = leader.current_tick().await.unwrap();

        let mut h = start(leader, 1, config()).await;
        let state = wait_until(&mut h.state_rx, |s| s.last_applied_tick >= target).await;
        assert_eq!(state.stats.documents_applied, 2);

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_unique_holder_loses_to_leader() {
        let leader = leader().await;
        let mut h = start(Arc::clone(&leader), 0, config()).await;

        h.store.write("users", "local", json!({"email": "dup@x"})).await.unwrap();
        let mut tx = leader.begin_transaction();
        tx.insert("users", "r1", json!({"email": "dup@x"})).await.unwrap();
        tx.commit().await.unwrap();
        let target = leader.current_tick().await.unwrap();

        let state = wait_until(&mut h.state_rx, |s| s.last_applied_tick >= target).await;
        assert_eq!(state.stats.conflicts_resolved, 1);
        assert!(h.store.get("users", "local").await.unwrap().is_none());

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
    }
}
