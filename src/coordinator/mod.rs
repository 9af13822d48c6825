// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager.
//!
//! The orchestrator that owns everything replication needs:
//! - The registry of leaders, by endpoint
//! - The registry of appliers, one per collection (see [`crate::applier`])
//! - Progress persistence via [`crate::progress::ProgressStore`]
//! - One-shot synchronization via [`crate::sync::Synchronizer`]
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────┐
//!                 │          ReplicationManager            │
//!  LeaderRef ◄────┤  leaders: endpoint → Arc<L>            │
//!                 │  appliers: collection → ApplierHandle  │──► ProgressStore (SQLite)
//!                 │  sync locks + bulkhead                 │
//!                 └──────┬──────────────────────┬──────────┘
//!                        │ spawn                │ sync_collection
//!                        ▼                      ▼
//!                  run_applier task        Synchronizer
//!                        │                      │
//!                        └──► StoreCircuit ◄────┘──► DocumentStore
//! ```
//!
//! Synchronizing a collection quiesces its applier first and restarts it
//! from the resume tick afterwards. A failed synchronization leaves the
//! applier stopped, since the local copy no longer matches any tick.

mod types;

pub use types::{ManagerState, StartOptions, SyncOptions};

use crate::applier::{run_applier, ApplierContext, ApplierState};
use crate::circuit_breaker::StoreCircuit;
use crate::config::ReplicationConfig;
use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use crate::leader::LeaderRef;
use crate::metrics;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::store::{DocumentStore, MemoryStore};
use crate::sync::{ConsistencyReport, SyncOutcome, Synchronizer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drain timeout for background tasks on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry entry for one collection's applier.
struct ApplierHandle {
    leader: String,
    options: StartOptions,
    state_tx: Arc<watch::Sender<ApplierState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ApplierHandle {
    fn state(&self) -> ApplierState {
        self.state_tx.borrow().clone()
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Owns the appliers of this follower and the leaders they follow.
///
/// All operations take `&self`, so the manager can be shared behind an `Arc`.
pub struct ReplicationManager<L: LeaderRef, S: DocumentStore = MemoryStore> {
    config: ReplicationConfig,
    store: Arc<S>,
    circuit: Arc<StoreCircuit>,
    progress: Arc<ProgressStore>,
    leaders: RwLock<HashMap<String, Arc<L>>>,
    appliers: Mutex<HashMap<String, ApplierHandle>>,
    /// Serializes synchronization, verification and start per collection.
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bulkhead: Bulkhead,
    /// Shared across appliers.
    rate_limiter: Option<Arc<RateLimiter>>,
    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: LeaderRef> ReplicationManager<L, MemoryStore> {
    /// Manager over a fresh in-memory store shaped by `config`.
    pub async fn in_memory(config: ReplicationConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::with_tree_config(config.server_id, config.tree));
        Self::new(config, store).await
    }
}

impl<L: LeaderRef, S: DocumentStore> ReplicationManager<L, S> {
    /// Create a manager. Opens the progress store; no tasks run until
    /// [`start()`](Self::start).
    pub async fn new(config: ReplicationConfig, store: Arc<S>) -> Result<Self> {
        let progress = ProgressStore::open(&config.progress).await?;
        info!(path = %config.progress.sqlite_path, "Progress store initialized");

        let rate_limiter = config.applier.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for appliers"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let (state_tx, state_rx) = watch::channel(ManagerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            bulkhead: Bulkhead::for_syncs(config.sync.max_concurrent_syncs),
            config,
            store,
            circuit: Arc::new(StoreCircuit::new()),
            progress: Arc::new(progress),
            leaders: RwLock::new(HashMap::new()),
            appliers: Mutex::new(HashMap::new()),
            sync_locks: Mutex::new(HashMap::new()),
            rate_limiter,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Start background tasks (progress flushing).
    pub async fn start(&self) -> Result<()> {
        if self.state() != ManagerState::Created {
            return Err(ReplicationError::InvalidState {
                expected: ManagerState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        self.spawn_progress_flush_task().await;

        self.set_state(ManagerState::Running);
        info!(server_id = self.config.server_id, "Replication manager running");
        Ok(())
    }

    fn set_state(&self, state: ManagerState) {
        let _ = self.state_tx.send(state);
        metrics::set_manager_state(&state.to_string());
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ManagerState::Running => Ok(()),
            ManagerState::ShuttingDown | ManagerState::Stopped => Err(ReplicationError::Shutdown),
            other => Err(ReplicationError::InvalidState {
                expected: ManagerState::Running.to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Periodically flush dirty progress records to SQLite.
    async fn spawn_progress_flush_task(&self) {
        let progress = Arc::clone(&self.progress);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.progress.flush_interval();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Progress flush task stopping");
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        if let Err(e) = progress.flush_dirty().await {
                            warn!(error = %e, "Failed to flush progress");
                        }
                    }
                }
            }
        });

        debug!(interval_ms = flush_interval.as_millis() as u64, "Spawned progress flush task");
        self.background.lock().await.push(handle);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leaders
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a leader under its endpoint. Returns `false` if it replaced
    /// an earlier registration.
    pub async fn register_leader(&self, leader: Arc<L>) -> bool {
        let endpoint = leader.endpoint().to_string();
        let replaced = self.leaders.write().await.insert(endpoint.clone(), leader).is_some();
        info!(leader = %endpoint, replaced, "Registered leader");
        !replaced
    }

    async fn leader(&self, endpoint: &str) -> Result<Arc<L>> {
        self.leaders
            .read()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ReplicationError::Config(format!("unknown leader endpoint {endpoint}")))
    }

    /// Explicit endpoint, else the one the collection follows, else the only
    /// registered leader.
    async fn resolve_leader(&self, collection: &str, explicit: Option<&str>) -> Result<String> {
        if let Some(endpoint) = explicit {
            return Ok(endpoint.to_string());
        }
        if let Some(handle) = self.appliers.lock().await.get(collection) {
            return Ok(handle.leader.clone());
        }
        if let Some(record) = self.progress.get(collection).await {
            return Ok(record.leader);
        }
        let leaders = self.leaders.read().await;
        if let (1, Some(only)) = (leaders.len(), leaders.keys().next()) {
            return Ok(only.clone());
        }
        Err(ReplicationError::Config(format!(
            "no leader known for {collection}, pass one explicitly"
        )))
    }

    async fn sync_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().await;
        Arc::clone(locks.entry(collection.to_string()).or_default())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Appliers
    // ═══════════════════════════════════════════════════════════════════════

    /// Start continuous replication of `collection` from `leader_endpoint`.
    ///
    /// Resumes from `options.from_tick` if given (it may not move backwards
    /// from the persisted tick), otherwise from the persisted tick. Without
    /// either, fails with [`ReplicationError::StartTickRequired`].
    pub async fn start_replication(
        &self,
        collection: &str,
        leader_endpoint: &str,
        options: StartOptions,
    ) -> Result<ApplierState> {
        self.ensure_running()?;
        let leader = self.leader(leader_endpoint).await?;
        if self
            .circuit
            .read(|| self.store.collection_spec(collection))
            .await?
            .is_none()
        {
            return Err(ReplicationError::collection_not_found(collection));
        }

        let lock = self.sync_lock(collection).await;
        let _guard = lock.lock().await;
        let mut appliers = self.appliers.lock().await;
        if appliers.get(collection).is_some_and(ApplierHandle::is_running) {
            return Err(ReplicationError::InvalidState {
                expected: "Stopped".to_string(),
                actual: "Running".to_string(),
            });
        }

        let persisted = self.progress.get(collection).await;
        let start_tick = resolve_start_tick(collection, options.from_tick, persisted.as_ref())?;

        let mut initial = ApplierState::new(collection, leader_endpoint, start_tick);
        if let Some(record) = persisted {
            if record.leader == leader_endpoint {
                initial.stats = record.stats;
            } else {
                warn!(
                    collection,
                    previous = %record.leader,
                    leader = %leader_endpoint,
                    "Switching leader; ticks of the previous leader do not carry over"
                );
            }
        }

        let handle = self.spawn_applier(collection, leader, options, initial);
        let state = handle.state();
        appliers.insert(collection.to_string(), handle);
        metrics::set_running_appliers(running_count(&appliers));
        Ok(state)
    }

    fn spawn_applier(
        &self,
        collection: &str,
        leader: Arc<L>,
        options: StartOptions,
        mut initial: ApplierState,
    ) -> ApplierHandle {
        let mut config = self.config.applier.clone();
        if let Some(chunk_size) = options.chunk_size {
            config.chunk_size = chunk_size.max(1);
        }
        if let Some(required) = options.require_from_present {
            config.require_from_present = required;
        }

        initial.running = true;
        initial.last_error = None;
        initial.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
        let from_tick = initial.last_applied_tick;

        let endpoint = leader.endpoint().to_string();
        let (state_tx, _) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = ApplierContext {
            collection: collection.to_string(),
            leader,
            store: Arc::clone(&self.store),
            circuit: Arc::clone(&self.circuit),
            progress: Arc::clone(&self.progress),
            config,
            rate_limiter: self.rate_limiter.clone(),
        };
        let task = tokio::spawn(run_applier(ctx, Arc::clone(&state_tx), stop_rx));
        info!(collection, leader = %endpoint, from_tick, "Spawned applier");

        ApplierHandle {
            leader: endpoint,
            options,
            state_tx,
            stop_tx,
            task: Some(task),
        }
    }

    /// Signal an applier to stop and wait for it (bounded by the configured
    /// stop timeout, after which the task is aborted).
    async fn stop_handle(&self, collection: &str, handle: &mut ApplierHandle) -> ApplierState {
        let Some(mut task) = handle.task.take() else {
            return handle.state();
        };
        let _ = handle.stop_tx.send(true);

        let timeout = self.config.applier.stop_timeout();
        let forced = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(collection, error = %e, "Applier task panicked");
                Some(format!("applier task panicked: {e}"))
            }
            Err(_) => {
                warn!(collection, timeout_ms = timeout.as_millis() as u64, "Applier did not stop in time, aborting");
                task.abort();
                None
            }
        };
        handle.state_tx.send_modify(|state| {
            state.running = false;
            if forced.is_some() {
                state.last_error = forced;
            }
        });
        metrics::set_applier_running(collection, false);

        if let Err(e) = self.progress.flush_dirty().await {
            warn!(collection, error = %e, "Failed to flush progress after stop");
        }
        handle.state()
    }

    /// Stop the applier of `collection`. Stopping a stopped applier returns
    /// its state unchanged.
    pub async fn stop_replication(&self, collection: &str) -> Result<ApplierState> {
        let mut appliers = self.appliers.lock().await;
        let handle = appliers
            .get_mut(collection)
            .ok_or_else(|| ReplicationError::ApplierNotFound {
                collection: collection.to_string(),
            })?;
        let state = self.stop_handle(collection, handle).await;
        metrics::set_running_appliers(running_count(&appliers));
        info!(collection, last_applied_tick = state.last_applied_tick, "Replication stopped");
        Ok(state)
    }

    /// Drop all persisted progress and statistics of a stopped applier.
    /// The next start needs an explicit tick.
    pub async fn forget_replication(&self, collection: &str) -> Result<()> {
        let mut appliers = self.appliers.lock().await;
        if appliers.get(collection).is_some_and(ApplierHandle::is_running) {
            return Err(ReplicationError::InvalidState {
                expected: "Stopped".to_string(),
                actual: "Running".to_string(),
            });
        }
        let had_handle = appliers.remove(collection).is_some();
        let had_progress = self.progress.forget(collection).await?;
        if !had_handle && !had_progress {
            return Err(ReplicationError::ApplierNotFound {
                collection: collection.to_string(),
            });
        }
        info!(collection, "Replication progress forgotten");
        Ok(())
    }

    /// Current state of a collection's applier, live or persisted.
    pub async fn applier_state(&self, collection: &str) -> Result<ApplierState> {
        if let Some(handle) = self.appliers.lock().await.get(collection) {
            return Ok(handle.state());
        }
        self.progress
            .get(collection)
            .await
            .map(state_from_record)
            .ok_or_else(|| ReplicationError::ApplierNotFound {
                collection: collection.to_string(),
            })
    }

    /// States of all known appliers, ordered by collection.
    pub async fn all_states(&self) -> Vec<ApplierState> {
        let mut states: HashMap<String, ApplierState> = self
            .progress
            .get_all()
            .await
            .into_values()
            .map(|record| (record.collection.clone(), state_from_record(record)))
            .collect();
        for (collection, handle) in self.appliers.lock().await.iter() {
            states.insert(collection.clone(), handle.state());
        }
        let mut states: Vec<ApplierState> = states.into_values().collect();
        states.sort_by(|a, b| a.collection.cmp(&b.collection));
        states
    }

    /// Wait until the applier has caught up with the leader's current tick.
    ///
    /// The target is read from the leader once, at call time. Fails with
    /// [`ReplicationError::Timeout`] if it is not reached in time, or
    /// [`ReplicationError::InvalidState`] if the applier stops first.
    pub async fn wait_for_catch_up(&self, collection: &str, timeout: Duration) -> Result<ApplierState> {
        let (endpoint, mut state_rx) = {
            let appliers = self.appliers.lock().await;
            let handle = appliers
                .get(collection)
                .ok_or_else(|| ReplicationError::ApplierNotFound {
                    collection: collection.to_string(),
                })?;
            (handle.leader.clone(), handle.state_tx.subscribe())
        };
        let target = self.leader(&endpoint).await?.current_tick().await?;
        debug!(collection, target, "Waiting for catch-up");

        let reached = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| state.is_caught_up(target) || !state.running),
        )
        .await;

        match reached {
            Err(_) => Err(ReplicationError::Timeout {
                collection: collection.to_string(),
                target,
                waited: timeout,
            }),
            Ok(Err(_)) => Err(ReplicationError::ApplierNotFound {
                collection: collection.to_string(),
            }),
            Ok(Ok(state)) => {
                let state = state.clone();
                if state.is_caught_up(target) {
                    Ok(state)
                } else {
                    Err(ReplicationError::InvalidState {
                        expected: "Running".to_string(),
                        actual: "Stopped".to_string(),
                    })
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Synchronization
    // ═══════════════════════════════════════════════════════════════════════

    /// Bring `collection` to the leader's current snapshot.
    ///
    /// A running applier is stopped first and restarted from the resume
    /// tick on success. The resume tick is persisted either way, so a later
    /// [`start_replication`](Self::start_replication) continues from it.
    pub async fn sync_collection(&self, collection: &str, options: SyncOptions) -> Result<SyncOutcome> {
        self.ensure_running()?;
        let endpoint = self.resolve_leader(collection, options.leader.as_deref()).await?;
        let leader = self.leader(&endpoint).await?;

        let lock = self.sync_lock(collection).await;
        let _guard = lock.lock().await;
        // acquire only fails once the bulkhead is closed by shutdown
        let _permit = self.bulkhead.acquire().await.map_err(|_| ReplicationError::Shutdown)?;

        let resume_options = {
            let mut appliers = self.appliers.lock().await;
            match appliers.get_mut(collection) {
                Some(handle) if handle.is_running() => {
                    info!(collection, "Quiescing applier for sync");
                    self.stop_handle(collection, handle).await;
                    Some(handle.options.clone())
                }
                _ => None,
            }
        };

        let synchronizer = Synchronizer::new(leader.as_ref(), self.store.as_ref(), &self.circuit, &self.config.sync);
        let result = if options.incremental {
            synchronizer.incremental_sync(collection).await
        } else {
            synchronizer.full_sync(collection).await
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if resume_options.is_some() {
                    warn!(collection, "Applier left stopped after failed sync");
                }
                return Err(e);
            }
        };

        let mut record = self
            .progress
            .get(collection)
            .await
            .filter(|record| record.leader == endpoint)
            .unwrap_or_else(|| ProgressRecord::new(collection, endpoint.clone(), outcome.resume_tick));
        record.last_applied_tick = outcome.resume_tick;
        record.last_error = None;
        self.progress.set(record.clone()).await;
        if let Err(e) = self.progress.flush_dirty().await {
            warn!(collection, error = %e, "Failed to persist resume tick");
        }

        let mut appliers = self.appliers.lock().await;
        match resume_options {
            Some(start_options) => {
                let handle = self.spawn_applier(collection, leader, start_options, state_from_record(record));
                appliers.insert(collection.to_string(), handle);
            }
            None => {
                if let Some(handle) = appliers.get_mut(collection) {
                    handle.leader = endpoint;
                    let resume_tick = outcome.resume_tick;
                    handle.state_tx.send_modify(|state| {
                        state.leader = handle.leader.clone();
                        state.last_applied_tick = resume_tick;
                        state.last_processed_tick = resume_tick;
                        state.last_error = None;
                    });
                }
            }
        }
        metrics::set_running_appliers(running_count(&appliers));
        Ok(outcome)
    }

    /// Compare the local collection against the leader's current snapshot.
    pub async fn verify_consistency(&self, collection: &str) -> Result<ConsistencyReport> {
        self.ensure_running()?;
        let endpoint = self.resolve_leader(collection, None).await?;
        let leader = self.leader(&endpoint).await?;

        let lock = self.sync_lock(collection).await;
        let _guard = lock.lock().await;
        Synchronizer::new(leader.as_ref(), self.store.as_ref(), &self.circuit, &self.config.sync)
            .verify_consistency(collection)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shutdown
    // ═══════════════════════════════════════════════════════════════════════

    /// Shut down gracefully.
    ///
    /// 1. Stop every applier concurrently (open transactions are dropped)
    /// 2. Drain background tasks (with timeout)
    /// 3. Flush and close the progress store
    pub async fn shutdown(&self) {
        if self.state() == ManagerState::Stopped {
            return;
        }
        info!("Shutting down replication manager");
        self.set_state(ManagerState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        self.bulkhead.close();

        {
            let mut appliers = self.appliers.lock().await;
            let stopped = futures::future::join_all(
                appliers
                    .iter_mut()
                    .map(|(collection, handle)| self.stop_handle(collection, handle)),
            )
            .await;
            debug!(appliers = stopped.len(), "Appliers stopped");
            metrics::set_running_appliers(0);
        }

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock().await);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Err(e) = self.progress.flush_dirty().await {
            warn!(error = %e, "Failed to flush progress on shutdown");
        }
        self.progress.close().await;

        self.set_state(ManagerState::Stopped);
        info!("Replication manager stopped");
    }
}

fn running_count(appliers: &HashMap<String, ApplierHandle>) -> usize {
    appliers.values().filter(|h| h.is_running()).count()
}

fn resolve_start_tick(collection: &str, requested: Option<Tick>, persisted: Option<&ProgressRecord>) -> Result<Tick> {
    match (requested, persisted) {
        (Some(tick), Some(record)) if tick < record.last_applied_tick => Err(ReplicationError::TickRegression {
            collection: collection.to_string(),
            requested: tick,
            last_applied: record.last_applied_tick,
        }),
        (Some(tick), _) => Ok(tick),
        (None, Some(record)) => Ok(record.last_applied_tick),
        (None, None) => Err(ReplicationError::StartTickRequired {
            collection: collection.to_string(),
        }),
    }
}

fn state_from_record(record: ProgressRecord) -> ApplierState {
    let mut state = ApplierState::new(record.collection, record.leader, record.last_applied_tick);
    state.last_error = record.last_error;
    state.stats = record.stats;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CollectionSpec;
    use crate::leader::InMemoryLeader;
    use serde_json::json;

    async fn manager() -> ReplicationManager<InMemoryLeader> {
        ReplicationManager::in_memory(ReplicationConfig::for_testing(2)).await.unwrap()
    }

    async fn running_with_leader() -> (ReplicationManager<InMemoryLeader>, Arc<InMemoryLeader>) {
        let manager = manager().await;
        manager.start().await.unwrap();
        let leader = Arc::new(InMemoryLeader::new("leader-1", 1));
        leader.create_collection(CollectionSpec::new("users")).await.unwrap();
        assert!(manager.register_leader(Arc::clone(&leader)).await);
        (manager, leader)
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = manager().await;
        assert_eq!(manager.state(), ManagerState::Created);
        assert!(!manager.is_running());

        manager.start().await.unwrap();
        assert!(manager.is_running());
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));

        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let manager = manager().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        let err = manager.sync_collection("users", SyncOptions::full()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Shutdown));
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let manager = manager().await;
        let err = manager
            .start_replication("users", "leader-1", StartOptions::from_tick(0))
            .await
            .unwrap_err();
        match err {
            ReplicationError::InvalidState { expected, actual } => {
                assert_eq!(expected, "Running");
                assert_eq!(actual, "Created");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_requires_tick_without_progress() {
        let (manager, _leader) = running_with_leader().await;
        manager.sync_collection("users", SyncOptions::full()).await.unwrap();
        manager.forget_replication("users").await.unwrap();

        let err = manager
            .start_replication("users", "leader-1", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::StartTickRequired { .. }));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_tick_regression() {
        let (manager, leader) = running_with_leader().await;
        leader.insert("users", "a", json!({})).await.unwrap();
        leader.insert("users", "b", json!({})).await.unwrap();
        let outcome = manager.sync_collection("users", SyncOptions::full()).await.unwrap();
        assert_eq!(outcome.resume_tick, 2);

        let err = manager
            .start_replication("users", "leader-1", StartOptions::from_tick(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::TickRegression {
                requested: 1,
                last_applied: 2,
                ..
            }
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_forget_requires_stopped_applier() {
        let (manager, _leader) = running_with_leader().await;
        manager.sync_collection("users", SyncOptions::full()).await.unwrap();
        manager
            .start_replication("users", "leader-1", StartOptions::default())
            .await
            .unwrap();

        let err = manager.forget_replication("users").await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));

        let stopped = manager.stop_replication("users").await.unwrap();
        assert!(!stopped.running);
        manager.forget_replication("users").await.unwrap();
        assert!(matches!(
            manager.applier_state("users").await.unwrap_err(),
            ReplicationError::ApplierNotFound { .. }
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_leader_and_collection() {
        let (manager, _leader) = running_with_leader().await;
        let err = manager
            .start_replication("users", "nowhere", StartOptions::from_tick(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));

        let err = manager
            .start_replication("missing", "leader-1", StartOptions::from_tick(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::CollectionNotFound { .. }));

        assert!(matches!(
            manager.stop_replication("users").await.unwrap_err(),
            ReplicationError::ApplierNotFound { .. }
        ));
        manager.shutdown().await;
    }

    #[test]
    fn test_resolve_start_tick() {
        let record = ProgressRecord::new("users", "leader-1", 10);
        assert_eq!(resolve_start_tick("users", None, Some(&record)).unwrap(), 10);
        assert_eq!(resolve_start_tick("users", Some(12), Some(&record)).unwrap(), 12);
        assert_eq!(resolve_start_tick("users", Some(3), None).unwrap(), 3);
        assert!(resolve_start_tick("users", Some(9), Some(&record)).is_err());
        assert!(resolve_start_tick("users", None, None).is_err());
    }
}
