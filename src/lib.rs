// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Collection Replication
//!
//! Leader/follower replication of document collections.
//!
//! A follower keeps a copy of a leader's collection and tracks it through
//! three mechanisms:
//!
//! 1. **Full sync**: bulk copy of a pinned leader snapshot
//! 2. **Incremental sync**: revision-tree comparison that repairs only the
//!    divergent key ranges
//! 3. **Continuous applier**: tails the leader's operation log from a tick
//!    and applies changes, honoring transaction boundaries
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          ReplicationManager                               │
//! │                                                                           │
//! │  ┌──────────────┐   tail(tick)  ┌──────────────┐   apply   ┌───────────┐  │
//! │  │  LeaderRef   │──────────────►│   Applier    │──────────►│ Document  │  │
//! │  │ (per leader) │               │ (per coll.)  │           │   Store   │  │
//! │  └──────────────┘               └──────────────┘           └───────────┘  │
//! │         │  batch / dump / tree         │ progress                ▲        │
//! │         ▼                              ▼                         │        │
//! │  ┌──────────────┐               ┌──────────────┐                 │        │
//! │  │ Synchronizer │               │ProgressStore │                 │        │
//! │  │ (full/incr.) │               │  (SQLite)    │                 │        │
//! │  └──────────────┘               └──────────────┘                 │        │
//! │         │  write                                                 │        │
//! │         └────────────────────────────────────────────────────────┘        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use collection_replication::{
//!     InMemoryLeader, ReplicationConfig, ReplicationManager, StartOptions, SyncOptions,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> collection_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let leader = Arc::new(InMemoryLeader::from_config("leader-1", &config));
//!
//!     let manager = ReplicationManager::in_memory(config).await?;
//!     manager.start().await?;
//!     manager.register_leader(leader).await;
//!
//!     manager.sync_collection("users", SyncOptions::full()).await?;
//!     manager.start_replication("users", "leader-1", StartOptions::default()).await?;
//!     manager.wait_for_catch_up("users", Duration::from_secs(5)).await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod oplog;
pub mod progress;
pub mod resilience;
pub mod store;
pub mod sync;
pub mod tree;

// Re-exports for convenience
pub use applier::{ApplierState, ApplierStats, ApplierStatus};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use config::{ApplierConfig, BatchConfig, ProgressConfig, ReplicationConfig, SyncConfig};
pub use coordinator::{ManagerState, ReplicationManager, StartOptions, SyncOptions};
pub use document::{Checksum, CollectionSpec, Document, IndexSpec, Revision, Tick};
pub use error::{ErrorClass, ReplicationError, Result};
pub use leader::{InMemoryLeader, LeaderRef};
pub use oplog::{LogEntry, TailChunk};
pub use progress::{ProgressRecord, ProgressStore};
pub use store::{DocumentStore, MemoryStore};
pub use sync::{ConsistencyReport, SyncOutcome, SyncStats, Synchronizer};
pub use tree::{KeyRange, RevisionTree, TreeConfig, TreeError, TreeSummary};
