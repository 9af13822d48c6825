// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication manager.
//!
//! Configuration is passed to
//! [`ReplicationManager::new()`](crate::ReplicationManager::new) and can be
//! constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use collection_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     server_id: 7,
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── server_id: u16               # Stamped into locally written revisions
//! ├── applier: ApplierConfig       # Continuous log tailing
//! ├── sync: SyncConfig             # Full and incremental synchronization
//! ├── tree: TreeConfig             # Revision tree shape
//! ├── batches: BatchConfig         # Snapshot lease housekeeping
//! └── progress: ProgressConfig     # SQLite progress persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "server_id": 2,
//!   "applier": { "chunk_size": 500, "idle_poll_interval": "50ms" },
//!   "sync": { "batch_ttl": "10m", "verify_attempts": 5 },
//!   "progress": { "sqlite_path": "/var/lib/app/replication.db" }
//! }
//! ```

use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::tree::TreeConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationManager::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationManager::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of this server.
    #[serde(default = "default_server_id")]
    pub server_id: u16,

    #[serde(default)]
    pub applier: ApplierConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    /// Must match the leaders' tree shape for incremental sync to work.
    #[serde(default)]
    pub tree: TreeConfig,

    #[serde(default)]
    pub batches: BatchConfig,

    #[serde(default)]
    pub progress: ProgressConfig,
}

fn default_server_id() -> u16 {
    1
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            applier: ApplierConfig::default(),
            sync: SyncConfig::default(),
            tree: TreeConfig::default(),
            batches: BatchConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Minimal config for tests: in-memory progress, fast polling, fast retries.
    pub fn for_testing(server_id: u16) -> Self {
        Self {
            server_id,
            applier: ApplierConfig {
                idle_poll_interval: "5ms".to_string(),
                max_idle_poll_interval: "20ms".to_string(),
                stop_timeout: "2s".to_string(),
                max_fetch_retries: 3,
                retry_initial_delay: "5ms".to_string(),
                retry_max_delay: "20ms".to_string(),
                ..ApplierConfig::default()
            },
            sync: SyncConfig::default(),
            tree: TreeConfig::default(),
            batches: BatchConfig::default(),
            progress: ProgressConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplierConfig: continuous log tailing
// ═══════════════════════════════════════════════════════════════════════════════

/// Continuous applier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Maximum log entries requested per tail call.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// First delay after an empty tail, as a duration string (e.g. "100ms").
    /// Doubles on every consecutive empty tail.
    #[serde(default = "default_idle_poll_interval")]
    pub idle_poll_interval: String,

    /// Ceiling for the idle delay.
    #[serde(default = "default_max_idle_poll_interval")]
    pub max_idle_poll_interval: String,

    /// Fail instead of warning when the first tail starts inside the
    /// compacted part of the leader's log.
    #[serde(default = "default_false")]
    pub require_from_present: bool,

    /// How long `stop_replication` waits for the applier task.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,

    /// Attempts per tail call before the applier gives up.
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: usize,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────
    /// Throttle how many log entries per second each applier writes.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_idle_poll_interval() -> String {
    "100ms".to_string()
}

fn default_max_idle_poll_interval() -> String {
    "1s".to_string()
}

fn default_stop_timeout() -> String {
    "10s".to_string()
}

fn default_max_fetch_retries() -> usize {
    5
}

fn default_retry_initial_delay() -> String {
    "100ms".to_string()
}

fn default_retry_max_delay() -> String {
    "10s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            idle_poll_interval: default_idle_poll_interval(),
            max_idle_poll_interval: default_max_idle_poll_interval(),
            require_from_present: false,
            stop_timeout: default_stop_timeout(),
            max_fetch_retries: default_max_fetch_retries(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ApplierConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        parse_duration_or(&self.idle_poll_interval, Duration::from_millis(100))
    }

    pub fn max_idle_poll_interval(&self) -> Duration {
        parse_duration_or(&self.max_idle_poll_interval, Duration::from_secs(1)).max(self.idle_poll_interval())
    }

    pub fn stop_timeout(&self) -> Duration {
        parse_duration_or(&self.stop_timeout, Duration::from_secs(10))
    }

    /// Backoff for failed tail calls.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_fetch_retries.max(1),
            initial_delay: parse_duration_or(&self.retry_initial_delay, Duration::from_millis(100)),
            max_delay: parse_duration_or(&self.retry_max_delay, Duration::from_secs(10)),
            backoff_factor: 2.0,
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig: full and incremental synchronization
// ═══════════════════════════════════════════════════════════════════════════════

/// Synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Lease requested for each batch; extended while the sync works.
    #[serde(default = "default_batch_ttl")]
    pub batch_ttl: String,

    /// Documents per dump request.
    #[serde(default = "default_dump_chunk_size")]
    pub dump_chunk_size: usize,

    /// Keys per document fetch during incremental repair.
    #[serde(default = "default_fetch_chunk_size")]
    pub fetch_chunk_size: usize,

    /// Divergent ranges listed per range-revisions request.
    #[serde(default = "default_ranges_per_request")]
    pub ranges_per_request: usize,

    /// Verification rounds after an incremental repair before giving up.
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    /// Collections synchronizing at the same time.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,

    /// Re-compare trees after repairing. Off means one round only.
    #[serde(default = "default_true")]
    pub verify_after_repair: bool,
}

fn default_batch_ttl() -> String {
    "300s".to_string()
}

fn default_dump_chunk_size() -> usize {
    1000
}

fn default_fetch_chunk_size() -> usize {
    5000
}

fn default_ranges_per_request() -> usize {
    64
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_max_concurrent_syncs() -> usize {
    4
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_ttl: default_batch_ttl(),
            dump_chunk_size: default_dump_chunk_size(),
            fetch_chunk_size: default_fetch_chunk_size(),
            ranges_per_request: default_ranges_per_request(),
            verify_attempts: default_verify_attempts(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            verify_after_repair: true,
        }
    }
}

impl SyncConfig {
    pub fn batch_ttl(&self) -> Duration {
        parse_duration_or(&self.batch_ttl, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchConfig: lease housekeeping
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot batch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Live batches a leader accepts before refusing new ones.
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,

    /// How often registered leaders collect expired batches.
    #[serde(default = "default_gc_interval")]
    pub gc_interval: String,
}

fn default_max_batches() -> usize {
    64
}

fn default_gc_interval() -> String {
    "30s".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batches: default_max_batches(),
            gc_interval: default_gc_interval(),
        }
    }
}

impl BatchConfig {
    pub fn gc_interval(&self) -> Duration {
        parse_duration_or(&self.gc_interval, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProgressConfig: applier progress persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Applier progress persistence.
///
/// The last applied tick, last error and statistics of every applier are
/// kept in SQLite so that a restarted process resumes where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Path to SQLite database, or `:memory:`.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty progress records are flushed.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_sqlite_path() -> String {
    "replication_progress.db".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl ProgressConfig {
    /// In-memory database for tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "50ms".to_string(),
        }
    }

    /// File-backed database at `path`.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: path.into(),
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        parse_duration_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
