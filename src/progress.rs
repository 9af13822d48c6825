// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applier progress persistence.
//!
//! For every replicated collection we keep the leader it follows, the last
//! applied tick, the last error and the applier statistics in SQLite, so a
//! restarted process resumes tailing where it stopped.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the record dirty
//! - `flush_dirty()` persists all dirty records in one pass
//! - The manager calls `flush_dirty()` on an interval, after every stop and
//!   after every synchronization, and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress. On restart those entries are tailed and applied
//! again, which is idempotent.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff; the cache
//! is always updated first.
//!
//! ## Tick Semantics
//!
//! The stored tick is the **last applied** tick. Tailing resumes strictly
//! after it.

use crate::applier::ApplierStats;
use crate::config::ProgressConfig;
use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const IN_MEMORY: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::progress_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Persisted state of one collection's applier.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub collection: String,
    /// Endpoint of the leader the collection follows.
    pub leader: String,
    pub last_applied_tick: Tick,
    pub last_error: Option<String>,
    pub stats: ApplierStats,
    /// Milliseconds since the epoch.
    pub updated_at: i64,
}

impl ProgressRecord {
    pub fn new(collection: impl Into<String>, leader: impl Into<String>, last_applied_tick: Tick) -> Self {
        Self {
            collection: collection.into(),
            leader: leader.into(),
            last_applied_tick,
            last_error: None,
            stats: ApplierStats::default(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

type ProgressRow = (String, String, i64, Option<String>, String, i64);

/// Persistent progress storage backed by SQLite.
pub struct ProgressStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, ProgressRecord>>>,
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
    wal_mode: bool,
}

impl ProgressStore {
    /// Open the store described by `config`.
    pub async fn open(config: &ProgressConfig) -> Result<Self> {
        Self::connect(&config.sqlite_path, config.wal_mode).await
    }

    /// Open (creating if needed) a WAL-mode store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::connect(&path_str, true).await
    }

    async fn connect(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing progress store");
        let in_memory = path == IN_MEMORY;
        let wal_mode = wal_mode && !in_memory;

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let journal = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // an in-memory database lives exactly as long as its one connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applier_progress (
                collection TEXT PRIMARY KEY,
                leader TEXT NOT NULL,
                last_applied_tick INTEGER NOT NULL,
                last_error TEXT,
                stats TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<ProgressRow> = sqlx::query_as(
            "SELECT collection, leader, last_applied_tick, last_error, stats, updated_at FROM applier_progress",
        )
        .fetch_all(&pool)
        .await?;

        let mut cache = HashMap::new();
        for (collection, leader, tick, last_error, stats, updated_at) in rows {
            let stats = serde_json::from_str(&stats).unwrap_or_else(|e| {
                warn!(collection = %collection, error = %e, "Unreadable persisted stats, starting from zero");
                ApplierStats::default()
            });
            debug!(collection = %collection, leader = %leader, tick, "Loaded progress from disk");
            cache.insert(
                collection.clone(),
                ProgressRecord {
                    collection,
                    leader,
                    last_applied_tick: tick.max(0) as Tick,
                    last_error,
                    stats,
                    updated_at,
                },
            );
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored applier progress from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path.to_string(),
            wal_mode,
        })
    }

    pub async fn get(&self, collection: &str) -> Option<ProgressRecord> {
        self.cache.read().await.get(collection).cloned()
    }

    /// Update a record (debounced).
    pub async fn set(&self, mut record: ProgressRecord) {
        record.updated_at = chrono::Utc::now().timestamp_millis();
        let collection = record.collection.clone();
        debug!(
            collection = %collection,
            tick = record.last_applied_tick,
            "Progress updated (pending flush)"
        );
        self.cache.write().await.insert(collection.clone(), record);
        self.dirty.write().await.insert(collection);
    }

    /// Flush all dirty records. Returns how many were written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let records: Vec<ProgressRecord> = {
            let cache = self.cache.read().await;
            dirty.iter().filter_map(|c| cache.get(c).cloned()).collect()
        };
        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;

        for record in &records {
            let stats = match serde_json::to_string(&record.stats) {
                Ok(stats) => stats,
                Err(e) => {
                    errors += 1;
                    warn!(collection = %record.collection, error = %e, "Cannot encode applier stats");
                    self.dirty.write().await.insert(record.collection.clone());
                    continue;
                }
            };
            let tick = i64::try_from(record.last_applied_tick).unwrap_or(i64::MAX);

            let result = execute_with_retry("progress_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO applier_progress
                        (collection, leader, last_applied_tick, last_error, stats, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(collection) DO UPDATE SET
                        leader = excluded.leader,
                        last_applied_tick = excluded.last_applied_tick,
                        last_error = excluded.last_error,
                        stats = excluded.stats,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&record.collection)
                .bind(&record.leader)
                .bind(tick)
                .bind(&record.last_error)
                .bind(&stats)
                .bind(record.updated_at)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(collection = %record.collection, error = %e, "Failed to flush progress");
                    self.dirty.write().await.insert(record.collection.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty progress");
            crate::metrics::record_progress_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} progress records",
                errors
            )));
        }
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Drop all persisted state of a collection.
    pub async fn forget(&self, collection: &str) -> Result<bool> {
        let existed = self.cache.write().await.remove(collection).is_some();
        self.dirty.write().await.remove(collection);

        let pool = &self.pool;
        execute_with_retry("progress_forget", || async {
            sqlx::query("DELETE FROM applier_progress WHERE collection = ?")
                .bind(collection)
                .execute(pool)
                .await
        })
        .await?;

        info!(collection = %collection, existed, "Forgot applier progress");
        Ok(existed)
    }

    pub async fn get_all(&self) -> HashMap<String, ProgressRecord> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to the main database. No-op without WAL.
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("progress_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty progress on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty progress on close"),
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Progress store closed");
    }
}
