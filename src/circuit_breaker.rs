// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker in front of the local document store.
//!
//! Prevents the applier and the synchronizers from hammering a store that
//! keeps failing. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Store unhealthy, requests fail fast without attempting
//! - **HalfOpen**: Testing if the store recovered, limited requests allowed
//!
//! Unique-constraint conflicts are outcomes, not errors, so they never count
//! against the circuit.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use collection_replication::circuit_breaker::StoreCircuit;
//! # use collection_replication::store::{DocumentStore, MemoryStore};
//! # async fn example(store: MemoryStore) -> collection_replication::Result<()> {
//! let circuit = StoreCircuit::new();
//!
//! // Rejections surface as ReplicationError::CircuitOpen, store failures
//! // as ReplicationError::Store.
//! let count = circuit.read(|| store.count("users")).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::store::{StoreError, StoreResult};
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and recovers cautiously. Used for store writes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Fast trip and recovery for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_threshold as f32 / 100.0)
            .closed_len(config.failure_threshold as usize)
            .half_open_len(config.success_threshold as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                metrics::set_circuit_state(&self.name, &CircuitState::Open.to_string());
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Circuits guarding the local store.
pub struct StoreCircuit {
    /// Writes: `apply_local`, `insert_local`, `remove_local`, `truncate`, collection DDL
    pub writes: CircuitBreaker,
    /// Reads: counts, trees, range listings, checksums
    pub reads: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::aggressive(), CircuitConfig::default())
    }

    pub fn with_configs(writes_config: CircuitConfig, reads_config: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("store_writes", writes_config),
            reads: CircuitBreaker::new("store_reads", reads_config),
        }
    }

    pub async fn write<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.writes.call(f).await.map_err(|e| lift(&self.writes, e))
    }

    pub async fn read<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.reads.call(f).await.map_err(|e| lift(&self.reads, e))
    }

    pub fn any_open(&self) -> bool {
        self.writes.is_likely_open() || self.reads.is_likely_open()
    }
}

fn lift(circuit: &CircuitBreaker, err: CircuitError<StoreError>) -> ReplicationError {
    match err {
        CircuitError::Rejected => ReplicationError::CircuitOpen {
            circuit: circuit.name().to_string(),
        },
        CircuitError::Inner(e) => ReplicationError::Store(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::testing());
        let result: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::testing());
        let result: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );
        for _ in 0..5 {
            let _: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        assert!(cb.failures() >= 2 || cb.rejections() >= 1);
    }

    #[tokio::test]
    async fn test_store_circuit_maps_errors() {
        let circuit = StoreCircuit::with_configs(CircuitConfig::lenient(), CircuitConfig::lenient());
        let err = circuit
            .write(|| async { Err::<(), _>(StoreError::Backend("disk full".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Store(StoreError::Backend(_))));

        let ok = circuit.read(|| async { Ok::<_, StoreError>(7u64) }).await.unwrap();
        assert_eq!(ok, 7);
        assert_eq!(circuit.writes.name(), "store_writes");
        assert_eq!(circuit.reads.name(), "store_reads");
    }

    #[tokio::test]
    async fn test_store_circuit_rejection_is_circuit_open() {
        let circuit = StoreCircuit::with_configs(
            CircuitConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
            CircuitConfig::default(),
        );
        let mut saw_open = false;
        for _ in 0..10 {
            let result = circuit
                .write(|| async { Err::<(), _>(StoreError::Backend("down".to_string())) })
                .await;
            if let Err(ReplicationError::CircuitOpen { circuit }) = result {
                assert_eq!(circuit, "store_writes");
                saw_open = true;
                break;
            }
        }
        assert!(saw_open);
        assert!(circuit.any_open());
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        assert!(CircuitConfig::aggressive().failure_threshold < default.failure_threshold);
        assert!(CircuitConfig::lenient().failure_threshold > default.failure_threshold);
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert!(rejected.is_rejected());
        assert!(rejected.inner().is_none());
        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert_eq!(inner.inner(), Some(&"boom"));
    }
}
