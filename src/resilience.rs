// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry logic, backoff, rate limiting, bulkheads.
//!
//! - [`RetryConfig`]: Exponential backoff for transient leader failures
//! - [`RateLimiter`]: Token bucket throttling how fast an applier writes
//! - [`Bulkhead`]: Semaphore capping concurrent synchronizations
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), collection_replication::resilience::BulkheadFull> {
//! use collection_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! // Rate limit: max 1000 entries/sec with burst of 100
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! // Bulkhead: max 4 synchronizations at once
//! let bulkhead = Bulkhead::for_syncs(4);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Retry behaviour for leader requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry forever with backoff capped at 5 minutes.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      300s
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each applied log entry consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 entries/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, waiting until one is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Acquire `n` permits, one at a time.
    pub async fn acquire_many(&self, n: u32) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits concurrent operations with a semaphore.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Bulkhead for collection synchronizations.
    pub fn for_syncs(max_concurrent: usize) -> Self {
        Self::new(max_concurrent)
    }

    /// Acquire a permit, waiting if necessary.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stop handing out permits; pending and future `acquire`s fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config() {
        let config = RetryConfig::daemon();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::testing();
        assert!(config.should_retry(1));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[tokio::test]
    async fn test_rate_limiter_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 3);
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_many_zero() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.acquire_many(0).await;
        limiter.acquire_many(5).await;
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrency() {
        let bulkhead = Bulkhead::for_syncs(2);
        let a = bulkhead.acquire().await.unwrap();
        let _b = bulkhead.acquire().await.unwrap();
        assert!(bulkhead.try_acquire().is_none());
        assert_eq!(bulkhead.available(), 0);
        drop(a);
        assert!(bulkhead.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_bulkhead_close() {
        let bulkhead = Bulkhead::new(0);
        assert_eq!(bulkhead.max_concurrent(), 1);
        bulkhead.close();
        assert!(bulkhead.acquire().await.is_err());
    }
}
