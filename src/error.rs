// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for collection replication.
//!
//! Every error belongs to one of five classes, which decide how the
//! engine reacts to it:
//!
//! | Class | Examples | Reaction |
//! |-------|----------|----------|
//! | `Transient` | `Transport`, `CircuitOpen` | retried with backoff at the fetch layer |
//! | `Conflict` | `UnresolvableConflict`, store unique violations | conflict policy, or applier stops |
//! | `Structural` | `CollectionNotFound`, `BatchExpired`, `Tree`, `TickNotPresent` | fatal to the operation |
//! | `Inconsistency` | `Inconsistent` | reported with the divergent ranges |
//! | `Internal` | `StateStore`, `InvalidState`, `Internal` | needs operator attention |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a fetch should
//! be retried. Only transport-level failures and an open circuit qualify.
//! `ResourceExhausted` and `Timeout` are transient, but the engine hands them
//! back to the caller instead of retrying them itself.

use crate::document::Tick;
use crate::store::StoreError;
use crate::tree::{KeyRange, TreeError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Coarse classification of a [`ReplicationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Conflict,
    Structural,
    Inconsistency,
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Conflict => write!(f, "conflict"),
            Self::Structural => write!(f, "structural"),
            Self::Inconsistency => write!(f, "inconsistency"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Talking to the leader failed.
    ///
    /// Retryable with exponential backoff.
    #[error("transport error ({endpoint} {operation}): {message}")]
    Transport {
        endpoint: String,
        operation: String,
        message: String,
    },

    /// SQLite error while persisting applier progress.
    ///
    /// Not retryable - local database issues need attention.
    #[error("progress store error: {0}")]
    StateStore(#[from] sqlx::Error),

    /// Invalid or missing configuration (including unknown leader endpoints).
    #[error("configuration error: {0}")]
    Config(String),

    /// The leader does not know the collection.
    #[error("collection not found on leader: {collection}")]
    CollectionNotFound { collection: String },

    /// A batch was used after its lease ran out.
    #[error("batch {batch_id} expired or unknown")]
    BatchExpired { batch_id: u64 },

    /// The leader refused to allocate another resource (e.g. a batch).
    ///
    /// Reported to the caller, never retried internally.
    #[error("resource exhausted: {resource} (limit {limit})")]
    ResourceExhausted { resource: String, limit: usize },

    /// Revision tree shape mismatch or a corrupt summary.
    #[error("revision tree error: {0}")]
    Tree(#[from] TreeError),

    /// Reconciliation could not converge after all verification attempts.
    #[error(
        "collection {collection} still diverges in {} range(s) after reconciliation: {}",
        ranges.len(),
        format_ranges(ranges)
    )]
    Inconsistent {
        collection: String,
        ranges: Vec<KeyRange>,
    },

    /// A unique-index collision with a document written by the leader in the
    /// same atomic unit. The applier stops; it is never retried.
    #[error(
        "unresolvable conflict in {collection} at tick {tick}: key {key} collides with {conflicting_key} on index {index}"
    )]
    UnresolvableConflict {
        collection: String,
        key: String,
        index: String,
        conflicting_key: String,
        tick: Tick,
    },

    /// Operation attempted in the wrong state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// No applier is registered for the collection.
    #[error("no applier registered for collection {collection}")]
    ApplierNotFound { collection: String },

    /// Starting replication without persisted progress needs an explicit tick.
    #[error("collection {collection} has no applied tick; an explicit start tick is required")]
    StartTickRequired { collection: String },

    /// The leader has compacted entries the applier still needs.
    #[error(
        "tick {requested} no longer present on leader for {collection} (compacted through {compacted_through})"
    )]
    TickNotPresent {
        collection: String,
        requested: Tick,
        compacted_through: Tick,
    },

    /// A start tick below the last applied tick would move progress backwards.
    #[error("start tick {requested} for {collection} is below last applied tick {last_applied}")]
    TickRegression {
        collection: String,
        requested: Tick,
        last_applied: Tick,
    },

    /// Waiting for the applier to catch up timed out.
    #[error("{collection} did not reach tick {target} within {waited:?}")]
    Timeout {
        collection: String,
        target: Tick,
        waited: Duration,
    },

    /// The circuit breaker in front of the local store is open.
    #[error("circuit {circuit} open, request rejected")]
    CircuitOpen { circuit: String },

    /// Local document store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_ranges(ranges: &[KeyRange]) -> String {
    const SHOWN: usize = 4;
    let mut out: Vec<String> = ranges.iter().take(SHOWN).map(|r| r.to_string()).collect();
    if ranges.len() > SHOWN {
        out.push(format!("... {} more", ranges.len() - SHOWN));
    }
    out.join(", ")
}

impl ReplicationError {
    /// Create a transport error.
    pub fn transport(
        endpoint: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn collection_not_found(collection: impl Into<String>) -> Self {
        Self::CollectionNotFound {
            collection: collection.into(),
        }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. }
            | Self::CircuitOpen { .. }
            | Self::ResourceExhausted { .. }
            | Self::Timeout { .. } => ErrorClass::Transient,
            Self::UnresolvableConflict { .. } => ErrorClass::Conflict,
            Self::Config(_)
            | Self::CollectionNotFound { .. }
            | Self::BatchExpired { .. }
            | Self::Tree(_)
            | Self::ApplierNotFound { .. }
            | Self::StartTickRequired { .. }
            | Self::TickNotPresent { .. }
            | Self::TickRegression { .. } => ErrorClass::Structural,
            Self::Inconsistent { .. } => ErrorClass::Inconsistency,
            Self::Store(e) => match e {
                StoreError::UniqueViolation { .. } => ErrorClass::Conflict,
                StoreError::CollectionNotFound(_) | StoreError::Tree(_) => ErrorClass::Structural,
                StoreError::Backend(_) => ErrorClass::Internal,
            },
            Self::StateStore(_) | Self::InvalidState { .. } | Self::Shutdown | Self::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_transport() {
        let err = ReplicationError::transport("leader-1", "tail", "connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("tail"));
        assert!(err.to_string().contains("leader-1"));
    }

    #[test]
    fn test_resource_exhausted_is_transient_but_not_retried() {
        let err = ReplicationError::ResourceExhausted {
            resource: "batches".to_string(),
            limit: 4,
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_structural_errors() {
        let errors = [
            ReplicationError::collection_not_found("users"),
            ReplicationError::BatchExpired { batch_id: 7 },
            ReplicationError::StartTickRequired {
                collection: "users".to_string(),
            },
            ReplicationError::TickNotPresent {
                collection: "users".to_string(),
                requested: 10,
                compacted_through: 50,
            },
        ];
        for err in errors {
            assert_eq!(err.class(), ErrorClass::Structural, "{err}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_unresolvable_conflict_names_keys() {
        let err = ReplicationError::UnresolvableConflict {
            collection: "users".to_string(),
            key: "a".to_string(),
            index: "email".to_string(),
            conflicting_key: "b".to_string(),
            tick: 42,
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("42"));
        assert!(msg.contains("email"));
    }

    #[test]
    fn test_inconsistent_lists_ranges() {
        let ranges: Vec<KeyRange> = (0..6u64)
            .map(|i| KeyRange::new(i << 52, (i << 52) | 0xF))
            .collect();
        let err = ReplicationError::Inconsistent {
            collection: "users".to_string(),
            ranges,
        };
        assert_eq!(err.class(), ErrorClass::Inconsistency);
        let msg = err.to_string();
        assert!(msg.contains("6 range(s)"));
        assert!(msg.contains("2 more"));
    }

    #[test]
    fn test_store_error_classes() {
        let conflict = ReplicationError::from(StoreError::UniqueViolation {
            collection: "c".to_string(),
            index: "idx".to_string(),
            key: "k".to_string(),
            conflicting_key: "other".to_string(),
        });
        assert_eq!(conflict.class(), ErrorClass::Conflict);

        let backend = ReplicationError::from(StoreError::Backend("disk full".to_string()));
        assert_eq!(backend.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
        assert_eq!(ErrorClass::Inconsistency.to_string(), "inconsistency");
    }
}
