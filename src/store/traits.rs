// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The follower's local storage seam.
//!
//! The replication engine never touches storage directly; it goes through
//! [`DocumentStore`]. Implementations must provide:
//!
//! - idempotent single-document writes (`insert_local` is an upsert,
//!   `remove_local` of a missing key is `Unchanged`),
//! - an atomic multi-operation write (`apply_local`): all or nothing,
//! - a revision tree maintained on every write path,
//! - unique-index enforcement, reported as a typed outcome, never as an error.
//!
//! # Example
//!
//! ```rust,ignore
//! let outcome = store.apply_local("users", vec![LocalOp::Put(doc)]).await?;
//! match outcome {
//!     ApplyOutcome::Applied { .. } => {}
//!     ApplyOutcome::Conflict { op_index, conflict, .. } => {
//!         // hand to the conflict policy
//!     }
//! }
//! ```

use crate::document::{Checksum, CollectionSpec, Document, Revision};
use crate::tree::{KeyRange, RevisionTree, TreeEntry, TreeError, TreeSummary};
use std::future::Future;
use std::pin::Pin;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Errors from the local store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Raised by plain (non-replication) writes; replication writes get a
    /// [`WriteOutcome::Conflict`] instead.
    #[error("unique constraint violated in {collection}: {key} collides with {conflicting_key} on index {index}")]
    UniqueViolation {
        collection: String,
        index: String,
        key: String,
        conflicting_key: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// One operation inside an atomic local write.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalOp {
    /// Insert or replace a document, keeping its revision.
    Put(Document),
    Remove { key: String },
}

impl LocalOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Put(doc) => &doc.key,
            Self::Remove { key } => key,
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }
}

/// A unique secondary-index collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConflict {
    pub index: String,
    /// The document already holding the value.
    pub conflicting_key: String,
}

/// Outcome of a single-document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced { previous: Revision },
    Removed { previous: Revision },
    /// Nothing to do: removing a missing key, or writing the stored revision again.
    Unchanged,
    Conflict(UniqueConflict),
}

/// Outcome of an atomic multi-operation write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every operation was applied.
    Applied { written: usize },
    /// Nothing was applied: operation `op_index` (on `key`) hit a unique conflict.
    Conflict {
        op_index: usize,
        key: String,
        conflict: UniqueConflict,
    },
}

/// Outcome of bringing a collection's index definitions in line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexAlignment {
    /// Whether the definitions differed.
    pub changed: bool,
    /// Documents dropped because they collided on a new unique index.
    pub dropped: Vec<String>,
}

/// Local document storage used by the replication engine.
pub trait DocumentStore: Send + Sync + 'static {
    /// Structural definition, or `None` if the collection does not exist.
    fn collection_spec<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Option<CollectionSpec>>;

    /// Drop (if present) and create the collection empty, with the given indexes.
    fn recreate_collection(&self, spec: CollectionSpec) -> BoxFuture<'_, ()>;

    /// Create the collection if missing. Returns `true` if it was created.
    fn ensure_collection(&self, spec: CollectionSpec) -> BoxFuture<'_, bool>;

    /// Replace the collection's index definitions with those of `spec`,
    /// keeping its documents.
    fn align_indexes(&self, spec: CollectionSpec) -> BoxFuture<'_, IndexAlignment>;

    /// Remove all documents. Returns how many were removed.
    fn truncate<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64>;

    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Document>>;

    /// Upsert one document, keeping its revision.
    fn insert_local<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, WriteOutcome>;

    fn remove_local<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, WriteOutcome>;

    /// Apply all operations atomically.
    fn apply_local<'a>(&'a self, collection: &'a str, ops: Vec<LocalOp>) -> BoxFuture<'a, ApplyOutcome>;

    fn count<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64>;

    /// Copy of the maintained revision tree.
    fn revision_tree<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, RevisionTree>;

    fn tree_summary<'a>(
        &'a self,
        collection: &'a str,
        only_populated: bool,
        verification: bool,
    ) -> BoxFuture<'a, TreeSummary>;

    /// `(key, revision)` pairs inside the ranges, ordered by position then key.
    fn range_revisions<'a>(&'a self, collection: &'a str, ranges: &'a [KeyRange]) -> BoxFuture<'a, Vec<TreeEntry>>;

    fn checksum<'a>(&'a self, collection: &'a str, with_data: bool) -> BoxFuture<'a, Checksum>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_op_key() {
        let put = LocalOp::Put(Document::new("a", Revision::new(1, 1), json!({})));
        assert_eq!(put.key(), "a");
        assert_eq!(LocalOp::remove("b").key(), "b");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::UniqueViolation {
            collection: "users".to_string(),
            index: "email".to_string(),
            key: "a".to_string(),
            conflicting_key: "b".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("email"));
    }
}
