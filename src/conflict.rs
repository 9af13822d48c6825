// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unique-constraint conflict policy.
//!
//! The leader is authoritative. When a replicated write collides with a
//! local document on a unique index, the local document is removed and the
//! write is retried. The one case that cannot be resolved that way is a
//! collision with a document the leader itself wrote earlier *in the same
//! unit* (same transaction or same repair batch) or in the same fetched log
//! chunk: removing it would drop leader data, so replication stops with
//! [`ReplicationError::UnresolvableConflict`].
//!
//! Every replicated write path goes through [`apply_unit`], so there is a
//! single place that decides.

use crate::circuit_breaker::StoreCircuit;
use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use crate::store::{ApplyOutcome, DocumentStore, LocalOp, UniqueConflict, WriteOutcome};
use std::collections::HashSet;
use tracing::{debug, warn};

/// What to do about a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Remove this local document, then retry the unit.
    RemoveLocal { key: String },
    /// Stop: the colliding document is part of the unit itself.
    Unresolvable,
}

/// Keys whose current local version was written from the chunk being applied.
#[derive(Debug, Default, Clone)]
pub struct ChunkWrites {
    keys: HashSet<String>,
}

impl ChunkWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the effect of an applied unit.
    pub fn record(&mut self, ops: &[LocalOp]) {
        for op in ops {
            match op {
                LocalOp::Put(doc) => {
                    self.keys.insert(doc.key.clone());
                }
                LocalOp::Remove { key } => {
                    self.keys.remove(key);
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Decide how to resolve a conflict hit by `ops[op_index]`.
pub fn resolve_conflict(
    ops: &[LocalOp],
    op_index: usize,
    conflict: &UniqueConflict,
    chunk: &ChunkWrites,
) -> Resolution {
    let written_by_unit = ops[..op_index.min(ops.len())]
        .iter()
        .any(|op| matches!(op, LocalOp::Put(doc) if doc.key == conflict.conflicting_key));
    if written_by_unit || chunk.contains(&conflict.conflicting_key) {
        Resolution::Unresolvable
    } else {
        Resolution::RemoveLocal {
            key: conflict.conflicting_key.clone(),
        }
    }
}

/// Result of applying one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub written: usize,
    pub conflicts_resolved: usize,
}

/// Atomically apply `ops` to `collection`, resolving conflicts on the way.
///
/// `tick` is the log position the unit came from (0 for synchronization)
/// and only ends up in the error. `chunk` holds the keys written earlier in
/// the same fetched chunk; the caller records this unit into it afterwards.
pub async fn apply_unit<S: DocumentStore>(
    store: &S,
    circuit: &StoreCircuit,
    collection: &str,
    ops: Vec<LocalOp>,
    tick: Tick,
    chunk: &ChunkWrites,
) -> Result<UnitReport> {
    let mut report = UnitReport::default();
    if ops.is_empty() {
        return Ok(report);
    }
    loop {
        let attempt = ops.clone();
        let outcome = circuit
            .write(|| store.apply_local(collection, attempt))
            .await?;
        let (op_index, key, conflict) = match outcome {
            ApplyOutcome::Applied { written } => {
                report.written = written;
                return Ok(report);
            }
            ApplyOutcome::Conflict {
                op_index,
                key,
                conflict,
            } => (op_index, key, conflict),
        };

        match resolve_conflict(&ops, op_index, &conflict, chunk) {
            Resolution::RemoveLocal { key: victim } => {
                debug!(
                    collection,
                    key = %key,
                    index = %conflict.index,
                    removed = %victim,
                    "Resolving unique conflict by removing local document"
                );
                let removed = circuit
                    .write(|| store.remove_local(collection, &victim))
                    .await?;
                if !matches!(removed, WriteOutcome::Removed { .. }) {
                    // the store reported a holder it no longer has
                    return Err(ReplicationError::Internal(format!(
                        "conflicting document {victim} in {collection} vanished during resolution"
                    )));
                }
                report.conflicts_resolved += 1;
            }
            Resolution::Unresolvable => {
                warn!(
                    collection,
                    key = %key,
                    index = %conflict.index,
                    conflicting_key = %conflict.conflicting_key,
                    tick,
                    "Unresolvable unique conflict"
                );
                return Err(ReplicationError::UnresolvableConflict {
                    collection: collection.to_string(),
                    key,
                    index: conflict.index,
                    conflicting_key: conflict.conflicting_key,
                    tick,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CollectionSpec, Document, IndexSpec, Revision};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn put(key: &str, rev: u64, email: &str) -> LocalOp {
        LocalOp::Put(Document::new(key, Revision::new(rev, 1), json!({ "email": email })))
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new(2);
        store
            .create_collection(CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"])))
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_resolution_removes_foreign_holder() {
        let ops = vec![put("a", 1, "x")];
        let conflict = UniqueConflict {
            index: "email".to_string(),
            conflicting_key: "local".to_string(),
        };
        assert_eq!(
            resolve_conflict(&ops, 0, &conflict, &ChunkWrites::new()),
            Resolution::RemoveLocal {
                key: "local".to_string()
            }
        );
    }

    #[test]
    fn test_resolution_detects_same_unit() {
        let ops = vec![put("a", 1, "x"), put("b", 2, "x")];
        let conflict = UniqueConflict {
            index: "email".to_string(),
            conflicting_key: "a".to_string(),
        };
        assert_eq!(
            resolve_conflict(&ops, 1, &conflict, &ChunkWrites::new()),
            Resolution::Unresolvable
        );
    }

    #[test]
    fn test_resolution_detects_same_chunk() {
        let conflict = UniqueConflict {
            index: "email".to_string(),
            conflicting_key: "a".to_string(),
        };
        let mut chunk = ChunkWrites::new();
        chunk.record(&[put("a", 1, "x")]);
        assert_eq!(
            resolve_conflict(&[put("b", 2, "x")], 0, &conflict, &chunk),
            Resolution::Unresolvable
        );

        chunk.record(&[LocalOp::remove("a")]);
        assert!(!chunk.contains("a"));
        assert_eq!(
            resolve_conflict(&[put("b", 2, "x")], 0, &conflict, &chunk),
            Resolution::RemoveLocal { key: "a".to_string() }
        );
    }

    #[tokio::test]
    async fn test_apply_unit_resolves_local_conflict() {
        let store = store().await;
        store.write("users", "local", json!({"email": "x"})).await.unwrap();
        let circuit = StoreCircuit::new();

        let report = apply_unit(&store, &circuit, "users", vec![put("remote", 1, "x")], 9, &ChunkWrites::new())
            .await
            .unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert!(store.get("users", "local").await.unwrap().is_none());
        assert!(store.get("users", "remote").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_apply_unit_resolves_chain() {
        let store = store().await;
        store.write("users", "l1", json!({"email": "x"})).await.unwrap();
        store.write("users", "l2", json!({"email": "y"})).await.unwrap();
        let circuit = StoreCircuit::new();

        let report = apply_unit(
            &store,
            &circuit,
            "users",
            vec![put("r1", 1, "x"), put("r2", 2, "y")],
            0,
            &ChunkWrites::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.conflicts_resolved, 2);
        assert_eq!(report.written, 2);
        assert_eq!(store.count("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_apply_unit_unresolvable_leaves_store_untouched() {
        let store = store().await;
        let circuit = StoreCircuit::new();
        let err = apply_unit(&store, &circuit, "users", vec![put("a", 1, "x"), put("b", 2, "x")], 17, &ChunkWrites::new())
            .await
            .unwrap_err();
        match err {
            ReplicationError::UnresolvableConflict {
                key,
                conflicting_key,
                tick,
                ..
            } => {
                assert_eq!(key, "b");
                assert_eq!(conflicting_key, "a");
                assert_eq!(tick, 17);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_then_reuse_in_same_unit_is_fine() {
        let store = store().await;
        let circuit = StoreCircuit::new();
        apply_unit(&store, &circuit, "users", vec![put("a", 1, "x")], 0, &ChunkWrites::new())
            .await
            .unwrap();
        let report = apply_unit(
            &store,
            &circuit,
            "users",
            vec![LocalOp::remove("a"), put("b", 2, "x")],
            0,
            &ChunkWrites::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.conflicts_resolved, 0);
        assert!(store.get("users", "b").await.unwrap().is_some());
    }
}
