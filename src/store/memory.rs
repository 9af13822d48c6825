// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`DocumentStore`].

use super::collection::{clock_seed, next_revision, Collection};
use super::traits::{
    ApplyOutcome, BoxFuture, DocumentStore, IndexAlignment, LocalOp, StoreError, StoreResult, WriteOutcome,
};
use crate::document::{Checksum, CollectionSpec, Document};
use crate::tree::{KeyRange, RevisionTree, TreeConfig, TreeEntry, TreeSummary};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use tokio::sync::RwLock;
use tracing::debug;

/// Follower-side store holding every collection in memory.
///
/// Besides the [`DocumentStore`] surface used by replication, it offers
/// plain writes ([`MemoryStore::write`], [`MemoryStore::delete`]) that stamp
/// a revision of this server, the way a local client write would.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    tree_config: TreeConfig,
    server_id: u16,
    clock: AtomicU64,
}

impl MemoryStore {
    pub fn new(server_id: u16) -> Self {
        Self::with_tree_config(server_id, TreeConfig::default())
    }

    pub fn with_tree_config(server_id: u16, tree_config: TreeConfig) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            tree_config,
            server_id,
            clock: AtomicU64::new(clock_seed()),
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Create a collection for local use. No-op if it exists.
    pub async fn create_collection(&self, spec: CollectionSpec) -> StoreResult<()> {
        self.ensure_collection(spec).await.map(|_| ())
    }

    /// Local write with a fresh revision. Unique collisions are errors here.
    pub async fn write(&self, collection: &str, key: &str, body: Value) -> StoreResult<Document> {
        let mut collections = self.collections.write().await;
        let c = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        let doc = Document::new(key, next_revision(&self.clock, self.server_id), body);
        match c.put(doc.clone()) {
            WriteOutcome::Conflict(conflict) => Err(StoreError::UniqueViolation {
                collection: collection.to_string(),
                index: conflict.index,
                key: key.to_string(),
                conflicting_key: conflict.conflicting_key,
            }),
            _ => Ok(doc),
        }
    }

    /// Local removal. Returns whether the document existed.
    pub async fn delete(&self, collection: &str, key: &str) -> StoreResult<bool> {
        let outcome = self.remove_local(collection, key).await?;
        Ok(matches!(outcome, WriteOutcome::Removed { .. }))
    }

    /// All documents, in key-position order.
    pub async fn documents(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().await;
        let c = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?;
        Ok(c.documents().cloned().collect())
    }

    async fn with_collection<T>(&self, collection: &str, f: impl FnOnce(&Collection) -> T) -> StoreResult<T> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(f)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }

    async fn with_collection_mut<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> StoreResult<T> {
        let mut collections = self.collections.write().await;
        collections
            .get_mut(collection)
            .map(f)
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }
}

impl DocumentStore for MemoryStore {
    fn collection_spec<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, Option<CollectionSpec>> {
        Box::pin(async move {
            let collections = self.collections.read().await;
            Ok(collections.get(collection).map(|c| c.spec().clone()))
        })
    }

    fn recreate_collection(&self, spec: CollectionSpec) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let name = spec.name.clone();
            let fresh = Collection::new(spec, self.tree_config)?;
            let mut collections = self.collections.write().await;
            let dropped = collections.insert(name.clone(), fresh).is_some();
            debug!(collection = %name, dropped, "Collection recreated");
            Ok(())
        })
    }

    fn ensure_collection(&self, spec: CollectionSpec) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut collections = self.collections.write().await;
            if collections.contains_key(&spec.name) {
                return Ok(false);
            }
            let name = spec.name.clone();
            collections.insert(name.clone(), Collection::new(spec, self.tree_config)?);
            debug!(collection = %name, "Collection created");
            Ok(true)
        })
    }

    fn align_indexes(&self, spec: CollectionSpec) -> BoxFuture<'_, IndexAlignment> {
        Box::pin(async move {
            let name = spec.name.clone();
            let dropped = self
                .with_collection_mut(&name, |c| c.align_indexes(spec.indexes))
                .await?;
            Ok(match dropped {
                Some(dropped) => {
                    debug!(collection = %name, dropped = dropped.len(), "Indexes aligned");
                    IndexAlignment { changed: true, dropped }
                }
                None => IndexAlignment::default(),
            })
        })
    }

    fn truncate<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move { self.with_collection_mut(collection, Collection::truncate).await })
    }

    fn get<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, Option<Document>> {
        Box::pin(async move { self.with_collection(collection, |c| c.get(key).cloned()).await })
    }

    fn insert_local<'a>(&'a self, collection: &'a str, doc: Document) -> BoxFuture<'a, WriteOutcome> {
        Box::pin(async move { self.with_collection_mut(collection, |c| c.put(doc)).await })
    }

    fn remove_local<'a>(&'a self, collection: &'a str, key: &'a str) -> BoxFuture<'a, WriteOutcome> {
        Box::pin(async move { self.with_collection_mut(collection, |c| c.remove(key)).await })
    }

    fn apply_local<'a>(&'a self, collection: &'a str, ops: Vec<LocalOp>) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move { self.with_collection_mut(collection, |c| c.apply(ops)).await })
    }

    fn count<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, u64> {
        Box::pin(async move { self.with_collection(collection, Collection::len).await })
    }

    fn revision_tree<'a>(&'a self, collection: &'a str) -> BoxFuture<'a, RevisionTree> {
        Box::pin(async move { self.with_collection(collection, |c| c.tree().clone()).await })
    }

    fn tree_summary<'a>(
        &'a self,
        collection: &'a str,
        only_populated: bool,
        verification: bool,
    ) -> BoxFuture<'a, TreeSummary> {
        Box::pin(async move {
            self.with_collection(collection, |c| c.summary(only_populated, verification))
                .await
        })
    }

    fn range_revisions<'a>(&'a self, collection: &'a str, ranges: &'a [KeyRange]) -> BoxFuture<'a, Vec<TreeEntry>> {
        Box::pin(async move { self.with_collection(collection, |c| c.range_revisions(ranges)).await })
    }

    fn checksum<'a>(&'a self, collection: &'a str, with_data: bool) -> BoxFuture<'a, Checksum> {
        Box::pin(async move { self.with_collection(collection, |c| c.checksum(with_data)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{IndexSpec, Revision};
    use serde_json::json;

    async fn store_with_users() -> MemoryStore {
        let store = MemoryStore::new(2);
        store
            .create_collection(CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"])))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let store = MemoryStore::new(1);
        assert_eq!(store.collection_spec("nope").await.unwrap(), None);
        assert!(matches!(
            store.count("nope").await,
            Err(StoreError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_write_stamps_own_revision() {
        let store = store_with_users().await;
        let a = store.write("users", "a", json!({"email": "a@x"})).await.unwrap();
        let b = store.write("users", "b", json!({"email": "b@x"})).await.unwrap();
        assert_eq!(a.revision.server, 2);
        assert!(b.revision > a.revision);
        assert_eq!(store.count("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_local_write_unique_violation() {
        let store = store_with_users().await;
        store.write("users", "a", json!({"email": "dup"})).await.unwrap();
        let err = store.write("users", "b", json!({"email": "dup"})).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { ref conflicting_key, .. } if conflicting_key == "a"));
    }

    #[tokio::test]
    async fn test_insert_local_is_idempotent() {
        let store = store_with_users().await;
        let doc = Document::new("a", Revision::new(5, 1), json!({"email": "a"}));
        assert_eq!(store.insert_local("users", doc.clone()).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(store.insert_local("users", doc).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(store.remove_local("users", "zzz").await.unwrap(), WriteOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_recreate_drops_contents() {
        let store = store_with_users().await;
        store.write("users", "a", json!({"email": "a"})).await.unwrap();
        store.recreate_collection(CollectionSpec::new("users")).await.unwrap();
        assert_eq!(store.count("users").await.unwrap(), 0);
        assert!(!store.ensure_collection(CollectionSpec::new("users")).await.unwrap());
        assert!(store.ensure_collection(CollectionSpec::new("other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_tree_tracks_writes() {
        let store = store_with_users().await;
        for i in 0..30 {
            store.write("users", &format!("k{i}"), json!({"email": i})).await.unwrap();
        }
        store.delete("users", "k3").await.unwrap();
        let tree = store.revision_tree("users").await.unwrap();
        let docs = store.documents("users").await.unwrap();
        let rebuilt = RevisionTree::build(
            tree.config(),
            docs.iter().map(|d| (d.key.as_str(), d.revision)),
        )
        .unwrap();
        assert_eq!(tree, rebuilt);
        assert_eq!(tree.count(), 29);
    }

    #[tokio::test]
    async fn test_align_indexes_adds_missing_index() {
        let store = MemoryStore::new(2);
        store.create_collection(CollectionSpec::new("users")).await.unwrap();
        store.write("users", "a", json!({"email": "a@x"})).await.unwrap();

        let spec = CollectionSpec::new("users").with_index(IndexSpec::unique("email", &["email"]));
        let alignment = store.align_indexes(spec.clone()).await.unwrap();
        assert!(alignment.changed);
        assert!(alignment.dropped.is_empty());
        assert_eq!(store.collection_spec("users").await.unwrap(), Some(spec.clone()));
        assert_eq!(store.count("users").await.unwrap(), 1);
        assert!(store.write("users", "b", json!({"email": "a@x"})).await.is_err());

        assert_eq!(store.align_indexes(spec).await.unwrap(), IndexAlignment::default());
        assert!(matches!(
            store.align_indexes(CollectionSpec::new("missing")).await,
            Err(StoreError::CollectionNotFound(_))
        ));
    }
}
