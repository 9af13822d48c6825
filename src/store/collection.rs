// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory collection shared by the reference leader and follower stores.
//!
//! Documents live in a `BTreeMap` keyed by `(key position, key)`, which is
//! exactly the order range listings and dumps need. The map sits behind an
//! `Arc` and is copied on write, so a [`CollectionSnapshot`] taken for a
//! batch keeps seeing the old contents while writes continue.

use super::traits::{ApplyOutcome, LocalOp, UniqueConflict, WriteOutcome};
use crate::document::{Checksum, CollectionSpec, Document, IndexSpec, Revision};
use crate::tree::{key_position, KeyRange, RevisionTree, TreeConfig, TreeEntry, TreeError, TreeSummary};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

pub(crate) type DocMap = BTreeMap<(u64, String), Document>;

/// Cursor into a dump, ordered like the document map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct DumpCursor {
    pub position: u64,
    pub key: String,
}

#[derive(Clone)]
pub(crate) struct Collection {
    spec: CollectionSpec,
    docs: Arc<DocMap>,
    /// index name -> encoded value -> owning key
    unique: HashMap<String, HashMap<String, String>>,
    tree: RevisionTree,
}

/// Frozen view of a collection, pinned by a batch.
#[derive(Clone)]
pub(crate) struct CollectionSnapshot {
    pub spec: CollectionSpec,
    docs: Arc<DocMap>,
    tree: RevisionTree,
}

impl Collection {
    pub fn new(spec: CollectionSpec, tree: TreeConfig) -> Result<Self, TreeError> {
        let unique = spec
            .unique_indexes()
            .map(|i| (i.name.clone(), HashMap::new()))
            .collect();
        Ok(Self {
            spec,
            docs: Arc::new(BTreeMap::new()),
            unique,
            tree: RevisionTree::new(tree)?,
        })
    }

    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    pub fn tree(&self) -> &RevisionTree {
        &self.tree
    }

    pub fn len(&self) -> u64 {
        self.docs.len() as u64
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.docs.get(&(key_position(key), key.to_string()))
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot {
            spec: self.spec.clone(),
            docs: Arc::clone(&self.docs),
            tree: self.tree.clone(),
        }
    }

    /// First unique index on which `doc` would collide with another document.
    pub fn check_unique(&self, doc: &Document) -> Option<UniqueConflict> {
        for index in self.spec.unique_indexes() {
            let Some(value) = index.index_value(doc) else {
                continue;
            };
            if let Some(owner) = self.unique.get(&index.name).and_then(|m| m.get(&value)) {
                if owner != &doc.key {
                    return Some(UniqueConflict {
                        index: index.name.clone(),
                        conflicting_key: owner.clone(),
                    });
                }
            }
        }
        None
    }

    /// Upsert, keeping the document's revision.
    pub fn put(&mut self, doc: Document) -> WriteOutcome {
        if let Some(conflict) = self.check_unique(&doc) {
            return WriteOutcome::Conflict(conflict);
        }
        let slot = (key_position(&doc.key), doc.key.clone());
        if let Some(existing) = self.docs.get(&slot) {
            if existing == &doc {
                return WriteOutcome::Unchanged;
            }
        }

        let previous = Arc::make_mut(&mut self.docs).remove(&slot);
        if let Some(old) = &previous {
            self.unindex(old);
        }
        self.index(&doc);
        self.tree
            .update(&doc.key, previous.as_ref().map(|d| d.revision), Some(doc.revision));
        Arc::make_mut(&mut self.docs).insert(slot, doc);

        match previous {
            Some(old) => WriteOutcome::Replaced {
                previous: old.revision,
            },
            None => WriteOutcome::Inserted,
        }
    }

    pub fn remove(&mut self, key: &str) -> WriteOutcome {
        let slot = (key_position(key), key.to_string());
        if !self.docs.contains_key(&slot) {
            return WriteOutcome::Unchanged;
        }
        match Arc::make_mut(&mut self.docs).remove(&slot) {
            Some(old) => {
                self.unindex(&old);
                self.tree.remove(&old.key, old.revision);
                WriteOutcome::Removed {
                    previous: old.revision,
                }
            }
            None => WriteOutcome::Unchanged,
        }
    }

    /// All-or-nothing application of `ops`.
    pub fn apply(&mut self, ops: Vec<LocalOp>) -> ApplyOutcome {
        let total = ops.len();
        let mut undo: Vec<(String, Option<Document>)> = Vec::with_capacity(total);

        for (op_index, op) in ops.into_iter().enumerate() {
            let key = op.key().to_string();
            let previous = self.get(&key).cloned();
            let outcome = match op {
                LocalOp::Put(doc) => self.put(doc),
                LocalOp::Remove { key } => self.remove(&key),
            };
            if let WriteOutcome::Conflict(conflict) = outcome {
                self.rollback(undo);
                return ApplyOutcome::Conflict {
                    op_index,
                    key,
                    conflict,
                };
            }
            undo.push((key, previous));
        }
        ApplyOutcome::Applied { written: total }
    }

    fn rollback(&mut self, undo: Vec<(String, Option<Document>)>) {
        for (key, previous) in undo.into_iter().rev() {
            match previous {
                Some(doc) => {
                    // restoring a prior state cannot collide: remove first so
                    // the unique slot of the newer version is released
                    self.remove(&key);
                    self.put(doc);
                }
                None => {
                    self.remove(&key);
                }
            }
        }
    }

    /// Replace the index definitions and rebuild the unique lookups.
    ///
    /// Documents colliding on a newly unique value are dropped; their keys
    /// are returned. `None` if the definitions already match.
    pub fn align_indexes(&mut self, indexes: Vec<IndexSpec>) -> Option<Vec<String>> {
        if self.spec.indexes == indexes {
            return None;
        }
        self.spec.indexes = indexes;
        self.unique = self
            .spec
            .unique_indexes()
            .map(|i| (i.name.clone(), HashMap::new()))
            .collect();

        let docs = Arc::clone(&self.docs);
        let mut dropped = Vec::new();
        for doc in docs.values() {
            if self.check_unique(doc).is_some() {
                dropped.push(doc.key.clone());
            } else {
                self.index(doc);
            }
        }
        drop(docs);
        for key in &dropped {
            self.remove(key);
        }
        Some(dropped)
    }

    pub fn truncate(&mut self) -> u64 {
        let removed = self.docs.len() as u64;
        self.docs = Arc::new(BTreeMap::new());
        for index in self.unique.values_mut() {
            index.clear();
        }
        self.tree.clear();
        removed
    }

    pub fn summary(&self, only_populated: bool, verification: bool) -> TreeSummary {
        summarize(&self.tree, &self.docs, only_populated, verification)
    }

    pub fn range_revisions(&self, ranges: &[KeyRange]) -> Vec<TreeEntry> {
        range_revisions(&self.docs, ranges)
    }

    pub fn checksum(&self, with_data: bool) -> Checksum {
        checksum(&self.docs, with_data)
    }

    fn index(&mut self, doc: &Document) {
        for index in self.spec.unique_indexes() {
            if let Some(value) = index.index_value(doc) {
                if let Some(map) = self.unique.get_mut(&index.name) {
                    map.insert(value, doc.key.clone());
                }
            }
        }
    }

    fn unindex(&mut self, doc: &Document) {
        for index in self.spec.unique_indexes() {
            if let Some(value) = index.index_value(doc) {
                if let Some(map) = self.unique.get_mut(&index.name) {
                    if map.get(&value) == Some(&doc.key) {
                        map.remove(&value);
                    }
                }
            }
        }
    }
}

impl CollectionSnapshot {
    pub fn len(&self) -> u64 {
        self.docs.len() as u64
    }

    pub fn summary(&self, only_populated: bool, verification: bool) -> TreeSummary {
        summarize(&self.tree, &self.docs, only_populated, verification)
    }

    pub fn range_revisions(&self, ranges: &[KeyRange]) -> Vec<TreeEntry> {
        range_revisions(&self.docs, ranges)
    }

    /// Up to `limit` documents strictly after `after`, plus the cursor to
    /// continue from (if more remain).
    pub fn dump(&self, after: Option<&DumpCursor>, limit: usize) -> (Vec<Document>, Option<DumpCursor>) {
        let lower = match after {
            Some(c) => Bound::Excluded((c.position, c.key.clone())),
            None => Bound::Unbounded,
        };
        let mut iter = self.docs.range((lower, Bound::Unbounded));
        let documents: Vec<Document> = iter.by_ref().take(limit.max(1)).map(|(_, d)| d.clone()).collect();
        let next = match (iter.next(), documents.last()) {
            (Some(_), Some(last)) => Some(DumpCursor {
                position: key_position(&last.key),
                key: last.key.clone(),
            }),
            _ => None,
        };
        (documents, next)
    }

    pub fn fetch(&self, keys: &[String]) -> Vec<Document> {
        keys.iter()
            .filter_map(|k| self.docs.get(&(key_position(k), k.clone())).cloned())
            .collect()
    }
}

fn summarize(tree: &RevisionTree, docs: &DocMap, only_populated: bool, verification: bool) -> TreeSummary {
    let mut summary = tree.summary(only_populated);
    if verification {
        summary.attach_entries(docs.values().map(|d| (d.key.as_str(), d.revision)));
    }
    summary
}

fn range_revisions(docs: &DocMap, ranges: &[KeyRange]) -> Vec<TreeEntry> {
    let mut out = Vec::new();
    for range in ranges {
        let lower = Bound::Included((range.start, String::new()));
        for ((position, _), doc) in docs.range((lower, Bound::Unbounded)) {
            if *position > range.end {
                break;
            }
            out.push(TreeEntry::new(doc.key.clone(), doc.revision));
        }
    }
    out
}

fn checksum(docs: &DocMap, with_data: bool) -> Checksum {
    let mut sum = Checksum::default();
    for doc in docs.values() {
        sum.add(doc, with_data);
    }
    sum
}

/// Helper used by both reference stores to stamp local writes.
pub(crate) fn next_revision(clock: &std::sync::atomic::AtomicU64, server: u16) -> Revision {
    let stamp = clock.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Revision::new(stamp, server)
}

/// Initial clock value: microseconds since the epoch.
pub(crate) fn clock_seed() -> u64 {
    chrono::Utc::now().timestamp_micros().max(1) as u64
}
