// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Documents, revisions and collection definitions.
//!
//! A [`Tick`] orders leader mutations; a [`Revision`] identifies one version of
//! one document. Replicated documents keep the leader's revision, so a
//! follower-local write (stamped with the follower's server id) can never be
//! mistaken for a leader version.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Position in the leader's operation log.
pub type Tick = u64;

/// Version identifier of a document.
///
/// Ordered by stamp first, then by the id of the server that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub stamp: u64,
    pub server: u16,
}

impl Revision {
    pub fn new(stamp: u64, server: u16) -> Self {
        Self { stamp, server }
    }

    pub(crate) fn to_bytes(self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&self.stamp.to_be_bytes());
        out[8..].copy_from_slice(&self.server.to_be_bytes());
        out
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}-{}", self.stamp, self.server)
    }
}

/// A document in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub revision: Revision,
    pub body: Value,
}

impl Document {
    pub fn new(key: impl Into<String>, revision: Revision, body: Value) -> Self {
        Self {
            key: key.into(),
            revision,
            body,
        }
    }

    /// Look up a (possibly nested, dot-separated) attribute of the body.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.body, |value, segment| value.get(segment))
    }
}

/// A secondary index on a collection.
///
/// Only unique indexes matter to replication: they are what turns a replicated
/// write into a conflict with an unrelated local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Sparse indexes skip documents where any indexed attribute is missing or null.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    pub fn unique(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: true,
            sparse: false,
        }
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// The value this document contributes to the index, encoded as a
    /// comparable string, or `None` if a sparse index skips the document.
    pub fn index_value(&self, doc: &Document) -> Option<String> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match doc.field(field) {
                Some(Value::Null) | None if self.sparse => return None,
                Some(v) => values.push(v.clone()),
                None => values.push(Value::Null),
            }
        }
        Some(Value::Array(values).to_string())
    }
}

/// Structural definition of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indexes.iter().filter(|i| i.unique)
    }
}

/// Order-independent checksum over a collection's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub count: u64,
    pub hash: u64,
}

impl Checksum {
    /// Fold a document in. With `with_data`, the body contributes as well as
    /// the key and revision.
    pub fn add(&mut self, doc: &Document, with_data: bool) {
        let mut hasher = Sha256::new();
        hasher.update(doc.key.as_bytes());
        hasher.update([0u8]);
        if with_data {
            // serde_json maps are ordered, so the encoding is deterministic
            hasher.update(doc.body.to_string().as_bytes());
        } else {
            hasher.update(doc.revision.to_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        self.count += 1;
        self.hash = self.hash.wrapping_add(u64::from_be_bytes(head));
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:016x}", self.count, self.hash)
    }
}
