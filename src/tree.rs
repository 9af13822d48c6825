// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision trees.
//!
//! A revision tree is a fixed-shape hash tree over the `(key, revision)`
//! pairs of a collection. Keys are placed by their *position*, the first
//! eight bytes of their SHA-256, so the same key always lands in the same
//! leaf regardless of which server builds the tree.
//!
//! ```text
//!                         root
//!            ┌─────────┬────┴────┬─────────┐        fanout F
//!          node      node      node      node
//!         ┌─┴─┐     ┌─┴─┐     ┌─┴─┐     ┌─┴─┐
//!         leaves: F^D buckets, each covering a contiguous position range
//! ```
//!
//! Every node stores a `count` and a `hash`. An entry contributes a 64-bit
//! hash that is combined with wrapping addition, so:
//!
//! - the combination is order-independent (rebuild == incremental maintenance),
//! - removal is exact (wrapping subtraction of the same contribution),
//! - an internal node is the plain sum of its children.
//!
//! Two trees are compared top-down, skipping equal subtrees; divergent leaves
//! are turned into [`KeyRange`]s, with adjacent leaves merged into one range.
//! The depth does not depend on the number of documents.

use crate::document::Revision;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_DEPTH: u8 = 4;
pub const DEFAULT_FANOUT: u32 = 8;

/// Upper bound on `log2(fanout) * depth`; keeps leaf arrays addressable.
const MAX_LEAF_BITS: u32 = 24;

/// Errors raised by tree construction and comparison.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("invalid tree parameters: depth {depth}, fanout {fanout}")]
    InvalidParameters { depth: u8, fanout: u32 },

    #[error("tree shape mismatch: local {local_depth}x{local_fanout}, remote {remote_depth}x{remote_fanout}")]
    ShapeMismatch {
        local_depth: u8,
        local_fanout: u32,
        remote_depth: u8,
        remote_fanout: u32,
    },

    #[error("leaf {index} out of range ({leaves} leaves)")]
    LeafOutOfRange { index: u32, leaves: usize },

    #[error("leaf {0} appears twice in summary")]
    DuplicateLeaf(u32),

    #[error(
        "corrupt summary: declares {declared_count}/{declared_hash:016x}, leaves sum to {computed_count}/{computed_hash:016x}"
    )]
    Corrupt {
        declared_count: u64,
        declared_hash: u64,
        computed_count: u64,
        computed_hash: u64,
    },
}

/// Position of a key in the 64-bit key space.
pub fn key_position(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Contribution of one `(key, revision)` pair to its leaf hash.
pub fn entry_hash(key: &str, revision: Revision) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(revision.to_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Inclusive range of key positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    /// The whole key space.
    pub const FULL: KeyRange = KeyRange {
        start: 0,
        end: u64::MAX,
    };

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:016x}..{:016x}]", self.start, self.end)
    }
}

/// Shape of a revision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_depth")]
    pub depth: u8,
    #[serde(default = "default_fanout")]
    pub fanout: u32,
}

fn default_depth() -> u8 {
    DEFAULT_DEPTH
}

fn default_fanout() -> u32 {
    DEFAULT_FANOUT
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            fanout: DEFAULT_FANOUT,
        }
    }
}

impl TreeConfig {
    pub fn new(depth: u8, fanout: u32) -> Result<Self, TreeError> {
        let config = Self { depth, fanout };
        config.validate()?;
        Ok(config)
    }

    /// Fanout must be a power of two (at least 2) and the leaf count bounded.
    pub fn validate(&self) -> Result<(), TreeError> {
        let valid = self.depth >= 1
            && self.fanout >= 2
            && self.fanout.is_power_of_two()
            && self.fanout_bits() * self.depth as u32 <= MAX_LEAF_BITS;
        if valid {
            Ok(())
        } else {
            Err(TreeError::InvalidParameters {
                depth: self.depth,
                fanout: self.fanout,
            })
        }
    }

    fn fanout_bits(&self) -> u32 {
        self.fanout.trailing_zeros()
    }

    fn leaf_bits(&self) -> u32 {
        self.fanout_bits() * self.depth as u32
    }

    pub fn leaf_count(&self) -> usize {
        1usize << self.leaf_bits()
    }

    /// Leaf bucket for a key position.
    pub fn leaf_for(&self, position: u64) -> usize {
        (position >> (64 - self.leaf_bits())) as usize
    }

    /// Key positions covered by a leaf.
    pub fn leaf_range(&self, leaf: usize) -> KeyRange {
        let shift = 64 - self.leaf_bits();
        let start = (leaf as u64) << shift;
        KeyRange::new(start, start | ((1u64 << shift) - 1))
    }
}

/// Count and combined hash of a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub count: u64,
    pub hash: u64,
}

impl Node {
    fn add(&mut self, hash: u64) {
        self.count = self.count.wrapping_add(1);
        self.hash = self.hash.wrapping_add(hash);
    }

    fn sub(&mut self, hash: u64) {
        self.count = self.count.wrapping_sub(1);
        self.hash = self.hash.wrapping_sub(hash);
    }

    fn combine(&mut self, other: Node) {
        self.count = self.count.wrapping_add(other.count);
        self.hash = self.hash.wrapping_add(other.hash);
    }
}

/// One `(key, revision)` pair, as listed by range queries and verification
/// summaries. Ordered by key position, then key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub key: String,
    pub revision: Revision,
}

impl TreeEntry {
    pub fn new(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }

    pub fn sort_key(&self) -> (u64, &str) {
        (key_position(&self.key), self.key.as_str())
    }
}

/// A leaf as shipped in a [`TreeSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSummary {
    pub index: u32,
    pub count: u64,
    pub hash: u64,
    /// Present only in verification summaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<TreeEntry>>,
}

/// The serializable form of a tree: its shape, totals and leaves.
///
/// With `only_populated`, empty leaves are elided and must be read as empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSummary {
    pub depth: u8,
    pub fanout: u32,
    pub count: u64,
    pub hash: u64,
    pub only_populated: bool,
    pub leaves: Vec<LeafSummary>,
}

impl TreeSummary {
    pub fn config(&self) -> TreeConfig {
        TreeConfig {
            depth: self.depth,
            fanout: self.fanout,
        }
    }

    /// Attach per-leaf entries, turning this into a verification summary.
    ///
    /// Entries for leaves not present in the summary are attached to new,
    /// zero-valued leaves so that [`verify`](Self::verify) reports them.
    pub fn attach_entries<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, Revision)>) {
        let config = self.config();
        let mut by_leaf: BTreeMap<u32, Vec<TreeEntry>> = BTreeMap::new();
        for (key, revision) in entries {
            let leaf = config.leaf_for(key_position(key)) as u32;
            by_leaf.entry(leaf).or_default().push(TreeEntry::new(key, revision));
        }
        for leaf in &mut self.leaves {
            leaf.entries = Some(by_leaf.remove(&leaf.index).unwrap_or_default());
        }
        for (index, entries) in by_leaf {
            self.leaves.push(LeafSummary {
                index,
                count: 0,
                hash: 0,
                entries: Some(entries),
            });
        }
        self.leaves.sort_by_key(|l| l.index);
    }

    /// Recompute every leaf that carries entries and return the indexes of
    /// leaves whose declared count/hash disagree with their own entries (or
    /// that hold entries belonging to another leaf).
    pub fn verify(&self) -> Vec<u32> {
        let config = self.config();
        if config.validate().is_err() {
            return self.leaves.iter().map(|l| l.index).collect();
        }
        let mut bad = Vec::new();
        for leaf in &self.leaves {
            let Some(entries) = &leaf.entries else {
                continue;
            };
            let mut node = Node::default();
            let mut misplaced = false;
            for entry in entries {
                let position = key_position(&entry.key);
                if config.leaf_for(position) as u32 != leaf.index {
                    misplaced = true;
                }
                node.add(entry_hash(&entry.key, entry.revision));
            }
            if misplaced || node.count != leaf.count || node.hash != leaf.hash {
                bad.push(leaf.index);
            }
        }
        bad
    }
}

/// Fixed-shape hashed tree over `(key, revision)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionTree {
    config: TreeConfig,
    /// `levels[0]` is the root, `levels[depth]` the leaves.
    levels: Vec<Vec<Node>>,
}

impl RevisionTree {
    pub fn new(config: TreeConfig) -> Result<Self, TreeError> {
        config.validate()?;
        let levels = (0..=config.depth as u32)
            .map(|level| vec![Node::default(); 1usize << (config.fanout_bits() * level)])
            .collect();
        Ok(Self { config, levels })
    }

    /// Full rebuild from a scan of the collection.
    pub fn build<'a>(
        config: TreeConfig,
        entries: impl IntoIterator<Item = (&'a str, Revision)>,
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(config)?;
        for (key, revision) in entries {
            let leaf = config.leaf_for(key_position(key));
            tree.leaves_mut()[leaf].add(entry_hash(key, revision));
        }
        tree.rebuild_internal();
        Ok(tree)
    }

    /// Reconstruct a tree from a summary, validating its shape and totals.
    pub fn from_summary(summary: &TreeSummary) -> Result<Self, TreeError> {
        let config = summary.config();
        let mut tree = Self::new(config)?;
        let leaves = config.leaf_count();
        let mut seen = vec![false; leaves];
        for leaf in &summary.leaves {
            let index = leaf.index as usize;
            if index >= leaves {
                return Err(TreeError::LeafOutOfRange {
                    index: leaf.index,
                    leaves,
                });
            }
            if std::mem::replace(&mut seen[index], true) {
                return Err(TreeError::DuplicateLeaf(leaf.index));
            }
            tree.leaves_mut()[index] = Node {
                count: leaf.count,
                hash: leaf.hash,
            };
        }
        tree.rebuild_internal();

        let root = tree.root();
        if root.count != summary.count || root.hash != summary.hash {
            return Err(TreeError::Corrupt {
                declared_count: summary.count,
                declared_hash: summary.hash,
                computed_count: root.count,
                computed_hash: root.hash,
            });
        }
        Ok(tree)
    }

    pub fn config(&self) -> TreeConfig {
        self.config
    }

    pub fn root(&self) -> Node {
        self.levels[0][0]
    }

    pub fn count(&self) -> u64 {
        self.root().count
    }

    pub fn leaf(&self, index: usize) -> Option<Node> {
        self.leaves().get(index).copied()
    }

    pub fn insert(&mut self, key: &str, revision: Revision) {
        let hash = entry_hash(key, revision);
        let leaf = self.config.leaf_for(key_position(key));
        self.walk_up(leaf, |node| node.add(hash));
    }

    pub fn remove(&mut self, key: &str, revision: Revision) {
        let hash = entry_hash(key, revision);
        let leaf = self.config.leaf_for(key_position(key));
        self.walk_up(leaf, |node| node.sub(hash));
    }

    /// Incremental maintenance: `old` is the revision being replaced (if
    /// any), `new` the revision being written (if any).
    pub fn update(&mut self, key: &str, old: Option<Revision>, new: Option<Revision>) {
        if let Some(old) = old {
            self.remove(key, old);
        }
        if let Some(new) = new {
            self.insert(key, new);
        }
    }

    pub fn clear(&mut self) {
        for level in &mut self.levels {
            level.iter_mut().for_each(|n| *n = Node::default());
        }
    }

    pub fn summary(&self, only_populated: bool) -> TreeSummary {
        let leaves = self
            .leaves()
            .iter()
            .enumerate()
            .filter(|(_, node)| !only_populated || node.count != 0 || node.hash != 0)
            .map(|(index, node)| LeafSummary {
                index: index as u32,
                count: node.count,
                hash: node.hash,
                entries: None,
            })
            .collect();
        let root = self.root();
        TreeSummary {
            depth: self.config.depth,
            fanout: self.config.fanout,
            count: root.count,
            hash: root.hash,
            only_populated,
            leaves,
        }
    }

    /// Divergent key ranges between two trees of the same shape.
    pub fn diff(&self, other: &RevisionTree) -> Result<Vec<KeyRange>, TreeError> {
        if self.config != other.config {
            return Err(TreeError::ShapeMismatch {
                local_depth: self.config.depth,
                local_fanout: self.config.fanout,
                remote_depth: other.config.depth,
                remote_fanout: other.config.fanout,
            });
        }

        let depth = self.config.depth as usize;
        let fanout = self.config.fanout as usize;
        let mut divergent = Vec::new();
        let mut stack = vec![(0usize, 0usize)];
        while let Some((level, index)) = stack.pop() {
            if self.levels[level][index] == other.levels[level][index] {
                continue;
            }
            if level == depth {
                divergent.push(index);
                continue;
            }
            let first = index * fanout;
            // reversed so leaves come off the stack in ascending order
            for child in (first..first + fanout).rev() {
                stack.push((level + 1, child));
            }
        }
        Ok(self.merge_leaves(&divergent))
    }

    /// Compare against a remote summary.
    pub fn diff_leaves(&self, remote: &TreeSummary) -> Result<Vec<KeyRange>, TreeError> {
        let shape = remote.config();
        if shape != self.config {
            return Err(TreeError::ShapeMismatch {
                local_depth: self.config.depth,
                local_fanout: self.config.fanout,
                remote_depth: shape.depth,
                remote_fanout: shape.fanout,
            });
        }
        let remote = Self::from_summary(remote)?;
        self.diff(&remote)
    }

    fn merge_leaves(&self, leaves: &[usize]) -> Vec<KeyRange> {
        let mut ranges: Vec<KeyRange> = Vec::new();
        let mut previous: Option<usize> = None;
        for &leaf in leaves {
            let range = self.config.leaf_range(leaf);
            match (previous, ranges.last_mut()) {
                (Some(p), Some(last)) if p + 1 == leaf => last.end = range.end,
                _ => ranges.push(range),
            }
            previous = Some(leaf);
        }
        ranges
    }

    fn leaves(&self) -> &[Node] {
        &self.levels[self.config.depth as usize]
    }

    fn leaves_mut(&mut self) -> &mut [Node] {
        let depth = self.config.depth as usize;
        &mut self.levels[depth]
    }

    fn walk_up(&mut self, leaf: usize, mut f: impl FnMut(&mut Node)) {
        let bits = self.config.fanout_bits();
        let depth = self.config.depth as u32;
        for level in (0..=depth).rev() {
            let index = leaf >> (bits * (depth - level));
            f(&mut self.levels[level as usize][index]);
        }
    }

    fn rebuild_internal(&mut self) {
        let fanout = self.config.fanout as usize;
        for level in (0..self.config.depth as usize).rev() {
            let (upper, lower) = self.levels.split_at_mut(level + 1);
            let parents = &mut upper[level];
            let children = &lower[0];
            for (i, parent) in parents.iter_mut().enumerate() {
                let mut node = Node::default();
                for child in &children[i * fanout..(i + 1) * fanout] {
                    node.combine(*child);
                }
                *parent = node;
            }
        }
    }
}
