// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The leader's operation log.
//!
//! Every committed mutation is appended as a [`LogEntry`] with a strictly
//! increasing tick. Document operations written inside a transaction carry
//! its id (`tid`) and are bracketed by `TransactionBegin` and either
//! `TransactionCommit` or `TransactionAbort`.
//!
//! Tailing is per collection: a reader sees the document operations of its
//! collection plus the markers of transactions that touched it. The
//! `scanned_to` tick of a [`TailChunk`] tells the reader how far the leader
//! looked, so a follower makes progress even when nothing in the scanned
//! span concerned its collection.
//!
//! Compaction drops a prefix of the log. Readers asking for ticks inside the
//! dropped prefix get `from_present == false`.

use crate::document::{Document, Revision, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// One entry in the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LogEntry {
    Insert {
        tick: Tick,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<u64>,
        document: Document,
    },
    Update {
        tick: Tick,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<u64>,
        document: Document,
    },
    Remove {
        tick: Tick,
        collection: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tid: Option<u64>,
        key: String,
        revision: Revision,
    },
    TransactionBegin {
        tick: Tick,
        tid: u64,
    },
    TransactionCommit {
        tick: Tick,
        tid: u64,
    },
    TransactionAbort {
        tick: Tick,
        tid: u64,
    },
}

impl LogEntry {
    pub fn tick(&self) -> Tick {
        match self {
            Self::Insert { tick, .. }
            | Self::Update { tick, .. }
            | Self::Remove { tick, .. }
            | Self::TransactionBegin { tick, .. }
            | Self::TransactionCommit { tick, .. }
            | Self::TransactionAbort { tick, .. } => *tick,
        }
    }

    /// Collection of a document operation; `None` for transaction markers.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Remove { collection, .. } => Some(collection),
            _ => None,
        }
    }

    pub fn tid(&self) -> Option<u64> {
        match self {
            Self::Insert { tid, .. } | Self::Update { tid, .. } | Self::Remove { tid, .. } => *tid,
            Self::TransactionBegin { tid, .. }
            | Self::TransactionCommit { tid, .. }
            | Self::TransactionAbort { tid, .. } => Some(*tid),
        }
    }

    pub fn is_marker(&self) -> bool {
        self.collection().is_none()
    }
}

/// A page of log entries returned by tailing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailChunk {
    pub entries: Vec<LogEntry>,
    /// Highest tick the leader examined for this page.
    pub scanned_to: Tick,
    /// Leader's current tick when the page was produced.
    pub leader_tick: Tick,
    /// `false` if entries after the requested tick were compacted away.
    pub from_present: bool,
    /// Highest tick dropped by compaction.
    #[serde(default)]
    pub compacted_through: Tick,
    /// More relevant entries are waiting beyond `scanned_to`. Irrelevant
    /// entries past the page are folded into `scanned_to` instead.
    pub has_more: bool,
}

/// Append-only, compactable operation log.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: VecDeque<LogEntry>,
    /// Collections touched by each transaction still referenced by the log.
    tx_collections: HashMap<u64, BTreeSet<String>>,
    compacted_through: Tick,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_tick(&self) -> Option<Tick> {
        self.entries.front().map(LogEntry::tick)
    }

    pub fn last_tick(&self) -> Option<Tick> {
        self.entries.back().map(LogEntry::tick)
    }

    /// Highest tick removed by compaction (0 if nothing was compacted).
    pub fn compacted_through(&self) -> Tick {
        self.compacted_through
    }

    /// Append an entry. Ticks must increase strictly.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert!(
            self.last_tick().map_or(true, |last| entry.tick() > last),
            "log ticks must increase"
        );
        if let (Some(tid), Some(collection)) = (entry.tid(), entry.collection()) {
            self.tx_collections
                .entry(tid)
                .or_default()
                .insert(collection.to_string());
        }
        self.entries.push_back(entry);
    }

    /// Entries for `collection` strictly after `after`, at most `limit` of them.
    pub fn read_after(&self, collection: &str, after: Tick, limit: usize) -> TailChunk {
        let start = self.entries.partition_point(|e| e.tick() <= after);
        let mut entries = Vec::new();
        let mut scanned_to = after;
        let mut has_more = false;

        for entry in self.entries.iter().skip(start) {
            let relevant = self.is_relevant(entry, collection);
            if relevant && entries.len() >= limit.max(1) {
                has_more = true;
                break;
            }
            if relevant {
                entries.push(entry.clone());
            }
            scanned_to = entry.tick();
        }

        TailChunk {
            entries,
            scanned_to,
            leader_tick: self.last_tick().unwrap_or(self.compacted_through),
            from_present: after >= self.compacted_through,
            compacted_through: self.compacted_through,
            has_more,
        }
    }

    /// Whether transaction `tid` has written to `collection` so far.
    pub fn touches(&self, tid: u64, collection: &str) -> bool {
        self.tx_collections
            .get(&tid)
            .is_some_and(|set| set.contains(collection))
    }

    fn is_relevant(&self, entry: &LogEntry, collection: &str) -> bool {
        match entry.collection() {
            Some(c) => c == collection,
            None => entry.tid().is_some_and(|tid| self.touches(tid, collection)),
        }
    }

    /// Drop all entries with a tick `<= up_to`. Returns the number removed.
    pub fn compact(&mut self, up_to: Tick) -> usize {
        let mut removed = 0;
        while let Some(front) = self.entries.front() {
            if front.tick() > up_to {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                if let LogEntry::TransactionCommit { tid, .. } | LogEntry::TransactionAbort { tid, .. } = entry {
                    self.tx_collections.remove(&tid);
                }
                removed += 1;
            }
        }
        self.compacted_through = self.compacted_through.max(up_to);
        removed
    }
}
