// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Buffering of replicated transactions.
//!
//! Document operations carrying a transaction id are held here until the
//! leader's `TransactionCommit` arrives, then applied as one unit. An
//! abort, or the applier stopping, discards them.

use crate::document::Tick;
use crate::store::LocalOp;
use std::collections::BTreeMap;

/// Operations of one open transaction, in log order.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTransaction {
    pub tid: u64,
    /// Tick of the `TransactionBegin` (or of the first operation seen).
    pub begin_tick: Tick,
    pub ops: Vec<LocalOp>,
}

#[derive(Debug, Default)]
pub struct TransactionBuffer {
    open: BTreeMap<u64, OpenTransaction>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, tid: u64, tick: Tick) {
        self.open.entry(tid).or_insert_with(|| OpenTransaction {
            tid,
            begin_tick: tick,
            ops: Vec::new(),
        });
    }

    /// Buffer an operation. An unknown tid opens the transaction at `tick`.
    pub fn push(&mut self, tid: u64, tick: Tick, op: LocalOp) {
        self.begin(tid, tick);
        if let Some(tx) = self.open.get_mut(&tid) {
            tx.ops.push(op);
        }
    }

    /// Remove a transaction for committing.
    pub fn take(&mut self, tid: u64) -> Option<OpenTransaction> {
        self.open.remove(&tid)
    }

    /// Drop a transaction. Returns how many operations were discarded.
    pub fn discard(&mut self, tid: u64) -> usize {
        self.open.remove(&tid).map_or(0, |tx| tx.ops.len())
    }

    /// Begin tick of the oldest open transaction.
    pub fn earliest_begin(&self) -> Option<Tick> {
        self.open.values().map(|tx| tx.begin_tick).min()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
