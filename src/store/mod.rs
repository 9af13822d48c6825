// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local document storage.
//!
//! [`DocumentStore`] is the seam the replication engine writes through;
//! [`MemoryStore`] is the in-process reference implementation used by the
//! manager by default and throughout the tests.

mod collection;
mod memory;
mod traits;

pub use collection::DumpCursor;
pub use memory::MemoryStore;
pub use traits::{
    ApplyOutcome, BoxFuture, DocumentStore, IndexAlignment, LocalOp, StoreError, StoreResult, UniqueConflict,
    WriteOutcome,
};

pub(crate) use collection::{clock_seed, next_revision, Collection, CollectionSnapshot};
