// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for log entry decoding.
//!
//! This tests that arbitrary tail pages decode or fail cleanly, and that the
//! accessors of any decoded entry never panic.

#![no_main]

use collection_replication::oplog::{LogEntry, TailChunk};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = serde_json::from_slice::<LogEntry>(data) {
        let _ = entry.tick();
        let _ = entry.collection();
        let _ = entry.tid();
        let _ = entry.is_marker();
    }

    if let Ok(chunk) = serde_json::from_slice::<TailChunk>(data) {
        // Should never panic
        let _ = chunk.entries.iter().map(LogEntry::tick).max();
    }
});
