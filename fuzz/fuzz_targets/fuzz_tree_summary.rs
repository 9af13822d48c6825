// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for tree summary decoding.
//!
//! This tests that a summary received from a leader never panics when it is
//! decoded, verified or compared, whatever shape or totals it declares.

#![no_main]

use collection_replication::tree::{RevisionTree, TreeSummary};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(summary) = serde_json::from_slice::<TreeSummary>(data) else {
        return;
    };

    // Should never panic
    let _ = summary.verify();
    if let Ok(remote) = RevisionTree::from_summary(&summary) {
        let _ = remote.diff_leaves(&summary);
    }
    if let Ok(local) = RevisionTree::new(summary.config()) {
        let _ = local.diff_leaves(&summary);
    }
});
