// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for key placement.
//!
//! This tests that every key maps to a leaf whose range contains it, for
//! every valid tree shape.

#![no_main]

use collection_replication::tree::{key_position, TreeConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u8, u8)| {
    let (key, depth, fanout_bits) = data;
    let Ok(config) = TreeConfig::new(depth % 8, 1u32 << (fanout_bits % 5)) else {
        return;
    };

    let position = key_position(key);
    let leaf = config.leaf_for(position);
    assert!(leaf < config.leaf_count());
    assert!(config.leaf_range(leaf).contains(position));
});
