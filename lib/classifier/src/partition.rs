// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The metadata partition index.
//!
//! Pipelines that use the metadata register to separate stages
//! effectively partition one classifier into several. For every
//! metadata value pinned by at least one rule, the index keeps the OR
//! of the tags of the subtables holding such rules. A lookup then
//! probes the index once and skips any tagged subtable whose tag does
//! not intersect.
//!
//! Tags are sparse 64-bit fingerprints. Subtables that pin the whole
//! metadata word get a deterministic two-bit tag drawn from bits
//! 1..=63; everything else gets [`TAG_ALL`] and is never skipped.
//! [`TAG_ARBITRARY`] (bit 0 alone) stands in for metadata values with
//! no partition: it intersects `TAG_ALL` but, by construction, never a
//! deterministic tag, so unrelated partitioned subtables are skipped
//! wholesale. Duplicate tags cost a wasted probe, never a wrong
//! answer.

use dashmap::DashMap;

/// Tag of a subtable that must be consulted for every metadata value.
pub(crate) const TAG_ALL: u64 = u64::MAX;

/// Tag set used when the packet's metadata has no partition.
pub(crate) const TAG_ARBITRARY: u64 = 1;

/// Derive a two-bit tag from a subtable's mask fingerprint. Both bits
/// land in 1..=63 so the tag never intersects [`TAG_ARBITRARY`].
pub(crate) fn tag_create_deterministic(seed: u64) -> u64 {
    let x = 1 + (seed % 63) as u32;
    let mut y = 1 + ((seed >> 6) % 62) as u32;
    if y >= x {
        y += 1;
    }
    (1u64 << x) | (1u64 << y)
}

struct Partition {
    /// OR of the tags of every contributing subtable.
    tags: u64,
    /// Contributions per tag bit, so removal can clear bits exactly.
    counts: [u32; 64],
}

/// Metadata value -> tag set, with per-bit reference counting.
pub(crate) struct Partitions {
    map: DashMap<u64, Partition>,
}

impl Partitions {
    pub(crate) fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record one rule with `metadata` living in a subtable tagged
    /// `tag`. `TAG_ALL` subtables never contribute.
    pub(crate) fn add(&self, metadata: u64, tag: u64) {
        debug_assert_ne!(tag, TAG_ALL);
        let mut p = self.map.entry(metadata).or_insert_with(|| Partition {
            tags: 0,
            counts: [0; 64],
        });
        let mut bits = tag;
        while bits != 0 {
            let b = bits.trailing_zeros() as usize;
            p.counts[b] += 1;
            bits &= bits - 1;
        }
        p.tags |= tag;
    }

    /// Undo one [`Partitions::add`].
    pub(crate) fn remove(&self, metadata: u64, tag: u64) {
        let emptied = {
            let mut p = match self.map.get_mut(&metadata) {
                Some(p) => p,
                None => {
                    debug_assert!(false, "partition missing on remove");
                    return;
                }
            };
            let mut bits = tag;
            while bits != 0 {
                let b = bits.trailing_zeros() as usize;
                debug_assert!(p.counts[b] > 0);
                p.counts[b] -= 1;
                if p.counts[b] == 0 {
                    p.tags &= !(1u64 << b);
                }
                bits &= bits - 1;
            }
            p.tags == 0
        };
        if emptied {
            self.map.remove_if(&metadata, |_, p| p.tags == 0);
        }
    }

    /// The tag set to filter subtables with for a packet carrying
    /// `metadata`, or `None` if the value has no partition.
    pub(crate) fn tags(&self, metadata: u64) -> Option<u64> {
        self.map.get(&metadata).map(|p| p.tags)
    }
}
