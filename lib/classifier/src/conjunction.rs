// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-lookup conjunction bookkeeping.
//!
//! While a lookup walks the subtables, every matching rule that
//! carries conjunctions contributes its clauses here instead of
//! competing as an ordinary match. A conjunction fires once all of its
//! clauses have been observed at one (id, priority) pair. The sets are
//! tiny and live on the lookup's stack, so a linear scan beats a real
//! map.

/// Largest supported clause count; clause sets are tracked in a `u32`
/// bitset.
pub(crate) const MAX_CLAUSES: u8 = 32;

#[derive(Clone, Copy, Debug)]
struct ConjEntry {
    id: u32,
    priority: i32,
    clauses: u32,
}

/// The conjunctions in progress during one lookup.
#[derive(Debug, Default)]
pub(crate) struct ConjMatches {
    entries: Vec<ConjEntry>,
}

impl ConjMatches {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that clause `clause` of conjunction `id` matched at
    /// `priority`. Returns true when this completes the conjunction.
    pub(crate) fn observe(
        &mut self,
        id: u32,
        priority: i32,
        clause: u8,
        n_clauses: u8,
    ) -> bool {
        debug_assert!(clause < n_clauses);
        debug_assert!(n_clauses <= MAX_CLAUSES);
        let all = if n_clauses == MAX_CLAUSES {
            u32::MAX
        } else {
            (1u32 << n_clauses) - 1
        };
        let bit = 1u32 << clause;
        for e in self.entries.iter_mut() {
            if e.id == id && e.priority == priority {
                e.clauses |= bit;
                return e.clauses == all;
            }
        }
        self.entries.push(ConjEntry { id, priority, clauses: bit });
        bit == all
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_only_when_complete() {
        let mut cm = ConjMatches::new();
        assert!(!cm.observe(7, 50, 0, 2));
        // Same clause again does not complete anything.
        assert!(!cm.observe(7, 50, 0, 2));
        assert!(cm.observe(7, 50, 1, 2));
    }

    #[test]
    fn single_clause_fires_immediately() {
        let mut cm = ConjMatches::new();
        assert!(cm.observe(3, 10, 0, 1));
    }

    #[test]
    fn id_and_priority_are_distinct_keys() {
        let mut cm = ConjMatches::new();
        assert!(!cm.observe(7, 50, 0, 2));
        // Same id at a different priority is a different conjunction.
        assert!(!cm.observe(7, 40, 1, 2));
        // A different id at the same priority too.
        assert!(!cm.observe(8, 50, 1, 2));
        assert!(cm.observe(7, 50, 1, 2));
    }
}
