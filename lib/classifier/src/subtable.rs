// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Subtables: all rules sharing one mask.
//!
//! A subtable is a hash table keyed by the masked flow value, probed
//! in stages. The stage plan splits the mask at the classifier's
//! segment boundaries; each stage owns an index keyed by the hash of
//! every masked word up to that stage's boundary, so a probe that
//! misses early proves "no rule here" while having examined only the
//! leading segments. The final probe is against the full-mask chain
//! map, whose buckets hold priority-descending chains of match nodes.
//!
//! Readers probe the maps and walk chains concurrently with the single
//! writer; the writer's linking and unlinking go through the shard
//! locks of the underlying concurrent maps. The max-priority cache and
//! the insertion-ordered rules list are writer bookkeeping plus a
//! snapshot source for iteration.

use crate::flow::Flow;
use crate::flow::Mask;
use crate::flow::Wildcards;
use crate::flow::FLOW_WORDS;
use crate::flow::METADATA_WORD;
use crate::hash;
use crate::partition::tag_create_deterministic;
use crate::partition::TAG_ALL;
use crate::rule::CMatch;
use crate::rule::Version;
use crate::trie::Trie;
use crate::trie::TrieCtx;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Maximum number of staged indices per subtable, which is also the
/// maximum number of segment boundaries per classifier.
pub const MAX_INDICES: usize = 3;

struct Stage {
    /// One past the last flow word this stage's hash covers; stages
    /// always hash from word 0.
    end: usize,
    /// Hash of the masked words `[0..end)` -> number of rules.
    index: DashMap<u64, u32>,
}

pub(crate) struct Subtable {
    mask: Mask,
    tag: u64,
    stages: Vec<Stage>,
    /// Full-mask hash -> priority-descending chain.
    rules: DashMap<u64, Vec<Arc<CMatch>>>,
    /// Insertion-ordered, for iteration snapshots.
    rules_list: RwLock<Vec<Arc<CMatch>>>,
    max_priority: AtomicI32,
    max_count: AtomicUsize,
}

impl Subtable {
    pub(crate) fn new(mask: Mask, boundaries: &[usize]) -> Self {
        let mut stages = Vec::new();
        let mut prev = 0;
        for &b in boundaries {
            if mask.any_in_range(prev..b) {
                stages.push(Stage { end: b, index: DashMap::new() });
            }
            prev = b;
        }
        // An index covering every masked word would only duplicate the
        // final probe.
        if !mask.any_in_range(prev..FLOW_WORDS) {
            stages.pop();
        }

        let tag = if mask.words()[METADATA_WORD] == u64::MAX {
            tag_create_deterministic(hash::mask_hash(&mask))
        } else {
            TAG_ALL
        };

        Self {
            mask,
            tag,
            stages,
            rules: DashMap::new(),
            rules_list: RwLock::new(Vec::new()),
            max_priority: AtomicI32::new(i32::MIN),
            max_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mask(&self) -> &Mask {
        &self.mask
    }

    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    /// Does this subtable's mask pin the metadata word to one value?
    pub(crate) fn pins_metadata(&self) -> bool {
        self.tag != TAG_ALL
    }

    pub(crate) fn max_priority(&self) -> i32 {
        self.max_priority.load(Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules_list.read().is_empty()
    }

    pub(crate) fn full_hash(&self, flow: &Flow) -> u64 {
        hash::flow_hash_in_mask(flow, &self.mask)
    }

    fn stage_keys(&self, flow: &Flow) -> Vec<u64> {
        let mut keys = Vec::with_capacity(self.stages.len());
        let mut prev = 0;
        let mut basis = 0;
        for stage in &self.stages {
            basis = hash::flow_hash_in_mask_range(
                flow,
                &self.mask,
                prev..stage.end,
                basis,
            );
            keys.push(hash::hash_finish(basis, stage.end));
            prev = stage.end;
        }
        keys
    }

    /// The staged probe for one packet, accumulating examined bits.
    ///
    /// Returns the chain entries visible at `version` that match the
    /// packet, in descending priority, stopping at the first one with
    /// no conjunctions: entries below an ordinary match can never win,
    /// but conjunction-bearing entries above it must still reach the
    /// conjunction tracker, and an ordinary rule below them must not
    /// be hidden by them. An empty result means no match, with `wc`
    /// covering exactly the mask bits the probe had to look at to
    /// prove that.
    pub(crate) fn find_match_wc(
        &self,
        flow: &Flow,
        version: Version,
        tries: &[Trie],
        ctxs: &mut [TrieCtx],
        wc: &mut Wildcards,
    ) -> Vec<Arc<CMatch>> {
        let target = self.mask.apply(flow);
        let mut prev = 0;
        let mut basis = 0;

        for stage in &self.stages {
            if self.check_tries(prev..stage.end, flow, tries, ctxs, wc) {
                wc.fold_range(&self.mask, 0..prev);
                return Vec::new();
            }
            basis = hash::flow_hash_in_mask_range(
                flow,
                &self.mask,
                prev..stage.end,
                basis,
            );
            if !stage.index.contains_key(&hash::hash_finish(basis, stage.end))
            {
                // Everything up to and including this stage was
                // examined; later segments were not.
                wc.fold_range(&self.mask, 0..stage.end);
                return Vec::new();
            }
            prev = stage.end;
        }

        if self.check_tries(prev..FLOW_WORDS, flow, tries, ctxs, wc) {
            wc.fold_range(&self.mask, 0..prev);
            return Vec::new();
        }
        basis = hash::flow_hash_in_mask_range(
            flow,
            &self.mask,
            prev..FLOW_WORDS,
            basis,
        );
        let key = hash::hash_finish(basis, FLOW_WORDS);
        let mut found = Vec::new();
        if let Some(chain) = self.rules.get(&key) {
            for cm in chain.iter() {
                if cm.flow != target || !cm.visible_in(version) {
                    continue;
                }
                let ordinary = cm.conj.load().is_none();
                found.push(cm.clone());
                if ordinary {
                    break;
                }
            }
        }
        // The full mask took part in the decision, match or not.
        wc.fold(&self.mask);
        found
    }

    /// Consult the tries whose field lies in the word range about to
    /// be probed. Returns true when one of them proves that no rule in
    /// this subtable can match `flow`, in which case the bits that
    /// justify the skip have been added to `wc`.
    fn check_tries(
        &self,
        range: Range<usize>,
        flow: &Flow,
        tries: &[Trie],
        ctxs: &mut [TrieCtx],
        wc: &mut Wildcards,
    ) -> bool {
        for (trie, ctx) in tries.iter().zip(ctxs.iter_mut()) {
            let field = trie.field();
            let spec = field.spec();
            if !range.contains(&spec.word) {
                continue;
            }
            let plen = self.mask.prefix_len(field);
            if plen == 0 {
                continue;
            }
            if !ctx.done {
                let (match_plen, plens) =
                    trie.lookup(flow.trie_key(field), spec.n_bits);
                ctx.match_plen = match_plen;
                ctx.plens = plens;
                ctx.done = true;
            }
            if (ctx.plens >> (plen - 1)) & 1 == 0 {
                // No rule anywhere requires exactly `plen` bits of a
                // prefix agreeing with this packet, and every rule in
                // this subtable does. One bit past the longest
                // agreement is enough evidence.
                let maskbits = (ctx.match_plen + 1).min(plen);
                wc.unwildcard_prefix(field, maskbits);
                return true;
            }
        }
        false
    }

    /// Find a rule identical in value and priority that is visible at
    /// `version`.
    pub(crate) fn find_dup(
        &self,
        hash: u64,
        flow: &Flow,
        priority: i32,
        version: Version,
    ) -> Option<Arc<CMatch>> {
        self.rules.get(&hash).and_then(|chain| {
            chain
                .iter()
                .find(|cm| {
                    cm.priority == priority
                        && cm.flow == *flow
                        && cm.visible_in(version)
                })
                .cloned()
        })
    }

    /// Find a rule identical in value and priority with no removal
    /// scheduled yet.
    pub(crate) fn find_active(
        &self,
        hash: u64,
        flow: &Flow,
        priority: i32,
    ) -> Option<Arc<CMatch>> {
        self.rules.get(&hash).and_then(|chain| {
            chain
                .iter()
                .find(|cm| {
                    cm.priority == priority
                        && cm.flow == *flow
                        && cm.not_removed()
                })
                .cloned()
        })
    }

    /// Find the rule with exactly this value and priority, visible at
    /// `version`.
    pub(crate) fn find_eq(
        &self,
        hash: u64,
        flow: &Flow,
        priority: i32,
        version: Version,
    ) -> Option<Arc<CMatch>> {
        self.find_dup(hash, flow, priority, version)
    }

    /// Link a match node in: chain, staged indices, rules list, and
    /// the max-priority cache. Writer only.
    pub(crate) fn link(&self, hash: u64, cm: &Arc<CMatch>) {
        {
            let mut chain = self.rules.entry(hash).or_default();
            // Descending by priority; later arrivals go after their
            // priority peers.
            let at = chain.partition_point(|c| c.priority >= cm.priority);
            chain.insert(at, cm.clone());
        }
        for (stage, key) in
            self.stages.iter().zip(self.stage_keys(&cm.flow))
        {
            *stage.index.entry(key).or_insert(0) += 1;
        }

        let mut list = self.rules_list.write();
        list.push(cm.clone());

        let max = self.max_priority.load(Relaxed);
        if list.len() == 1 || cm.priority > max {
            self.max_priority.store(cm.priority, Relaxed);
            self.max_count.store(1, Relaxed);
        } else if cm.priority == max {
            self.max_count.fetch_add(1, Relaxed);
        }
    }

    /// Undo [`Subtable::link`]. Writer only.
    pub(crate) fn unlink(&self, hash: u64, cm: &Arc<CMatch>) {
        let emptied = {
            let mut chain = match self.rules.get_mut(&hash) {
                Some(c) => c,
                None => {
                    debug_assert!(false, "chain missing on unlink");
                    return;
                }
            };
            match chain.iter().position(|c| Arc::ptr_eq(c, cm)) {
                Some(i) => {
                    chain.remove(i);
                }
                None => debug_assert!(false, "match missing on unlink"),
            }
            chain.is_empty()
        };
        if emptied {
            self.rules.remove_if(&hash, |_, chain| chain.is_empty());
        }

        for (stage, key) in
            self.stages.iter().zip(self.stage_keys(&cm.flow))
        {
            let gone = {
                match stage.index.get_mut(&key) {
                    Some(mut n) => {
                        debug_assert!(*n > 0);
                        *n -= 1;
                        *n == 0
                    }
                    None => {
                        debug_assert!(false, "stage entry missing");
                        false
                    }
                }
            };
            if gone {
                stage.index.remove_if(&key, |_, n| *n == 0);
            }
        }

        let mut list = self.rules_list.write();
        if let Some(i) = list.iter().position(|c| Arc::ptr_eq(c, cm)) {
            list.remove(i);
        }

        if cm.priority == self.max_priority.load(Relaxed) {
            let left = self.max_count.load(Relaxed).saturating_sub(1);
            if left > 0 {
                self.max_count.store(left, Relaxed);
            } else {
                let mut max = i32::MIN;
                let mut count = 0;
                for c in list.iter() {
                    if c.priority > max {
                        max = c.priority;
                        count = 1;
                    } else if c.priority == max {
                        count += 1;
                    }
                }
                self.max_priority.store(max, Relaxed);
                self.max_count.store(count, Relaxed);
            }
        }
    }

    /// A point-in-time copy of the insertion-ordered rules, for
    /// iteration without holding any lock while the caller walks it.
    pub(crate) fn snapshot_rules(&self) -> Vec<Arc<CMatch>> {
        self.rules_list.read().clone()
    }
}
