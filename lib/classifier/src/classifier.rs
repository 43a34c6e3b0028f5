// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The classifier container and its lookup engine.
//!
//! A classifier is a set of subtables, one per distinct rule mask,
//! scanned at lookup time in descending order of each subtable's best
//! priority so the scan can stop as soon as no remaining subtable can
//! beat the best match found. Three further structures cut the scan
//! down: the metadata partition index skips subtables whose tag does
//! not intersect the packet's partition, per-field prefix tries skip
//! subtables whose masks want longer prefixes than any rule supplies
//! for this packet, and staged probing inside each subtable stops at
//! the first segment with no candidates. All of it is in service of
//! the two goals that shape this crate: answer fast, and be able to
//! say exactly which header bits the answer depended on.
//!
//! Many reader threads may call the lookup and query methods
//! concurrently with one writer; modifiers serialize on an internal
//! lock. Readers reach shared state only through snapshot pointers and
//! concurrent maps, so they never wait on the writer lock.

use crate::conjunction::ConjMatches;
use crate::conjunction::MAX_CLAUSES;
use crate::field::FieldId;
use crate::flow::Flow;
use crate::flow::Mask;
use crate::flow::Match;
use crate::flow::Wildcards;
use crate::flow::FLOW_WORDS;
use crate::partition::Partitions;
use crate::partition::TAG_ALL;
use crate::partition::TAG_ARBITRARY;
use crate::rule::CMatch;
use crate::rule::Conjunction;
use crate::rule::Rule;
use crate::rule::Version;
use crate::subtable::Subtable;
use crate::subtable::MAX_INDICES;
use crate::trie::Trie;
use crate::trie::TrieCtx;
use crate::trie::MAX_TRIES;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use tracing::debug;

/// Errors from classifier modifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// An identical rule (mask, value, and priority) is already
    /// visible at the given version.
    Duplicate,
    /// A configured limit was exceeded.
    Limit { what: &'static str, max: usize },
    /// Segment boundaries must be strictly increasing flow-word
    /// indices inside the flow.
    BadSegments,
    /// The field cannot be used where it was given, e.g. a
    /// non-prefix field configured for a trie.
    BadField(FieldId),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Duplicate => write!(f, "duplicate rule"),
            Error::Limit { what, max } => {
                write!(f, "too many {} (max {})", what, max)
            }
            Error::BadSegments => write!(f, "bad segment boundaries"),
            Error::BadField(id) => write!(f, "field {} not usable", id),
        }
    }
}

impl std::error::Error for Error {}

/// The outcome of a successful lookup.
#[derive(Clone, Debug)]
pub enum LookupResult {
    /// An ordinary rule won.
    Rule(Arc<Rule>),
    /// All clauses of a conjunction matched; the caller resolves the
    /// identifier to whatever action it associates with the
    /// conjunction.
    Conjunction { id: u32, priority: i32 },
}

impl LookupResult {
    /// The winning rule, if the winner was an ordinary rule.
    pub fn rule(&self) -> Option<&Arc<Rule>> {
        match self {
            LookupResult::Rule(r) => Some(r),
            LookupResult::Conjunction { .. } => None,
        }
    }
}

/// A subtable with the best priority it held when last published.
struct Ranked {
    max_priority: i32,
    subtable: Arc<Subtable>,
}

struct WriterState {
    /// Every live subtable, in creation order. The published vector
    /// is rebuilt from this on each publishing mutation.
    working: Vec<Arc<Subtable>>,
    publish: bool,
}

/// A prioritized flow classifier.
///
/// Lookups and the query methods ([`Classifier::lookup`],
/// [`Classifier::find_rule_exactly`], iteration, ...) may be called
/// from any number of threads concurrently with each other and with
/// one modifier. Modifiers ([`Classifier::insert`],
/// [`Classifier::remove`], ...) are serialized internally; callers
/// that want deterministic outcomes across several modifications must
/// still provide their own ordering.
pub struct Classifier {
    boundaries: Vec<usize>,
    n_rules: AtomicUsize,
    subtables: DashMap<Mask, Arc<Subtable>>,
    ranked: ArcSwap<Vec<Ranked>>,
    partitions: Partitions,
    tries: ArcSwap<Vec<Trie>>,
    writer: Mutex<WriterState>,
}

impl Classifier {
    /// Create a classifier with the given staged-lookup segment
    /// boundaries (flow-word indices, strictly increasing, at most
    /// [`MAX_INDICES`]). No boundaries means plain single-probe
    /// subtables.
    pub fn new(segments: &[usize]) -> Result<Self, Error> {
        if segments.len() > MAX_INDICES {
            return Err(Error::Limit {
                what: "flow segments",
                max: MAX_INDICES,
            });
        }
        let mut prev = 0;
        for &b in segments {
            if b <= prev || b >= FLOW_WORDS {
                return Err(Error::BadSegments);
            }
            prev = b;
        }
        Ok(Self {
            boundaries: segments.to_vec(),
            n_rules: AtomicUsize::new(0),
            subtables: DashMap::new(),
            ranked: ArcSwap::from_pointee(Vec::new()),
            partitions: Partitions::new(),
            tries: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(WriterState {
                working: Vec::new(),
                publish: true,
            }),
        })
    }

    /// Number of rules, including ones not visible at any version.
    pub fn count(&self) -> usize {
        self.n_rules.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Configure which fields carry prefix tries (at most
    /// [`MAX_TRIES`], all prefix-capable). Existing rules' prefixes
    /// are folded into the new tries before they are swapped in, so
    /// concurrent lookups see either the old configuration or the
    /// complete new one. Returns `Ok(true)` iff the set changed.
    pub fn set_prefix_fields(
        &self,
        fields: &[FieldId],
    ) -> Result<bool, Error> {
        if fields.len() > MAX_TRIES {
            return Err(Error::Limit {
                what: "prefix fields",
                max: MAX_TRIES,
            });
        }
        for (i, f) in fields.iter().enumerate() {
            if !f.spec().prefix || fields[..i].contains(f) {
                return Err(Error::BadField(*f));
            }
        }

        let _w = self.writer.lock();
        let cur = self.tries.load();
        if cur.len() == fields.len()
            && cur.iter().zip(fields).all(|(t, f)| t.field() == *f)
        {
            return Ok(false);
        }

        let tries: Vec<Trie> =
            fields.iter().map(|f| Trie::new(*f)).collect();
        for entry in self.subtables.iter() {
            let subtable = entry.value();
            for trie in &tries {
                let plen = subtable.mask().prefix_len(trie.field());
                if plen == 0 {
                    continue;
                }
                for cm in subtable.snapshot_rules() {
                    trie.insert(cm.flow.trie_key(trie.field()), plen);
                }
            }
        }
        self.tries.store(Arc::new(tries));
        debug!(fields = ?fields, "prefix tries reconfigured");
        Ok(true)
    }

    /// Insert `rule`, visible to lookups at `version` and later.
    ///
    /// Fails with [`Error::Duplicate`] if a rule with the same mask,
    /// value, and priority is already visible at `version`; rules
    /// identical except for non-overlapping visibility windows may
    /// coexist.
    ///
    /// # Panics
    ///
    /// Panics if `rule` is already in a classifier.
    pub fn insert(
        &self,
        rule: &Arc<Rule>,
        version: Version,
        conjs: &[Conjunction],
    ) -> Result<(), Error> {
        validate_conjs(conjs)?;
        let mut w = self.writer.lock();
        assert!(
            rule.cmatch().is_none(),
            "rule is already in a classifier"
        );

        let subtable =
            self.subtable_for_insert(&mut w, rule.criteria().mask());
        let hash = subtable.full_hash(rule.criteria().flow());
        if subtable
            .find_dup(hash, rule.criteria().flow(), rule.priority(), version)
            .is_some()
        {
            return Err(Error::Duplicate);
        }
        self.attach(&mut w, &subtable, hash, rule, version, conjs);
        Ok(())
    }

    /// Insert `rule`, displacing and returning a rule with identical
    /// mask, value, and priority if one is present with no removal
    /// scheduled.
    ///
    /// The displaced rule disappears from all versions at once, so
    /// this is only safe when every concurrent lookup uses the single
    /// current version; callers mixing `replace` with versioning get
    /// no atomicity across versions.
    pub fn replace(
        &self,
        rule: &Arc<Rule>,
        version: Version,
        conjs: &[Conjunction],
    ) -> Result<Option<Arc<Rule>>, Error> {
        validate_conjs(conjs)?;
        let mut w = self.writer.lock();
        assert!(
            rule.cmatch().is_none(),
            "rule is already in a classifier"
        );

        let subtable =
            self.subtable_for_insert(&mut w, rule.criteria().mask());
        let hash = subtable.full_hash(rule.criteria().flow());
        let displaced =
            subtable.find_active(hash, rule.criteria().flow(), rule.priority());
        // Link the new rule before unlinking the old one so the
        // subtable never transiently empties out.
        self.attach(&mut w, &subtable, hash, rule, version, conjs);
        Ok(displaced.map(|old| {
            let displaced_rule = old.rule.clone();
            self.detach(&mut w, &subtable, hash, &old);
            displaced_rule
        }))
    }

    /// Unlink `rule` from the classifier, returning it if it was
    /// present.
    ///
    /// The unlink is immediate: lookups at versions where the rule was
    /// still visible will no longer find it. Callers that must not
    /// disturb in-flight lookups first make the rule invisible in a
    /// future version ([`Rule::make_invisible_in`]), wait until no
    /// lookup uses an earlier version, and only then remove. Memory is
    /// reclaimed once the last reader reference drops.
    pub fn remove(&self, rule: &Arc<Rule>) -> Option<Arc<Rule>> {
        let mut w = self.writer.lock();
        let cm = rule.cmatch()?;
        let subtable = self
            .subtables
            .get(rule.criteria().mask())
            .map(|e| e.value().clone())?;
        let hash = subtable.full_hash(&cm.flow);
        self.detach(&mut w, &subtable, hash, &cm);
        Some(cm.rule.clone())
    }

    /// Stop publishing structural changes to lookups; the priority
    /// order observed by readers is frozen until
    /// [`Classifier::publish`].
    pub fn defer(&self) {
        self.writer.lock().publish = false;
    }

    /// Publish all structural changes made since
    /// [`Classifier::defer`] in one pass.
    pub fn publish(&self) {
        let mut w = self.writer.lock();
        w.publish = true;
        self.republish(&mut w);
    }

    /// Find the highest-priority rule visible at `version` matching
    /// `flow`.
    ///
    /// Bits examined on the way to the answer are OR-ed into `wc`,
    /// including for probes that ruled subtables out; the result is a
    /// superset of the winning rule's mask and never resets between
    /// calls. Returns `None` when nothing matches (with `wc` still
    /// updated), and a synthetic
    /// [`LookupResult::Conjunction`] when a conjunction's clauses all
    /// matched at a priority above every ordinary match.
    pub fn lookup(
        &self,
        version: Version,
        flow: &Flow,
        wc: &mut Wildcards,
    ) -> Option<LookupResult> {
        let tries = self.tries.load_full();
        let mut ctxs = [TrieCtx::default(); MAX_TRIES];
        let ctxs = &mut ctxs[..tries.len()];

        let tags = if self.partitions.is_empty() {
            TAG_ALL
        } else {
            // The partition probe examines the whole metadata word.
            wc.unwildcard_field(FieldId::Metadata);
            self.partitions
                .tags(flow.metadata())
                .unwrap_or(TAG_ARBITRARY)
        };

        let ranked = self.ranked.load_full();
        let mut hard: Option<Arc<CMatch>> = None;
        // Wider than a priority so that "nothing found yet" sorts
        // below even i32::MIN.
        let mut hard_pri = i64::MIN;
        let mut soft: Vec<(i32, Arc<Vec<Conjunction>>)> = Vec::new();

        for entry in ranked.iter() {
            if i64::from(entry.max_priority) <= hard_pri {
                break;
            }
            if entry.subtable.tag() & tags == 0 {
                continue;
            }
            // A chain may stack conjunction-bearing entries on top of
            // an ordinary rule with the same masked value; every one
            // of them competes.
            for cm in entry
                .subtable
                .find_match_wc(flow, version, &tries, ctxs, wc)
            {
                match cm.conj.load_full() {
                    Some(conjs) => soft.push((cm.priority, conjs)),
                    None => {
                        if i64::from(cm.priority) > hard_pri {
                            hard_pri = i64::from(cm.priority);
                            hard = Some(cm);
                        }
                    }
                }
            }
        }

        // A conjunction beats the ordinary winner only from a strictly
        // higher priority; at equal priority the ordinary rule wins.
        if !soft.is_empty() {
            let mut prios: Vec<i32> = soft
                .iter()
                .map(|s| s.0)
                .filter(|p| i64::from(*p) > hard_pri)
                .collect();
            prios.sort_unstable_by(|a, b| b.cmp(a));
            prios.dedup();
            for p in prios {
                let mut matches = ConjMatches::new();
                for (pri, conjs) in soft.iter().filter(|s| s.0 == p) {
                    for c in conjs.iter() {
                        if matches.observe(c.id, *pri, c.clause, c.n_clauses)
                        {
                            return Some(LookupResult::Conjunction {
                                id: c.id,
                                priority: p,
                            });
                        }
                    }
                }
            }
        }

        hard.map(|cm| LookupResult::Rule(cm.rule.clone()))
    }

    /// Find the inserted rule equal to `target` (same mask, value,
    /// and priority) visible at `version`.
    pub fn find_rule_exactly(
        &self,
        target: &Rule,
        version: Version,
    ) -> Option<Arc<Rule>> {
        self.find_match_exactly(target.criteria(), target.priority(), version)
    }

    /// Find the rule with exactly these criteria and priority visible
    /// at `version`.
    pub fn find_match_exactly(
        &self,
        criteria: &Match,
        priority: i32,
        version: Version,
    ) -> Option<Arc<Rule>> {
        let subtable = self
            .subtables
            .get(criteria.mask())
            .map(|e| e.value().clone())?;
        let hash = subtable.full_hash(criteria.flow());
        subtable
            .find_eq(hash, criteria.flow(), priority, version)
            .map(|cm| cm.rule.clone())
    }

    /// Does some rule visible at `version` overlap `target`: equal
    /// priority, and some packet matches both?
    pub fn rule_overlaps(&self, target: &Rule, version: Version) -> bool {
        let t_mask = target.criteria().mask();
        let t_flow = target.criteria().flow();
        for entry in self.subtables.iter() {
            let s_mask = entry.value().mask();
            for cm in entry.value().snapshot_rules() {
                if cm.priority != target.priority()
                    || !cm.visible_in(version)
                {
                    continue;
                }
                let agree = (0..FLOW_WORDS).all(|i| {
                    let common =
                        t_mask.words()[i] & s_mask.words()[i];
                    (t_flow.words()[i] ^ cm.flow.words()[i]) & common == 0
                });
                if agree {
                    return true;
                }
            }
        }
        false
    }

    /// Iterate every rule visible at `version`. Use
    /// [`crate::MAX_VERSION`] to see all rules not yet removed.
    pub fn iter(&self, version: Version) -> Cursor<'static> {
        Cursor::new(self.ranked.load_full(), None, version)
    }

    /// Iterate the rules visible at `version` that are at least as
    /// specific as `target`; subtables looser than `target` are
    /// skipped wholesale.
    pub fn iter_target<'a>(
        &self,
        target: &'a Match,
        version: Version,
    ) -> Cursor<'a> {
        Cursor::new(self.ranked.load_full(), Some(target), version)
    }

    fn subtable_for_insert(
        &self,
        w: &mut WriterState,
        mask: &Mask,
    ) -> Arc<Subtable> {
        if let Some(entry) = self.subtables.get(mask) {
            return entry.value().clone();
        }
        let subtable = Arc::new(Subtable::new(*mask, &self.boundaries));
        self.subtables.insert(*mask, subtable.clone());
        w.working.push(subtable.clone());
        debug!(n_subtables = w.working.len(), "new subtable");
        subtable
    }

    fn attach(
        &self,
        w: &mut WriterState,
        subtable: &Arc<Subtable>,
        hash: u64,
        rule: &Arc<Rule>,
        version: Version,
        conjs: &[Conjunction],
    ) {
        let cm = CMatch::new(rule, version, conjs);
        rule.set_cmatch(&cm);
        subtable.link(hash, &cm);

        if subtable.pins_metadata() {
            self.partitions.add(cm.flow.metadata(), subtable.tag());
        }
        for trie in self.tries.load().iter() {
            let plen = subtable.mask().prefix_len(trie.field());
            if plen > 0 {
                trie.insert(cm.flow.trie_key(trie.field()), plen);
            }
        }
        self.n_rules.fetch_add(1, Relaxed);
        self.republish(w);
    }

    fn detach(
        &self,
        w: &mut WriterState,
        subtable: &Arc<Subtable>,
        hash: u64,
        cm: &Arc<CMatch>,
    ) {
        subtable.unlink(hash, cm);
        cm.rule.clear_cmatch();

        if subtable.pins_metadata() {
            self.partitions.remove(cm.flow.metadata(), subtable.tag());
        }
        for trie in self.tries.load().iter() {
            let plen = subtable.mask().prefix_len(trie.field());
            if plen > 0 {
                trie.remove(cm.flow.trie_key(trie.field()), plen);
            }
        }
        self.n_rules.fetch_sub(1, Relaxed);

        if subtable.is_empty() {
            self.subtables.remove(subtable.mask());
            w.working.retain(|s| !Arc::ptr_eq(s, subtable));
            debug!(n_subtables = w.working.len(), "subtable destroyed");
        }
        self.republish(w);
    }

    fn republish(&self, w: &mut WriterState) {
        if !w.publish {
            return;
        }
        let mut ranked: Vec<Ranked> = w
            .working
            .iter()
            .map(|s| Ranked {
                max_priority: s.max_priority(),
                subtable: s.clone(),
            })
            .collect();
        // Stable: equal priorities keep creation order.
        ranked.sort_by(|a, b| b.max_priority.cmp(&a.max_priority));
        self.ranked.store(Arc::new(ranked));
    }
}

fn validate_conjs(conjs: &[Conjunction]) -> Result<(), Error> {
    for c in conjs {
        if c.n_clauses as usize > MAX_CLAUSES as usize {
            return Err(Error::Limit {
                what: "conjunction clauses",
                max: MAX_CLAUSES as usize,
            });
        }
        assert!(c.clause < c.n_clauses, "conjunction clause out of range");
    }
    Ok(())
}

/// A lockless iteration cursor. The subtable vector and each
/// subtable's rule list are read as point-in-time snapshots, so
/// concurrent modifications may or may not be observed, but a rule
/// present for the whole iteration is never missed.
pub struct Cursor<'a> {
    ranked: Arc<Vec<Ranked>>,
    target: Option<&'a Match>,
    version: Version,
    subtable: usize,
    rules: Vec<Arc<CMatch>>,
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(
        ranked: Arc<Vec<Ranked>>,
        target: Option<&'a Match>,
        version: Version,
    ) -> Self {
        Self { ranked, target, version, subtable: 0, rules: Vec::new(), at: 0 }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Arc<Rule>;

    fn next(&mut self) -> Option<Arc<Rule>> {
        loop {
            while self.at < self.rules.len() {
                let cm = &self.rules[self.at];
                self.at += 1;
                if !cm.visible_in(self.version) {
                    continue;
                }
                if let Some(t) = self.target {
                    if !cm.rule.is_loose_match(t) {
                        continue;
                    }
                }
                return Some(cm.rule.clone());
            }

            let subtable = loop {
                let entry = self.ranked.get(self.subtable)?;
                self.subtable += 1;
                match self.target {
                    // A subtable looser than the target cannot hold
                    // rules with every target bit pinned.
                    Some(t)
                        if !entry.subtable.mask().covers(t.mask()) =>
                    {
                        continue
                    }
                    _ => break &entry.subtable,
                }
            };
            self.rules = subtable.snapshot_rules();
            self.at = 0;
        }
    }
}
