// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Classifier rules and their versioned visibility.
//!
//! A [`Rule`] is created by the caller and handed to
//! [`crate::Classifier::insert`]; the match criteria and priority are
//! immutable from then on. Internally the classifier links the rule
//! through a match node ([`CMatch`]) that carries the version stamps
//! and the conjunction set. The rule only holds a weak reference to
//! its match node: the classifier owns the node (and through it a
//! strong reference back to the rule), so dropping every external
//! handle to an inserted rule keeps it alive and matchable until it is
//! removed.
//!
//! Versions are opaque totally-ordered stamps chosen by the caller. A
//! rule is visible at version `v` iff it was added at or before `v`
//! and not yet removed at `v`. Making a rule invisible in a future
//! version, waiting until no lookup uses an older version, and only
//! then removing it is how a caller deletes rules without disturbing
//! concurrent lookups.

use crate::flow::Flow;
use crate::flow::Match;
use arc_swap::ArcSwapAny;
use arc_swap::ArcSwapOption;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

/// A rule visibility stamp.
pub type Version = u64;

/// Default version to use when the caller does not version its rules.
pub const MIN_VERSION: Version = 0;

/// Largest version usable for lookups.
pub const MAX_VERSION: Version = u64::MAX - 1;

/// Sentinel: the rule has no removal scheduled.
pub(crate) const NOT_REMOVED: Version = u64::MAX;

/// One clause of an N-clause conjunction.
///
/// A rule carrying conjunctions never wins a lookup on its own; it
/// only contributes its clause toward the identified conjunction,
/// which fires when all `n_clauses` distinct clauses match at the
/// rule's priority.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct Conjunction {
    pub id: u32,
    pub clause: u8,
    pub n_clauses: u8,
}

/// The classifier-internal match node for an inserted rule.
///
/// Indexed from its subtable's hash chains and staged indices; owns a
/// strong reference to the rule so that lookups can return it.
pub(crate) struct CMatch {
    pub(crate) priority: i32,
    /// The rule's value, canonical under its subtable's mask.
    pub(crate) flow: Flow,
    pub(crate) add_version: Version,
    pub(crate) remove_version: AtomicU64,
    pub(crate) conj: ArcSwapOption<Vec<Conjunction>>,
    pub(crate) rule: Arc<Rule>,
}

impl CMatch {
    pub(crate) fn new(
        rule: &Arc<Rule>,
        version: Version,
        conjs: &[Conjunction],
    ) -> Arc<Self> {
        let conj = if conjs.is_empty() {
            ArcSwapOption::empty()
        } else {
            ArcSwapOption::from_pointee(conjs.to_vec())
        };
        Arc::new(CMatch {
            priority: rule.priority,
            flow: *rule.criteria.flow(),
            add_version: version,
            remove_version: AtomicU64::new(NOT_REMOVED),
            conj,
            rule: rule.clone(),
        })
    }

    #[inline]
    pub(crate) fn visible_in(&self, version: Version) -> bool {
        self.add_version <= version
            && version < self.remove_version.load(Ordering::Acquire)
    }

    /// True if no removal version has been set.
    #[inline]
    pub(crate) fn not_removed(&self) -> bool {
        self.remove_version.load(Ordering::Acquire) == NOT_REMOVED
    }
}

type CMatchRef = ArcSwapAny<Weak<CMatch>>;

/// A prioritized matching rule.
pub struct Rule {
    priority: i32,
    criteria: Match,
    cmatch: CMatchRef,
}

impl Rule {
    /// Create a rule matching `criteria` at `priority`. Larger
    /// priorities win.
    pub fn new(criteria: Match, priority: i32) -> Self {
        Self { priority, criteria, cmatch: CMatchRef::new(Weak::new()) }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn criteria(&self) -> &Match {
        &self.criteria
    }

    /// Does this rule match every packet?
    pub fn is_catchall(&self) -> bool {
        self.criteria.mask().is_catchall()
    }

    /// True if every packet this rule matches is also matched by
    /// `criteria`, i.e. the rule is at least as specific.
    pub fn is_loose_match(&self, criteria: &Match) -> bool {
        self.criteria.mask().covers(criteria.mask())
            && criteria.matches_flow(self.criteria.flow())
    }

    /// Is the rule in a classifier and visible at `version`?
    pub fn visible_in(&self, version: Version) -> bool {
        match self.cmatch.load().upgrade() {
            Some(cm) => cm.visible_in(version),
            None => false,
        }
    }

    /// Schedule the rule to become invisible to lookups at `version`
    /// and later. Idempotent; the removal version may only move
    /// earlier, never later.
    ///
    /// # Panics
    ///
    /// Panics if the rule is not in a classifier, or if a later
    /// removal version than one already set is requested.
    pub fn make_invisible_in(&self, version: Version) {
        let cm = self
            .cmatch
            .load()
            .upgrade()
            .expect("make_invisible_in: rule is not in a classifier");
        let cur = cm.remove_version.load(Ordering::Acquire);
        assert!(
            version <= cur,
            "make_invisible_in: removal version may only decrease \
             ({} > {})",
            version,
            cur,
        );
        cm.remove_version.store(version, Ordering::Release);
    }

    /// Cancel a scheduled removal. Only legal while no lookup at or
    /// past the scheduled version has begun; the classifier cannot
    /// check that, the caller must.
    pub fn restore_visibility(&self) {
        if let Some(cm) = self.cmatch.load().upgrade() {
            cm.remove_version.store(NOT_REMOVED, Ordering::Release);
        }
    }

    /// Replace the rule's conjunction set. Only meaningful while the
    /// rule is in a classifier; lookups observe the change on their
    /// next probe of the rule.
    pub fn set_conjunctions(&self, conjs: &[Conjunction]) {
        if let Some(cm) = self.cmatch.load().upgrade() {
            if conjs.is_empty() {
                cm.conj.store(None);
            } else {
                cm.conj.store(Some(Arc::new(conjs.to_vec())));
            }
        }
    }

    pub(crate) fn cmatch(&self) -> Option<Arc<CMatch>> {
        self.cmatch.load().upgrade()
    }

    pub(crate) fn set_cmatch(&self, cm: &Arc<CMatch>) {
        self.cmatch.store(Arc::downgrade(cm));
    }

    pub(crate) fn clear_cmatch(&self) {
        self.cmatch.store(Weak::new());
    }
}

impl Clone for Rule {
    /// Clone the criteria and priority into a fresh, uninserted rule.
    fn clone(&self) -> Self {
        Self::new(self.criteria, self.priority)
    }
}

impl PartialEq for Rule {
    /// Rules are equal when their criteria and priority are; being in
    /// a classifier (or which one) does not participate.
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.criteria == other.criteria
    }
}

impl Eq for Rule {}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rule")
            .field("priority", &self.priority)
            .field("criteria", &self.criteria)
            .finish()
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "priority={} {}", self.priority, self.criteria)
    }
}
