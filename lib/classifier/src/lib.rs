// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A prioritized flow classifier.
//!
//! A [`Classifier`] holds any number of [`Rule`]s, each matching some
//! header fields of a [`Flow`] at a priority, and answers one
//! question: given a packet's headers, which is the highest-priority
//! matching rule? Flow pipelines build their match-action tables out
//! of classifiers, one per table.
//!
//! # Un-wildcarding
//!
//! The second, subtler job of a lookup is to report which header bits
//! the answer depended on. A datapath that caches flow decisions wants
//! to install the coarsest cache entry that is still correct: every
//! bit the classifier never looked at can be wildcarded in the cache,
//! letting one entry cover many flows. Lookup therefore accumulates
//! into a caller-provided [`Wildcards`] a one-bit for every header bit
//! it examined. False ones cost cache hit rate, never correctness;
//! false zeros are forbidden. The structures below are shaped mostly
//! by the desire to examine (and so un-wildcard) as few bits as
//! possible:
//!
//! - Rules sharing a mask live in one subtable, a hash table over the
//!   masked bits; subtables are scanned in descending order of their
//!   best priority so the scan stops early.
//! - Each subtable probes in stages (metadata, L2, L3, L4 by
//!   default): a probe that misses at an early stage has examined
//!   only the leading segments.
//! - Per-field prefix tries record which prefix lengths actually have
//!   rules, letting lookup dismiss whole subtables after examining
//!   just enough of an address to prove no rule can want it.
//! - A metadata partition index maps each pinned metadata value to
//!   the (tagged) subtables that can match it.
//!
//! # Versioning
//!
//! Rules become visible at the [`Version`] given at insertion and stop
//! being visible at the version set by [`Rule::make_invisible_in`]; a
//! lookup at version `v` sees exactly the rules whose window contains
//! `v`. Together with [`Classifier::defer`] / [`Classifier::publish`]
//! this lets a writer stage an arbitrary batch of changes, publish the
//! supporting structures, and only then announce the new version to
//! lookups, so no lookup ever observes a half-applied batch.
//!
//! # Concurrency
//!
//! Any number of threads may call lookups and queries concurrently
//! with one writer; writers are additionally serialized internally.
//! Readers reach shared state through atomically swapped snapshots,
//! concurrent maps, and immutable nodes, and hold references (not
//! locks) across their walk, so a removed rule stays safely readable
//! until the last reader drops it.
//!
//! ```
//! use classifier::Classifier;
//! use classifier::FieldId;
//! use classifier::Flow;
//! use classifier::Mask;
//! use classifier::Match;
//! use classifier::Rule;
//! use classifier::Wildcards;
//! use std::sync::Arc;
//!
//! let cls = Classifier::new(&[2, 5, 7]).unwrap();
//! let rule = Arc::new(Rule::new(
//!     Match::new(
//!         Flow::new().with(FieldId::IpProto, 6),
//!         Mask::new().with_field(FieldId::IpProto),
//!     ),
//!     100,
//! ));
//! cls.insert(&rule, 0, &[]).unwrap();
//!
//! let pkt = Flow::new()
//!     .with(FieldId::IpProto, 6)
//!     .with(FieldId::TpDst, 443);
//! let mut wc = Wildcards::new();
//! let hit = cls.lookup(0, &pkt, &mut wc).unwrap();
//! assert!(Arc::ptr_eq(hit.rule().unwrap(), &rule));
//! // Only the protocol was examined; tp_dst stays wildcarded.
//! assert_eq!(*wc.mask(), Mask::new().with_field(FieldId::IpProto));
//! ```

mod classifier;
mod conjunction;
mod field;
mod flow;
mod hash;
mod partition;
mod rule;
mod subtable;
mod trie;

pub use classifier::Classifier;
pub use classifier::Cursor;
pub use classifier::Error;
pub use classifier::LookupResult;
pub use field::FieldId;
pub use field::FieldSpec;
pub use field::FIELDS;
pub use flow::Flow;
pub use flow::Mask;
pub use flow::Match;
pub use flow::Wildcards;
pub use flow::FLOW_WORDS;
pub use rule::Conjunction;
pub use rule::Rule;
pub use rule::Version;
pub use rule::MAX_VERSION;
pub use rule::MIN_VERSION;
pub use subtable::MAX_INDICES;
pub use trie::MAX_TRIES;
