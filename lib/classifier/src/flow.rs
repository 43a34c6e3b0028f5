// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flows, masks, matches, and wildcard accumulation.
//!
//! A [`Flow`] is the fixed-layout view of one packet's header fields:
//! eight 64-bit words, with the field catalog in [`crate::field`]
//! naming the bits. A [`Mask`] selects header bits over the same words;
//! a [`Match`] is a (value, mask) pair with the value canonicalized
//! under the mask. [`Wildcards`] accumulates the bits a lookup had to
//! examine.
//!
//! The word-array form is what makes the rest of the classifier cheap:
//! masked comparison, masked hashing over a word range, and subset
//! tests are all straight-line loops over eight words.

use crate::field::FieldId;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::ops::Range;

/// Number of 64-bit words in a flow.
pub const FLOW_WORDS: usize = 8;

/// Flow word holding the pipeline metadata register.
pub(crate) const METADATA_WORD: usize = 0;

/// One packet's header fields, in classifier word layout.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
pub struct Flow([u64; FLOW_WORDS]);

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn words(&self) -> &[u64; FLOW_WORDS] {
        &self.0
    }

    /// Read a field's value, right-aligned.
    pub fn get(&self, field: FieldId) -> u64 {
        let spec = field.spec();
        (self.0[spec.word] & spec.word_mask()) >> spec.shift
    }

    /// Set a field's value. Bits beyond the field width are ignored.
    pub fn set(&mut self, field: FieldId, value: u64) {
        let spec = field.spec();
        let mask = spec.word_mask();
        self.0[spec.word] &= !mask;
        self.0[spec.word] |= (value << spec.shift) & mask;
    }

    #[must_use]
    pub fn with(mut self, field: FieldId, value: u64) -> Self {
        self.set(field, value);
        self
    }

    #[inline]
    pub(crate) fn metadata(&self) -> u64 {
        self.0[METADATA_WORD]
    }

    /// The field's value shifted up so its most significant bit is
    /// bit 63, the form the prefix tries operate on.
    #[inline]
    pub(crate) fn trie_key(&self, field: FieldId) -> u64 {
        let spec = field.spec();
        self.get(field) << (64 - spec.n_bits)
    }
}

/// A set of header bits, over the same word layout as [`Flow`].
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
pub struct Mask([u64; FLOW_WORDS]);

impl Mask {
    /// The empty mask: matches every packet.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn words(&self) -> &[u64; FLOW_WORDS] {
        &self.0
    }

    /// Select every bit of `field`.
    pub fn set_field(&mut self, field: FieldId) {
        let spec = field.spec();
        self.0[spec.word] |= spec.word_mask();
    }

    /// Select the `n_bits` most significant bits of `field`.
    pub fn set_field_prefix(&mut self, field: FieldId, n_bits: u8) {
        let spec = field.spec();
        assert!(n_bits <= spec.n_bits);
        if n_bits == 0 {
            return;
        }
        let ones = if n_bits == 64 {
            u64::MAX
        } else {
            (1u64 << n_bits) - 1
        };
        let prefix = ones << (spec.n_bits - n_bits);
        self.0[spec.word] |= (prefix << spec.shift) & spec.word_mask();
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldId) -> Self {
        self.set_field(field);
        self
    }

    #[must_use]
    pub fn with_field_prefix(mut self, field: FieldId, n_bits: u8) -> Self {
        self.set_field_prefix(field, n_bits);
        self
    }

    /// True if no bits are selected.
    pub fn is_catchall(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// The selected bits of `field`, right-aligned.
    pub fn get(&self, field: FieldId) -> u64 {
        let spec = field.spec();
        (self.0[spec.word] & spec.word_mask()) >> spec.shift
    }

    /// True if every bit selected by `other` is also selected here.
    pub fn covers(&self, other: &Mask) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| b & !a == 0)
    }

    /// True if any selected word lies in `range`.
    pub(crate) fn any_in_range(&self, range: Range<usize>) -> bool {
        self.0[range].iter().any(|w| *w != 0)
    }

    /// Number of leading (most significant) selected bits of `field`.
    ///
    /// A mask with a hole in the field contributes only the contiguous
    /// leading run; the trailing bits are not usable as a trie prefix.
    pub(crate) fn prefix_len(&self, field: FieldId) -> u8 {
        let spec = field.spec();
        let bits = (self.0[spec.word] & spec.word_mask()) >> spec.shift;
        let aligned = bits << (64 - spec.n_bits);
        let run = (!aligned).leading_zeros() as u8;
        run.min(spec.n_bits)
    }

    /// The flow with every unselected bit cleared.
    #[inline]
    pub(crate) fn apply(&self, flow: &Flow) -> Flow {
        let mut out = [0u64; FLOW_WORDS];
        for (i, w) in out.iter_mut().enumerate() {
            *w = flow.0[i] & self.0[i];
        }
        Flow(out)
    }

    /// True if `flow` agrees with `value` on every selected bit.
    /// `value` must already be canonical under this mask.
    #[inline]
    pub(crate) fn matches(&self, value: &Flow, flow: &Flow) -> bool {
        self.0
            .iter()
            .zip(value.0.iter().zip(flow.0.iter()))
            .all(|(m, (v, f))| (f & m) == *v)
    }
}

/// A matching rule's criteria: a value and the mask of bits that must
/// agree with it. The value is canonicalized (masked) on construction.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Match {
    flow: Flow,
    mask: Mask,
}

impl Match {
    pub fn new(flow: Flow, mask: Mask) -> Self {
        Self { flow: mask.apply(&flow), mask }
    }

    /// A match accepting every packet.
    pub fn catchall() -> Self {
        Self::new(Flow::new(), Mask::new())
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Does this match accept `flow`?
    pub fn matches_flow(&self, flow: &Flow) -> bool {
        self.mask.matches(&self.flow, flow)
    }
}

impl Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use crate::field::FIELDS;

        if self.mask.is_catchall() {
            return write!(f, "*");
        }
        let mut first = true;
        for spec in &FIELDS {
            let m = (self.mask.0[spec.word] & spec.word_mask()) >> spec.shift;
            if m == 0 {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            let v = self.flow.get(spec.id);
            let full = if spec.n_bits == 64 {
                u64::MAX
            } else {
                (1u64 << spec.n_bits) - 1
            };
            if m == full {
                write!(f, "{}={:#x}", spec.id, v)?;
            } else {
                write!(f, "{}={:#x}/{:#x}", spec.id, v, m)?;
            }
        }
        Ok(())
    }
}

/// Accumulator for the header bits a lookup examined.
///
/// Lookup only ever adds bits; the caller decides when to reset. A set
/// bit means the corresponding packet bit took part in the decision,
/// so a downstream cache entry built from the result must match on it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Wildcards {
    masks: Mask,
}

impl Wildcards {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bits examined so far.
    pub fn mask(&self) -> &Mask {
        &self.masks
    }

    pub(crate) fn fold(&mut self, mask: &Mask) {
        self.fold_range(mask, 0..FLOW_WORDS);
    }

    pub(crate) fn fold_range(&mut self, mask: &Mask, range: Range<usize>) {
        for w in range {
            self.masks.0[w] |= mask.0[w];
        }
    }

    pub(crate) fn unwildcard_field(&mut self, field: FieldId) {
        self.masks.set_field(field);
    }

    pub(crate) fn unwildcard_prefix(&mut self, field: FieldId, n_bits: u8) {
        self.masks.set_field_prefix(field, n_bits);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_roundtrip() {
        let mut flow = Flow::new();
        flow.set(FieldId::InPort, 3);
        flow.set(FieldId::Ipv4Dst, 0x0a00_0001);
        flow.set(FieldId::TpDst, 443);
        assert_eq!(flow.get(FieldId::InPort), 3);
        assert_eq!(flow.get(FieldId::Ipv4Dst), 0x0a00_0001);
        assert_eq!(flow.get(FieldId::TpDst), 443);
        // Neighbors sharing a word are untouched.
        assert_eq!(flow.get(FieldId::Ipv4Src), 0);
        assert_eq!(flow.get(FieldId::TpSrc), 0);
    }

    #[test]
    fn set_truncates_to_width() {
        let mut flow = Flow::new();
        flow.set(FieldId::IpProto, 0x1_06);
        assert_eq!(flow.get(FieldId::IpProto), 0x06);
    }

    #[test]
    fn match_canonicalizes() {
        let flow = Flow::new()
            .with(FieldId::Ipv4Src, 0xc0a8_0101)
            .with(FieldId::TpSrc, 1234);
        let mask = Mask::new().with_field(FieldId::TpSrc);
        let m = Match::new(flow, mask);
        // Bits outside the mask are dropped from the stored value.
        assert_eq!(m.flow().get(FieldId::Ipv4Src), 0);
        assert_eq!(m.flow().get(FieldId::TpSrc), 1234);
    }

    #[test]
    fn prefix_mask_and_len() {
        let mask = Mask::new().with_field_prefix(FieldId::Ipv4Dst, 24);
        assert_eq!(mask.prefix_len(FieldId::Ipv4Dst), 24);
        assert_eq!(mask.prefix_len(FieldId::Ipv4Src), 0);

        let m = Match::new(
            Flow::new().with(FieldId::Ipv4Dst, 0x0a00_0000),
            mask,
        );
        assert!(m.matches_flow(
            &Flow::new().with(FieldId::Ipv4Dst, 0x0a00_00ff)
        ));
        assert!(!m.matches_flow(
            &Flow::new().with(FieldId::Ipv4Dst, 0x0a00_0100)
        ));
    }

    #[test]
    fn covers_is_subset() {
        let narrow = Mask::new().with_field(FieldId::IpProto);
        let wide = narrow.with_field(FieldId::TpDst);
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(wide.covers(&wide));
        assert!(narrow.covers(&Mask::new()));
    }

    #[test]
    fn wildcards_accumulate() {
        let mut wc = Wildcards::new();
        wc.fold(&Mask::new().with_field(FieldId::EthDst));
        wc.fold(&Mask::new().with_field(FieldId::IpProto));
        let want = Mask::new()
            .with_field(FieldId::EthDst)
            .with_field(FieldId::IpProto);
        assert_eq!(*wc.mask(), want);
    }

    #[test]
    fn display_terse() {
        let m = Match::new(
            Flow::new().with(FieldId::IpProto, 6),
            Mask::new().with_field(FieldId::IpProto),
        );
        assert_eq!(m.to_string(), "ip_proto=0x6");
        assert_eq!(Match::catchall().to_string(), "*");
    }
}
