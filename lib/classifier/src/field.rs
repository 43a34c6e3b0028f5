// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The header field catalog.
//!
//! Every field the classifier can match on is described here: which
//! flow word it lives in, where inside the word, how wide it is, and
//! whether a prefix trie may be configured on it. The set is closed;
//! the rest of the crate dispatches on [`FieldId`] through the static
//! [`FIELDS`] table rather than through any dynamic registry.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

/// A header field known to the classifier.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FieldId {
    /// The 64-bit pipeline metadata register.
    Metadata,
    /// Ingress port.
    InPort,
    /// Ethernet destination address.
    EthDst,
    /// Ethernet source address.
    EthSrc,
    /// Ethertype.
    EthType,
    /// 802.1Q TCI.
    VlanTci,
    /// IPv4 source address.
    Ipv4Src,
    /// IPv4 destination address.
    Ipv4Dst,
    /// IP protocol number.
    IpProto,
    /// IP TOS byte.
    IpTos,
    /// Transport source port.
    TpSrc,
    /// Transport destination port.
    TpDst,
}

/// Location and shape of one field within the flow words.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub id: FieldId,
    /// Index of the flow word holding the field.
    pub word: usize,
    /// Bit offset of the field within its word (from bit 0).
    pub shift: u8,
    /// Field width in bits.
    pub n_bits: u8,
    /// Whether a prefix trie may be configured on this field.
    pub prefix: bool,
}

/// The field catalog, indexed by `FieldId as usize`.
pub const FIELDS: [FieldSpec; 12] = [
    FieldSpec {
        id: FieldId::Metadata,
        word: 0,
        shift: 0,
        n_bits: 64,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::InPort,
        word: 1,
        shift: 0,
        n_bits: 32,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::EthDst,
        word: 2,
        shift: 0,
        n_bits: 48,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::EthSrc,
        word: 3,
        shift: 0,
        n_bits: 48,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::EthType,
        word: 4,
        shift: 0,
        n_bits: 16,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::VlanTci,
        word: 4,
        shift: 16,
        n_bits: 16,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::Ipv4Src,
        word: 5,
        shift: 0,
        n_bits: 32,
        prefix: true,
    },
    FieldSpec {
        id: FieldId::Ipv4Dst,
        word: 5,
        shift: 32,
        n_bits: 32,
        prefix: true,
    },
    FieldSpec {
        id: FieldId::IpProto,
        word: 6,
        shift: 0,
        n_bits: 8,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::IpTos,
        word: 6,
        shift: 8,
        n_bits: 8,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::TpSrc,
        word: 7,
        shift: 0,
        n_bits: 16,
        prefix: false,
    },
    FieldSpec {
        id: FieldId::TpDst,
        word: 7,
        shift: 16,
        n_bits: 16,
        prefix: false,
    },
];

impl FieldId {
    /// The location/shape entry for this field.
    pub fn spec(self) -> &'static FieldSpec {
        &FIELDS[self as usize]
    }
}

impl FieldSpec {
    /// The field's bits within its word.
    #[inline]
    pub(crate) fn word_mask(&self) -> u64 {
        let all = if self.n_bits == 64 {
            u64::MAX
        } else {
            (1u64 << self.n_bits) - 1
        };
        all << self.shift
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FieldId::Metadata => "metadata",
            FieldId::InPort => "in_port",
            FieldId::EthDst => "eth_dst",
            FieldId::EthSrc => "eth_src",
            FieldId::EthType => "eth_type",
            FieldId::VlanTci => "vlan_tci",
            FieldId::Ipv4Src => "ipv4_src",
            FieldId::Ipv4Dst => "ipv4_dst",
            FieldId::IpProto => "ip_proto",
            FieldId::IpTos => "ip_tos",
            FieldId::TpSrc => "tp_src",
            FieldId::TpDst => "tp_dst",
        };
        write!(f, "{}", name)
    }
}
