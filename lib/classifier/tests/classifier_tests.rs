// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use classifier::Classifier;
use classifier::Conjunction;
use classifier::FieldId;
use classifier::Flow;
use classifier::LookupResult;
use classifier::Mask;
use classifier::Match;
use classifier::Rule;
use classifier::Wildcards;
use classifier::MAX_VERSION;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::sync::Arc;

const SEGMENTS: [usize; 3] = [2, 5, 7];

fn rule(m: Match, priority: i32) -> Arc<Rule> {
    Arc::new(Rule::new(m, priority))
}

fn lookup_rule(
    cls: &Classifier,
    version: u64,
    flow: &Flow,
) -> Option<Arc<Rule>> {
    let mut wc = Wildcards::new();
    match cls.lookup(version, flow, &mut wc)? {
        LookupResult::Rule(r) => Some(r),
        LookupResult::Conjunction { .. } => None,
    }
}

#[test]
fn priority_ordering() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    let mac = 0x0a0b_0c0d_0e0f_u64;
    let m = Match::new(
        Flow::new().with(FieldId::EthDst, mac),
        Mask::new().with_field(FieldId::EthDst),
    );
    let a = rule(m, 10);
    let b = rule(m, 20);
    cls.insert(&a, 0, &[]).unwrap();
    cls.insert(&b, 0, &[]).unwrap();

    let pkt = Flow::new().with(FieldId::EthDst, mac);
    let mut wc = Wildcards::new();
    let hit = cls.lookup(0, &pkt, &mut wc).unwrap();
    assert!(Arc::ptr_eq(hit.rule().unwrap(), &b));

    // Only eth_dst was consulted.
    assert_eq!(*wc.mask(), Mask::new().with_field(FieldId::EthDst));
}

#[test]
fn staged_lookup_limits_unwildcarding() {
    // Two boundaries: metadata+port | L2 | rest.
    let cls = Classifier::new(&[2, 5]).unwrap();
    let r = rule(
        Match::new(
            Flow::new().with(FieldId::InPort, 3),
            Mask::new().with_field(FieldId::InPort),
        ),
        7,
    );
    cls.insert(&r, 0, &[]).unwrap();

    let pkt = Flow::new()
        .with(FieldId::InPort, 3)
        .with(FieldId::Ipv4Dst, 0x0102_0304);
    let mut wc = Wildcards::new();
    let hit = cls.lookup(0, &pkt, &mut wc).unwrap();
    assert!(Arc::ptr_eq(hit.rule().unwrap(), &r));

    // in_port is un-wildcarded, dst_ip is not.
    assert_eq!(wc.mask().get(FieldId::InPort), u32::MAX as u64);
    assert_eq!(wc.mask().get(FieldId::Ipv4Dst), 0);
}

#[test]
fn trie_skip_examines_few_address_bits() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    cls.set_prefix_fields(&[FieldId::Ipv4Dst]).unwrap();

    // 10.0.0.0/24
    let r = rule(
        Match::new(
            Flow::new().with(FieldId::Ipv4Dst, 0x0a00_0000),
            Mask::new().with_field_prefix(FieldId::Ipv4Dst, 24),
        ),
        7,
    );
    cls.insert(&r, 0, &[]).unwrap();

    // 192.0.2.1 diverges from 10/8 in the first byte.
    let pkt = Flow::new().with(FieldId::Ipv4Dst, 0xc000_0201);
    let mut wc = Wildcards::new();
    assert!(cls.lookup(0, &pkt, &mut wc).is_none());

    // Some leading dst bits were examined, but no more than the first
    // byte, and nothing else at all.
    let dst_bits = wc.mask().get(FieldId::Ipv4Dst);
    assert_ne!(dst_bits, 0);
    let first_byte_only =
        Mask::new().with_field_prefix(FieldId::Ipv4Dst, 8);
    assert!(first_byte_only.covers(wc.mask()));

    // A destination inside the prefix still matches normally.
    let pkt = Flow::new().with(FieldId::Ipv4Dst, 0x0a00_0042);
    assert!(lookup_rule(&cls, 0, &pkt).is_some());
}

#[test]
fn partition_skips_unrelated_metadata() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    let meta = |v: u64| {
        Match::new(
            Flow::new().with(FieldId::Metadata, v),
            Mask::new().with_field(FieldId::Metadata),
        )
    };
    cls.insert(&rule(meta(1), 10), 0, &[]).unwrap();
    cls.insert(&rule(meta(2), 10), 0, &[]).unwrap();

    let pkt = Flow::new().with(FieldId::Metadata, 3);
    let mut wc = Wildcards::new();
    assert!(cls.lookup(0, &pkt, &mut wc).is_none());
    // The partition probe consulted the metadata register and nothing
    // else: the metadata subtable itself was never probed.
    assert_eq!(
        *wc.mask(),
        Mask::new().with_field(FieldId::Metadata)
    );

    assert!(lookup_rule(
        &cls,
        0,
        &Flow::new().with(FieldId::Metadata, 2)
    )
    .is_some());
}

#[test]
fn versioned_visibility() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    let r = rule(
        Match::new(
            Flow::new().with(FieldId::TpDst, 53),
            Mask::new().with_field(FieldId::TpDst),
        ),
        1,
    );
    cls.insert(&r, 5, &[]).unwrap();

    let pkt = Flow::new().with(FieldId::TpDst, 53);
    assert!(lookup_rule(&cls, 4, &pkt).is_none());
    assert!(lookup_rule(&cls, 5, &pkt).is_some());
    assert!(lookup_rule(&cls, 6, &pkt).is_some());

    r.make_invisible_in(9);
    assert!(lookup_rule(&cls, 8, &pkt).is_some());
    assert!(lookup_rule(&cls, 9, &pkt).is_none());

    r.restore_visibility();
    assert!(lookup_rule(&cls, 9, &pkt).is_some());
}

#[test]
fn conjunction_fires_only_when_complete() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    let src_a = 0x0a00_0001_u64;
    let dst_b = 0x0a00_0002_u64;
    let conj = |clause| Conjunction { id: 7, clause, n_clauses: 2 };

    let c0 = rule(
        Match::new(
            Flow::new().with(FieldId::Ipv4Src, src_a),
            Mask::new().with_field(FieldId::Ipv4Src),
        ),
        50,
    );
    let c1 = rule(
        Match::new(
            Flow::new().with(FieldId::Ipv4Dst, dst_b),
            Mask::new().with_field(FieldId::Ipv4Dst),
        ),
        50,
    );
    let x = rule(
        Match::new(
            Flow::new().with(FieldId::IpProto, 6),
            Mask::new().with_field(FieldId::IpProto),
        ),
        40,
    );
    cls.insert(&c0, 0, &[conj(0)]).unwrap();
    cls.insert(&c1, 0, &[conj(1)]).unwrap();
    cls.insert(&x, 0, &[]).unwrap();

    // Both clauses match: the conjunction wins at priority 50.
    let both = Flow::new()
        .with(FieldId::Ipv4Src, src_a)
        .with(FieldId::Ipv4Dst, dst_b)
        .with(FieldId::IpProto, 6);
    let mut wc = Wildcards::new();
    match cls.lookup(0, &both, &mut wc).unwrap() {
        LookupResult::Conjunction { id, priority } => {
            assert_eq!(id, 7);
            assert_eq!(priority, 50);
        }
        LookupResult::Rule(r) => panic!("expected conjunction, got {}", r),
    }

    // Only one clause matches: the ordinary rule wins; the clause
    // rule never stands alone.
    let one = Flow::new()
        .with(FieldId::Ipv4Src, src_a)
        .with(FieldId::IpProto, 6);
    let mut wc = Wildcards::new();
    match cls.lookup(0, &one, &mut wc).unwrap() {
        LookupResult::Rule(r) => assert!(Arc::ptr_eq(&r, &x)),
        other => panic!("expected plain rule, got {:?}", other),
    }
}

#[test]
fn conjunction_clause_does_not_shadow_chain() {
    // A clause rule and an ordinary rule with identical mask and
    // value share one subtable chain; the clause entry sits above the
    // ordinary one and must not hide it.
    let cls = Classifier::new(&SEGMENTS).unwrap();
    let dst_b = 0x0a00_0002_u64;
    let tcp = Match::new(
        Flow::new().with(FieldId::IpProto, 6),
        Mask::new().with_field(FieldId::IpProto),
    );

    let c0 = rule(tcp, 50);
    let c1 = rule(
        Match::new(
            Flow::new().with(FieldId::Ipv4Dst, dst_b),
            Mask::new().with_field(FieldId::Ipv4Dst),
        ),
        50,
    );
    let y = rule(tcp, 40);
    cls.insert(&c0, 0, &[Conjunction { id: 9, clause: 0, n_clauses: 2 }])
        .unwrap();
    cls.insert(&c1, 0, &[Conjunction { id: 9, clause: 1, n_clauses: 2 }])
        .unwrap();
    cls.insert(&y, 0, &[]).unwrap();

    // The second clause is absent: the incomplete conjunction must
    // not swallow the ordinary match buried below its clause.
    let tcp_only = Flow::new().with(FieldId::IpProto, 6);
    let mut wc = Wildcards::new();
    match cls.lookup(0, &tcp_only, &mut wc).unwrap() {
        LookupResult::Rule(r) => assert!(Arc::ptr_eq(&r, &y)),
        other => panic!("expected the ordinary rule, got {:?}", other),
    }

    // Both clauses present: the conjunction outranks it again.
    let both = Flow::new()
        .with(FieldId::IpProto, 6)
        .with(FieldId::Ipv4Dst, dst_b);
    let mut wc = Wildcards::new();
    match cls.lookup(0, &both, &mut wc).unwrap() {
        LookupResult::Conjunction { id, priority } => {
            assert_eq!(id, 9);
            assert_eq!(priority, 50);
        }
        LookupResult::Rule(r) => panic!("expected conjunction, got {}", r),
    }
}

#[test]
fn deferred_batch_publishes_atomically() {
    let cls = Classifier::new(&SEGMENTS).unwrap();
    cls.defer();
    let mut rules = Vec::new();
    for port in 0..64u64 {
        let r = rule(
            Match::new(
                Flow::new().with(FieldId::TpDst, port),
                Mask::new().with_field(FieldId::TpDst),
            ),
            port as i32,
        );
        cls.insert(&r, 1, &[]).unwrap();
        rules.push(r);
    }
    // Nothing published yet.
    let pkt = Flow::new().with(FieldId::TpDst, 17);
    assert!(lookup_rule(&cls, MAX_VERSION, &pkt).is_none());

    cls.publish();
    let hit = lookup_rule(&cls, 1, &pkt).unwrap();
    assert!(Arc::ptr_eq(&hit, &rules[17]));

    // Tear the batch down the same way.
    cls.defer();
    for r in &rules {
        cls.remove(r).unwrap();
    }
    cls.publish();
    assert!(cls.is_empty());
    assert!(lookup_rule(&cls, MAX_VERSION, &pkt).is_none());
}

// ======================================================================
// Differential testing against a naive linear-scan classifier.
// ======================================================================

struct Naive {
    rules: Vec<Arc<Rule>>,
}

impl Naive {
    fn lookup(&self, flow: &Flow) -> Option<&Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.criteria().matches_flow(flow))
            .max_by_key(|r| r.priority())
    }
}

fn random_mask(rng: &mut StdRng) -> Mask {
    let mut mask = Mask::new();
    // A handful of mask shapes, biased toward realistic ones.
    for (field, chance) in [
        (FieldId::Metadata, 0.15),
        (FieldId::InPort, 0.3),
        (FieldId::EthDst, 0.2),
        (FieldId::EthType, 0.3),
        (FieldId::IpProto, 0.5),
        (FieldId::TpDst, 0.4),
    ] {
        if rng.gen_bool(chance) {
            mask.set_field(field);
        }
    }
    if rng.gen_bool(0.5) {
        mask.set_field_prefix(FieldId::Ipv4Dst, rng.gen_range(0..=32));
    }
    if rng.gen_bool(0.3) {
        mask.set_field_prefix(FieldId::Ipv4Src, rng.gen_range(0..=32));
    }
    mask
}

fn random_flow(rng: &mut StdRng) -> Flow {
    // Small value domains so that probes actually hit rules.
    Flow::new()
        .with(FieldId::Metadata, rng.gen_range(0..3))
        .with(FieldId::InPort, rng.gen_range(0..4))
        .with(FieldId::EthDst, rng.gen_range(0..4))
        .with(FieldId::EthType, [0x0800u64, 0x86dd][rng.gen_range(0..2)])
        .with(FieldId::Ipv4Src, rng.gen_range(0..8) << 24)
        .with(FieldId::Ipv4Dst, rng.gen_range(0..8) << 24)
        .with(FieldId::IpProto, [6u64, 17][rng.gen_range(0..2)])
        .with(FieldId::TpDst, rng.gen_range(0..4))
}

#[test]
fn matches_naive_classifier() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let cls = Classifier::new(&SEGMENTS).unwrap();
    cls.set_prefix_fields(&[FieldId::Ipv4Dst, FieldId::Ipv4Src])
        .unwrap();
    let mut naive = Naive { rules: Vec::new() };

    // Unique priorities keep the winner unambiguous.
    for priority in 0..400 {
        let mask = random_mask(&mut rng);
        let flow = random_flow(&mut rng);
        let r = rule(Match::new(flow, mask), priority);
        if cls.insert(&r, 0, &[]).is_ok() {
            naive.rules.push(r);
        }
    }

    for _ in 0..2_000 {
        let pkt = random_flow(&mut rng);
        let got = lookup_rule(&cls, 0, &pkt);
        let want = naive.lookup(&pkt);
        match (got, want) {
            (Some(g), Some(w)) => assert!(
                Arc::ptr_eq(&g, w),
                "lookup disagrees for {:?}: got {}, want {}",
                pkt,
                g,
                w
            ),
            (None, None) => {}
            (got, want) => {
                panic!("disagree for {:?}: {:?} vs {:?}", pkt, got, want)
            }
        }
    }

    // Remove half the rules and cross-check again.
    for r in naive.rules.drain(..200).collect::<Vec<_>>() {
        assert!(cls.remove(&r).is_some());
    }
    for _ in 0..1_000 {
        let pkt = random_flow(&mut rng);
        let got = lookup_rule(&cls, 0, &pkt);
        let want = naive.lookup(&pkt);
        match (got, want) {
            (Some(g), Some(w)) => assert!(Arc::ptr_eq(&g, w)),
            (None, None) => {}
            (got, want) => {
                panic!("disagree for {:?}: {:?} vs {:?}", pkt, got, want)
            }
        }
    }
}

#[test]
fn wildcards_justify_the_answer() {
    // Flipping bits the lookup never examined must not change the
    // result.
    let mut rng = StdRng::seed_from_u64(0xbeef_cafe);
    let cls = Classifier::new(&SEGMENTS).unwrap();
    cls.set_prefix_fields(&[FieldId::Ipv4Dst]).unwrap();
    let mut all = Vec::new();
    for priority in 0..200 {
        let r = rule(
            Match::new(random_flow(&mut rng), random_mask(&mut rng)),
            priority,
        );
        if cls.insert(&r, 0, &[]).is_ok() {
            all.push(r);
        }
    }

    for _ in 0..500 {
        let pkt = random_flow(&mut rng);
        let mut wc = Wildcards::new();
        let got = cls
            .lookup(0, &pkt, &mut wc)
            .and_then(|r| r.rule().cloned());

        for _ in 0..20 {
            // Perturb only bits outside the examined set.
            let mut twisted = pkt;
            for spec in classifier::FIELDS.iter() {
                let examined = wc.mask().get(spec.id);
                let width_mask = if spec.n_bits == 64 {
                    u64::MAX
                } else {
                    (1u64 << spec.n_bits) - 1
                };
                let flip = rng.gen::<u64>() & width_mask & !examined;
                twisted.set(spec.id, twisted.get(spec.id) ^ flip);
            }
            let mut wc2 = Wildcards::new();
            let got2 = cls
                .lookup(0, &twisted, &mut wc2)
                .and_then(|r| r.rule().cloned());
            match (&got, &got2) {
                (Some(a), Some(b)) => assert!(
                    Arc::ptr_eq(a, b),
                    "wildcards lied: {:?} vs {:?}",
                    pkt,
                    twisted
                ),
                (None, None) => {}
                _ => panic!(
                    "wildcards lied: {:?} vs {:?}",
                    pkt, twisted
                ),
            }
        }
    }
}

// ======================================================================
// Concurrency smoke test: readers race a writer.
// ======================================================================

#[test]
fn concurrent_readers_and_writer() {
    let cls = Arc::new(Classifier::new(&SEGMENTS).unwrap());
    cls.set_prefix_fields(&[FieldId::Ipv4Dst]).unwrap();

    std::thread::scope(|s| {
        for seed in 0..4u64 {
            let cls = Arc::clone(&cls);
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..20_000 {
                    let pkt = random_flow(&mut rng);
                    let mut wc = Wildcards::new();
                    if let Some(LookupResult::Rule(r)) =
                        cls.lookup(MAX_VERSION, &pkt, &mut wc)
                    {
                        // Whatever wins must actually match, and the
                        // examined bits must cover its mask.
                        assert!(r.criteria().matches_flow(&pkt));
                        assert!(wc.mask().covers(r.criteria().mask()));
                    }
                }
            });
        }

        let mut rng = StdRng::seed_from_u64(99);
        let mut live: Vec<Arc<Rule>> = Vec::new();
        for i in 0..4_000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let r = rule(
                    Match::new(
                        random_flow(&mut rng),
                        random_mask(&mut rng),
                    ),
                    i,
                );
                if cls.insert(&r, 0, &[]).is_ok() {
                    live.push(r);
                }
            } else {
                let at = rng.gen_range(0..live.len());
                let r = live.swap_remove(at);
                assert!(cls.remove(&r).is_some());
            }
        }
    });
}
