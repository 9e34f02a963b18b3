// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Cross-layer scenarios for the header-cache engine.

use std::collections::BTreeSet;
use std::thread;
use swage::api::ActionKind;
use swage::api::Ipv4Addr;
use swage::api::MacAddr;
use swage::api::MatchField;
use swage::api::Protocol;
use swage::engine::ether::EtherCache;
use swage::engine::ether::EtherMeta;
use swage::engine::ether::EtherType;
use swage::engine::flow::FlowContext;
use swage::engine::flow::PendingFlow;
use swage::engine::ip4::Ipv4Cache;
use swage::engine::ip4::Ipv4Meta;
use swage::engine::tcp::TcpCache;
use swage::engine::tcp::TcpFlags;
use swage::engine::tcp::TcpMeta;
use swage::engine::udp::UdpCache;
use swage::engine::udp::UdpMeta;

fn frame() -> EtherMeta {
    EtherMeta {
        src: "00:11:22:33:44:55".parse().unwrap(),
        dst: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
        ether_type: EtherType::Ipv4,
        vlan: 10,
        pcp: Some(3),
        payload: vec![],
    }
}

// A frame enters with three queued rewrites, two of which turn out to
// be redundant: the destination MAC and the priority are both left at
// values the flow match already pins. Only the real rewrite survives.
#[test]
fn redundant_rewrites_are_pruned_on_commit() {
    let mut ctx = PendingFlow::new();
    ctx.add_match_field(MatchField::EtherDst);
    ctx.add_match_field(MatchField::VlanPcp);
    ctx.push_action(ActionKind::SetEtherSrc);
    ctx.push_action(ActionKind::SetEtherDst);
    ctx.push_action(ActionKind::SetVlanPcp);

    let mut cache = EtherCache::new(frame());
    cache.set_src("02:00:00:00:00:01".parse().unwrap());

    assert!(cache.commit(&mut ctx));
    assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);
}

// Source NAT across the whole header stack: rewrite the source
// address and port, commit each layer once, then settle the TCP
// checksum.
#[test]
fn snat_style_rewrite() {
    let tcp = TcpMeta {
        src: 33000,
        dst: 443,
        seq: 4000123,
        ack: 0,
        flags: TcpFlags::SYN,
        window_size: 64240,
        csum: 0,
        urg: 0,
        options: vec![],
        payload: vec![0x16, 0x03, 0x01, 0x02],
    };
    let ip4 = Ipv4Meta {
        src: "10.0.0.54".parse().unwrap(),
        dst: "52.10.128.69".parse().unwrap(),
        proto: Protocol::TCP,
        dscp: 0,
        ttl: 64,
        ident: 7,
        hdr_len: 20,
        total_len: 20 + 24,
    };

    let mut ether = EtherCache::new(frame());
    let mut l3 = Ipv4Cache::new(ip4);
    let mut l4 = TcpCache::new(tcp);

    let public: Ipv4Addr = "198.51.100.7".parse().unwrap();
    l3.set_src(public);
    l4.set_src_port(61234);

    let mut ctx = PendingFlow::new();
    assert!(!ether.commit(&mut ctx));
    assert!(l3.commit(&mut ctx));
    assert!(l4.commit(&mut ctx));

    // Both L3 and L4 commits pinned their prerequisite match fields.
    assert!(ctx.has_match_field(MatchField::EtherType));
    assert!(ctx.has_match_field(MatchField::IpProto));

    // The rewritten copies carry the new values; the checksum settles
    // over the rewritten pseudo-header and ports.
    assert_eq!(l3.packet().src, public);
    assert_eq!(l4.packet().src, 61234);
    assert!(l4.update_checksum(&mut l3).unwrap());
    assert!(l4.verify_checksum(&mut l3).unwrap());

    // Everything has settled; running the checksum again changes
    // nothing.
    assert!(!l4.update_checksum(&mut l3).unwrap());
}

// A match is always built from the packet as it arrived, even when
// the caches already carry staged rewrites for every field involved.
#[test]
fn match_creation_ignores_staged_rewrites() {
    let mut ether = EtherCache::new(frame());
    let mut l3 = Ipv4Cache::new(Ipv4Meta {
        src: "10.0.0.54".parse().unwrap(),
        dst: "52.10.128.69".parse().unwrap(),
        proto: Protocol::UDP,
        total_len: 20 + 12,
        ..Default::default()
    });
    let mut l4 = UdpCache::new(UdpMeta {
        src: 5353,
        dst: 5353,
        csum: 0,
        payload: vec![0; 4],
    });

    ether.set_dst(MacAddr::BROADCAST);
    l3.set_dst("224.0.0.251".parse().unwrap());
    l4.set_dst_port(53);

    let fields: BTreeSet<MatchField> = [
        MatchField::EtherDst,
        MatchField::Ip4Dst,
        MatchField::L4Dst,
    ]
    .into_iter()
    .collect();

    let mut mtch = ether.create_match(&fields);
    l3.set_match(&mut mtch, &fields);
    l4.set_match(&mut mtch, &fields);

    assert_eq!(mtch.ether_dst, Some("AA:BB:CC:DD:EE:FF".parse().unwrap()));
    assert_eq!(mtch.vlan, Some(10));
    assert_eq!(mtch.ipv4_dst(), Ok("52.10.128.69".parse().ok()));
    assert_eq!(mtch.ip_proto, Some(Protocol::UDP));
    assert_eq!(mtch.l4_dst, Some(5353));
}

// Forked caches may be committed concurrently, each against its own
// runtime context, without observing one another.
#[test]
fn forked_paths_commit_independently() {
    let mut original = Ipv4Cache::new(Ipv4Meta {
        src: "10.0.0.54".parse().unwrap(),
        dst: "52.10.128.69".parse().unwrap(),
        proto: Protocol::TCP,
        total_len: 40,
        ..Default::default()
    });

    let mut forked = original.fork();

    let handles = [
        thread::spawn(move || {
            original.set_dst("192.0.2.1".parse().unwrap());
            let mut ctx = PendingFlow::new();
            assert!(original.commit(&mut ctx));
            original.packet().dst
        }),
        thread::spawn(move || {
            forked.set_dst("192.0.2.2".parse().unwrap());
            let mut ctx = PendingFlow::new();
            assert!(forked.commit(&mut ctx));
            forked.packet().dst
        }),
    ];

    let dsts: Vec<Ipv4Addr> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(dsts[0], "192.0.2.1".parse().unwrap());
    assert_eq!(dsts[1], "192.0.2.2".parse().unwrap());
}
