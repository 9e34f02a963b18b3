// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ethernet frames and their header cache.

use super::cache::Lazy;
use super::cache::reconcile_field;
use super::flow::FlowContext;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use swage_api::ActionKind;
use swage_api::FlowMatch;
use swage_api::MacAddr;
use swage_api::MatchField;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

pub const ETHER_ADDR_LEN: usize = 6;

/// The VLAN id of an untagged frame.
pub const VLAN_NONE: u16 = 0;
/// The largest assignable VLAN id.
pub const VLAN_VID_MAX: u16 = 4094;
/// The largest 802.1Q priority code point.
pub const VLAN_PCP_MAX: u8 = 7;

#[derive(
    Clone, Copy, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum EtherType {
    Ipv4,
    Arp,
    Vlan,
    Ipv6,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(raw: u16) -> Self {
        match raw {
            ETHER_TYPE_IPV4 => Self::Ipv4,
            ETHER_TYPE_ARP => Self::Arp,
            ETHER_TYPE_VLAN => Self::Vlan,
            ETHER_TYPE_IPV6 => Self::Ipv6,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(et: EtherType) -> Self {
        use EtherType::*;

        match et {
            Ipv4 => ETHER_TYPE_IPV4,
            Arp => ETHER_TYPE_ARP,
            Vlan => ETHER_TYPE_VLAN,
            Ipv6 => ETHER_TYPE_IPV6,
            Unknown(val) => val,
        }
    }
}

impl Default for EtherType {
    fn default() -> Self {
        EtherType::Unknown(0x7777)
    }
}

impl Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}", u16::from(*self))
    }
}

/// We are never really interested in internal representation of
/// [`EtherType`].
impl Debug for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// A decoded Ethernet frame, as handed over by the wire decoder.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EtherMeta {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// The inner ethertype: the frame's own type field, or the type
    /// carried after the 802.1Q tag when the frame is tagged.
    pub ether_type: EtherType,
    /// 802.1Q VLAN id; [`VLAN_NONE`] for an untagged frame.
    pub vlan: u16,
    /// 802.1Q priority code point; `None` on untagged frames.
    pub pcp: Option<u8>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
struct EtherValues {
    src: Lazy<MacAddr>,
    dst: Lazy<MacAddr>,
    vlan: Lazy<u16>,
    pcp: Lazy<Option<u8>>,
}

/// Copy-on-write cache over one decoded Ethernet frame.
///
/// Unlike the L3/L4 caches, committing never replaces the wrapped
/// frame: the caller always re-encodes the outgoing frame from the
/// cache's getters, so `commit` only reconciles staged values against
/// the runtime context and reports whether anything changed.
#[derive(Debug)]
pub struct EtherCache {
    pkt: Arc<EtherMeta>,
    base: EtherValues,
    staged: Option<EtherValues>,
    /// Inner ethertype, fixed when the frame is decoded.
    ether_type: EtherType,
    /// The VLAN id observed when the frame entered the pipeline.
    vlan_at_entry: u16,
    /// Payload override. The payload rides along outside the
    /// copy-on-write value set.
    payload: Option<Vec<u8>>,
}

impl EtherCache {
    pub fn new(pkt: EtherMeta) -> Self {
        let ether_type = pkt.ether_type;
        let vlan_at_entry = pkt.vlan;
        let mut base = EtherValues::default();
        base.vlan.set(vlan_at_entry);

        Self {
            pkt: Arc::new(pkt),
            base,
            staged: None,
            ether_type,
            vlan_at_entry,
            payload: None,
        }
    }

    /// The wrapped frame. Staged, uncommitted values are never
    /// visible here.
    pub fn packet(&self) -> &EtherMeta {
        &self.pkt
    }

    pub fn src(&mut self) -> MacAddr {
        let pkt = &self.pkt;
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.src.hydrate(|| pkt.src)
    }

    pub fn set_src(&mut self, mac: MacAddr) {
        self.stage().src.set(mac);
    }

    pub fn dst(&mut self) -> MacAddr {
        let pkt = &self.pkt;
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.dst.hydrate(|| pkt.dst)
    }

    pub fn set_dst(&mut self, mac: MacAddr) {
        self.stage().dst.set(mac);
    }

    /// The current VLAN id; [`VLAN_NONE`] when untagged.
    pub fn vlan(&mut self) -> u16 {
        let pkt = &self.pkt;
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.vlan.hydrate(|| pkt.vlan)
    }

    /// Rewrite the VLAN id. [`VLAN_NONE`] strips the tag.
    pub fn set_vlan(&mut self, vid: u16) {
        self.stage().vlan.set(vid);
    }

    /// The VLAN id the frame arrived with, regardless of any staged
    /// or committed rewrite. This is what distinguishes "arrived
    /// untagged" from "rewritten to untagged".
    pub fn original_vlan(&self) -> u16 {
        self.vlan_at_entry
    }

    /// The current priority code point; `None` when the frame carries
    /// no priority.
    pub fn vlan_pcp(&mut self) -> Option<u8> {
        let pkt = &self.pkt;
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.pcp.hydrate(|| pkt.pcp)
    }

    pub fn set_vlan_pcp(&mut self, pcp: u8) {
        self.stage().pcp.set(Some(pcp));
    }

    /// The inner ethertype. Read-only: rewriting the payload protocol
    /// is not a thing this pipeline does.
    pub fn ether_type(&self) -> EtherType {
        self.ether_type
    }

    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Some(p) => p,
            None => &self.pkt.payload,
        }
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    /// Fork this cache for an independent processing path. The two
    /// caches share no mutable state.
    pub fn fork(&self) -> Self {
        Self {
            pkt: Arc::clone(&self.pkt),
            base: self.base.clone(),
            staged: self.staged.clone(),
            ether_type: self.ether_type,
            vlan_at_entry: self.vlan_at_entry,
            payload: self.payload.clone(),
        }
    }

    /// Populate `mtch` with the requested fields, read from the frame
    /// as it arrived: a match describes the incoming packet, so
    /// staged values are never consulted. The VLAN id is always
    /// pinned, requested or not; the priority is only considered for
    /// tagged frames.
    pub fn set_match(
        &mut self,
        mtch: &mut FlowMatch,
        fields: &BTreeSet<MatchField>,
    ) {
        if fields.contains(&MatchField::EtherSrc) {
            mtch.ether_src = Some(self.base_src());
        }

        if fields.contains(&MatchField::EtherDst) {
            mtch.ether_dst = Some(self.base_dst());
        }

        if fields.contains(&MatchField::EtherType) {
            mtch.ether_type = Some(u16::from(self.ether_type));
        }

        mtch.vlan = Some(self.vlan_at_entry);

        if fields.contains(&MatchField::VlanPcp)
            && self.vlan_at_entry != VLAN_NONE
        {
            mtch.vlan_pcp = self.base_pcp();
        }
    }

    /// Allocate and populate a match; see [`EtherCache::set_match`].
    pub fn create_match(&mut self, fields: &BTreeSet<MatchField>) -> FlowMatch {
        let mut mtch = FlowMatch::default();
        self.set_match(&mut mtch, fields);
        mtch
    }

    /// Finalize staged changes against the flow's runtime context.
    ///
    /// Returns whether the frame's content changed. Rewrite actions
    /// for fields that did not change, but which the flow match
    /// already pins, are dropped from the context. A priority rewrite
    /// never survives when the final VLAN id is [`VLAN_NONE`]: an
    /// untagged frame has nowhere to carry one.
    ///
    /// Committing drains the staged snapshot into the baseline, so a
    /// second call is a no-op.
    pub fn commit<C>(&mut self, ctx: &mut C) -> bool
    where
        C: FlowContext + ?Sized,
    {
        let Some(staged) = self.staged.take() else {
            return false;
        };

        let mut changed = false;
        changed |= reconcile_field(
            ctx,
            MatchField::EtherSrc,
            ActionKind::SetEtherSrc,
            &self.base.src.read(),
            &staged.src.read(),
        );
        changed |= reconcile_field(
            ctx,
            MatchField::EtherDst,
            ActionKind::SetEtherDst,
            &self.base.dst.read(),
            &staged.dst.read(),
        );

        let vlan = staged.vlan.read();
        changed |= vlan != self.base.vlan.read();

        if vlan == VLAN_NONE {
            ctx.remove_filter_action(ActionKind::SetVlanPcp);
        } else {
            changed |= reconcile_field(
                ctx,
                MatchField::VlanPcp,
                ActionKind::SetVlanPcp,
                &self.base.pcp.read(),
                &staged.pcp.read(),
            );
        }

        self.base = staged;
        changed
    }

    fn base_src(&mut self) -> MacAddr {
        let pkt = &self.pkt;
        self.base.src.hydrate(|| pkt.src)
    }

    fn base_dst(&mut self) -> MacAddr {
        let pkt = &self.pkt;
        self.base.dst.hydrate(|| pkt.dst)
    }

    fn base_pcp(&mut self) -> Option<u8> {
        let pkt = &self.pkt;
        self.base.pcp.hydrate(|| pkt.pcp)
    }

    /// Hydrate every remaining baseline field and copy the baseline
    /// into the staged snapshot, on the first staged write only.
    fn stage(&mut self) -> &mut EtherValues {
        if self.staged.is_none() {
            let pkt = &self.pkt;
            let base = &mut self.base;
            base.src.hydrate(|| pkt.src);
            base.dst.hydrate(|| pkt.dst);
            base.vlan.hydrate(|| pkt.vlan);
            base.pcp.hydrate(|| pkt.pcp);
            self.staged = Some(base.clone());
        }

        // Unwrap safety: populated just above.
        self.staged.as_mut().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow::PendingFlow;

    fn tagged_frame() -> EtherMeta {
        EtherMeta {
            dst: MacAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            src: MacAddr::from([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            ether_type: EtherType::Ipv4,
            vlan: 10,
            pcp: Some(3),
            payload: vec![0xDE, 0xAD],
        }
    }

    #[test]
    fn untouched_cache_commits_nothing() {
        let frame = tagged_frame();
        let mut cache = EtherCache::new(frame.clone());
        let mut ctx = PendingFlow::new();
        ctx.push_action(ActionKind::SetEtherSrc);

        assert!(!cache.commit(&mut ctx));
        assert_eq!(cache.packet(), &frame);
        assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);
    }

    #[test]
    fn getters_read_through_without_staging() {
        let mut cache = EtherCache::new(tagged_frame());
        assert_eq!(cache.vlan(), 10);
        assert_eq!(cache.vlan_pcp(), Some(3));
        assert_eq!(cache.ether_type(), EtherType::Ipv4);

        let mut ctx = PendingFlow::new();
        assert!(!cache.commit(&mut ctx));
    }

    #[test]
    fn staging_to_original_value_is_not_a_change() {
        let frame = tagged_frame();
        let mut cache = EtherCache::new(frame.clone());
        let mut ctx = PendingFlow::new();
        ctx.add_match_field(MatchField::EtherSrc);
        ctx.push_action(ActionKind::SetEtherSrc);

        cache.set_src(frame.src);
        assert!(!cache.commit(&mut ctx));
        // Unchanged and pinned by the match: the rewrite is
        // redundant.
        assert!(ctx.actions().is_empty());
    }

    #[test]
    fn src_rewrite_reports_change_and_keeps_action() {
        let mut cache = EtherCache::new(tagged_frame());
        let mut ctx = PendingFlow::new();
        ctx.add_match_field(MatchField::EtherSrc);
        ctx.push_action(ActionKind::SetEtherSrc);

        cache.set_src(MacAddr::from([0x02, 0, 0, 0, 0, 0x01]));
        assert!(cache.commit(&mut ctx));
        assert_eq!(ctx.actions(), [ActionKind::SetEtherSrc]);
        // The wrapped frame itself is untouched; callers re-encode
        // from the getters.
        assert_eq!(cache.packet().src, tagged_frame().src);
        assert_eq!(cache.src(), MacAddr::from([0x02, 0, 0, 0, 0, 0x01]));
    }

    #[test]
    fn untagging_drops_priority_rewrite() {
        let mut cache = EtherCache::new(tagged_frame());
        let mut ctx = PendingFlow::new();
        ctx.push_action(ActionKind::SetVlanPcp);

        cache.set_vlan(VLAN_NONE);
        assert!(cache.commit(&mut ctx));
        assert!(ctx.actions().is_empty());
        assert_eq!(cache.original_vlan(), 10);
    }

    #[test]
    fn untagging_drops_priority_rewrite_even_when_staged() {
        let mut cache = EtherCache::new(tagged_frame());
        let mut ctx = PendingFlow::new();
        ctx.push_action(ActionKind::SetVlanPcp);

        cache.set_vlan_pcp(6);
        cache.set_vlan(VLAN_NONE);
        assert!(cache.commit(&mut ctx));
        assert!(ctx.actions().is_empty());
    }

    #[test]
    fn priority_rewrite_survives_when_tagged() {
        let mut cache = EtherCache::new(tagged_frame());
        let mut ctx = PendingFlow::new();
        ctx.push_action(ActionKind::SetVlanPcp);

        cache.set_vlan_pcp(6);
        assert!(cache.commit(&mut ctx));
        assert_eq!(ctx.actions(), [ActionKind::SetVlanPcp]);
        assert_eq!(cache.vlan_pcp(), Some(6));
    }

    #[test]
    fn match_reads_pre_modification_values() {
        let frame = tagged_frame();
        let mut cache = EtherCache::new(frame.clone());
        cache.set_src(MacAddr::from([0x02, 0, 0, 0, 0, 0x01]));
        cache.set_vlan(VLAN_NONE);

        let fields: BTreeSet<MatchField> =
            [MatchField::EtherSrc, MatchField::VlanPcp].into_iter().collect();
        let mtch = cache.create_match(&fields);

        assert_eq!(mtch.ether_src, Some(frame.src));
        // VLAN id is pinned whether or not it was requested.
        assert_eq!(mtch.vlan, Some(10));
        assert_eq!(mtch.vlan_pcp, Some(3));
        // Not requested.
        assert_eq!(mtch.ether_dst, None);
    }

    #[test]
    fn match_skips_priority_on_untagged_frames() {
        let frame = EtherMeta { vlan: VLAN_NONE, pcp: None, ..tagged_frame() };
        let mut cache = EtherCache::new(frame);

        let fields: BTreeSet<MatchField> =
            [MatchField::VlanPcp].into_iter().collect();
        let mtch = cache.create_match(&fields);
        assert_eq!(mtch.vlan, Some(VLAN_NONE));
        assert_eq!(mtch.vlan_pcp, None);
    }

    #[test]
    fn fork_shares_nothing_mutable() {
        let mut h1 = EtherCache::new(tagged_frame());
        let mut h2 = h1.fork();

        h2.set_dst(MacAddr::BROADCAST);
        assert_eq!(h1.dst(), tagged_frame().dst);

        let mut ctx1 = PendingFlow::new();
        let mut ctx2 = PendingFlow::new();
        assert!(!h1.commit(&mut ctx1));
        assert!(h2.commit(&mut ctx2));
    }

    #[test]
    fn second_commit_is_a_noop() {
        let mut cache = EtherCache::new(tagged_frame());
        let mut ctx = PendingFlow::new();
        ctx.add_match_field(MatchField::EtherDst);

        cache.set_src(MacAddr::from([0x02, 0, 0, 0, 0, 0x01]));
        assert!(cache.commit(&mut ctx));

        // The staged snapshot has been drained; a second commit sees
        // a quiesced cache and must not touch the context again.
        ctx.push_action(ActionKind::SetEtherDst);
        assert!(!cache.commit(&mut ctx));
        assert_eq!(ctx.actions(), [ActionKind::SetEtherDst]);
    }

    #[test]
    fn payload_passes_through() {
        let mut cache = EtherCache::new(tagged_frame());
        assert_eq!(cache.payload(), &[0xDE, 0xAD]);
        cache.set_payload(vec![1, 2, 3]);
        assert_eq!(cache.payload(), &[1, 2, 3]);
        // The frame itself still holds the original payload.
        assert_eq!(cache.packet().payload, vec![0xDE, 0xAD]);
    }
}
