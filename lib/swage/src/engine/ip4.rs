// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers and their header cache.

use super::cache::CowPacket;
use super::cache::Lazy;
use super::cache::reconcile_field;
use super::flow::FlowContext;
use alloc::collections::BTreeSet;
use serde::Deserialize;
use serde::Serialize;
use swage_api::ActionKind;
use swage_api::FlowMatch;
use swage_api::IpAddr;
use swage_api::Ipv4Addr;
use swage_api::MatchField;
use swage_api::Protocol;

pub const IPV4_HDR_LEN: u16 = 20;
/// The largest value of the 6-bit differentiated services field.
pub const DSCP_MAX: u8 = 63;

/// A decoded IPv4 datagram header, as handed over by the wire
/// decoder.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv4Meta {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: Protocol,
    /// Differentiated services, 0–63.
    pub dscp: u8,
    pub ttl: u8,
    pub ident: u16,
    pub hdr_len: u16,
    pub total_len: u16,
}

impl Default for Ipv4Meta {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::ANY_ADDR,
            dst: Ipv4Addr::ANY_ADDR,
            proto: Protocol::Unknown(255),
            dscp: 0,
            ttl: 64,
            ident: 0,
            hdr_len: IPV4_HDR_LEN,
            total_len: 0,
        }
    }
}

impl Ipv4Meta {
    /// The length of the Upper Layer Protocol (ULP) portion of the
    /// datagram.
    pub fn ulp_len(&self) -> u16 {
        self.total_len - self.hdr_len
    }
}

#[derive(Clone, Debug, Default)]
struct Ipv4Values {
    src: Lazy<Ipv4Addr>,
    dst: Lazy<Ipv4Addr>,
    dscp: Lazy<u8>,
}

/// Copy-on-write cache over one decoded IPv4 header.
#[derive(Debug)]
pub struct Ipv4Cache {
    pkt: CowPacket<Ipv4Meta>,
    base: Ipv4Values,
    staged: Option<Ipv4Values>,
}

impl Ipv4Cache {
    pub fn new(pkt: Ipv4Meta) -> Self {
        Self {
            pkt: CowPacket::new(pkt),
            base: Ipv4Values::default(),
            staged: None,
        }
    }

    /// The wrapped header. Staged, uncommitted values are never
    /// visible here; after a committing `commit` this is the rewritten
    /// copy.
    pub fn packet(&self) -> &Ipv4Meta {
        self.pkt.get()
    }

    pub fn src(&mut self) -> Ipv4Addr {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.src.hydrate(|| pkt.src)
    }

    pub fn set_src(&mut self, ip: Ipv4Addr) {
        self.stage().src.set(ip);
    }

    pub fn dst(&mut self) -> Ipv4Addr {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.dst.hydrate(|| pkt.dst)
    }

    pub fn set_dst(&mut self, ip: Ipv4Addr) {
        self.stage().dst.set(ip);
    }

    pub fn dscp(&mut self) -> u8 {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.dscp.hydrate(|| pkt.dscp)
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        self.stage().dscp.set(dscp);
    }

    /// True when a staged address differs from the one the datagram
    /// arrived with. The L4 caches use this to decide whether a
    /// checksum depending on the pseudo-header went stale.
    pub fn is_address_modified(&self) -> bool {
        match &self.staged {
            Some(s) => s.src != self.base.src || s.dst != self.base.dst,
            None => false,
        }
    }

    /// Build the 12-byte pseudo-header summed into every L4 checksum:
    /// `{src(4) | dst(4) | zero(1) | protocol(1) | length(2)}`.
    ///
    /// The addresses are the *current* ones: a staged rewrite is
    /// reflected here even before commit, since the outgoing segment
    /// will be carried by the rewritten datagram.
    pub fn pseudo_bytes(
        &mut self,
        proto: Protocol,
        ulp_len: u16,
    ) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.src().bytes());
        bytes[4..8].copy_from_slice(&self.dst().bytes());
        let len_bytes = ulp_len.to_be_bytes();
        bytes[8..12].copy_from_slice(&[
            0,
            u8::from(proto),
            len_bytes[0],
            len_bytes[1],
        ]);
        bytes
    }

    /// Fork this cache for an independent processing path. The two
    /// caches share no mutable state; the wrapped header is shared
    /// until one side commits a change.
    pub fn fork(&mut self) -> Self {
        Self {
            pkt: self.pkt.fork(),
            base: self.base.clone(),
            staged: self.staged.clone(),
        }
    }

    /// Populate `mtch` from pre-modification values. The protocol is
    /// always pinned; addresses and DSCP only when requested.
    pub fn set_match(
        &mut self,
        mtch: &mut FlowMatch,
        fields: &BTreeSet<MatchField>,
    ) {
        mtch.ip_proto = Some(self.pkt.get().proto);

        if fields.contains(&MatchField::Ip4Src) {
            mtch.ip_src = Some(IpAddr::Ip4(self.base_src()));
        }

        if fields.contains(&MatchField::Ip4Dst) {
            mtch.ip_dst = Some(IpAddr::Ip4(self.base_dst()));
        }

        if fields.contains(&MatchField::Dscp) {
            mtch.dscp = Some(self.base_dscp());
        }
    }

    /// Allocate and populate a match; see [`Ipv4Cache::set_match`].
    pub fn create_match(&mut self, fields: &BTreeSet<MatchField>) -> FlowMatch {
        let mut mtch = FlowMatch::default();
        self.set_match(&mut mtch, fields);
        mtch
    }

    /// Finalize staged changes against the flow's runtime context.
    ///
    /// The wrapped header is cloned at most once, lazily, when the
    /// first actually-changed field is applied; an all-no-op commit
    /// leaves the original untouched. Any staged IPv4 field forces
    /// the flow to pin the ethertype. Returns whether the header
    /// changed.
    pub fn commit<C>(&mut self, ctx: &mut C) -> bool
    where
        C: FlowContext + ?Sized,
    {
        let Some(staged) = self.staged.take() else {
            return false;
        };

        ctx.add_match_field(MatchField::EtherType);

        let mut changed = false;

        if reconcile_field(
            ctx,
            MatchField::Ip4Src,
            ActionKind::SetIp4Src,
            &self.base.src.read(),
            &staged.src.read(),
        ) {
            self.pkt.to_mut().src = staged.src.read();
            changed = true;
        }

        if reconcile_field(
            ctx,
            MatchField::Ip4Dst,
            ActionKind::SetIp4Dst,
            &self.base.dst.read(),
            &staged.dst.read(),
        ) {
            self.pkt.to_mut().dst = staged.dst.read();
            changed = true;
        }

        if reconcile_field(
            ctx,
            MatchField::Dscp,
            ActionKind::SetDscp,
            &self.base.dscp.read(),
            &staged.dscp.read(),
        ) {
            self.pkt.to_mut().dscp = staged.dscp.read();
            changed = true;
        }

        self.base = staged;
        changed
    }

    fn base_src(&mut self) -> Ipv4Addr {
        let pkt = self.pkt.get();
        self.base.src.hydrate(|| pkt.src)
    }

    fn base_dst(&mut self) -> Ipv4Addr {
        let pkt = self.pkt.get();
        self.base.dst.hydrate(|| pkt.dst)
    }

    fn base_dscp(&mut self) -> u8 {
        let pkt = self.pkt.get();
        self.base.dscp.hydrate(|| pkt.dscp)
    }

    /// Hydrate every remaining baseline field and copy the baseline
    /// into the staged snapshot, on the first staged write only.
    fn stage(&mut self) -> &mut Ipv4Values {
        if self.staged.is_none() {
            let pkt = self.pkt.get();
            let base = &mut self.base;
            base.src.hydrate(|| pkt.src);
            base.dst.hydrate(|| pkt.dst);
            base.dscp.hydrate(|| pkt.dscp);
            self.staged = Some(base.clone());
        }

        // Unwrap safety: populated just above.
        self.staged.as_mut().unwrap()
    }
}
