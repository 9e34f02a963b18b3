// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMP headers.

use super::cache::CowPacket;
use super::cache::Lazy;
use super::cache::reconcile_field;
use super::flow::FlowContext;
use super::ip4::Ipv4Cache;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use swage_api::ActionKind;
use swage_api::FlowMatch;
use swage_api::MatchField;

/// A decoded ICMP message, as handed over by the wire decoder.
///
/// The body is opaque to this engine: type and code are the only
/// rewritable fields, and the checksum is the encoder's business (see
/// [`IcmpCache::update_checksum`]).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IcmpMeta {
    pub msg_type: u8,
    pub code: u8,
    pub csum: u16,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
struct IcmpValues {
    msg_type: Lazy<u8>,
    code: Lazy<u8>,
}

/// Copy-on-write cache over one decoded ICMP message.
///
/// In the flow model ICMP rides in the transport-port slots: the
/// message type matches and rewrites as the "source port", the code
/// as the "destination port". That convention comes from the
/// OpenFlow 1.0 wire format and is preserved here for compatibility
/// with the surrounding match model.
#[derive(Debug)]
pub struct IcmpCache {
    pkt: CowPacket<IcmpMeta>,
    base: IcmpValues,
    staged: Option<IcmpValues>,
}

impl IcmpCache {
    /// The match field carrying the ICMP message type.
    pub const TYPE_MATCH: MatchField = MatchField::L4Src;
    /// The match field carrying the ICMP code.
    pub const CODE_MATCH: MatchField = MatchField::L4Dst;

    pub fn new(pkt: IcmpMeta) -> Self {
        Self {
            pkt: CowPacket::new(pkt),
            base: IcmpValues::default(),
            staged: None,
        }
    }

    /// The wrapped message. Staged, uncommitted values are never
    /// visible here; after a committing `commit` this is the
    /// rewritten copy.
    pub fn packet(&self) -> &IcmpMeta {
        self.pkt.get()
    }

    pub fn msg_type(&mut self) -> u8 {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.msg_type.hydrate(|| pkt.msg_type)
    }

    pub fn set_msg_type(&mut self, msg_type: u8) {
        self.stage().msg_type.set(msg_type);
    }

    pub fn code(&mut self) -> u8 {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.code.hydrate(|| pkt.code)
    }

    pub fn set_code(&mut self, code: u8) {
        self.stage().code.set(code);
    }

    /// Deliberately does nothing and reports no modification.
    ///
    /// The ICMP encoder recomputes the message checksum as a side
    /// effect of serialization, so there is never a stale checksum to
    /// patch here, and no cause to clone the wrapped message.
    pub fn update_checksum(&mut self, _ip4: &mut Ipv4Cache) -> bool {
        false
    }

    /// Fork this cache for an independent processing path. The two
    /// caches share no mutable state; the wrapped message is shared
    /// until one side commits a change.
    pub fn fork(&mut self) -> Self {
        Self {
            pkt: self.pkt.fork(),
            base: self.base.clone(),
            staged: self.staged.clone(),
        }
    }

    /// Populate `mtch` with the requested fields from
    /// pre-modification values, type and code riding in the transport
    /// slots.
    pub fn set_match(
        &mut self,
        mtch: &mut FlowMatch,
        fields: &BTreeSet<MatchField>,
    ) {
        if fields.contains(&Self::TYPE_MATCH) {
            mtch.l4_src = Some(u16::from(self.base_msg_type()));
        }

        if fields.contains(&Self::CODE_MATCH) {
            mtch.l4_dst = Some(u16::from(self.base_code()));
        }
    }

    /// Allocate and populate a match; see [`IcmpCache::set_match`].
    pub fn create_match(&mut self, fields: &BTreeSet<MatchField>) -> FlowMatch {
        let mut mtch = FlowMatch::default();
        self.set_match(&mut mtch, fields);
        mtch
    }

    /// Finalize staged changes against the flow's runtime context.
    ///
    /// Same shape as the port caches: the message is cloned at most
    /// once, lazily, when the first actually-changed field is
    /// applied, and a staged field forces the flow to pin ethertype
    /// and IP protocol. Returns whether the message changed.
    pub fn commit<C>(&mut self, ctx: &mut C) -> bool
    where
        C: FlowContext + ?Sized,
    {
        let Some(staged) = self.staged.take() else {
            return false;
        };

        ctx.add_match_field(MatchField::EtherType);
        ctx.add_match_field(MatchField::IpProto);

        let mut changed = false;

        if reconcile_field(
            ctx,
            Self::TYPE_MATCH,
            ActionKind::SetL4Src,
            &self.base.msg_type.read(),
            &staged.msg_type.read(),
        ) {
            self.pkt.to_mut().msg_type = staged.msg_type.read();
            changed = true;
        }

        if reconcile_field(
            ctx,
            Self::CODE_MATCH,
            ActionKind::SetL4Dst,
            &self.base.code.read(),
            &staged.code.read(),
        ) {
            self.pkt.to_mut().code = staged.code.read();
            changed = true;
        }

        self.base = staged;
        changed
    }

    fn base_msg_type(&mut self) -> u8 {
        let pkt = self.pkt.get();
        self.base.msg_type.hydrate(|| pkt.msg_type)
    }

    fn base_code(&mut self) -> u8 {
        let pkt = self.pkt.get();
        self.base.code.hydrate(|| pkt.code)
    }

    /// Hydrate every remaining baseline field and copy the baseline
    /// into the staged snapshot, on the first staged write only.
    fn stage(&mut self) -> &mut IcmpValues {
        if self.staged.is_none() {
            let pkt = self.pkt.get();
            let base = &mut self.base;
            base.msg_type.hydrate(|| pkt.msg_type);
            base.code.hydrate(|| pkt.code);
            self.staged = Some(base.clone());
        }

        // Unwrap safety: populated just above.
        self.staged.as_mut().unwrap()
    }
}
