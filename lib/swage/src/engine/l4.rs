// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The generic cache for port-bearing L4 segments.
//!
//! TCP and UDP differ in framing and in checksum policy, but their
//! rewritable surface is the same pair of 16-bit ports and their
//! checksums are computed over the same pseudo-header construction.
//! [`L4Cache`] carries everything shared; the per-protocol pieces
//! (protocol number, checksum offset and policy, match-field slots)
//! come in through the [`PortHeader`] descriptor.

use super::cache::CowPacket;
use super::cache::Lazy;
use super::cache::reconcile_field;
use super::checksum::Checksum;
use super::flow::FlowContext;
use super::ip4::Ipv4Cache;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::result;
use swage_api::ActionKind;
use swage_api::FlowMatch;
use swage_api::MatchField;
use swage_api::Protocol;

/// A segment could not be serialized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmitError {
    /// TCP options must fit in 40 bytes.
    OversizeOptions(usize),
    /// TCP options are padded to 32-bit words.
    RaggedOptions(usize),
    /// The segment exceeds what its length field can carry.
    SegmentTooLong(usize),
}

impl Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OversizeOptions(len) => {
                write!(f, "options too long: {len} bytes")
            }
            Self::RaggedOptions(len) => {
                write!(f, "options not 32-bit aligned: {len} bytes")
            }
            Self::SegmentTooLong(len) => {
                write!(f, "segment too long: {len} bytes")
            }
        }
    }
}

/// A checksum could not be computed.
///
/// An uncomputed checksum means the outgoing packet would be invalid,
/// so this always propagates; the pipeline decides whether to drop
/// the packet or abort the flow installation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChecksumError {
    Emit(EmitError),
}

impl From<EmitError> for ChecksumError {
    fn from(err: EmitError) -> Self {
        Self::Emit(err)
    }
}

impl Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Emit(err) => {
                write!(f, "could not serialize segment: {err}")
            }
        }
    }
}

/// Descriptor for a port-bearing L4 segment type.
///
/// Implemented by the decoded TCP and UDP headers; everything the
/// generic cache cannot know by itself comes in through here.
pub trait PortHeader: Clone {
    /// IP protocol number used in the pseudo-header.
    const PROTO: Protocol;
    /// Offset of the checksum field within the serialized segment.
    const CSUM_OFFSET: usize;
    /// The match field carrying this protocol's source port in the
    /// flow model.
    const SRC_MATCH: MatchField;
    /// The match field carrying this protocol's destination port.
    const DST_MATCH: MatchField;

    fn src_port(&self) -> u16;
    fn dst_port(&self) -> u16;
    fn set_src_port(&mut self, port: u16);
    fn set_dst_port(&mut self, port: u16);

    /// The checksum as stored in the segment.
    fn csum(&self) -> u16;
    fn set_csum(&mut self, csum: u16);

    /// Serialize the segment, header then payload, exactly as it is
    /// summed on the wire.
    fn emit(&self) -> result::Result<Vec<u8>, EmitError>;
}

#[derive(Clone, Debug, Default)]
struct PortValues {
    src: Lazy<u16>,
    dst: Lazy<u16>,
}

/// Copy-on-write cache over one decoded port-bearing segment.
#[derive(Debug)]
pub struct L4Cache<H: PortHeader> {
    pkt: CowPacket<H>,
    base: PortValues,
    staged: Option<PortValues>,
}

impl<H: PortHeader> L4Cache<H> {
    pub fn new(pkt: H) -> Self {
        Self {
            pkt: CowPacket::new(pkt),
            base: PortValues::default(),
            staged: None,
        }
    }

    /// The wrapped segment. Staged, uncommitted values are never
    /// visible here; after a committing `commit` this is the
    /// rewritten copy.
    pub fn packet(&self) -> &H {
        self.pkt.get()
    }

    pub fn src_port(&mut self) -> u16 {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.src.hydrate(|| pkt.src_port())
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.stage().src.set(port);
    }

    pub fn dst_port(&mut self) -> u16 {
        let pkt = self.pkt.get();
        let snap = match self.staged.as_mut() {
            Some(s) => s,
            None => &mut self.base,
        };
        snap.dst.hydrate(|| pkt.dst_port())
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.stage().dst.set(port);
    }

    /// One's complement checksum over the pseudo-header followed by
    /// the segment, with the segment's own checksum field zeroed. The
    /// carries are folded and the result complemented for storage.
    pub fn compute_checksum(
        &self,
        ip4: &mut Ipv4Cache,
    ) -> result::Result<u16, ChecksumError> {
        let mut seg = self.pkt.get().emit()?;
        seg[H::CSUM_OFFSET] = 0;
        seg[H::CSUM_OFFSET + 1] = 0;

        let ulp_len = u16::try_from(seg.len())
            .map_err(|_| EmitError::SegmentTooLong(seg.len()))?;
        let mut sum =
            Checksum::compute(&ip4.pseudo_bytes(H::PROTO, ulp_len));
        sum.add_bytes(&seg);
        Ok(!sum.finalize())
    }

    /// Validate the live checksum: the sum over pseudo-header and
    /// segment, checksum field included, must come to `0xFFFF`.
    pub fn verify_checksum(
        &self,
        ip4: &mut Ipv4Cache,
    ) -> result::Result<bool, ChecksumError> {
        let seg = self.pkt.get().emit()?;
        let ulp_len = u16::try_from(seg.len())
            .map_err(|_| EmitError::SegmentTooLong(seg.len()))?;
        let mut sum =
            Checksum::compute(&ip4.pseudo_bytes(H::PROTO, ulp_len));
        sum.add_bytes(&seg);
        Ok(sum.finalize() == 0xFFFF)
    }

    /// Fork this cache for an independent processing path. The two
    /// caches share no mutable state; the wrapped segment is shared
    /// until one side commits a change.
    pub fn fork(&mut self) -> Self {
        Self {
            pkt: self.pkt.fork(),
            base: self.base.clone(),
            staged: self.staged.clone(),
        }
    }

    /// Populate `mtch` with the requested port fields from
    /// pre-modification values.
    pub fn set_match(
        &mut self,
        mtch: &mut FlowMatch,
        fields: &BTreeSet<MatchField>,
    ) {
        if fields.contains(&H::SRC_MATCH) {
            mtch.l4_src = Some(self.base_src());
        }

        if fields.contains(&H::DST_MATCH) {
            mtch.l4_dst = Some(self.base_dst());
        }
    }

    /// Allocate and populate a match; see [`L4Cache::set_match`].
    pub fn create_match(&mut self, fields: &BTreeSet<MatchField>) -> FlowMatch {
        let mut mtch = FlowMatch::default();
        self.set_match(&mut mtch, fields);
        mtch
    }

    /// Finalize staged port changes against the flow's runtime
    /// context.
    ///
    /// The wrapped segment is cloned at most once, lazily, when the
    /// first actually-changed port is applied. Any staged port forces
    /// the flow to pin both the ethertype and the IP protocol: a port
    /// match is meaningless without them. Returns whether the segment
    /// changed.
    ///
    /// Note that this does not touch the checksum; callers follow up
    /// with the protocol's `update_checksum` once the L3 and L4
    /// commits have settled.
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
            H::SRC_MATCH,
            ActionKind::SetL4Src,
            &self.base.src.read(),
            &staged.src.read(),
        ) {
            let port = staged.src.read();
            self.pkt.to_mut().set_src_port(port);
            changed = true;
        }

        if reconcile_field(
            ctx,
            H::DST_MATCH,
            ActionKind::SetL4Dst,
            &self.base.dst.read(),
            &staged.dst.read(),
        ) {
            let port = staged.dst.read();
            self.pkt.to_mut().set_dst_port(port);
            changed = true;
        }

        self.base = staged;
        changed
    }

    pub(crate) fn packet_mut(&mut self) -> &mut H {
        self.pkt.to_mut()
    }

    fn base_src(&mut self) -> u16 {
        let pkt = self.pkt.get();
        self.base.src.hydrate(|| pkt.src_port())
    }

    fn base_dst(&mut self) -> u16 {
        let pkt = self.pkt.get();
        self.base.dst.hydrate(|| pkt.dst_port())
    }

    /// Hydrate every remaining baseline field and copy the baseline
    /// into the staged snapshot, on the first staged write only.
    fn stage(&mut self) -> &mut PortValues {
        if self.staged.is_none() {
            let pkt = self.pkt.get();
            let base = &mut self.base;
            base.src.hydrate(|| pkt.src_port());
            base.dst.hydrate(|| pkt.dst_port());
            self.staged = Some(base.clone());
        }

        // Unwrap safety: populated just above.
        self.staged.as_mut().unwrap()
    }
}
