// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP headers.

use super::ip4::Ipv4Cache;
use super::l4::ChecksumError;
use super::l4::EmitError;
use super::l4::L4Cache;
use super::l4::PortHeader;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::result;
use swage_api::MatchField;
use swage_api::Protocol;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const TCP_HDR_LEN: usize = 20;
/// The data-offset field counts 32-bit words, so options can occupy
/// at most (15 - 5) * 4 bytes.
pub const TCP_HDR_MAX_OPTIONS_LEN: usize = 40;
pub const TCP_HDR_OFFSET_SHIFT: u8 = 4;
pub const TCP_CSUM_OFFSET: usize = 16;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// A decoded TCP segment, as handed over by the wire decoder.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TcpMeta {
    pub src: u16,
    pub dst: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub csum: u16,
    pub urg: u16,
    /// Raw option bytes, already padded to 32-bit words by the
    /// decoder.
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl TcpMeta {
    /// Header length in bytes, options included.
    pub fn hdr_len(&self) -> usize {
        TCP_HDR_LEN + self.options.len()
    }
}

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
struct TcpHdrRaw {
    src_port: [u8; 2],
    dst_port: [u8; 2],
    seq: [u8; 4],
    ack: [u8; 4],
    offset: u8,
    flags: u8,
    window_size: [u8; 2],
    csum: [u8; 2],
    urg: [u8; 2],
}

impl PortHeader for TcpMeta {
    const PROTO: Protocol = Protocol::TCP;
    const CSUM_OFFSET: usize = TCP_CSUM_OFFSET;
    const SRC_MATCH: MatchField = MatchField::L4Src;
    const DST_MATCH: MatchField = MatchField::L4Dst;

    fn src_port(&self) -> u16 {
        self.src
    }

    fn dst_port(&self) -> u16 {
        self.dst
    }

    fn set_src_port(&mut self, port: u16) {
        self.src = port;
    }

    fn set_dst_port(&mut self, port: u16) {
        self.dst = port;
    }

    fn csum(&self) -> u16 {
        self.csum
    }

    fn set_csum(&mut self, csum: u16) {
        self.csum = csum;
    }

    fn emit(&self) -> result::Result<Vec<u8>, EmitError> {
        if self.options.len() > TCP_HDR_MAX_OPTIONS_LEN {
            return Err(EmitError::OversizeOptions(self.options.len()));
        }

        if self.options.len() % 4 != 0 {
            return Err(EmitError::RaggedOptions(self.options.len()));
        }

        let raw = TcpHdrRaw {
            src_port: self.src.to_be_bytes(),
            dst_port: self.dst.to_be_bytes(),
            seq: self.seq.to_be_bytes(),
            ack: self.ack.to_be_bytes(),
            offset: ((self.hdr_len() / 4) as u8) << TCP_HDR_OFFSET_SHIFT,
            flags: self.flags.bits(),
            window_size: self.window_size.to_be_bytes(),
            csum: self.csum.to_be_bytes(),
            urg: self.urg.to_be_bytes(),
        };

        let mut out =
            Vec::with_capacity(self.hdr_len() + self.payload.len());
        out.extend_from_slice(raw.as_bytes());
        out.extend_from_slice(&self.options);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Copy-on-write cache over one decoded TCP segment.
pub type TcpCache = L4Cache<TcpMeta>;

impl L4Cache<TcpMeta> {
    /// Recompute the segment checksum and apply it if it disagrees
    /// with the stored one.
    ///
    /// TCP checksums are mandatory, so this recomputes
    /// unconditionally; the pseudo-header reflects the IPv4 cache's
    /// current addresses. A disagreement alone materializes the
    /// wrapped segment and reports modification, even when no port
    /// changed.
    pub fn update_checksum(
        &mut self,
        ip4: &mut Ipv4Cache,
    ) -> result::Result<bool, ChecksumError> {
        let csum = match self.compute_checksum(ip4) {
            Ok(csum) => csum,
            Err(e) => {
                super::err!("unable to checksum TCP segment: {}", e);
                return Err(e);
            }
        };

        if csum == self.packet().csum {
            return Ok(false);
        }

        self.packet_mut().csum = csum;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow::FlowContext;
    use crate::engine::flow::PendingFlow;
    use crate::engine::ip4::Ipv4Meta;
    use swage_api::ActionKind;
    use swage_api::Ipv4Addr;

    fn segment() -> TcpMeta {
        TcpMeta {
            src: 49154,
            dst: 80,
            seq: 2511121667,
            ack: 754208397,
            flags: TcpFlags::ACK,
            window_size: 64436,
            csum: 0,
            urg: 0,
            options: vec![],
            payload: vec![],
        }
    }

    fn ip4_for(seg: &TcpMeta) -> Ipv4Cache {
        Ipv4Cache::new(Ipv4Meta {
            src: Ipv4Addr::from([10, 0, 0, 54]),
            dst: Ipv4Addr::from([52, 10, 128, 69]),
            proto: Protocol::TCP,
            total_len: 20 + (seg.hdr_len() + seg.payload.len()) as u16,
            ..Default::default()
        })
    }

    #[test]
    fn emit_no_opts() {
        let out = segment().emit().unwrap();
        assert_eq!(out.len(), 20);

        #[rustfmt::skip]
        let expected_bytes = vec![
            // source
            0xC0, 0x02,
            // dest
            0x00, 0x50,
            // seq
            0x95, 0xAC, 0xAD, 0x03,
            // ack
            0x2C, 0xF4, 0x4E, 0x8D,
            // offset + flags
            0x50, 0x10,
            // window
            0xFB, 0xB4,
            // checksum
            0x00, 0x00,
            // URG pointer
            0x00, 0x00,
        ];
        assert_eq!(expected_bytes, out);
    }

    #[test]
    fn emit_rejects_bad_options() {
        let mut seg = segment();
        seg.options = vec![0x01; 3];
        assert_eq!(seg.emit(), Err(EmitError::RaggedOptions(3)));

        seg.options = vec![0x01; 44];
        assert_eq!(seg.emit(), Err(EmitError::OversizeOptions(44)));
    }

    #[test]
    fn checksum_applied_then_stable() {
        let seg = segment();
        let mut ip4 = ip4_for(&seg);
        let mut cache = TcpCache::new(seg);

        // First pass: the stored checksum (zero) is stale.
        assert!(cache.update_checksum(&mut ip4).unwrap());
        let applied = cache.packet().csum;
        assert_ne!(applied, 0);

        // The applied checksum verifies...
        assert!(cache.verify_checksum(&mut ip4).unwrap());

        // ...and repeating the computation with unchanged inputs is a
        // no-op.
        assert!(!cache.update_checksum(&mut ip4).unwrap());
        assert_eq!(cache.packet().csum, applied);
    }

    #[test]
    fn checksum_tracks_address_rewrite() {
        let seg = segment();
        let mut ip4 = ip4_for(&seg);
        let mut cache = TcpCache::new(seg);

        cache.update_checksum(&mut ip4).unwrap();
        let before = cache.packet().csum;

        // A staged (not yet committed) source rewrite already feeds
        // the pseudo-header, so the checksum shifts even though no
        // port changed.
        ip4.set_src(Ipv4Addr::from([192, 168, 2, 1]));
        assert!(cache.update_checksum(&mut ip4).unwrap());
        assert_ne!(cache.packet().csum, before);
        assert!(cache.verify_checksum(&mut ip4).unwrap());
    }

    #[test]
    fn port_commit_reconciles_actions() {
        let mut cache = TcpCache::new(segment());
        let mut ctx = PendingFlow::new();
        ctx.add_match_field(MatchField::L4Dst);
        ctx.push_action(ActionKind::SetL4Dst);
        ctx.push_action(ActionKind::SetL4Src);

        cache.set_src_port(8080);
        cache.set_dst_port(80);

        assert!(cache.commit(&mut ctx));
        // Source changed: applied, action kept. Destination staged to
        // its original value and pinned by the match: action dropped.
        assert_eq!(cache.packet().src, 8080);
        assert_eq!(cache.packet().dst, 80);
        assert_eq!(ctx.actions(), [ActionKind::SetL4Src]);
        assert!(ctx.has_match_field(MatchField::EtherType));
        assert!(ctx.has_match_field(MatchField::IpProto));
    }

    #[test]
    fn fork_shares_nothing_mutable() {
        let mut h1 = TcpCache::new(segment());
        let mut h2 = h1.fork();

        h2.set_src_port(1234);
        assert_eq!(h1.src_port(), 49154);

        let mut ctx1 = PendingFlow::new();
        let mut ctx2 = PendingFlow::new();
        assert!(!h1.commit(&mut ctx1));
        assert!(h2.commit(&mut ctx2));
        assert_eq!(h1.packet().src, 49154);
        assert_eq!(h2.packet().src, 1234);
    }
}
