// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! UDP headers.

use super::ip4::Ipv4Cache;
use super::l4::ChecksumError;
use super::l4::EmitError;
use super::l4::L4Cache;
use super::l4::PortHeader;
use alloc::vec::Vec;
use core::result;
use swage_api::MatchField;
use swage_api::Protocol;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub const UDP_HDR_LEN: usize = 8;
pub const UDP_CSUM_OFFSET: usize = 6;

/// A transmitted UDP checksum of zero means the sender never computed
/// one.
pub const UDP_CSUM_DISABLED: u16 = 0;

/// A decoded UDP datagram, as handed over by the wire decoder.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UdpMeta {
    pub src: u16,
    pub dst: u16,
    pub csum: u16,
    pub payload: Vec<u8>,
}

impl UdpMeta {
    /// The length field: header plus payload.
    pub fn total_len(&self) -> usize {
        UDP_HDR_LEN + self.payload.len()
    }
}

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
struct UdpHdrRaw {
    src_port: [u8; 2],
    dst_port: [u8; 2],
    length: [u8; 2],
    csum: [u8; 2],
}

impl PortHeader for UdpMeta {
    const PROTO: Protocol = Protocol::UDP;
    const CSUM_OFFSET: usize = UDP_CSUM_OFFSET;
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
        let total_len = self.total_len();
        let length = u16::try_from(total_len)
            .map_err(|_| EmitError::SegmentTooLong(total_len))?;

        let raw = UdpHdrRaw {
            src_port: self.src.to_be_bytes(),
            dst_port: self.dst.to_be_bytes(),
            length: length.to_be_bytes(),
            csum: self.csum.to_be_bytes(),
        };

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(raw.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Copy-on-write cache over one decoded UDP datagram.
pub type UdpCache = L4Cache<UdpMeta>;

impl L4Cache<UdpMeta> {
    /// Recompute the datagram checksum and apply it if it disagrees
    /// with the stored one.
    ///
    /// UDP checksums are optional: a stored value of
    /// [`UDP_CSUM_DISABLED`] means the sender never computed one, and
    /// it must stay that way. When we do compute, the all-zero result
    /// is reserved for the disabled case, so it is sent as its
    /// complement instead.
    pub fn update_checksum(
        &mut self,
        ip4: &mut Ipv4Cache,
    ) -> result::Result<bool, ChecksumError> {
        if self.packet().csum == UDP_CSUM_DISABLED {
            return Ok(false);
        }

        let mut csum = match self.compute_checksum(ip4) {
            Ok(csum) => csum,
            Err(e) => {
                super::err!("unable to checksum UDP datagram: {}", e);
                return Err(e);
            }
        };

        if csum == UDP_CSUM_DISABLED {
            csum = !csum;
        }

        if csum == self.packet().csum {
            return Ok(false);
        }

        self.packet_mut().csum = csum;
        Ok(true)
    }
}
