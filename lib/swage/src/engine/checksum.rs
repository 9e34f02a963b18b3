// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum.
//!
//! This module implements the one's complement sum of RFC 1071 as a
//! rolling accumulator: bytes are folded in two at a time as 16-bit
//! big-endian words, carries are accumulated in the upper bits of a
//! `u32`, and only [`Checksum::finalize`] folds them back down. The
//! L4 caches feed it the IPv4 pseudo-header followed by the
//! serialized segment.
//!
//! The words are read big-endian because the engine traffics in
//! logical field values (`u16` ports, lengths, checksums) rather than
//! raw header slices; the serialized segments produced by the `emit`
//! routines are always in network order, so interpreting pairs
//! big-endian yields the checksum as the logical value of the header
//! field. See RFC 1071 §1.B for why the fold itself is byte-order
//! independent.
//!
//! # Relevant RFCs
//!
//! * 1071 Computing the Internet Checksum
//!
//! * 1624 Computation of the Internet Checksum via Incremental Update

/// A rolling one's complement checksum calculation.
///
/// Summing is cheap; the carries accumulated past bit 16 are only
/// folded down when the finalized sum is needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    /// Creates a new checksum counter.
    pub fn new() -> Self {
        Self::from(0)
    }

    /// Create a new rolling checksum, starting with the passed in
    /// `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: csum_add(0, bytes) }
    }

    /// Update the sum by adding the contents of `bytes`.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_add(self.inner, bytes);
    }

    /// Finalize the sum by folding the accumulated carries back into
    /// the low 16 bits and returning the resulting value.
    ///
    /// Note that this is the plain sum; callers storing a checksum
    /// into a header want its one's complement.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

impl From<u32> for Checksum {
    fn from(csum: u32) -> Self {
        Self { inner: csum }
    }
}

fn csum_add(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut len = bytes.len();
    let mut pos = 0;

    while len > 1 {
        csum += u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as u32;
        pos += 2;
        len -= 2;
    }

    // A trailing lone byte is summed as if the data were padded with
    // a zero octet.
    if len == 1 {
        csum += u16::from_be_bytes([bytes[pos], 0]) as u32;
    }

    csum
}
