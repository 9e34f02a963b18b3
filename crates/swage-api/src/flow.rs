// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow-model vocabulary.
//!
//! These identifiers name the packet attributes a flow rule can match
//! on and the kinds of rewrite actions a flow can carry. They are the
//! currency between the header caches and the surrounding flow
//! machinery; the caches only ever talk about matches and actions in
//! these terms.

use crate::ip::AddrFamilyError;
use crate::ip::IpAddr;
use crate::ip::Ipv4Addr;
use crate::ip::Protocol;
use crate::mac::MacAddr;
use core::result;
use serde::Deserialize;
use serde::Serialize;

/// A single packet attribute a flow rule can match on.
///
/// The transport slots follow the OpenFlow 1.0 convention: `L4Src`
/// and `L4Dst` carry TCP/UDP ports for TCP and UDP flows, and ICMP
/// type/code for ICMP flows. The flow's `IpProto` match disambiguates.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum MatchField {
    EtherSrc,
    EtherDst,
    EtherType,
    Vlan,
    VlanPcp,
    Ip4Src,
    Ip4Dst,
    Dscp,
    IpProto,
    L4Src,
    L4Dst,
}

/// The kind of a pending rewrite action attached to a flow.
///
/// `SetL4Src`/`SetL4Dst` shadow the transport match slots: for an ICMP
/// flow they rewrite type and code.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ActionKind {
    SetEtherSrc,
    SetEtherDst,
    SetVlanPcp,
    SetIp4Src,
    SetIp4Dst,
    SetDscp,
    SetL4Src,
    SetL4Dst,
}

/// Packet attributes pinned by a flow match, in simplified record
/// form.
///
/// Fields are `None` until a header cache writes them. The caches
/// always populate a match from pre-modification values: a match
/// describes the packet as it arrived, never as it will leave.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowMatch {
    pub ether_src: Option<MacAddr>,
    pub ether_dst: Option<MacAddr>,
    pub ether_type: Option<u16>,
    pub vlan: Option<u16>,
    pub vlan_pcp: Option<u8>,
    pub ip_src: Option<IpAddr>,
    pub ip_dst: Option<IpAddr>,
    pub dscp: Option<u8>,
    pub ip_proto: Option<Protocol>,
    pub l4_src: Option<u16>,
    pub l4_dst: Option<u16>,
}

impl FlowMatch {
    /// The IPv4 source match, if any.
    ///
    /// Fails when a non-IPv4 address was pinned; for a match populated
    /// by the IPv4 cache that is a caller programming error.
    pub fn ipv4_src(
        &self,
    ) -> result::Result<Option<Ipv4Addr>, AddrFamilyError> {
        self.ip_src.map(Ipv4Addr::try_from).transpose()
    }

    /// The IPv4 destination match, if any.
    pub fn ipv4_dst(
        &self,
    ) -> result::Result<Option<Ipv4Addr>, AddrFamilyError> {
        self.ip_dst.map(Ipv4Addr::try_from).transpose()
    }
}
