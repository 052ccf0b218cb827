// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Ethernet/IPv4 ARP frame, as read from and written to a raw ARP
//! socket, and the conflict classification rule from [RFC 5227 section 2.1].
//!
//! [RFC 5227 section 2.1]: https://datatracker.ietf.org/doc/html/rfc5227#section-2.1

use net_types::ethernet::Mac;
use net_types::ip::{Ip as _, Ipv4, Ipv4Addr};
use net_types::{SpecifiedAddr, UnicastAddr, Witness as _};
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Length in bytes of an Ethernet/IPv4 ARP frame as delivered by a raw ARP
/// socket (no link-layer header).
pub const ARP_FRAME_LEN: usize = core::mem::size_of::<ArpFrame>();

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;

/// An Ethernet/IPv4 ARP frame.
///
/// Conflict detection only ever transmits the two request shapes from RFC
/// 5227: probes ([`ArpFrame::probe`]) and gratuitous announcements
/// ([`ArpFrame::announcement`]).
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct ArpFrame {
    htype: U16<NetworkEndian>,
    ptype: U16<NetworkEndian>,
    hlen: u8,
    plen: u8,
    op: U16<NetworkEndian>,
    sha: [u8; 6],
    spa: [u8; 4],
    tha: [u8; 6],
    tpa: [u8; 4],
}

impl ArpFrame {
    pub(crate) fn request(sha: Mac, spa: Ipv4Addr, tpa: Ipv4Addr) -> ArpFrame {
        ArpFrame {
            htype: U16::new(ARP_HTYPE_ETHERNET),
            ptype: U16::new(ARP_PTYPE_IPV4),
            hlen: 6,
            plen: 4,
            op: U16::new(ARP_OP_REQUEST),
            sha: sha.bytes(),
            spa: spa.ipv4_bytes(),
            tha: [0; 6],
            tpa: tpa.ipv4_bytes(),
        }
    }

    /// Builds an ARP probe for `address`: an ARP request with an all-zeroes
    /// sender protocol address, asking whether anyone holds the candidate
    /// without polluting neighbor caches with a claim.
    pub fn probe(mac: UnicastAddr<Mac>, address: SpecifiedAddr<Ipv4Addr>) -> ArpFrame {
        ArpFrame::request(mac.get(), Ipv4::UNSPECIFIED_ADDRESS, address.get())
    }

    /// Builds a gratuitous ARP announcement for `address`: an ARP request
    /// with sender and target protocol address both set to the candidate,
    /// claiming (or defending) it.
    pub fn announcement(mac: UnicastAddr<Mac>, address: SpecifiedAddr<Ipv4Addr>) -> ArpFrame {
        ArpFrame::request(mac.get(), address.get(), address.get())
    }

    /// Parses a frame from exactly [`ARP_FRAME_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Option<ArpFrame> {
        ArpFrame::read_from(bytes)
    }

    /// The sender protocol address.
    pub fn sender_protocol_address(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.spa)
    }

    /// The target protocol address.
    pub fn target_protocol_address(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.tpa)
    }

    /// The sender hardware address.
    pub fn sender_hardware_address(&self) -> Mac {
        Mac::new(self.sha)
    }

    /// Returns whether this frame is a conflicting use of `address`.
    ///
    /// Per RFC 5227 a conflict is a frame whose sender protocol address
    /// equals the candidate. A frame that merely names the candidate as its
    /// target is somebody asking about the address, not using it, and is
    /// never a conflict on its own. (While the detector has not yet bound
    /// the address it does treat such frames as conflicts, but that decision
    /// rests on the socket filter contract, not on this classifier; see
    /// [`crate::socket::ArpSocketContext::open_raw_arp_socket`].)
    pub fn conflicts_with(&self, address: SpecifiedAddr<Ipv4Addr>) -> bool {
        self.sender_protocol_address() == address.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: Mac = Mac::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
    const ADDR: Ipv4Addr = Ipv4Addr::new([169, 254, 5, 7]);
    const OTHER_ADDR: Ipv4Addr = Ipv4Addr::new([169, 254, 5, 8]);

    fn mac() -> UnicastAddr<Mac> {
        UnicastAddr::new(MAC).unwrap()
    }

    fn addr() -> SpecifiedAddr<Ipv4Addr> {
        SpecifiedAddr::new(ADDR).unwrap()
    }

    #[test]
    fn probe_layout() {
        let frame = ArpFrame::probe(mac(), addr());
        assert_eq!(
            frame.as_bytes(),
            [
                0x00, 0x01, // htype: Ethernet
                0x08, 0x00, // ptype: IPv4
                6, 4, // hlen, plen
                0x00, 0x01, // op: request
                0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, // sha
                0, 0, 0, 0, // spa: unspecified
                0, 0, 0, 0, 0, 0, // tha
                169, 254, 5, 7, // tpa
            ]
        );
    }

    #[test]
    fn announcement_layout() {
        let frame = ArpFrame::announcement(mac(), addr());
        assert_eq!(frame.sender_hardware_address(), MAC);
        assert_eq!(frame.sender_protocol_address(), ADDR);
        assert_eq!(frame.target_protocol_address(), ADDR);
    }

    #[test]
    fn parse_requires_exact_length() {
        let bytes = ArpFrame::announcement(mac(), addr()).as_bytes().to_vec();
        assert_eq!(bytes.len(), ARP_FRAME_LEN);
        assert_eq!(ArpFrame::parse(&bytes), Some(ArpFrame::announcement(mac(), addr())));
        assert_eq!(ArpFrame::parse(&bytes[..ARP_FRAME_LEN - 1]), None);
        let mut long = bytes;
        long.push(0);
        assert_eq!(ArpFrame::parse(&long), None);
    }

    #[test]
    fn sender_match_is_a_conflict() {
        let frame = ArpFrame::announcement(mac(), addr());
        assert!(frame.conflicts_with(addr()));
        assert!(!frame.conflicts_with(SpecifiedAddr::new(OTHER_ADDR).unwrap()));
    }

    #[test]
    fn target_only_match_is_not_a_conflict() {
        // A probe for our address carries an unspecified sender, so the
        // classifier alone does not call it a conflict.
        let frame = ArpFrame::probe(mac(), addr());
        assert!(!frame.conflicts_with(addr()));
    }
}
