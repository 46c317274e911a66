//! Frame admission and classification (spec.md §4.1).
//!
//! A frame that is too short to be a valid Ethernet header, addressed to
//! neither the broadcast address nor the receiving interface, or carrying
//! an ethertype we don't speak, is dropped here before it ever reaches a
//! protocol handler.

use router_core::{Interface, MacAddr};
use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

/// What an inbound Ethernet frame turned out to carry, once it passed the
/// admission checks.
pub enum Classification<'a> {
    Arp(&'a [u8]),
    Ipv4(&'a [u8]),
}

/// Validate and classify one inbound frame. `ingress` is the interface it
/// arrived on, used to decide whether the destination MAC is ours. Returns
/// the frame's source MAC alongside the classification; `None` means drop.
pub fn classify<'a>(ingress: &Interface, frame: &'a [u8]) -> Option<(MacAddr, Classification<'a>)> {
    let eth_frame = EthernetFrame::new_checked(frame).ok()?;

    let dst = eth_frame.dst_addr();
    let is_broadcast = dst == EthernetAddress::BROADCAST;
    let is_ours = dst == EthernetAddress(ingress.mac.octets());
    if !is_broadcast && !is_ours {
        return None;
    }

    let src = MacAddr(eth_frame.src_addr().0);
    let classification = match eth_frame.ethertype() {
        EthernetProtocol::Arp => Classification::Arp(eth_frame.payload()),
        EthernetProtocol::Ipv4 => Classification::Ipv4(eth_frame.payload()),
        _ => return None,
    };

    Some((src, classification))
}
