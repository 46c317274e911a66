//! IPv4 validation, local delivery, and the forwarding path (spec.md §4.3).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use router_core::{Interface, MacAddr, Route};
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4DstUnreachable,
    IpProtocol, Ipv4Packet, TcpPacket,
};

use crate::arp::ArpTable;
use crate::frame_io::TxFrame;
use crate::icmp::{self, IpIdGenerator};
use crate::nat::{InboundOutcome, NatEngine, OutboundOutcome};
use crate::route::RoutingTable;
use crate::ETHERNET_HEADER_LEN;

/// Everything the forwarding engine needs to resolve a route and an
/// outgoing MAC address; borrowed for the lifetime of one datagram.
pub struct ForwardContext<'a> {
    pub interfaces: &'a HashMap<String, Interface>,
    pub routes: &'a RoutingTable,
    pub arp: &'a ArpTable,
    pub id_gen: &'a IpIdGenerator,
}

/// Process one inbound IPv4 datagram (no Ethernet header) that arrived on
/// `ingress` from `eth_src_mac`. Returns whatever frames must be transmitted
/// as a result; an empty vec means the datagram was silently dropped.
pub fn process_datagram(
    ctx: &ForwardContext,
    nat: Option<&NatEngine>,
    ingress: &Interface,
    eth_src_mac: MacAddr,
    ip_bytes: &[u8],
) -> Vec<TxFrame> {
    let Ok(packet) = Ipv4Packet::new_checked(ip_bytes) else {
        return Vec::new();
    };
    if packet.version() != 4 {
        return Vec::new();
    }
    if !packet.verify_checksum() {
        tracing::debug!(src = %packet.src_addr(), "dropping ipv4 datagram with bad header checksum");
        return Vec::new();
    }

    let dst_addr = packet.dst_addr();

    if let Some(nat) = nat {
        if ingress.name != nat.internal_interface() {
            // The internal interface's address is never meant to be
            // reachable from outside; a packet claiming it as destination
            // is either misrouted or hostile, and gets no response at all
            // (spec.md §4.5).
            if let Some(internal_iface) = ctx.interfaces.get(nat.internal_interface()) {
                if dst_addr == internal_iface.ip {
                    tracing::debug!(%dst_addr, "dropping externally sourced datagram addressed to the internal interface");
                    return Vec::new();
                }
            }

            // A packet addressed to our external-facing IP might be an
            // inbound reply to a NAT'd flow rather than traffic meant for
            // the router itself; try translating it before falling back to
            // local delivery (spec.md §4.5.1, §4.5.2). `nat` is passed as
            // `None` to the recursive forward so it isn't translated a
            // second time.
            if ctx.interfaces.values().any(|iface| iface.ip == dst_addr) {
                let mut translated = ip_bytes.to_vec();
                match nat.translate_inbound(&mut translated) {
                    InboundOutcome::Translated => {
                        let Ok(translated_packet) = Ipv4Packet::new_checked(&translated) else {
                            return Vec::new();
                        };
                        return forward(ctx, None, ingress, &translated, &translated_packet);
                    }
                    // No mapping recognizes this flow at all. For TCP a SYN
                    // still gets an honest port-unreachable by falling
                    // through to local delivery; anything else (including a
                    // non-SYN segment, which must be dropped, not answered)
                    // is silently dropped (spec.md §4.5.3, §7).
                    InboundOutcome::NoMapping => {
                        if packet.protocol() == IpProtocol::Tcp && !is_tcp_syn(packet.payload()) {
                            return Vec::new();
                        }
                    }
                    // A mapping matched but this packet itself warrants no
                    // response: a simultaneous-open SYN was queued, or an
                    // orphaned non-SYN segment was rejected (spec.md §4.5.3).
                    InboundOutcome::NoResponse => return Vec::new(),
                }
            }
        }
    }

    if ctx.interfaces.values().any(|iface| iface.ip == dst_addr) {
        return deliver_locally(ctx, ingress, eth_src_mac, &packet, ip_bytes);
    }

    if dst_addr.is_broadcast() {
        return Vec::new();
    }

    forward(ctx, nat, ingress, ip_bytes, &packet)
}

fn deliver_locally(
    ctx: &ForwardContext,
    ingress: &Interface,
    eth_src_mac: MacAddr,
    packet: &Ipv4Packet<&[u8]>,
    ip_bytes: &[u8],
) -> Vec<TxFrame> {
    let reply = match packet.protocol() {
        IpProtocol::Icmp => icmp::handle_echo_request(packet.src_addr(), packet.dst_addr(), packet.payload()),
        IpProtocol::Tcp | IpProtocol::Udp => icmp::dest_unreachable(
            ctx.id_gen,
            packet.dst_addr(),
            Icmpv4DstUnreachable::PortUnreachable,
            ip_bytes,
        ),
        _ => {
            tracing::debug!(protocol = ?packet.protocol(), "dropping unsupported protocol directed at router");
            None
        }
    };

    let Some(reply_ip_bytes) = reply else {
        return Vec::new();
    };

    // Locally originated responses reuse the receiving interface and reply
    // straight to the sender's learned MAC; they never need a route lookup
    // or ARP resolution because the sender just spoke to us.
    vec![encapsulate(ingress, eth_src_mac, reply_ip_bytes)]
}

fn forward(
    ctx: &ForwardContext,
    nat: Option<&NatEngine>,
    ingress: &Interface,
    ip_bytes: &[u8],
    packet: &Ipv4Packet<&[u8]>,
) -> Vec<TxFrame> {
    let original_src = packet.src_addr();
    let ttl = packet.hop_limit();
    let suppress_errors = should_suppress_error(ctx, packet);

    if ttl <= 1 {
        if suppress_errors {
            return Vec::new();
        }
        return originate_and_route(ctx, original_src, |responder_ip| {
            icmp::time_exceeded(ctx.id_gen, responder_ip, ip_bytes)
        });
    }

    let Some(route) = ctx.routes.lookup(packet.dst_addr()) else {
        if suppress_errors {
            return Vec::new();
        }
        return originate_and_route(ctx, original_src, |responder_ip| {
            icmp::dest_unreachable(ctx.id_gen, responder_ip, Icmpv4DstUnreachable::NetUnreachable, ip_bytes)
        });
    };

    if route.interface == ingress.name {
        // Routing back out the interface a packet arrived on almost always
        // means no real route exists; report it the same way as no route.
        if suppress_errors {
            return Vec::new();
        }
        return originate_and_route(ctx, original_src, |responder_ip| {
            icmp::dest_unreachable(ctx.id_gen, responder_ip, Icmpv4DstUnreachable::NetUnreachable, ip_bytes)
        });
    }

    let Some(egress) = ctx.interfaces.get(&route.interface) else {
        return Vec::new();
    };

    let mut owned = ip_bytes.to_vec();
    {
        let mut mutable = Ipv4Packet::new_unchecked(&mut owned);
        mutable.set_hop_limit(ttl - 1);
        mutable.fill_checksum();
    }

    // Outbound translation happens here, after the route is known, since it
    // needs the egress interface's IP as the new source address. Inbound
    // translation already ran in `process_datagram` before the route could
    // even be resolved against the real (post-translation) destination, so
    // `nat` is `None` on that call path and this block is skipped.
    if let Some(nat) = nat {
        if ingress.name == nat.internal_interface() {
            match nat.translate_outbound(&mut owned, egress.ip) {
                OutboundOutcome::Translated | OutboundOutcome::NotTracked => {}
                // A tracked protocol (TCP, ICMP) produced nothing
                // forwardable for this packet - e.g. a non-SYN segment
                // with no open hole. Forwarding it untranslated would leak
                // the internal host's private address; spec.md §4.5.3
                // calls for a silent drop instead.
                OutboundOutcome::Rejected => return Vec::new(),
            }
        }
    }

    route_and_resolve(ctx, route, egress, owned)
}

/// Route `dst_for_route` to find an egress interface, hand its IP to `build`
/// to finish constructing the datagram (a self-originated ICMP error uses it
/// as its source address), then resolve the next hop and transmit.
fn originate_and_route(
    ctx: &ForwardContext,
    dst_for_route: Ipv4Addr,
    build: impl FnOnce(Ipv4Addr) -> Option<Vec<u8>>,
) -> Vec<TxFrame> {
    let Some(route) = ctx.routes.lookup(dst_for_route) else {
        return Vec::new();
    };
    let Some(egress) = ctx.interfaces.get(&route.interface) else {
        return Vec::new();
    };
    let Some(datagram) = build(egress.ip) else {
        return Vec::new();
    };

    route_and_resolve(ctx, route, egress, datagram)
}

/// Build and route an ICMP host-unreachable back to `ip_bytes`' source.
/// Called when ARP resolution for a datagram queued in the ARP table is
/// exhausted (spec.md §4.2, §4.4). A datagram queued in the ARP table may
/// already be NAT-translated (outbound translation runs before the route's
/// next hop is resolved), in which case its source reads as the router's
/// own external address rather than the real internal host; `nat` lets the
/// translation be undone so the error reaches the host that actually sent
/// it (spec.md §4.5.4).
pub fn host_unreachable_for_arp_failure(ctx: &ForwardContext, nat: Option<&NatEngine>, ip_bytes: &[u8]) -> Vec<TxFrame> {
    let owned;
    let ip_bytes = match nat {
        Some(nat) => {
            owned = {
                let mut buf = ip_bytes.to_vec();
                nat.undo_outbound_translation(&mut buf);
                buf
            };
            owned.as_slice()
        }
        None => ip_bytes,
    };

    let Ok(packet) = Ipv4Packet::new_checked(ip_bytes) else {
        return Vec::new();
    };
    if should_suppress_error(ctx, &packet) {
        return Vec::new();
    }

    originate_and_route(ctx, packet.src_addr(), |responder_ip| {
        icmp::dest_unreachable(ctx.id_gen, responder_ip, Icmpv4DstUnreachable::HostUnreachable, ip_bytes)
    })
}

/// Build and route an ICMP port-unreachable back to the source of an
/// unsolicited inbound TCP SYN that the NAT engine queued hoping for a
/// simultaneous open, once that queued SYN has aged out unclaimed
/// (spec.md §4.5.5).
pub fn port_unreachable_for_aged_nat_syn(ctx: &ForwardContext, ip_bytes: &[u8]) -> Vec<TxFrame> {
    let Ok(packet) = Ipv4Packet::new_checked(ip_bytes) else {
        return Vec::new();
    };
    if should_suppress_error(ctx, &packet) {
        return Vec::new();
    }

    originate_and_route(ctx, packet.src_addr(), |responder_ip| {
        icmp::dest_unreachable(ctx.id_gen, responder_ip, Icmpv4DstUnreachable::PortUnreachable, ip_bytes)
    })
}

fn route_and_resolve(ctx: &ForwardContext, route: &Route, egress: &Interface, ip_bytes: Vec<u8>) -> Vec<TxFrame> {
    let dst_addr = Ipv4Packet::new_unchecked(&ip_bytes).dst_addr();
    let next_hop = if route.gateway.is_unspecified() {
        dst_addr
    } else {
        route.gateway
    };

    if let Some(mac) = ctx.arp.lookup(next_hop) {
        return vec![encapsulate(egress, mac, ip_bytes)];
    }

    let pending_frame = build_pending_frame(egress, ip_bytes);
    match ctx.arp.enqueue(next_hop, egress, pending_frame) {
        Some(broadcast) => vec![broadcast],
        None => Vec::new(),
    }
}

/// Don't generate an ICMP error in response to unrouteable/unicast-only
/// traffic, traffic that is itself one of our own interfaces', or an ICMP
/// message that is itself an error (spec.md §4.3, §4.4's
/// no-error-about-an-error rule): a datagram with no real source, one this
/// router itself originated, or an ICMP error, never gets an error of its
/// own.
fn should_suppress_error(ctx: &ForwardContext, packet: &Ipv4Packet<&[u8]>) -> bool {
    let src = packet.src_addr();
    if src.is_unspecified() || src.is_broadcast() {
        return true;
    }
    if ctx.interfaces.values().any(|iface| iface.ip == src) {
        return true;
    }
    if packet.protocol() == IpProtocol::Icmp {
        if let Some(&msg_type) = packet.payload().first() {
            // 0 = echo reply, 8 = echo request; anything else is an error.
            return msg_type != 0 && msg_type != 8;
        }
    }
    false
}

/// Whether a TCP segment's payload has SYN set. An unparseable segment is
/// treated as non-SYN, so it gets silently dropped rather than answered.
fn is_tcp_syn(tcp_bytes: &[u8]) -> bool {
    TcpPacket::new_checked(tcp_bytes).map(|tcp| tcp.syn()).unwrap_or(false)
}

fn encapsulate(iface: &Interface, dst_mac: MacAddr, ip_bytes: Vec<u8>) -> TxFrame {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(iface.mac.octets()),
        dst_addr: EthernetAddress(dst_mac.octets()),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_bytes.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(&ip_bytes);
    TxFrame::new(iface.name.clone(), buf)
}

fn build_pending_frame(egress: &Interface, ip_bytes: Vec<u8>) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(egress.mac.octets()),
        dst_addr: EthernetAddress([0; 6]),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_bytes.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(&ip_bytes);
    buf
}
