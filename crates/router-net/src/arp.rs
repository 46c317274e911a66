//! ARP resolution and the pending-packet queue (spec.md §4.2).
//!
//! The cache and the outstanding-request list share a single mutex, matching
//! the concurrency model of spec.md §5: every public operation takes the
//! lock once, and anything handed back across the lock boundary (a cache
//! hit, a frame to transmit) is an owned copy.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use router_core::{Interface, MacAddr};
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Ipv4Address,
};

use crate::frame_io::TxFrame;
use crate::ETHERNET_HEADER_LEN;

/// Lifetime of a learned cache entry (spec.md §3).
pub const CACHE_TTL: Duration = Duration::from_secs(15);
/// Cadence of ARP retry broadcasts (spec.md §4.2).
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Requests are abandoned after this many broadcasts go unanswered.
pub const MAX_ATTEMPTS: u8 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ArpCacheEntry {
    pub mac: MacAddr,
    pub inserted: Instant,
}

impl ArpCacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted) > CACHE_TTL
    }
}

/// A datagram held pending ARP resolution.
///
/// `frame` is a complete Ethernet frame (14-byte header + IP datagram) with
/// the destination MAC left zeroed; once the next hop resolves we patch
/// bytes `0..6` in place and transmit. `interface` is where it must go out.
struct PendingDatagram {
    frame: Vec<u8>,
    interface: String,
}

struct ArpRequest {
    interface: String,
    pending: Vec<PendingDatagram>,
    times_sent: u8,
    last_sent: Instant,
}

struct ArpState {
    cache: HashMap<Ipv4Addr, ArpCacheEntry>,
    requests: HashMap<Ipv4Addr, ArpRequest>,
}

/// A datagram whose ARP resolution was exhausted; the caller is expected to
/// originate an ICMP host-unreachable (type 3, code 1) back to its source.
pub struct ExhaustedDatagram {
    /// The original IP datagram (no Ethernet header).
    pub ip_bytes: Vec<u8>,
}

/// Outcome of a periodic sweep (spec.md §4.2's "periodic sweep").
#[derive(Default)]
pub struct SweepResult {
    pub retries: Vec<TxFrame>,
    pub exhausted: Vec<ExhaustedDatagram>,
}

pub struct ArpTable {
    state: Mutex<ArpState>,
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ArpState {
                cache: HashMap::new(),
                requests: HashMap::new(),
            }),
        }
    }

    /// Returns a snapshot of the cache entry for `ip`, if present and not
    /// expired. Expiration here is best-effort: a stale entry may still be
    /// returned within the same second (spec.md §4.2).
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let state = self.state.lock().unwrap();
        state.cache.get(&ip).map(|entry| entry.mac)
    }

    /// Record a learned `(sender_ip -> sender_mac)` binding and drain any
    /// request outstanding for it. The caller has already verified the ARP
    /// reply's target protocol address matches one of our interfaces.
    pub fn learn_reply(&self, sender_ip: Ipv4Addr, sender_mac: MacAddr) -> Vec<TxFrame> {
        let mut state = self.state.lock().unwrap();
        state.cache.insert(
            sender_ip,
            ArpCacheEntry {
                mac: sender_mac,
                inserted: Instant::now(),
            },
        );

        let Some(request) = state.requests.remove(&sender_ip) else {
            return Vec::new();
        };

        request
            .pending
            .into_iter()
            .map(|mut pending| {
                pending.frame[0..6].copy_from_slice(&sender_mac.octets());
                TxFrame::new(pending.interface, pending.frame)
            })
            .collect()
    }

    /// Queue `frame` (a full Ethernet frame with a zeroed destination MAC)
    /// for transmission on `interface` once `next_hop` resolves.
    ///
    /// Returns the first ARP broadcast to send immediately if this created a
    /// brand new outstanding request; `None` if a request was already in
    /// flight for this next hop.
    pub fn enqueue(
        &self,
        next_hop: Ipv4Addr,
        interface: &Interface,
        frame: Vec<u8>,
    ) -> Option<TxFrame> {
        let mut state = self.state.lock().unwrap();

        if let Some(request) = state.requests.get_mut(&next_hop) {
            request.pending.push(PendingDatagram {
                frame,
                interface: interface.name.clone(),
            });
            return None;
        }

        let request_frame = build_request_frame(interface, next_hop);
        state.requests.insert(
            next_hop,
            ArpRequest {
                interface: interface.name.clone(),
                pending: vec![PendingDatagram {
                    frame,
                    interface: interface.name.clone(),
                }],
                times_sent: 1,
                last_sent: Instant::now(),
            },
        );
        Some(TxFrame::new(interface.name.clone(), request_frame))
    }

    /// Run one periodic sweep: retry requests due for another broadcast,
    /// and destroy (with host-unreachable fallout) requests that have
    /// exhausted their attempts.
    pub fn sweep(&self, now: Instant, interfaces: &HashMap<String, Interface>) -> SweepResult {
        let mut state = self.state.lock().unwrap();
        state.cache.retain(|_, entry| !entry.is_expired(now));

        let mut result = SweepResult::default();
        let exhausted_keys: Vec<Ipv4Addr> = state
            .requests
            .iter()
            .filter(|(_, req)| req.times_sent >= MAX_ATTEMPTS)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in exhausted_keys {
            if let Some(request) = state.requests.remove(&ip) {
                for pending in request.pending {
                    // frame[14..] is the original IP datagram, no Ethernet header.
                    result.exhausted.push(ExhaustedDatagram {
                        ip_bytes: pending.frame[14..].to_vec(),
                    });
                }
            }
        }

        for (ip, request) in state.requests.iter_mut() {
            if now.duration_since(request.last_sent) >= RETRY_INTERVAL {
                if let Some(iface) = interfaces.get(&request.interface) {
                    result
                        .retries
                        .push(TxFrame::new(iface.name.clone(), build_request_frame(iface, *ip)));
                    request.times_sent += 1;
                    request.last_sent = now;
                }
            }
        }

        result
    }
}

/// Build an ARP reply frame if `arp.target_protocol_addr` matches `iface`'s
/// IP; `None` otherwise (the caller dispatches only matching requests, but
/// this guard keeps the function total).
pub fn handle_request(iface: &Interface, arp: &ArpRepr) -> Option<TxFrame> {
    let ArpRepr::EthernetIpv4 {
        source_hardware_addr,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = *arp
    else {
        return None;
    };

    if target_protocol_addr != Ipv4Address::from(iface.ip) {
        return None;
    }

    let reply = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress(iface.mac.octets()),
        source_protocol_addr: Ipv4Address::from(iface.ip),
        target_hardware_addr: source_hardware_addr,
        target_protocol_addr: source_protocol_addr,
    };

    Some(TxFrame::new(
        iface.name.clone(),
        emit_arp_frame(iface, &reply, source_hardware_addr),
    ))
}

fn build_request_frame(iface: &Interface, target_ip: Ipv4Addr) -> Vec<u8> {
    let request = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(iface.mac.octets()),
        source_protocol_addr: Ipv4Address::from(iface.ip),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: Ipv4Address::from(target_ip),
    };
    emit_arp_frame(iface, &request, EthernetAddress::BROADCAST)
}

fn emit_arp_frame(iface: &Interface, arp: &ArpRepr, dst_mac: EthernetAddress) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(iface.mac.octets()),
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + arp.buffer_len()];
    let mut eth_frame = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut eth_frame);

    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp.emit(&mut arp_packet);

    buf
}
