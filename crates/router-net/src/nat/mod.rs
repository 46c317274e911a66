//! The NAT translation engine (spec.md §4.5).
//!
//! [`NatEngine`] owns the mapping/connection table and the external port
//! allocators behind a single [`Mutex`], so every public operation -
//! looking up or creating a mapping, advancing TCP state, aging out idle
//! entries - runs as one critical section. This is the restructuring
//! spec.md §9 calls for in place of a recursive mutex: nothing here ever
//! needs to re-enter the lock mid-operation.

mod aging;
mod mapping;
mod port_alloc;
mod translate;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Instant;

use router_core::NatConfig;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, TcpPacket};

pub use mapping::NatProtocol;

use mapping::{Connection, ExternalKey, InternalKey, Mapping, TcpConnState};
use port_alloc::PortAllocator;

/// Outcome of driving the inbound half of the TCP state machine for one
/// segment, distinguishing "no NAT state recognizes this external port at
/// all" from "a mapping matched but this segment itself produced nothing
/// forwardable" - the two require different caller-visible behavior
/// (spec.md §4.5.3, §7): the former answers a SYN with port-unreachable,
/// the latter (a queued simultaneous-open SYN, or an orphaned non-SYN
/// segment) stays silent.
enum InboundTcpOutcome {
    Translated(Ipv4Addr, u16),
    NoMapping,
    NoResponse,
}

/// Outcome of [`NatEngine::translate_outbound`].
pub enum OutboundOutcome {
    /// `ip_bytes` was rewritten to external addressing; forward it.
    Translated,
    /// This protocol isn't tracked by NAT at all (UDP); forward it as-is
    /// (spec.md §1's UDP NAT non-goal).
    NotTracked,
    /// A tracked protocol (TCP, ICMP) produced nothing forwardable: a TCP
    /// segment with no SYN and no open hole, an ICMP message that is
    /// neither an echo nor an error quoting a mapped flow, or the port
    /// range is exhausted. Drop silently (spec.md §4.5.3's "Outbound, no
    /// mapping, non-SYN: drop silently").
    Rejected,
}

/// Outcome of [`NatEngine::translate_inbound`].
pub enum InboundOutcome {
    /// `ip_bytes` was rewritten to internal addressing; forward it.
    Translated,
    /// No NAT state recognizes this flow. For ICMP this means "assume the
    /// ping is for the router itself"; for TCP it means "no hole exists"
    /// (spec.md §4.5.3: answer a SYN with port-unreachable).
    NoMapping,
    /// A mapping matched but this packet warrants no response at all: a
    /// simultaneous-open SYN was queued, or an orphaned non-SYN segment to
    /// an existing mapping with no matching connection was rejected
    /// (spec.md §4.5.3's "Inbound, non-SYN, mapping exists but no active
    /// connection: drop").
    NoResponse,
}

struct NatState {
    by_internal: HashMap<InternalKey, Mapping>,
    by_external: HashMap<ExternalKey, InternalKey>,
    allocators: HashMap<NatProtocol, PortAllocator>,
}

impl NatState {
    fn new(port_range_start: u16, port_range_end: u16) -> Self {
        let mut allocators = HashMap::new();
        for protocol in [NatProtocol::Tcp, NatProtocol::Icmp] {
            allocators.insert(protocol, PortAllocator::new(port_range_start, port_range_end));
        }
        Self {
            by_internal: HashMap::new(),
            by_external: HashMap::new(),
            allocators,
        }
    }

    fn in_use(&self, protocol: NatProtocol) -> HashSet<u16> {
        self.by_external
            .keys()
            .filter(|key| key.protocol == protocol)
            .map(|key| key.external_aux)
            .collect()
    }

    /// Endpoint-independent ICMP mapping: one external identifier per
    /// internal (ip, ident) pair, reused for every remote host it pings
    /// (spec.md §4.5.1).
    fn outbound_icmp(&mut self, internal_ip: Ipv4Addr, internal_aux: u16, now: Instant) -> Option<u16> {
        let key = InternalKey {
            protocol: NatProtocol::Icmp,
            internal_ip,
            internal_aux,
        };
        if let Some(mapping) = self.by_internal.get_mut(&key) {
            mapping.touch(now);
            return Some(mapping.external_aux);
        }

        let in_use = self.in_use(NatProtocol::Icmp);
        let external_aux = self.allocators.get_mut(&NatProtocol::Icmp)?.allocate(&in_use)?;
        self.by_internal.insert(
            key,
            Mapping {
                protocol: NatProtocol::Icmp,
                internal_ip,
                internal_aux,
                external_aux,
                last_updated: now,
                connections: Vec::new(),
            },
        );
        self.by_external.insert(
            ExternalKey {
                protocol: NatProtocol::Icmp,
                external_aux,
            },
            key,
        );
        Some(external_aux)
    }

    fn lookup_by_external(&mut self, protocol: NatProtocol, external_aux: u16, now: Instant) -> Option<(Ipv4Addr, u16)> {
        let key = *self.by_external.get(&ExternalKey { protocol, external_aux })?;
        let mapping = self.by_internal.get_mut(&key)?;
        mapping.touch(now);
        Some((mapping.internal_ip, mapping.internal_aux))
    }

    fn lookup_external_aux(&mut self, protocol: NatProtocol, internal_ip: Ipv4Addr, internal_aux: u16, now: Instant) -> Option<u16> {
        let mapping = self.by_internal.get_mut(&InternalKey {
            protocol,
            internal_ip,
            internal_aux,
        })?;
        mapping.touch(now);
        Some(mapping.external_aux)
    }

    /// Drive the outbound half of the TCP state machine (spec.md §4.5.3).
    /// A SYN opens a mapping (if none exists yet) and a connection record
    /// for the remote endpoint (if none exists yet); any other segment to
    /// an endpoint with no connection record is a packet for a hole that
    /// was never opened, and is rejected. Returns the allocated external
    /// port and, when this outbound SYN resolves a simultaneous-open race,
    /// the queued inbound SYN that can now be discarded.
    fn outbound_tcp(
        &mut self,
        internal_ip: Ipv4Addr,
        internal_aux: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        syn: bool,
        fin: bool,
        now: Instant,
    ) -> Option<(u16, Option<Vec<u8>>)> {
        let key = InternalKey {
            protocol: NatProtocol::Tcp,
            internal_ip,
            internal_aux,
        };

        if !self.by_internal.contains_key(&key) {
            if !syn {
                return None;
            }
            let in_use = self.in_use(NatProtocol::Tcp);
            let external_aux = self.allocators.get_mut(&NatProtocol::Tcp)?.allocate(&in_use)?;
            self.by_internal.insert(
                key,
                Mapping {
                    protocol: NatProtocol::Tcp,
                    internal_ip,
                    internal_aux,
                    external_aux,
                    last_updated: now,
                    connections: Vec::new(),
                },
            );
            self.by_external.insert(
                ExternalKey {
                    protocol: NatProtocol::Tcp,
                    external_aux,
                },
                key,
            );
        }

        let mapping = self.by_internal.get_mut(&key)?;
        mapping.touch(now);
        let external_aux = mapping.external_aux;

        let dropped = match mapping.find_connection_mut(remote_ip, remote_port) {
            Some(conn) => mapping::advance_on_outbound(conn, syn, fin, now),
            None => {
                if !syn {
                    return None;
                }
                mapping.open_connection(remote_ip, remote_port, TcpConnState::OutboundSyn, now);
                None
            }
        };

        Some((external_aux, dropped))
    }

    /// Drive the inbound half of the TCP state machine. A segment for a
    /// connection already in the table advances its state; an unsolicited
    /// SYN for a mapping that exists (but with no matching connection yet)
    /// opens an `INBOUND_SYN_PENDING` hole and queues the raw datagram,
    /// giving a matching outbound SYN a chance to arrive and claim it as a
    /// simultaneous open (spec.md §4.5.3). Any other unmatched segment is
    /// rejected.
    fn inbound_tcp(
        &mut self,
        external_aux: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        syn: bool,
        fin: bool,
        now: Instant,
        raw_ip_bytes: &[u8],
    ) -> InboundTcpOutcome {
        let Some(&key) = self.by_external.get(&ExternalKey {
            protocol: NatProtocol::Tcp,
            external_aux,
        }) else {
            return InboundTcpOutcome::NoMapping;
        };
        let Some(mapping) = self.by_internal.get_mut(&key) else {
            return InboundTcpOutcome::NoMapping;
        };
        mapping.touch(now);

        match mapping.find_connection_mut(remote_ip, remote_port) {
            Some(conn) => {
                mapping::advance_on_inbound(conn, syn, fin, now);
                InboundTcpOutcome::Translated(mapping.internal_ip, mapping.internal_aux)
            }
            None => {
                if syn && !fin {
                    let conn = mapping.open_connection(remote_ip, remote_port, TcpConnState::InboundSynPending, now);
                    conn.queued_inbound_syn = Some(raw_ip_bytes.to_vec());
                }
                InboundTcpOutcome::NoResponse
            }
        }
    }
}

/// NAT translation engine: mapping/connection tables, port allocation, and
/// the periodic aging sweep.
pub struct NatEngine {
    internal_interface: String,
    config: NatConfig,
    state: Mutex<NatState>,
}

impl NatEngine {
    pub fn new(config: NatConfig) -> Self {
        let state = NatState::new(config.port_range_start, config.port_range_end);
        Self {
            internal_interface: config.internal_interface.clone(),
            config,
            state: Mutex::new(state),
        }
    }

    pub fn internal_interface(&self) -> &str {
        &self.internal_interface
    }

    /// Translate an outbound datagram (already TTL-decremented by the
    /// forwarding engine) in place, allocating a new mapping on first sight
    /// of a flow. See [`OutboundOutcome`] for how the caller should react to
    /// each result: an untracked protocol (UDP) forwards as-is, a tracked
    /// protocol with nothing forwardable gets dropped rather than forwarded
    /// with its internal address still attached.
    pub fn translate_outbound(&self, ip_bytes: &mut [u8], external_ip: Ipv4Addr) -> OutboundOutcome {
        let now = Instant::now();
        let (protocol, internal_ip, header_len) = {
            let packet = Ipv4Packet::new_unchecked(&*ip_bytes);
            (packet.protocol(), packet.src_addr(), usize::from(packet.header_len()))
        };

        match protocol {
            IpProtocol::Icmp => {
                let Some(internal_aux) = read_icmp_echo_ident(&ip_bytes[header_len..]) else {
                    return if self.translate_outbound_embedded_error(ip_bytes, header_len, external_ip, now) {
                        OutboundOutcome::Translated
                    } else {
                        OutboundOutcome::Rejected
                    };
                };
                let external_aux = {
                    let mut state = self.state.lock().unwrap();
                    state.outbound_icmp(internal_ip, internal_aux, now)
                };
                let Some(external_aux) = external_aux else {
                    return OutboundOutcome::Rejected;
                };
                translate::rewrite_outbound(ip_bytes, external_ip, external_aux);
                OutboundOutcome::Translated
            }
            IpProtocol::Tcp => {
                let Ok(tcp) = TcpPacket::new_checked(&ip_bytes[header_len..]) else {
                    return OutboundOutcome::Rejected;
                };
                let internal_aux = tcp.src_port();
                let remote_port = tcp.dst_port();
                let (syn, fin) = (tcp.syn(), tcp.fin());
                let remote_ip = Ipv4Packet::new_unchecked(&*ip_bytes).dst_addr();

                let result = {
                    let mut state = self.state.lock().unwrap();
                    state.outbound_tcp(internal_ip, internal_aux, remote_ip, remote_port, syn, fin, now)
                };
                let Some((external_aux, _dropped_syn)) = result else {
                    return OutboundOutcome::Rejected;
                };
                translate::rewrite_outbound(ip_bytes, external_ip, external_aux);
                OutboundOutcome::Translated
            }
            _ => OutboundOutcome::NotTracked,
        }
    }

    /// Translate an inbound datagram in place using a mapping an earlier
    /// outbound translation created. See [`InboundOutcome`] for how the
    /// caller should react to each non-`Translated` result.
    pub fn translate_inbound(&self, ip_bytes: &mut [u8]) -> InboundOutcome {
        let now = Instant::now();
        let (protocol, header_len) = {
            let packet = Ipv4Packet::new_unchecked(&*ip_bytes);
            (packet.protocol(), usize::from(packet.header_len()))
        };

        match protocol {
            IpProtocol::Icmp => {
                if let Some(external_aux) = read_icmp_echo_ident(&ip_bytes[header_len..]) {
                    let resolved = {
                        let mut state = self.state.lock().unwrap();
                        state.lookup_by_external(NatProtocol::Icmp, external_aux, now)
                    };
                    let Some((internal_ip, internal_aux)) = resolved else {
                        return InboundOutcome::NoMapping;
                    };
                    translate::rewrite_inbound(ip_bytes, internal_ip, internal_aux);
                    return InboundOutcome::Translated;
                }

                let Some((internal_ip, internal_aux)) = self.try_translate_embedded_error(ip_bytes, header_len, now) else {
                    return InboundOutcome::NoMapping;
                };
                {
                    let icmp_bytes = &mut ip_bytes[header_len..];
                    translate::rewrite_embedded_source(icmp_bytes, internal_ip, internal_aux);
                }
                translate::rewrite_inbound(ip_bytes, internal_ip, internal_aux);
                InboundOutcome::Translated
            }
            IpProtocol::Tcp => {
                let Ok(tcp) = TcpPacket::new_checked(&ip_bytes[header_len..]) else {
                    return InboundOutcome::NoMapping;
                };
                let external_aux = tcp.dst_port();
                let remote_port = tcp.src_port();
                let (syn, fin) = (tcp.syn(), tcp.fin());
                let remote_ip = Ipv4Packet::new_unchecked(&*ip_bytes).src_addr();

                let outcome = {
                    let mut state = self.state.lock().unwrap();
                    state.inbound_tcp(external_aux, remote_ip, remote_port, syn, fin, now, ip_bytes)
                };
                match outcome {
                    InboundTcpOutcome::Translated(internal_ip, internal_aux) => {
                        translate::rewrite_inbound(ip_bytes, internal_ip, internal_aux);
                        InboundOutcome::Translated
                    }
                    InboundTcpOutcome::NoMapping => InboundOutcome::NoMapping,
                    InboundTcpOutcome::NoResponse => InboundOutcome::NoResponse,
                }
            }
            _ => InboundOutcome::NoMapping,
        }
    }

    /// Reverse a prior outbound translation this engine itself performed,
    /// rewriting `ip_bytes`' source back to the original internal identity.
    /// Used when the router must quote a datagram's pre-NAT form in a
    /// self-originated ICMP error - e.g. an ARP resolution failure for an
    /// already-translated datagram still queued for the internal host's
    /// true address, not the router's external one (spec.md §4.5.4).
    /// Returns `false` (leaving `ip_bytes` untouched) if it doesn't
    /// recognize the source as one of its own translations.
    pub fn undo_outbound_translation(&self, ip_bytes: &mut [u8]) -> bool {
        let now = Instant::now();
        let (protocol, header_len) = {
            let packet = Ipv4Packet::new_unchecked(&*ip_bytes);
            (packet.protocol(), usize::from(packet.header_len()))
        };
        let Some(nat_protocol) = NatProtocol::from_ip_protocol(protocol) else {
            return false;
        };
        let Some(external_aux) = read_icmp_echo_ident_or_tcp_src(protocol, &ip_bytes[header_len..]) else {
            return false;
        };

        let resolved = {
            let mut state = self.state.lock().unwrap();
            state.lookup_by_external(nat_protocol, external_aux, now)
        };
        let Some((internal_ip, internal_aux)) = resolved else {
            return false;
        };

        translate::rewrite_outbound(ip_bytes, internal_ip, internal_aux);
        true
    }

    /// An ICMP error returned by a remote host quotes the datagram that
    /// triggered it; if that quoted datagram's source endpoint matches one
    /// of our mappings, the error is about a connection an internal host
    /// opened and both the outer destination and the embedded source need
    /// rewriting (spec.md §4.5.2).
    fn try_translate_embedded_error(&self, ip_bytes: &[u8], header_len: usize, now: Instant) -> Option<(Ipv4Addr, u16)> {
        let caps = ChecksumCapabilities::default();
        let icmp_bytes = &ip_bytes[header_len..];
        let packet = Icmpv4Packet::new_checked(icmp_bytes).ok()?;
        let repr = Icmpv4Repr::parse(&packet, &caps).ok()?;

        let (embedded_protocol, embedded_data) = match repr {
            Icmpv4Repr::DstUnreachable { header, data, .. } => (header.next_header, data),
            Icmpv4Repr::TimeExceeded { header, data, .. } => (header.next_header, data),
            _ => return None,
        };

        let nat_protocol = NatProtocol::from_ip_protocol(embedded_protocol)?;
        let embedded_src_aux = read_embedded_source_aux(embedded_protocol, embedded_data)?;

        let mut state = self.state.lock().unwrap();
        state.lookup_by_external(nat_protocol, embedded_src_aux, now)
    }

    /// The symmetric outbound case: an internal host itself generated an
    /// ICMP error in response to an inbound, already-translated datagram
    /// addressed to it. The error's quoted header still names the internal
    /// host as destination; that needs to become the NAT's external
    /// identity so the remote host that triggered the error can match the
    /// reply to what it actually sent (spec.md §4.5.2).
    fn translate_outbound_embedded_error(&self, ip_bytes: &mut [u8], header_len: usize, external_ip: Ipv4Addr, now: Instant) -> bool {
        let caps = ChecksumCapabilities::default();
        let resolved = {
            let icmp_bytes = &ip_bytes[header_len..];
            let Ok(packet) = Icmpv4Packet::new_checked(icmp_bytes) else {
                return false;
            };
            let Ok(repr) = Icmpv4Repr::parse(&packet, &caps) else {
                return false;
            };
            let (embedded_protocol, embedded_data, embedded_dst_ip) = match repr {
                Icmpv4Repr::DstUnreachable { header, data, .. } => (header.next_header, data, header.dst_addr),
                Icmpv4Repr::TimeExceeded { header, data, .. } => (header.next_header, data, header.dst_addr),
                _ => return false,
            };
            let Some(nat_protocol) = NatProtocol::from_ip_protocol(embedded_protocol) else {
                return false;
            };
            let Some(embedded_dst_aux) = read_embedded_dest_aux(embedded_protocol, embedded_data) else {
                return false;
            };
            (nat_protocol, embedded_dst_ip, embedded_dst_aux)
        };
        let (nat_protocol, internal_ip, internal_aux) = resolved;

        let external_aux = {
            let mut state = self.state.lock().unwrap();
            state.lookup_external_aux(nat_protocol, internal_ip, internal_aux, now)
        };
        let Some(external_aux) = external_aux else {
            return false;
        };

        {
            let icmp_bytes = &mut ip_bytes[header_len..];
            translate::rewrite_embedded_dest(icmp_bytes, external_ip, external_aux);
        }
        translate::rewrite_outbound(ip_bytes, external_ip, external_aux);
        true
    }

    /// Run one aging sweep (spec.md §4.5.5): ICMP mappings age on their own
    /// last-use timestamp; TCP connections age individually by their own
    /// state's timeout, and a TCP mapping is evicted once its last
    /// connection is. Returns the raw datagrams of any `INBOUND_SYN_PENDING`
    /// connections that aged out with a queued SYN still unclaimed, so the
    /// caller can answer their sender with an ICMP port-unreachable.
    pub fn sweep(&self, now: Instant) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let mut expired_syns = Vec::new();
        let mut to_remove = Vec::new();

        for (key, mapping) in state.by_internal.iter_mut() {
            match mapping.protocol {
                NatProtocol::Icmp => {
                    if aging::is_icmp_mapping_expired(mapping, now, &self.config) {
                        to_remove.push(*key);
                    }
                }
                NatProtocol::Tcp => {
                    mapping.connections.retain_mut(|conn| {
                        let expired = aging::is_connection_expired(conn, now, &self.config);
                        if expired {
                            if let Some(bytes) = conn.queued_inbound_syn.take() {
                                expired_syns.push(bytes);
                            }
                        }
                        !expired
                    });
                    if mapping.connections.is_empty() {
                        to_remove.push(*key);
                    }
                }
            }
        }

        for key in to_remove {
            if let Some(mapping) = state.by_internal.remove(&key) {
                state.by_external.remove(&ExternalKey {
                    protocol: mapping.protocol,
                    external_aux: mapping.external_aux,
                });
            }
        }

        expired_syns
    }
}

/// Extract an ICMP echo's identifier, the only per-flow state this engine
/// tracks for ICMP; errors carry no identifier of their own and are handled
/// separately via the embedded-error path.
fn read_icmp_echo_ident(payload: &[u8]) -> Option<u16> {
    let caps = ChecksumCapabilities::default();
    let icmp = Icmpv4Packet::new_checked(payload).ok()?;
    match Icmpv4Repr::parse(&icmp, &caps).ok()? {
        Icmpv4Repr::EchoRequest { ident, .. } | Icmpv4Repr::EchoReply { ident, .. } => Some(ident),
        _ => None,
    }
}

/// The aux value a self-originated error's pre-translation datagram was
/// keyed by: an ICMP echo's identifier, or a TCP segment's source port.
fn read_icmp_echo_ident_or_tcp_src(protocol: IpProtocol, payload: &[u8]) -> Option<u16> {
    match protocol {
        IpProtocol::Icmp => read_icmp_echo_ident(payload),
        IpProtocol::Tcp => Some(TcpPacket::new_checked(payload).ok()?.src_port()),
        _ => None,
    }
}

fn read_embedded_source_aux(protocol: IpProtocol, data: &[u8]) -> Option<u16> {
    match protocol {
        IpProtocol::Tcp if data.len() >= 2 => Some(u16::from_be_bytes([data[0], data[1]])),
        IpProtocol::Icmp if data.len() >= 6 => Some(u16::from_be_bytes([data[4], data[5]])),
        _ => None,
    }
}

fn read_embedded_dest_aux(protocol: IpProtocol, data: &[u8]) -> Option<u16> {
    match protocol {
        IpProtocol::Tcp if data.len() >= 4 => Some(u16::from_be_bytes([data[2], data[3]])),
        IpProtocol::Icmp if data.len() >= 6 => Some(u16::from_be_bytes([data[4], data[5]])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{Icmpv4DstUnreachable, Icmpv4Repr, Ipv4Repr};
    use std::time::Duration;

    fn config() -> NatConfig {
        NatConfig {
            enabled: true,
            internal_interface: "eth1".to_string(),
            icmp_timeout_secs: 60,
            tcp_established_timeout_secs: 7440,
            tcp_transitory_timeout_secs: 300,
            port_range_start: 50000,
            port_range_end: 50002,
        }
    }

    fn build_icmp_echo(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, is_request: bool) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let data = [0xaa; 8];
        let repr = if is_request {
            Icmpv4Repr::EchoRequest { ident, seq_no: 1, data: &data }
        } else {
            Icmpv4Repr::EchoReply { ident, seq_no: 1, data: &data }
        };
        let ip_repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmp,
            payload_len: repr.buffer_len(),
            hop_limit: 64,
        };
        let mut buf = vec![0u8; ip_repr.buffer_len() + repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip_packet, &caps);
        let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        repr.emit(&mut icmp_packet, &caps);
        buf
    }

    const TCP_HEADER_LEN: usize = 20;

    fn build_tcp_segment(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, syn: bool, fin: bool, ack: bool) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let ip_repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Tcp,
            payload_len: TCP_HEADER_LEN,
            hop_limit: 64,
        };
        let mut buf = vec![0u8; ip_repr.buffer_len() + TCP_HEADER_LEN];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip_packet, &caps);
        {
            let mut tcp = TcpPacket::new_unchecked(ip_packet.payload_mut());
            tcp.set_src_port(src_port);
            tcp.set_dst_port(dst_port);
            tcp.set_seq_number(0.into());
            tcp.set_ack_number(0.into());
            tcp.set_header_len(TCP_HEADER_LEN as u8);
            tcp.set_syn(syn);
            tcp.set_fin(fin);
            tcp.set_ack(ack);
            tcp.set_window_len(65535);
            tcp.fill_checksum(&src.into(), &dst.into());
        }
        buf
    }

    fn tcp_src_port(ip_bytes: &[u8]) -> u16 {
        let packet = Ipv4Packet::new_checked(ip_bytes).unwrap();
        TcpPacket::new_checked(packet.payload()).unwrap().src_port()
    }

    #[test]
    fn icmp_echo_round_trip_outbound_then_inbound() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(8, 8, 8, 8);

        let mut datagram = build_icmp_echo(internal, remote, 1, true);
        assert!(matches!(engine.translate_outbound(&mut datagram, external), OutboundOutcome::Translated));
        let packet = Ipv4Packet::new_checked(&datagram).unwrap();
        assert_eq!(packet.src_addr(), external);

        let mut reply = build_icmp_echo(remote, external, 1, false);
        assert!(matches!(engine.translate_inbound(&mut reply), InboundOutcome::Translated));
        let reply_packet = Ipv4Packet::new_checked(&reply).unwrap();
        assert_eq!(reply_packet.dst_addr(), internal);
    }

    #[test]
    fn outbound_tcp_syn_allocates_mapping_and_opens_connection() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp_segment(internal, remote, 40000, 80, true, false, false);
        assert!(matches!(engine.translate_outbound(&mut syn, external), OutboundOutcome::Translated));

        let packet = Ipv4Packet::new_checked(&syn).unwrap();
        assert_eq!(packet.src_addr(), external);

        let state = engine.state.lock().unwrap();
        let mapping = state
            .by_internal
            .values()
            .find(|m| m.protocol == NatProtocol::Tcp)
            .unwrap();
        assert_eq!(mapping.connections.len(), 1);
        assert_eq!(mapping.connections[0].state, TcpConnState::OutboundSyn);
    }

    #[test]
    fn non_syn_tcp_segment_with_no_hole_is_rejected_outbound_and_inbound() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        let mut ack_only = build_tcp_segment(internal, remote, 40000, 80, false, false, true);
        assert!(matches!(engine.translate_outbound(&mut ack_only, external), OutboundOutcome::Rejected));

        let mut unsolicited = build_tcp_segment(remote, external, 80, 55000, false, false, true);
        assert!(matches!(engine.translate_inbound(&mut unsolicited), InboundOutcome::NoMapping));
    }

    #[test]
    fn inbound_syn_ack_completes_outbound_connection() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp_segment(internal, remote, 40000, 80, true, false, false);
        engine.translate_outbound(&mut syn, external);
        let external_port = tcp_src_port(&syn);

        let mut syn_ack = build_tcp_segment(remote, external, 80, external_port, true, false, true);
        assert!(matches!(engine.translate_inbound(&mut syn_ack), InboundOutcome::Translated));
        let reply_packet = Ipv4Packet::new_checked(&syn_ack).unwrap();
        assert_eq!(reply_packet.dst_addr(), internal);

        let state = engine.state.lock().unwrap();
        let mapping = state
            .by_internal
            .values()
            .find(|m| m.protocol == NatProtocol::Tcp)
            .unwrap();
        assert_eq!(mapping.connections[0].state, TcpConnState::Connected);
    }

    #[test]
    fn simultaneous_open_drops_queued_syn_when_outbound_syn_crosses_it() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let first_remote = Ipv4Addr::new(93, 184, 216, 34);
        let second_remote = Ipv4Addr::new(198, 51, 100, 7);

        // An unrelated established flow binds the internal endpoint to an
        // external port.
        let mut first_syn = build_tcp_segment(internal, first_remote, 40000, 80, true, false, false);
        engine.translate_outbound(&mut first_syn, external);
        let external_port = tcp_src_port(&first_syn);

        // A second remote's SYN arrives on that same external port before
        // the internal host has dialed out to it.
        let mut crossing_syn = build_tcp_segment(second_remote, external, 443, external_port, true, false, false);
        assert!(
            matches!(engine.translate_inbound(&mut crossing_syn), InboundOutcome::NoResponse),
            "queued, not yet deliverable"
        );

        {
            let state = engine.state.lock().unwrap();
            let mapping = state
                .by_internal
                .values()
                .find(|m| m.protocol == NatProtocol::Tcp)
                .unwrap();
            let conn = mapping
                .connections
                .iter()
                .find(|c| c.external_ip == second_remote)
                .unwrap();
            assert_eq!(conn.state, TcpConnState::InboundSynPending);
            assert!(conn.queued_inbound_syn.is_some());
        }

        // The internal host dials the same remote at the same moment.
        let mut outbound_syn = build_tcp_segment(internal, second_remote, 40000, 443, true, false, false);
        assert!(matches!(engine.translate_outbound(&mut outbound_syn, external), OutboundOutcome::Translated));

        let state = engine.state.lock().unwrap();
        let mapping = state
            .by_internal
            .values()
            .find(|m| m.protocol == NatProtocol::Tcp)
            .unwrap();
        let conn = mapping
            .connections
            .iter()
            .find(|c| c.external_ip == second_remote)
            .unwrap();
        assert_eq!(conn.state, TcpConnState::Connected);
        assert!(conn.queued_inbound_syn.is_none());
    }

    #[test]
    fn sweep_evicts_idle_connection_and_the_mapping_once_empty() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp_segment(internal, remote, 40000, 80, true, false, false);
        engine.translate_outbound(&mut syn, external);

        assert_eq!(engine.state.lock().unwrap().by_internal.len(), 1);
        let expired_syns = engine.sweep(Instant::now() + Duration::from_secs(301));
        assert!(expired_syns.is_empty());
        assert_eq!(engine.state.lock().unwrap().by_internal.len(), 0);
        assert_eq!(engine.state.lock().unwrap().by_external.len(), 0);
    }

    #[test]
    fn sweep_reports_aged_unclaimed_inbound_syn_for_port_unreachable() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let first_remote = Ipv4Addr::new(93, 184, 216, 34);
        let second_remote = Ipv4Addr::new(198, 51, 100, 7);

        let mut first_syn = build_tcp_segment(internal, first_remote, 40000, 80, true, false, false);
        engine.translate_outbound(&mut first_syn, external);
        let external_port = tcp_src_port(&first_syn);

        let mut crossing_syn = build_tcp_segment(second_remote, external, 443, external_port, true, false, false);
        engine.translate_inbound(&mut crossing_syn);

        let expired_syns = engine.sweep(Instant::now() + Duration::from_secs(301));
        assert_eq!(expired_syns.len(), 1);
        let queued_packet = Ipv4Packet::new_checked(&expired_syns[0]).unwrap();
        assert_eq!(queued_packet.src_addr(), second_remote);
    }

    #[test]
    fn embedded_icmp_error_rewrites_outer_destination_and_quoted_source() {
        let engine = NatEngine::new(config());
        let internal = Ipv4Addr::new(10, 0, 1, 5);
        let external = Ipv4Addr::new(107, 23, 115, 113);
        let remote = Ipv4Addr::new(93, 184, 216, 34);

        let mut syn = build_tcp_segment(internal, remote, 40000, 80, true, false, false);
        engine.translate_outbound(&mut syn, external);
        let external_port = tcp_src_port(&syn);

        let caps = ChecksumCapabilities::default();
        let quoted_tcp = build_tcp_segment(external, remote, external_port, 80, true, false, false);
        let quoted_header_and_8_bytes = &quoted_tcp[..Ipv4Packet::new_checked(&quoted_tcp).unwrap().header_len() as usize + 8];
        let quoted_ip = Ipv4Packet::new_checked(&quoted_tcp).unwrap();
        let error_repr = Icmpv4Repr::DstUnreachable {
            reason: Icmpv4DstUnreachable::PortUnreachable,
            header: Ipv4Repr {
                src_addr: quoted_ip.src_addr(),
                dst_addr: quoted_ip.dst_addr(),
                next_header: IpProtocol::Tcp,
                payload_len: 8,
                hop_limit: 64,
            },
            data: &quoted_header_and_8_bytes[quoted_ip.header_len() as usize..],
        };
        let error_ip_repr = Ipv4Repr {
            src_addr: remote,
            dst_addr: external,
            next_header: IpProtocol::Icmp,
            payload_len: error_repr.buffer_len(),
            hop_limit: 64,
        };
        let mut buf = vec![0u8; error_ip_repr.buffer_len() + error_repr.buffer_len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        error_ip_repr.emit(&mut ip_packet, &caps);
        let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        error_repr.emit(&mut icmp_packet, &caps);

        assert!(matches!(engine.translate_inbound(&mut buf), InboundOutcome::Translated));
        let translated = Ipv4Packet::new_checked(&buf).unwrap();
        assert_eq!(translated.dst_addr(), internal);

        let parsed = Icmpv4Repr::parse(&Icmpv4Packet::new_checked(translated.payload()).unwrap(), &caps).unwrap();
        let Icmpv4Repr::DstUnreachable { header, data, .. } = parsed else {
            panic!("expected dst unreachable");
        };
        assert_eq!(header.src_addr, internal);
        assert_eq!(u16::from_be_bytes([data[0], data[1]]), 40000);
    }
}
