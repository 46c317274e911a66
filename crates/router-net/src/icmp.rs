//! ICMP echo termination and type-3/type-11 error origination (spec.md §4.4).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, Icmpv4TimeExceeded, IpProtocol,
    Ipv4Packet, Ipv4Repr,
};

/// Number of bytes of the original datagram's payload quoted in a generated
/// ICMP error, per spec.md §4.3.
const QUOTED_PAYLOAD_LEN: usize = 8;
/// Default TTL for datagrams the router originates itself.
const DEFAULT_TTL: u8 = 64;

/// Monotonically increasing IPv4 identification counter for
/// router-originated datagrams (spec.md §4.3, §9).
pub struct IpIdGenerator {
    next: AtomicU16,
}

impl Default for IpIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IpIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Verify the ICMP checksum and, if this is an echo request, build the echo
/// reply datagram (IP + ICMP), mirroring identifier, sequence, and payload
/// and swapping source/destination addresses.
///
/// Any other ICMP type directed at the router is logged and dropped
/// (returns `None`), as is a request whose checksum does not verify.
pub fn handle_echo_request(ip_src: Ipv4Addr, ip_dst: Ipv4Addr, icmp_bytes: &[u8]) -> Option<Vec<u8>> {
    let caps = ChecksumCapabilities::default();
    let packet = Icmpv4Packet::new_checked(icmp_bytes).ok()?;
    let repr = Icmpv4Repr::parse(&packet, &caps).ok()?;

    let Icmpv4Repr::EchoRequest { ident, seq_no, data } = repr else {
        tracing::debug!(msg_type = ?packet.msg_type(), "dropping non-echo ICMP directed at router");
        return None;
    };

    let reply_repr = Icmpv4Repr::EchoReply { ident, seq_no, data };
    let icmp_len = reply_repr.buffer_len();

    let ip_repr = Ipv4Repr {
        src_addr: ip_dst.into(),
        dst_addr: ip_src.into(),
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: DEFAULT_TTL,
    };

    Some(build_ip_datagram(ip_repr, icmp_len, |buf| {
        let mut icmp_packet = Icmpv4Packet::new_unchecked(buf);
        reply_repr.emit(&mut icmp_packet, &caps);
    }))
}

/// Build an ICMP type-3 (destination unreachable) datagram quoting
/// `triggering_ip_bytes`, with `responder_ip` as the source (the outgoing
/// interface's address facing the original sender).
pub fn dest_unreachable(
    id_gen: &IpIdGenerator,
    responder_ip: Ipv4Addr,
    reason: Icmpv4DstUnreachable,
    triggering_ip_bytes: &[u8],
) -> Option<Vec<u8>> {
    build_error(id_gen, responder_ip, triggering_ip_bytes, |header, data| {
        Icmpv4Repr::DstUnreachable { reason, header, data }
    })
}

/// Build an ICMP type-11 (time exceeded) datagram quoting
/// `triggering_ip_bytes`.
pub fn time_exceeded(
    id_gen: &IpIdGenerator,
    responder_ip: Ipv4Addr,
    triggering_ip_bytes: &[u8],
) -> Option<Vec<u8>> {
    build_error(id_gen, responder_ip, triggering_ip_bytes, |header, data| {
        Icmpv4Repr::TimeExceeded {
            reason: Icmpv4TimeExceeded::TtlExpired,
            header,
            data,
        }
    })
}

fn build_error<'a>(
    id_gen: &IpIdGenerator,
    responder_ip: Ipv4Addr,
    triggering_ip_bytes: &'a [u8],
    make_repr: impl FnOnce(Ipv4Repr, &'a [u8]) -> Icmpv4Repr<'a>,
) -> Option<Vec<u8>> {
    let caps = ChecksumCapabilities::default();
    let original = Ipv4Packet::new_checked(triggering_ip_bytes).ok()?;
    let original_src: Ipv4Addr = original.src_addr();

    // spec.md §4.3: suppress if it would target one of our own interfaces.
    // The caller is expected to have already checked this against the full
    // interface list; this function only builds the datagram.

    let header_len = usize::from(original.header_len());
    let quote_end = (header_len + QUOTED_PAYLOAD_LEN).min(triggering_ip_bytes.len());
    let quoted = &triggering_ip_bytes[..quote_end];

    let quoted_header = Ipv4Repr {
        src_addr: original_src,
        dst_addr: original.dst_addr(),
        next_header: original.protocol(),
        payload_len: quoted.len().saturating_sub(header_len),
        hop_limit: original.hop_limit(),
    };
    let quoted_data = &quoted[header_len.min(quoted.len())..];

    let icmp_repr = make_repr(quoted_header, quoted_data);
    let icmp_len = icmp_repr.buffer_len();

    let ip_repr = Ipv4Repr {
        src_addr: responder_ip,
        dst_addr: original_src,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: DEFAULT_TTL,
    };

    let mut datagram = build_ip_datagram(ip_repr, icmp_len, |buf| {
        let mut icmp_packet = Icmpv4Packet::new_unchecked(buf);
        icmp_repr.emit(&mut icmp_packet, &caps);
    });

    set_ident_and_df(&mut datagram, id_gen.next());
    Some(datagram)
}

fn build_ip_datagram(ip_repr: Ipv4Repr, payload_len: usize, emit_payload: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();
    let total_len = ip_repr.buffer_len() + payload_len;
    let mut buf = vec![0u8; total_len];

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
    ip_repr.emit(&mut ip_packet, &caps);
    emit_payload(ip_packet.payload_mut());
    buf
}

fn set_ident_and_df(datagram: &mut [u8], ident: u16) {
    let mut packet = Ipv4Packet::new_unchecked(datagram);
    packet.set_ident(ident);
    packet.set_dont_frag(true);
    packet.fill_checksum();
}

/// Returns `true` if `msg_type` is one we terminate (echo request); used by
/// callers deciding whether an inbound ICMP packet is ours to answer.
pub fn is_echo_request(msg_type: Icmpv4Message) -> bool {
    msg_type == Icmpv4Message::EchoRequest
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::Ipv4Address;

    fn build_echo_request_datagram(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq: u16, data: &[u8]) -> Vec<u8> {
        let caps = ChecksumCapabilities::default();
        let icmp_repr = Icmpv4Repr::EchoRequest { ident, seq_no: seq, data };
        let icmp_len = icmp_repr.buffer_len();

        let ip_repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmp,
            payload_len: icmp_len,
            hop_limit: 64,
        };

        let total_len = ip_repr.buffer_len() + icmp_len;
        let mut buf = vec![0u8; total_len];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip_packet, &caps);
        let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        icmp_repr.emit(&mut icmp_packet, &caps);
        buf
    }

    #[test]
    fn echo_request_to_router_mirrors_payload() {
        let src = Ipv4Addr::new(64, 121, 20, 36);
        let dst = Ipv4Addr::new(107, 23, 115, 113);
        let payload: Vec<u8> = (0..56).collect();

        let datagram = build_echo_request_datagram(src, dst, 0, 1, &payload);
        let ip_packet = Ipv4Packet::new_checked(&datagram).unwrap();
        let reply = handle_echo_request(ip_packet.src_addr(), ip_packet.dst_addr(), ip_packet.payload())
            .expect("echo request should produce a reply");

        let reply_ip = Ipv4Packet::new_checked(&reply).unwrap();
        assert_eq!(reply_ip.src_addr(), Ipv4Address::from(dst));
        assert_eq!(reply_ip.dst_addr(), Ipv4Address::from(src));
        assert!(reply_ip.verify_checksum());

        let reply_icmp = Icmpv4Packet::new_checked(reply_ip.payload()).unwrap();
        let repr = Icmpv4Repr::parse(&reply_icmp, &ChecksumCapabilities::default()).unwrap();
        match repr {
            Icmpv4Repr::EchoReply { ident, seq_no, data } => {
                assert_eq!(ident, 0);
                assert_eq!(seq_no, 1);
                assert_eq!(data, &payload[..]);
            }
            other => panic!("expected echo reply, got {other:?}"),
        }
    }

    #[test]
    fn non_echo_icmp_is_dropped() {
        let caps = ChecksumCapabilities::default();
        let icmp_repr = Icmpv4Repr::EchoReply { ident: 1, seq_no: 1, data: &[] };
        let icmp_len = icmp_repr.buffer_len();
        let mut buf = vec![0u8; icmp_len];
        let mut packet = Icmpv4Packet::new_unchecked(&mut buf);
        icmp_repr.emit(&mut packet, &caps);

        assert!(handle_echo_request(Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8), &buf).is_none());
    }

    #[test]
    fn time_exceeded_quotes_header_and_eight_bytes() {
        let id_gen = IpIdGenerator::new();
        let triggering = build_echo_request_datagram(
            Ipv4Addr::new(64, 121, 20, 36),
            Ipv4Addr::new(10, 0, 1, 5),
            0x1234,
            7,
            &[9; 40],
        );

        let error = time_exceeded(&id_gen, Ipv4Addr::new(107, 23, 115, 113), &triggering).unwrap();
        let error_ip = Ipv4Packet::new_checked(&error).unwrap();
        assert!(error_ip.verify_checksum());
        assert_eq!(error_ip.dst_addr(), Ipv4Address::new(64, 121, 20, 36));
        assert!(error_ip.dont_frag());

        let icmp = Icmpv4Packet::new_checked(error_ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), Icmpv4Message::TimeExceeded);
    }
}
