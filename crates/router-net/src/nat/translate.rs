//! Header rewriting for NAT'd datagrams (spec.md §4.5.2, §4.5.4).
//!
//! These functions only mutate bytes; the engine decides *what* to rewrite
//! a packet to, these decide *how* to patch the wire format and keep
//! checksums honest.

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, Icmpv4TimeExceeded,
    Ipv4Packet, Ipv4Repr, TcpPacket,
};

enum ErrorKind {
    DstUnreachable(Icmpv4DstUnreachable),
    TimeExceeded(Icmpv4TimeExceeded),
}

/// Rewrite the source address and source port/identifier of an outbound
/// datagram to the NAT's external IP and the allocated external aux value.
pub fn rewrite_outbound(ip_bytes: &mut [u8], new_src_ip: Ipv4Addr, new_src_aux: u16) {
    let mut ip_packet = Ipv4Packet::new_unchecked(ip_bytes);
    ip_packet.set_src_addr(new_src_ip);
    ip_packet.fill_checksum();

    let protocol = ip_packet.protocol();
    let src_addr = IpAddress::from(new_src_ip);
    let dst_addr = IpAddress::from(ip_packet.dst_addr());
    rewrite_transport_source(ip_packet.payload_mut(), protocol, &src_addr, &dst_addr, new_src_aux);
}

/// Rewrite the destination address and destination port/identifier of an
/// inbound datagram back to the internal host's real address.
pub fn rewrite_inbound(ip_bytes: &mut [u8], new_dst_ip: Ipv4Addr, new_dst_aux: u16) {
    let mut ip_packet = Ipv4Packet::new_unchecked(ip_bytes);
    ip_packet.set_dst_addr(new_dst_ip);
    ip_packet.fill_checksum();

    let protocol = ip_packet.protocol();
    let src_addr = IpAddress::from(ip_packet.src_addr());
    let dst_addr = IpAddress::from(new_dst_ip);
    rewrite_transport_dest(ip_packet.payload_mut(), protocol, &src_addr, &dst_addr, new_dst_aux);
}

/// Rewrite the source endpoint embedded in a returned ICMP error's quoted
/// header back to the internal host's real address, so the internal host's
/// transport stack can match the error to its own socket. Used on the
/// inbound direction: an external host's error quotes the datagram an
/// internal host sent, with the NAT's external identity in the quoted
/// source (spec.md §4.5.2).
pub fn rewrite_embedded_source(icmp_error_bytes: &mut [u8], new_ip: Ipv4Addr, new_aux: u16) {
    rewrite_embedded_endpoint(icmp_error_bytes, Endpoint::Source, new_ip, new_aux);
}

/// Rewrite the destination endpoint embedded in an ICMP error's quoted
/// header to the NAT's external identity, so the remote host that triggered
/// the error can match it to the packet it originally sent. Used on the
/// outbound direction: an internal host's error quotes a datagram an
/// external host sent it (already translated inbound), so the quoted
/// destination still reads as the internal endpoint (spec.md §4.5.2).
pub fn rewrite_embedded_dest(icmp_error_bytes: &mut [u8], new_ip: Ipv4Addr, new_aux: u16) {
    rewrite_embedded_endpoint(icmp_error_bytes, Endpoint::Destination, new_ip, new_aux);
}

#[derive(Clone, Copy)]
enum Endpoint {
    Source,
    Destination,
}

fn rewrite_embedded_endpoint(icmp_error_bytes: &mut [u8], endpoint: Endpoint, new_ip: Ipv4Addr, new_aux: u16) {
    let caps = ChecksumCapabilities::default();
    let Ok(repr) = Icmpv4Repr::parse(&Icmpv4Packet::new_unchecked(&*icmp_error_bytes), &caps) else {
        return;
    };

    let (kind, mut header, data): (ErrorKind, Ipv4Repr, &[u8]) = match repr {
        Icmpv4Repr::DstUnreachable { reason, header, data } => (ErrorKind::DstUnreachable(reason), header, data),
        Icmpv4Repr::TimeExceeded { reason, header, data } => (ErrorKind::TimeExceeded(reason), header, data),
        _ => return,
    };

    match endpoint {
        Endpoint::Source => header.src_addr = new_ip,
        Endpoint::Destination => header.dst_addr = new_ip,
    }

    let quoted_len = 8.min(data.len());
    let mut quoted = data[..quoted_len].to_vec();
    rewrite_quoted_port(&mut quoted, header.next_header, endpoint, new_aux);

    let new_repr = match kind {
        ErrorKind::DstUnreachable(reason) => Icmpv4Repr::DstUnreachable { reason, header, data: &quoted },
        ErrorKind::TimeExceeded(reason) => Icmpv4Repr::TimeExceeded { reason, header, data: &quoted },
    };

    let mut packet = Icmpv4Packet::new_unchecked(icmp_error_bytes);
    new_repr.emit(&mut packet, &caps);
}

fn rewrite_transport_source(payload: &mut [u8], protocol: IpProtocol, src: &IpAddress, dst: &IpAddress, new_port: u16) {
    match protocol {
        IpProtocol::Tcp => {
            let mut tcp = TcpPacket::new_unchecked(payload);
            tcp.set_src_port(new_port);
            tcp.fill_checksum(src, dst);
        }
        IpProtocol::Icmp => rewrite_icmp_ident(payload, new_port),
        _ => {}
    }
}

fn rewrite_transport_dest(payload: &mut [u8], protocol: IpProtocol, src: &IpAddress, dst: &IpAddress, new_port: u16) {
    match protocol {
        IpProtocol::Tcp => {
            let mut tcp = TcpPacket::new_unchecked(payload);
            tcp.set_dst_port(new_port);
            tcp.fill_checksum(src, dst);
        }
        IpProtocol::Icmp => rewrite_icmp_ident(payload, new_port),
        _ => {}
    }
}

/// Quoted headers inside an ICMP error are too short to carry a full,
/// checksummed transport segment (spec.md §4.3 quotes only 8 payload bytes),
/// so the embedded port is patched in place without touching any checksum:
/// the quoted segment's own checksum is whatever the remote host already
/// sent and is not recomputed.
fn rewrite_quoted_port(quoted: &mut [u8], protocol: IpProtocol, endpoint: Endpoint, new_port: u16) {
    match (protocol, endpoint) {
        (IpProtocol::Tcp, Endpoint::Source) if quoted.len() >= 2 => {
            quoted[0..2].copy_from_slice(&new_port.to_be_bytes());
        }
        (IpProtocol::Tcp, Endpoint::Destination) if quoted.len() >= 4 => {
            quoted[2..4].copy_from_slice(&new_port.to_be_bytes());
        }
        (IpProtocol::Icmp, _) if quoted.len() >= 6 => {
            quoted[4..6].copy_from_slice(&new_port.to_be_bytes());
        }
        _ => {}
    }
}

fn rewrite_icmp_ident(payload: &mut [u8], ident: u16) {
    let caps = ChecksumCapabilities::default();
    let repr = {
        let packet = Icmpv4Packet::new_unchecked(&*payload);
        Icmpv4Repr::parse(&packet, &caps)
    };

    let (seq_no, data, is_request) = match repr {
        Ok(Icmpv4Repr::EchoRequest { seq_no, data, .. }) => (seq_no, data.to_vec(), true),
        Ok(Icmpv4Repr::EchoReply { seq_no, data, .. }) => (seq_no, data.to_vec(), false),
        _ => return,
    };

    let new_repr = if is_request {
        Icmpv4Repr::EchoRequest { ident, seq_no, data: &data }
    } else {
        Icmpv4Repr::EchoReply { ident, seq_no, data: &data }
    };

    let mut packet = Icmpv4Packet::new_unchecked(payload);
    new_repr.emit(&mut packet, &caps);
}
