//! The mapping and connection table (spec.md §3, §4.5.1, §4.5.3).

use std::net::Ipv4Addr;
use std::time::Instant;

use smoltcp::wire::IpProtocol;

/// The two protocols the NAT engine tracks state for. UDP NAT is explicitly
/// out of scope (spec.md §1); UDP datagrams cross the router untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatProtocol {
    Tcp,
    Icmp,
}

impl NatProtocol {
    pub fn from_ip_protocol(protocol: IpProtocol) -> Option<Self> {
        match protocol {
            IpProtocol::Tcp => Some(Self::Tcp),
            IpProtocol::Icmp => Some(Self::Icmp),
            _ => None,
        }
    }
}

/// TCP connection state within a mapping (spec.md §4.5.3's state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpConnState {
    OutboundSyn,
    InboundSynPending,
    Connected,
    TimeWait,
}

/// One TCP connection tracked within a [`Mapping`], keyed by the remote
/// (external) endpoint it talks to. `queued_inbound_syn` holds a deep copy
/// of an unsolicited inbound SYN's full IP datagram while the connection
/// sits in `InboundSynPending`, awaiting either a matching outbound SYN
/// (simultaneous open) or aging out (spec.md §3, §4.5.3).
#[derive(Debug, Clone)]
pub struct Connection {
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
    pub state: TcpConnState,
    pub last_accessed: Instant,
    pub queued_inbound_syn: Option<Vec<u8>>,
}

impl Connection {
    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }
}

/// One internal endpoint's translation, keyed both ways in
/// [`NatState`](super::NatState). `connections` is always empty for ICMP
/// mappings; for TCP it holds one record per distinct remote endpoint this
/// internal endpoint has talked to (spec.md §3).
#[derive(Debug, Clone)]
pub struct Mapping {
    pub protocol: NatProtocol,
    pub internal_ip: Ipv4Addr,
    pub internal_aux: u16,
    pub external_aux: u16,
    pub last_updated: Instant,
    pub connections: Vec<Connection>,
}

impl Mapping {
    pub fn touch(&mut self, now: Instant) {
        self.last_updated = now;
    }

    pub fn find_connection_mut(&mut self, external_ip: Ipv4Addr, external_port: u16) -> Option<&mut Connection> {
        self.connections
            .iter_mut()
            .find(|c| c.external_ip == external_ip && c.external_port == external_port)
    }

    /// Open a new connection record in `state`, touching both it and the
    /// owning mapping.
    pub fn open_connection(
        &mut self,
        external_ip: Ipv4Addr,
        external_port: u16,
        state: TcpConnState,
        now: Instant,
    ) -> &mut Connection {
        self.touch(now);
        self.connections.push(Connection {
            external_ip,
            external_port,
            state,
            last_accessed: now,
            queued_inbound_syn: None,
        });
        self.connections.last_mut().expect("just pushed")
    }
}

/// Advance `conn`'s state given an outbound packet's flags, touching its
/// timer. Returns the queued SYN to discard, if this transition resolves a
/// simultaneous-open race (spec.md §4.5.3: "INBOUND_SYN_PENDING --outbound
/// SYN--> CONNECTED [drop the queued SYN]").
pub fn advance_on_outbound(conn: &mut Connection, syn: bool, fin: bool, now: Instant) -> Option<Vec<u8>> {
    conn.touch(now);
    let dropped = if syn && conn.state == TcpConnState::InboundSynPending {
        conn.queued_inbound_syn.take()
    } else {
        None
    };

    conn.state = match (conn.state, syn, fin) {
        (_, _, true) => TcpConnState::TimeWait,
        (TcpConnState::TimeWait, true, _) => TcpConnState::OutboundSyn,
        (TcpConnState::InboundSynPending, true, _) => TcpConnState::Connected,
        (other, _, _) => other,
    };
    dropped
}

/// Advance `conn`'s state given an inbound packet's flags, touching its
/// timer (spec.md §4.5.3: "OUTBOUND_SYN --inbound SYN--> CONNECTED").
pub fn advance_on_inbound(conn: &mut Connection, syn: bool, fin: bool, now: Instant) {
    conn.touch(now);
    conn.state = match (conn.state, syn, fin) {
        (_, _, true) => TcpConnState::TimeWait,
        (TcpConnState::OutboundSyn, true, _) => TcpConnState::Connected,
        (other, _, _) => other,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub protocol: NatProtocol,
    pub internal_ip: Ipv4Addr,
    pub internal_aux: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalKey {
    pub protocol: NatProtocol,
    pub external_aux: u16,
}
