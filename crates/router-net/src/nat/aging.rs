//! Idle-timeout rules for the periodic aging sweep (spec.md §4.5.5).

use std::time::{Duration, Instant};

use router_core::NatConfig;

use super::mapping::{Connection, Mapping, NatProtocol, TcpConnState};

/// RFC 5382 REQ-3's floor on the transitory (embryonic or closing) TCP
/// timeout, applied regardless of how aggressively the configuration is
/// tuned (spec.md §9).
pub const MIN_TCP_TRANSITORY_TIMEOUT: Duration = Duration::from_secs(6);

fn established_timeout(config: &NatConfig) -> Duration {
    Duration::from_secs(config.tcp_established_timeout_secs)
}

fn transitory_timeout(config: &NatConfig) -> Duration {
    Duration::from_secs(config.tcp_transitory_timeout_secs).max(MIN_TCP_TRANSITORY_TIMEOUT)
}

fn icmp_timeout(config: &NatConfig) -> Duration {
    Duration::from_secs(config.icmp_timeout_secs)
}

/// Whether a TCP connection has been idle long enough to evict. `CONNECTED`
/// gets the long established timeout; every other state - including a
/// half-open `INBOUND_SYN_PENDING` hole a simultaneous open might still
/// claim - gets the short transitory one.
pub fn is_connection_expired(conn: &Connection, now: Instant, config: &NatConfig) -> bool {
    let age = now.duration_since(conn.last_accessed);
    let timeout = match conn.state {
        TcpConnState::Connected => established_timeout(config),
        TcpConnState::OutboundSyn | TcpConnState::InboundSynPending | TcpConnState::TimeWait => transitory_timeout(config),
    };
    age >= timeout
}

/// Whether an ICMP mapping has been idle longer than `icmp_timeout` allows.
pub fn is_icmp_mapping_expired(mapping: &Mapping, now: Instant, config: &NatConfig) -> bool {
    debug_assert_eq!(mapping.protocol, NatProtocol::Icmp);
    now.duration_since(mapping.last_updated) >= icmp_timeout(config)
}
