//! The router core: ARP resolution, IPv4 forwarding, ICMP, and NAT.
//!
//! See spec.md §4 for the four subsystems this crate implements and §5 for
//! the concurrency model the [`router::Router`] type realizes.

pub mod arp;
pub mod dispatcher;
pub mod frame_io;
pub mod icmp;
pub mod ip;
pub mod nat;
pub mod route;
pub mod router;

/// Length of an Ethernet II header in bytes (dst MAC + src MAC + ethertype).
pub const ETHERNET_HEADER_LEN: usize = 14;

pub use frame_io::{ChannelFrameIo, FrameIo, TxFrame};
pub use router::{Router, RouterHandle};
