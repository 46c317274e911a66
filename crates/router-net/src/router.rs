//! The top-level router: wires the dispatcher, ARP table, forwarding
//! engine, and NAT engine together and drives the three logical threads of
//! spec.md §5 over a [`FrameIo`] transport.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use router_core::{Interface, MacAddr, RouterConfig};
use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, Ipv4Address};

use crate::arp::{self, ArpTable};
use crate::dispatcher::{self, Classification};
use crate::frame_io::{FrameIo, TxFrame};
use crate::icmp::IpIdGenerator;
use crate::ip::{self, ForwardContext};
use crate::nat::NatEngine;
use crate::route::RoutingTable;

/// Cadence shared by the ARP sweep and NAT aging threads (spec.md §5).
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The router's fixed state: configured interfaces, routing table, ARP
/// cache, and an optional NAT engine. Built once at startup from
/// [`RouterConfig`] and shared (read-mostly) across the dispatcher and
/// sweep threads.
pub struct Router {
    interfaces: HashMap<String, Interface>,
    routes: RoutingTable,
    arp: ArpTable,
    nat: Option<NatEngine>,
    id_gen: IpIdGenerator,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let interfaces = config
            .interfaces
            .into_iter()
            .map(|iface| (iface.name.clone(), iface))
            .collect();

        let nat = config.nat.enabled.then(|| NatEngine::new(config.nat));

        Self {
            interfaces,
            routes: RoutingTable::new(config.routes),
            arp: ArpTable::new(),
            nat,
            id_gen: IpIdGenerator::new(),
        }
    }

    fn ctx(&self) -> ForwardContext<'_> {
        ForwardContext {
            interfaces: &self.interfaces,
            routes: &self.routes,
            arp: &self.arp,
            id_gen: &self.id_gen,
        }
    }

    /// Process one inbound frame and return whatever must be transmitted.
    /// This is the dispatcher's core logic (spec.md §4.1); it has no side
    /// effects beyond the ARP table and NAT engine's internal state.
    pub fn handle_frame(&self, ingress_name: &str, frame: &[u8]) -> Vec<TxFrame> {
        let Some(ingress) = self.interfaces.get(ingress_name) else {
            tracing::debug!(ingress_name, "dropping frame from unknown interface");
            return Vec::new();
        };

        let Some((src_mac, classification)) = dispatcher::classify(ingress, frame) else {
            return Vec::new();
        };

        match classification {
            Classification::Arp(bytes) => self.handle_arp(ingress, bytes),
            Classification::Ipv4(bytes) => {
                ip::process_datagram(&self.ctx(), self.nat.as_ref(), ingress, src_mac, bytes)
            }
        }
    }

    fn handle_arp(&self, ingress: &Interface, bytes: &[u8]) -> Vec<TxFrame> {
        let Ok(packet) = ArpPacket::new_checked(bytes) else {
            return Vec::new();
        };
        let Ok(repr) = ArpRepr::parse(&packet) else {
            return Vec::new();
        };
        let ArpRepr::EthernetIpv4 {
            operation,
            sender_hardware_addr,
            sender_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        else {
            return Vec::new();
        };

        match operation {
            ArpOperation::Request => arp::handle_request(ingress, &repr).into_iter().collect(),
            ArpOperation::Reply => {
                if target_protocol_addr != Ipv4Address::from(ingress.ip) {
                    return Vec::new();
                }
                let sender_ip: Ipv4Addr = sender_protocol_addr.into();
                self.arp.learn_reply(sender_ip, MacAddr(sender_hardware_addr.0))
            }
            _ => Vec::new(),
        }
    }

    /// Run one ARP sweep: retry outstanding requests, and turn any
    /// exhausted ones into routed ICMP host-unreachable datagrams.
    pub fn arp_sweep(&self, now: Instant) -> Vec<TxFrame> {
        let result = self.arp.sweep(now, &self.interfaces);
        let mut frames = result.retries;
        for exhausted in result.exhausted {
            frames.extend(ip::host_unreachable_for_arp_failure(
                &self.ctx(),
                self.nat.as_ref(),
                &exhausted.ip_bytes,
            ));
        }
        frames
    }

    /// Run one NAT aging sweep, turning any unclaimed simultaneous-open SYNs
    /// it evicted into routed ICMP port-unreachable datagrams. A no-op if
    /// NAT is disabled.
    pub fn nat_sweep(&self, now: Instant) -> Vec<TxFrame> {
        let Some(nat) = &self.nat else {
            return Vec::new();
        };
        let ctx = self.ctx();
        nat.sweep(now)
            .iter()
            .flat_map(|ip_bytes| ip::port_unreachable_for_aged_nat_syn(&ctx, ip_bytes))
            .collect()
    }

    /// Spawn the dispatcher loop and the two periodic sweep threads over
    /// `io`, returning a handle that can stop the sweep threads.
    ///
    /// The dispatcher thread blocks indefinitely on [`FrameIo::recv`]; it is
    /// not joined by [`RouterHandle::stop`], matching the lifetime of a
    /// long-running daemon whose frame transport has no graceful shutdown
    /// signal of its own.
    pub fn run(self: Arc<Self>, io: impl FrameIo + 'static) -> RouterHandle {
        let io = Arc::new(Mutex::new(io));
        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher_handle = {
            let router = Arc::clone(&self);
            let io = Arc::clone(&io);
            thread::spawn(move || loop {
                let received = io.lock().unwrap().recv();
                let Ok((frame, ingress_name)) = received else {
                    return;
                };
                let frames = router.handle_frame(&ingress_name, &frame);
                let mut io = io.lock().unwrap();
                for tx in frames {
                    let _ = io.send(&tx.interface, &tx.bytes);
                }
            })
        };

        let arp_handle = {
            let router = Arc::clone(&self);
            let io = Arc::clone(&io);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(SWEEP_INTERVAL);
                    let frames = router.arp_sweep(Instant::now());
                    let mut io = io.lock().unwrap();
                    for tx in frames {
                        let _ = io.send(&tx.interface, &tx.bytes);
                    }
                }
            })
        };

        let nat_handle = {
            let router = Arc::clone(&self);
            let io = Arc::clone(&io);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(SWEEP_INTERVAL);
                    let frames = router.nat_sweep(Instant::now());
                    let mut io = io.lock().unwrap();
                    for tx in frames {
                        let _ = io.send(&tx.interface, &tx.bytes);
                    }
                }
            })
        };

        RouterHandle {
            stop,
            dispatcher: Some(dispatcher_handle),
            sweeps: vec![arp_handle, nat_handle],
        }
    }
}

/// A handle to a running [`Router`]'s background threads.
pub struct RouterHandle {
    stop: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
    sweeps: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Signal the sweep threads to stop and join them. The dispatcher
    /// thread is left running; dropping the handle does not kill it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.sweeps.drain(..) {
            let _ = handle.join();
        }
    }

    /// Detach the dispatcher thread's handle for the caller to join
    /// directly (e.g. a CLI main waiting on the frame-processing loop).
    pub fn take_dispatcher(&mut self) -> Option<JoinHandle<()>> {
        self.dispatcher.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_io::ChannelFrameIo;
    use router_core::{NatConfig, Route};
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{
        EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Packet,
        Ipv4Repr,
    };

    fn test_config() -> RouterConfig {
        RouterConfig {
            interfaces: vec![
                Interface {
                    name: "eth1".to_string(),
                    mac: MacAddr([0x02; 6]),
                    ip: Ipv4Addr::new(10, 0, 1, 11),
                },
                Interface {
                    name: "eth3".to_string(),
                    mac: MacAddr([0x0e, 0x20, 0x0a, 0x00, 0x00, 0x03]),
                    ip: Ipv4Addr::new(107, 23, 115, 113),
                },
            ],
            routes: vec![Route {
                dest: Ipv4Addr::new(0, 0, 0, 0),
                mask: Ipv4Addr::new(0, 0, 0, 0),
                gateway: Ipv4Addr::new(107, 23, 115, 131),
                interface: "eth3".to_string(),
            }],
            nat: NatConfig::default(),
        }
    }

    fn arp_request_frame(dst_iface_ip: Ipv4Addr, sender_mac: [u8; 6], sender_ip: Ipv4Addr) -> Vec<u8> {
        let arp = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr: EthernetAddress(sender_mac),
            source_protocol_addr: Ipv4Address::from(sender_ip),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: Ipv4Address::from(dst_iface_ip),
        };
        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress(sender_mac),
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EthernetProtocol::Arp,
        };
        let mut buf = vec![0u8; 14 + arp.buffer_len()];
        let mut eth_frame = EthernetFrame::new_unchecked(&mut buf);
        eth_repr.emit(&mut eth_frame);
        let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
        arp.emit(&mut arp_packet);
        buf
    }

    #[test]
    fn arp_request_for_our_ip_produces_reply() {
        let router = Router::new(test_config());
        let frame = arp_request_frame(Ipv4Addr::new(107, 23, 115, 113), [0x0e, 0x20, 0xab, 0x80, 0x00, 0x02], Ipv4Addr::new(107, 23, 115, 131));

        let frames = router.handle_frame("eth3", &frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].interface, "eth3");
    }

    #[test]
    fn ping_to_router_produces_echo_reply_on_same_interface() {
        let router = Router::new(test_config());
        let caps = ChecksumCapabilities::default();
        let icmp_repr = smoltcp::wire::Icmpv4Repr::EchoRequest {
            ident: 1,
            seq_no: 1,
            data: &[1, 2, 3, 4],
        };
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Addr::new(107, 23, 115, 131),
            dst_addr: Ipv4Addr::new(107, 23, 115, 113),
            next_header: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress([0x0e, 0x20, 0xab, 0x80, 0x00, 0x02]),
            dst_addr: EthernetAddress([0x0e, 0x20, 0x0a, 0x00, 0x00, 0x03]),
            ethertype: EthernetProtocol::Ipv4,
        };

        let mut buf = vec![0u8; 14 + ip_repr.buffer_len() + icmp_repr.buffer_len()];
        let mut eth_frame = EthernetFrame::new_unchecked(&mut buf);
        eth_repr.emit(&mut eth_frame);
        let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
        ip_repr.emit(&mut ip_packet, &caps);
        let mut icmp_packet = smoltcp::wire::Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        icmp_repr.emit(&mut icmp_packet, &caps);

        let frames = router.handle_frame("eth3", &buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].interface, "eth3");
        let reply_eth = EthernetFrame::new_checked(&frames[0].bytes).unwrap();
        assert_eq!(reply_eth.dst_addr(), EthernetAddress([0x0e, 0x20, 0xab, 0x80, 0x00, 0x02]));
    }

    #[test]
    fn dispatch_through_channel_frame_io() {
        let router = Arc::new(Router::new(test_config()));
        let io = ChannelFrameIo::new();
        let injector = io.injector();
        let handle = router.run(io);

        let frame = arp_request_frame(Ipv4Addr::new(107, 23, 115, 113), [0x12; 6], Ipv4Addr::new(192, 168, 1, 1));
        injector.inject("eth3", frame);

        thread::sleep(Duration::from_millis(50));
        handle.stop();
    }
}
