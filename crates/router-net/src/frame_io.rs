//! The raw frame I/O boundary (spec.md §6).
//!
//! The core treats frame transport as an external collaborator: something
//! delivers whole Ethernet frames to the dispatcher and accepts frames for
//! transmission on a named interface. This module defines that boundary as
//! a trait so the engine can be driven by a real raw socket (see
//! `router-cli`) or, in tests, by an in-memory fake.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc;

/// An Ethernet frame the dispatcher should transmit, addressed by the
/// outgoing interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub interface: String,
    pub bytes: Vec<u8>,
}

impl TxFrame {
    pub fn new(interface: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            interface: interface.into(),
            bytes,
        }
    }
}

/// Blocking frame transport. The dispatcher thread is the only caller of
/// `recv`; `send` may be called from any thread (sweep threads originate
/// ICMP diagnostics too).
pub trait FrameIo: Send {
    /// Block until a frame arrives, returning its bytes and the name of the
    /// interface it arrived on.
    fn recv(&mut self) -> io::Result<(Vec<u8>, String)>;

    /// Best-effort send of `frame` on `interface`.
    fn send(&mut self, interface: &str, frame: &[u8]) -> io::Result<()>;
}

/// An in-memory `FrameIo` backed by one MPSC channel pair per interface.
///
/// Used by integration tests (and available to any caller that wants to
/// drive the router without a real NIC). Frames "transmitted" by the router
/// land in a per-interface outbox that the test can drain; frames "received"
/// are injected by the test via [`ChannelFrameIo::inject`].
pub struct ChannelFrameIo {
    inbound_rx: mpsc::Receiver<(Vec<u8>, String)>,
    inbound_tx: mpsc::Sender<(Vec<u8>, String)>,
    outboxes: HashMap<String, Vec<Vec<u8>>>,
}

impl ChannelFrameIo {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            inbound_rx,
            inbound_tx,
            outboxes: HashMap::new(),
        }
    }

    /// A handle that can inject inbound frames from another thread.
    pub fn injector(&self) -> FrameInjector {
        FrameInjector {
            tx: self.inbound_tx.clone(),
        }
    }

    /// Queue a frame as if it arrived on `interface`.
    pub fn inject(&self, interface: impl Into<String>, frame: Vec<u8>) {
        let _ = self.inbound_tx.send((frame, interface.into()));
    }

    /// Drain and return all frames transmitted on `interface` so far.
    pub fn drain(&mut self, interface: &str) -> Vec<Vec<u8>> {
        self.outboxes.remove(interface).unwrap_or_default()
    }
}

impl Default for ChannelFrameIo {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable handle for injecting frames into a [`ChannelFrameIo`] from
/// another thread (e.g. a test driving ARP retry timing).
#[derive(Clone)]
pub struct FrameInjector {
    tx: mpsc::Sender<(Vec<u8>, String)>,
}

impl FrameInjector {
    pub fn inject(&self, interface: impl Into<String>, frame: Vec<u8>) {
        let _ = self.tx.send((frame, interface.into()));
    }
}

impl FrameIo for ChannelFrameIo {
    fn recv(&mut self) -> io::Result<(Vec<u8>, String)> {
        self.inbound_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }

    fn send(&mut self, interface: &str, frame: &[u8]) -> io::Result<()> {
        self.outboxes
            .entry(interface.to_string())
            .or_default()
            .push(frame.to_vec());
        Ok(())
    }
}
