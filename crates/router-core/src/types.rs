use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;

/// An Ethernet hardware address, serialized as the usual colon-hex form
/// ("aa:bb:cc:dd:ee:ff") in config files.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl std::str::FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("'{s}' is not a MAC address"));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| format!("'{s}' is not a MAC address"))?;
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A router-attached Ethernet interface.
///
/// Immutable after startup. `name` mirrors the identifier the frame I/O
/// layer uses to label inbound frames and to address outbound sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

impl Interface {
    /// The interface name that designates the NAT-internal side by default.
    pub const DEFAULT_INTERNAL: &'static str = "eth1";
}

/// A static route: destination network reached via `gateway` out `interface`.
///
/// Matched by longest prefix: a candidate route matches a destination IP iff
/// `(dest_ip & mask) == (dest & mask)`; ties are broken by mask length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dest: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface: String,
}

impl Route {
    /// Number of leading one-bits in the mask, used to break prefix-match ties.
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.mask).leading_ones()
    }

    pub fn matches(&self, dest_ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        (u32::from(dest_ip) & mask) == (u32::from(self.dest) & mask)
    }
}

/// NAT tunables (spec.md §6), all with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub enabled: bool,
    pub internal_interface: String,
    pub icmp_timeout_secs: u64,
    pub tcp_established_timeout_secs: u64,
    pub tcp_transitory_timeout_secs: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            internal_interface: Interface::DEFAULT_INTERNAL.to_string(),
            icmp_timeout_secs: 60,
            tcp_established_timeout_secs: 7440,
            tcp_transitory_timeout_secs: 300,
            port_range_start: 50000,
            port_range_end: 59999,
        }
    }
}

/// Top-level router configuration, loaded once at startup (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub interfaces: Vec<Interface>,
    pub routes: Vec<Route>,
    #[serde(default)]
    pub nat: NatConfig,
}
