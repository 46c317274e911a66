use std::net::Ipv4Addr;

use router_core::Route;

/// Static routing table, matched by longest prefix (spec.md §3, §4.3).
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Find the longest-prefix-match route for `dest_ip`, if any.
    ///
    /// Ties are broken by mask length (longer wins); among equal-length
    /// matches the first configured route wins, mirroring a stable sort.
    pub fn lookup(&self, dest_ip: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.matches(dest_ip))
            .fold(None, |best: Option<&Route>, candidate| match best {
                Some(current) if current.prefix_len() >= candidate.prefix_len() => Some(current),
                _ => Some(candidate),
            })
    }
}
