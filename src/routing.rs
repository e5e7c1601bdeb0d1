//! The IPv4 routing table.
//!
//! An ordered list of prefix entries. Lookup takes the longest matching
//! prefix; ties break on the lower metric, then on insertion order. The
//! table is owned by the IPv4 module thread and only replaced wholesale
//! through a runtime-manager control frame.

use ipnetwork::Ipv4Network;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// One routing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub net: Ipv4Network,
    /// Next hop; `None` for directly attached networks.
    pub gateway: Option<Ipv4Addr>,
    /// Output interface index. The stack drives a single interface, so this
    /// is 0 everywhere today.
    pub interface: u32,
    pub metric: u32,
}

/// Routing table keyed by prefix length so that lookups can walk prefixes
/// from most to least specific.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    table: BTreeMap<u8, Vec<Route>>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable { table: BTreeMap::new() }
    }

    pub fn add_route(&mut self,
                     net: Ipv4Network,
                     gateway: Option<Ipv4Addr>,
                     interface: u32,
                     metric: u32) {
        let entry = Route {
            net: net,
            gateway: gateway,
            interface: interface,
            metric: metric,
        };
        self.table.entry(net.prefix()).or_insert_with(Vec::new).push(entry);
    }

    /// Longest-prefix match for `ip`.
    pub fn route(&self, ip: Ipv4Addr) -> Option<&Route> {
        for (_prefix, entries) in self.table.iter().rev() {
            let mut best: Option<&Route> = None;
            for entry in entries {
                if !entry.net.contains(ip) {
                    continue;
                }
                // Insertion order wins among equal metrics.
                match best {
                    Some(current) if entry.metric >= current.metric => {}
                    _ => best = Some(entry),
                }
            }
            if best.is_some() {
                return best;
            }
        }
        None
    }

    /// Every entry, most specific prefix first. Used by the runtime manager
    /// to read the table out.
    pub fn routes(&self) -> Vec<Route> {
        let mut all = Vec::new();
        for (_prefix, entries) in self.table.iter().rev() {
            all.extend(entries.iter().cloned());
        }
        all
    }

    /// Replaces the whole table.
    pub fn replace(&mut self, routes: Vec<Route>) {
        self.table.clear();
        for route in routes {
            self.table.entry(route.net.prefix()).or_insert_with(Vec::new).push(route);
        }
    }

    pub fn len(&self) -> usize {
        self.table.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
