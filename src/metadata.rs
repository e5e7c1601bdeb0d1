//! Typed key/value sidecar attached to data frames.
//!
//! Metadata carries cross-layer hints (addresses, ports, protocol numbers)
//! without widening the PDU format. Values for on-the-wire quantities are
//! stored in network byte order; the component that first reads a value is
//! responsible for converting it. Readers must tolerate missing keys.
//! Copying a metadata map is shallow: the maps are independent but the
//! value storage is reference counted.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Well-known metadata keys.
pub mod keys {
    /// Source IPv4 address, network order.
    pub const IP_SRC: &'static str = "ipsrc";
    /// Destination IPv4 address, network order.
    pub const IP_DST: &'static str = "ipdst";
    /// Source transport port, network order.
    pub const PORT_SRC: &'static str = "portsrc";
    /// Destination transport port, network order.
    pub const PORT_DST: &'static str = "portdst";
    /// IP protocol number, host order.
    pub const PROTOCOL: &'static str = "protocol";
    /// Source MAC address of the captured frame, string form.
    pub const ETH_SRC: &'static str = "ethsrc";
    /// Destination MAC address of the captured frame, string form.
    pub const ETH_DST: &'static str = "ethdst";
    /// EtherType of the captured frame, host order.
    pub const ETHERTYPE: &'static str = "ethertype";
    /// Next-hop IPv4 address chosen by routing, network order.
    pub const NEXT_HOP: &'static str = "nexthop";
    /// Nonzero when the sender requested the IPv4 Don't Fragment flag.
    pub const DONT_FRAGMENT: &'static str = "df";
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    U32(u32),
    I32(i32),
    Str(String),
}

/// The metadata map itself.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    values: HashMap<String, Arc<MetaValue>>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata { values: HashMap::new() }
    }

    pub fn insert_u32(&mut self, key: &str, value: u32) {
        self.values.insert(key.to_owned(), Arc::new(MetaValue::U32(value)));
    }

    pub fn insert_i32(&mut self, key: &str, value: i32) {
        self.values.insert(key.to_owned(), Arc::new(MetaValue::I32(value)));
    }

    pub fn insert_str(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), Arc::new(MetaValue::Str(value.to_owned())));
    }

    /// Stores an IPv4 address in a `U32` slot in network byte order.
    pub fn insert_ipv4(&mut self, key: &str, addr: Ipv4Addr) {
        self.insert_u32(key, u32::from(addr).to_be());
    }

    /// Stores a transport port in a `U32` slot in network byte order.
    pub fn insert_port(&mut self, key: &str, port: u16) {
        self.insert_u32(key, port.to_be() as u32);
    }

    pub fn u32_value(&self, key: &str) -> Option<u32> {
        match self.values.get(key).map(|v| &**v) {
            Some(&MetaValue::U32(value)) => Some(value),
            _ => None,
        }
    }

    pub fn i32_value(&self, key: &str) -> Option<i32> {
        match self.values.get(key).map(|v| &**v) {
            Some(&MetaValue::I32(value)) => Some(value),
            _ => None,
        }
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        match self.values.get(key).map(|v| &**v) {
            Some(&MetaValue::Str(ref value)) => Some(&value[..]),
            _ => None,
        }
    }

    /// Reads a network-order `U32` slot back into an address.
    pub fn ipv4_value(&self, key: &str) -> Option<Ipv4Addr> {
        self.u32_value(key).map(|raw| Ipv4Addr::from(u32::from_be(raw)))
    }

    /// Reads a network-order port slot back into host order.
    pub fn port_value(&self, key: &str) -> Option<u16> {
        self.u32_value(key).map(|raw| u16::from_be(raw as u16))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
