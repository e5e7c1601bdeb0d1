//! Daemon configuration.
//!
//! The configuration lives in a keyed JSON file. A missing file yields the
//! compiled-in defaults; a malformed file aborts startup. Everything here is
//! immutable once the stack is assembled, except for the parameters the
//! runtime manager can replace through control frames (routing table,
//! interface address, MTU).

use ipnetwork::{self, Ipv4Network};
use routing::RoutingTable;
use serde_json;

use std::fmt;
use std::fs::File;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    /// The netmask is not a contiguous prefix.
    BadNetmask(Ipv4Addr),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::Io(ref e) => write!(fmt, "unable to read configuration: {}", e),
            ConfigError::Parse(ref e) => write!(fmt, "malformed configuration: {}", e),
            ConfigError::BadNetmask(mask) => write!(fmt, "bad netmask: {}", mask),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the single interface the stack drives.
    pub interface_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Default gateway for off-link destinations.
    pub gateway: Ipv4Addr,
    /// MAC of the gateway, seeded into the neighbor cache at startup.
    pub gateway_mac: Option<String>,
    /// MAC the stack answers and sends with.
    pub interface_mac: String,
    pub mtu: usize,
    pub ttl: u8,
    /// Forward packets not addressed to us instead of dropping them.
    pub forwarding: bool,
    pub reassembly_timeout_s: u64,
    /// How long a delegated TCP connect may stay pending before the client
    /// gets ETIMEDOUT.
    pub connect_timeout_s: u64,
    pub queue_capacity: usize,
    /// Buffering attempts before an egress packet with an unresolved
    /// next-hop MAC is dropped.
    pub arp_retry_limit: u32,
    pub capture_pipe: String,
    pub inject_pipe: String,
    /// Socket-call records from the interception shim.
    pub channel_pipe: String,
    /// Replies back to the shim.
    pub reply_pipe: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            interface_addr: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 254),
            gateway_mac: None,
            interface_mac: "02:00:00:00:00:01".to_owned(),
            mtu: 1500,
            ttl: 64,
            forwarding: false,
            reassembly_timeout_s: 30,
            connect_timeout_s: 5,
            queue_capacity: 512,
            arp_retry_limit: 3,
            capture_pipe: "/tmp/netfabric/capture".to_owned(),
            inject_pipe: "/tmp/netfabric/inject".to_owned(),
            channel_pipe: "/tmp/netfabric/channel".to_owned(),
            reply_pipe: "/tmp/netfabric/reply".to_owned(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no configuration at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Config = serde_json::from_reader(file)?;
        config.interface_network()?;
        Ok(config)
    }

    /// The directly attached network of the interface.
    pub fn interface_network(&self) -> Result<Ipv4Network, ConfigError> {
        let prefix = ipnetwork::ipv4_mask_to_prefix(self.netmask)
            .map_err(|_| ConfigError::BadNetmask(self.netmask))?;
        Ipv4Network::new(self.interface_addr, prefix)
            .map_err(|_| ConfigError::BadNetmask(self.netmask))
    }

    /// The initial routing table: the link route plus the default route.
    pub fn initial_routes(&self) -> Result<RoutingTable, ConfigError> {
        let mut table = RoutingTable::new();
        table.add_route(self.interface_network()?, None, 0, 0);
        let default = Ipv4Network::new(Ipv4Addr::new(0, 0, 0, 0), 0)
            .expect("the zero network is always valid");
        table.add_route(default, Some(self.gateway), 0, 1);
        Ok(table)
    }
}
