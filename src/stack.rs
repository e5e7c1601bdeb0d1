//! Assembly of the whole stack: queues, modules, threads and their
//! shutdown.

use arp::ArpModule;
use config::{Config, ConfigError};
use ethernet::{self, EthernetEndpoint, NeighborCache};
use fabric::Fabric;
use frame::ModuleId;
use icmp::IcmpModule;
use ipv4::Ipv4Module;
use rtm::RtmModule;
use sem::ChannelGate;
use socket::{ControlChannel, PendingExecs, SocketModule, SocketServer, SocketTable};
use switch::Switch;
use tcp::TcpModule;
use udp::UdpModule;

use pnet::util::MacAddr;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Error returned upon invalid configuration or failing I/O while the
/// stack is brought up. Fatal: the daemon reports it and exits nonzero.
#[derive(Debug)]
pub enum StackError {
    Config(ConfigError),
    Io(io::Error),
    BadMacAddr(String),
}

impl fmt::Display for StackError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StackError::Config(ref e) => write!(fmt, "configuration error: {}", e),
            StackError::Io(ref e) => write!(fmt, "i/o error: {}", e),
            StackError::BadMacAddr(ref s) => write!(fmt, "bad MAC address: {:?}", s),
        }
    }
}

impl From<ConfigError> for StackError {
    fn from(e: ConfigError) -> Self {
        StackError::Config(e)
    }
}

impl From<io::Error> for StackError {
    fn from(e: io::Error) -> Self {
        StackError::Io(e)
    }
}

pub type StackResult<T> = Result<T, StackError>;

/// One-shot shutdown latch shared by the runtime manager, the daemon and
/// whoever else needs to stop the stack.
#[derive(Default)]
pub struct ShutdownSignal {
    requested: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    pub fn request(&self) {
        let mut requested = self.requested.lock().unwrap();
        *requested = true;
        self.cv.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut requested = self.requested.lock().unwrap();
        while !*requested {
            requested = self.cv.wait(requested).unwrap();
        }
    }

    /// True when the signal fired within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut requested = self.requested.lock().unwrap();
        while !*requested {
            let (guard, result) = self.cv.wait_timeout(requested, timeout).unwrap();
            requested = guard;
            if result.timed_out() {
                return *requested;
            }
        }
        true
    }
}

/// The capture/inject byte streams of the link.
pub struct LinkStreams {
    pub capture: Box<dyn Read + Send>,
    pub inject: Box<dyn Write + Send>,
}

/// The assembled stack. Owns every module thread through the fabric.
pub struct NetworkStack {
    fabric: Fabric,
    shutdown: Arc<ShutdownSignal>,
    table: Arc<SocketTable>,
    neighbors: NeighborCache,
    stopped: bool,
}

impl NetworkStack {
    pub fn new(config: &Config,
               link: LinkStreams,
               channel: ControlChannel,
               gate: Box<dyn ChannelGate>)
               -> StackResult<NetworkStack> {
        let net = config.interface_network()?;
        let routes = config.initial_routes()?;
        let local_mac = MacAddr::from_str(&config.interface_mac)
            .map_err(|_| StackError::BadMacAddr(config.interface_mac.clone()))?;

        let neighbors = NeighborCache::new();
        if let Some(ref mac) = config.gateway_mac {
            let mac = MacAddr::from_str(mac).map_err(|_| StackError::BadMacAddr(mac.clone()))?;
            neighbors.insert(config.gateway, mac);
        }

        let mut fabric = Fabric::new(config.queue_capacity);
        for id in &[ModuleId::Ethernet,
                    ModuleId::Ipv4,
                    ModuleId::Tcp,
                    ModuleId::Udp,
                    ModuleId::Socket,
                    ModuleId::Arp,
                    ModuleId::Icmp,
                    ModuleId::Rtm] {
            fabric.register(*id);
        }
        let switch = Switch::new(&fabric);

        let shutdown = Arc::new(ShutdownSignal::new());
        let alert_serial = Arc::new(AtomicU32::new(0));
        let table = Arc::new(SocketTable::new(config.queue_capacity));
        let pending_execs: PendingExecs = Arc::new(Mutex::new(HashMap::new()));

        fabric.spawn(ModuleId::Ipv4,
                     Ipv4Module::new(net,
                                     routes,
                                     config.mtu,
                                     config.ttl,
                                     config.forwarding,
                                     Duration::from_secs(config.reassembly_timeout_s)));
        fabric.spawn(ModuleId::Icmp, IcmpModule::new());
        fabric.spawn(ModuleId::Udp, UdpModule::new());
        fabric.spawn(ModuleId::Tcp, TcpModule::new());
        fabric.spawn(ModuleId::Arp, ArpModule::new());
        fabric.spawn(ModuleId::Rtm, RtmModule::new(shutdown.clone()));
        fabric.spawn(ModuleId::Ethernet,
                     EthernetEndpoint::new(link.inject,
                                           local_mac,
                                           neighbors.clone(),
                                           config.arp_retry_limit,
                                           alert_serial.clone()));
        fabric.spawn(ModuleId::Socket,
                     SocketModule::new(table.clone(), pending_execs.clone()));

        let ethernet_egress = fabric.endpoint(ModuleId::Ethernet)
            .expect("ethernet just registered")
            .egress
            .clone();
        let capture = ethernet::spawn_capture(link.capture,
                                              ethernet_egress,
                                              neighbors.clone(),
                                              alert_serial);
        fabric.adopt(capture);

        let socket_egress = fabric.endpoint(ModuleId::Socket)
            .expect("socket just registered")
            .egress
            .clone();
        let server = SocketServer::new(channel,
                                       gate,
                                       table.clone(),
                                       socket_egress,
                                       config.interface_addr,
                                       pending_execs,
                                       Duration::from_secs(config.connect_timeout_s));
        fabric.adopt(server.spawn());

        fabric.adopt(switch.spawn());

        info!("stack up on {} ({})", config.interface_addr, local_mac);
        Ok(NetworkStack {
            fabric: fabric,
            shutdown: shutdown,
            table: table,
            neighbors: neighbors,
            stopped: false,
        })
    }

    /// The latch that stops the stack; the runtime manager pulls it on a
    /// fatal alert.
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    pub fn socket_table(&self) -> Arc<SocketTable> {
        self.table.clone()
    }

    pub fn neighbors(&self) -> NeighborCache {
        self.neighbors.clone()
    }

    /// Blocks until shutdown is requested, then stops every thread.
    pub fn run(mut self) {
        self.shutdown.wait();
        self.stop();
    }

    /// Closes every queue and joins the fabric threads.
    ///
    /// The control-channel gate and the capture stream must be released by
    /// the caller first (close the shim side, end the capture stream),
    /// otherwise their threads stay parked in blocking reads.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("stopping stack");
        self.shutdown.request();
        self.table.close_all();
        self.fabric.shutdown();
        self.fabric.join();
    }
}

impl Drop for NetworkStack {
    fn drop(&mut self) {
        // Close the queues so module loops wind down even when `stop` was
        // never called; threads that may be parked in external reads are
        // not joined here.
        if !self.stopped {
            self.shutdown.request();
            self.table.close_all();
            self.fabric.shutdown();
        }
    }
}
