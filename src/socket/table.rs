//! The logical socket table.
//!
//! One record per intercepted client socket, keyed by (pid, client fd).
//! The table itself is guarded by one mutex; lookups clone the per-socket
//! `Arc` out so per-socket operations only take that socket's own state
//! mutex. Every socket owns a bounded data queue that inbound frames are
//! demultiplexed into and `recv` drains from.

use frame::Frame;
use ipv4::{PROTO_TCP, PROTO_UDP};
use queue::{EnqueueError, FrameQueue};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

pub const LOCAL_PORT_RANGE_START: u16 = 32768;
pub const LOCAL_PORT_RANGE_END: u16 = 61000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Fresh,
    Bound,
    Connected,
    Listening,
}

/// Mutable per-socket state, guarded by the socket's own mutex.
#[derive(Debug)]
pub struct SocketState {
    pub local: Option<SocketAddrV4>,
    pub peer: Option<SocketAddrV4>,
    pub conn: ConnState,
    pub shut_rd: bool,
    pub shut_wr: bool,
    /// Deferred transport error (e.g. ECONNREFUSED from an ICMP port
    /// unreachable), returned and cleared by the next send/recv.
    pub pending_error: Option<u32>,
    /// Raw option storage keyed by (level, optname). Unknown options are
    /// stored and returned verbatim.
    pub options: HashMap<(u32, u32), Vec<u8>>,
}

impl SocketState {
    fn new() -> SocketState {
        SocketState {
            local: None,
            peer: None,
            conn: ConnState::Fresh,
            shut_rd: false,
            shut_wr: false,
            pending_error: None,
            options: HashMap::new(),
        }
    }

    pub fn take_error(&mut self) -> Option<u32> {
        self.pending_error.take()
    }
}

/// One intercepted client socket.
pub struct LogicalSocket {
    pub pid: u32,
    pub fd: i32,
    pub fabric_id: u32,
    pub sock_type: u32,
    pub protocol: u8,
    pub state: Mutex<SocketState>,
    /// Inbound frames waiting for `recv`.
    pub data: FrameQueue,
}

impl LogicalSocket {
    pub fn local(&self) -> Option<SocketAddrV4> {
        self.state.lock().unwrap().local
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.state.lock().unwrap().peer
    }
}

/// Outcome of an inbound demultiplex lookup.
pub enum MatchResult {
    Match(Arc<LogicalSocket>),
    /// A connected socket matched but the frame came from another peer.
    PeerMismatch,
    NoMatch,
}

struct TableInner {
    by_key: HashMap<(u32, i32), Arc<LogicalSocket>>,
    next_fabric_id: u32,
}

/// The socket table. Writes serialize on the table mutex; readers clone
/// the `Arc` out and work against the socket's own mutex.
pub struct SocketTable {
    inner: Mutex<TableInner>,
    data_queue_capacity: usize,
}

impl SocketTable {
    pub fn new(data_queue_capacity: usize) -> SocketTable {
        SocketTable {
            inner: Mutex::new(TableInner {
                by_key: HashMap::new(),
                next_fabric_id: 1,
            }),
            data_queue_capacity: data_queue_capacity,
        }
    }

    /// Allocates a logical socket for (pid, fd). Fails when the fd is
    /// already tracked for that process.
    pub fn create(&self,
                  pid: u32,
                  fd: i32,
                  sock_type: u32,
                  protocol: u8)
                  -> Result<Arc<LogicalSocket>, ()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_key.contains_key(&(pid, fd)) {
            return Err(());
        }
        let fabric_id = inner.next_fabric_id;
        inner.next_fabric_id += 1;
        let socket = Arc::new(LogicalSocket {
            pid: pid,
            fd: fd,
            fabric_id: fabric_id,
            sock_type: sock_type,
            protocol: protocol,
            state: Mutex::new(SocketState::new()),
            data: FrameQueue::new(&format!("sock{}", fabric_id), self.data_queue_capacity),
        });
        inner.by_key.insert((pid, fd), socket.clone());
        Ok(socket)
    }

    pub fn get(&self, pid: u32, fd: i32) -> Option<Arc<LogicalSocket>> {
        self.inner.lock().unwrap().by_key.get(&(pid, fd)).cloned()
    }

    /// Removes one socket and closes its data queue.
    pub fn remove(&self, pid: u32, fd: i32) -> Option<Arc<LogicalSocket>> {
        let socket = self.inner.lock().unwrap().by_key.remove(&(pid, fd));
        if let Some(ref socket) = socket {
            socket.data.close();
        }
        socket
    }

    /// Tears down every socket owned by `pid`; used when a client dies.
    pub fn remove_pid(&self, pid: u32) -> Vec<Arc<LogicalSocket>> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(u32, i32)> = inner.by_key
            .keys()
            .filter(|&&(owner, _)| owner == pid)
            .cloned()
            .collect();
        keys.into_iter()
            .map(|key| {
                let socket = inner.by_key.remove(&key).unwrap();
                socket.data.close();
                socket
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_key.len()
    }

    /// Closes every per-socket data queue, waking blocked `recv` calls.
    /// Part of stack shutdown.
    pub fn close_all(&self) {
        let inner = self.inner.lock().unwrap();
        for socket in inner.by_key.values() {
            socket.data.close();
        }
    }

    /// True when `addr` collides with an existing bind of the same
    /// protocol. An exact duplicate always collides; a wildcard bind
    /// collides with any specific bind on the port and vice versa.
    pub fn bind_conflict(&self, protocol: u8, addr: SocketAddrV4, exclude_id: u32) -> bool {
        let wildcard = Ipv4Addr::new(0, 0, 0, 0);
        let inner = self.inner.lock().unwrap();
        for socket in inner.by_key.values() {
            if socket.protocol != protocol || socket.fabric_id == exclude_id {
                continue;
            }
            let local = match socket.local() {
                Some(local) => local,
                None => continue,
            };
            if local.port() != addr.port() {
                continue;
            }
            if local.ip() == addr.ip() || *local.ip() == wildcard || *addr.ip() == wildcard {
                return true;
            }
        }
        false
    }

    /// Picks an unused ephemeral port for `protocol`.
    pub fn ephemeral_port(&self, protocol: u8) -> u16 {
        use rand::Rng;
        let mut rng = ::rand::thread_rng();
        loop {
            let port = rng.gen_range(LOCAL_PORT_RANGE_START..LOCAL_PORT_RANGE_END);
            if !self.bind_conflict(protocol, SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), port), 0) {
                return port;
            }
        }
    }

    /// Finds the socket an inbound frame belongs to.
    ///
    /// ICMP frames match on local address and protocol only; UDP/TCP
    /// frames match on (local port, local address, protocol), preferring
    /// an exact address over a wildcard bind. The connected-peer filter is
    /// applied to the matched socket, never before matching.
    pub fn match_inbound(&self,
                        protocol: u8,
                        local: SocketAddrV4,
                        remote: SocketAddrV4)
                        -> MatchResult {
        let wildcard = Ipv4Addr::new(0, 0, 0, 0);
        let inner = self.inner.lock().unwrap();
        let mut exact: Option<Arc<LogicalSocket>> = None;
        let mut wild: Option<Arc<LogicalSocket>> = None;
        for socket in inner.by_key.values() {
            if socket.protocol != protocol {
                continue;
            }
            let sock_local = match socket.local() {
                Some(sock_local) => sock_local,
                None => continue,
            };
            let port_ok = match protocol {
                PROTO_UDP | PROTO_TCP => sock_local.port() == local.port(),
                _ => true,
            };
            if !port_ok {
                continue;
            }
            if *sock_local.ip() == *local.ip() {
                exact = Some(socket.clone());
            } else if *sock_local.ip() == wildcard && wild.is_none() {
                wild = Some(socket.clone());
            }
        }
        let chosen = match exact.or(wild) {
            Some(chosen) => chosen,
            None => return MatchResult::NoMatch,
        };
        if let Some(peer) = chosen.peer() {
            if peer != remote {
                return MatchResult::PeerMismatch;
            }
        }
        MatchResult::Match(chosen)
    }
}

/// Queues an inbound frame on a socket without blocking the demux loop;
/// a full per-socket queue drops the datagram, matching UDP semantics.
pub fn offer_frame(socket: &LogicalSocket, frame: Frame) -> bool {
    match socket.data.try_enqueue(frame) {
        Ok(()) => true,
        Err(EnqueueError::Full(..)) | Err(EnqueueError::Closed(..)) => false,
    }
}

#[cfg(test)]
mod tests {
    use ipv4::{PROTO_ICMP, PROTO_UDP};

    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
    }

    fn bound(table: &SocketTable, pid: u32, fd: i32, proto: u8, local: SocketAddrV4)
             -> Arc<LogicalSocket> {
        let socket = table.create(pid, fd, super::super::channel::SOCK_DGRAM, proto).unwrap();
        {
            let mut state = socket.state.lock().unwrap();
            state.local = Some(local);
            state.conn = ConnState::Bound;
        }
        socket
    }

    #[test]
    fn create_assigns_distinct_fabric_ids() {
        let table = SocketTable::new(8);
        let a = table.create(100, 3, SOCK_DGRAM_TYPE, PROTO_UDP).unwrap();
        let b = table.create(100, 4, SOCK_DGRAM_TYPE, PROTO_UDP).unwrap();
        assert!(a.fabric_id != b.fabric_id);
        assert!(table.create(100, 3, SOCK_DGRAM_TYPE, PROTO_UDP).is_err());
    }

    const SOCK_DGRAM_TYPE: u32 = super::super::channel::SOCK_DGRAM;

    #[test]
    fn duplicate_bind_conflicts() {
        let table = SocketTable::new(8);
        bound(&table, 1, 3, PROTO_UDP, addr(10, 0, 0, 1, 5000));
        assert!(table.bind_conflict(PROTO_UDP, addr(10, 0, 0, 1, 5000), 0));
        assert!(!table.bind_conflict(PROTO_UDP, addr(10, 0, 0, 1, 5001), 0));
        // Different protocol, same port: no conflict.
        assert!(!table.bind_conflict(6, addr(10, 0, 0, 1, 5000), 0));
    }

    #[test]
    fn wildcard_and_specific_binds_conflict() {
        let table = SocketTable::new(8);
        bound(&table, 1, 3, PROTO_UDP, addr(0, 0, 0, 0, 5000));
        assert!(table.bind_conflict(PROTO_UDP, addr(10, 0, 0, 1, 5000), 0));

        let table2 = SocketTable::new(8);
        bound(&table2, 1, 3, PROTO_UDP, addr(10, 0, 0, 1, 5000));
        assert!(table2.bind_conflict(PROTO_UDP, addr(0, 0, 0, 0, 5000), 0));
    }

    #[test]
    fn exact_address_match_beats_wildcard() {
        let table = SocketTable::new(8);
        bound(&table, 1, 3, PROTO_UDP, addr(0, 0, 0, 0, 6000));
        let exact = bound(&table, 1, 4, PROTO_UDP, addr(10, 0, 0, 1, 6000));

        match table.match_inbound(PROTO_UDP, addr(10, 0, 0, 1, 6000), addr(192, 0, 2, 1, 9)) {
            MatchResult::Match(socket) => assert_eq!(socket.fabric_id, exact.fabric_id),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn connected_socket_filters_foreign_peers() {
        let table = SocketTable::new(8);
        let socket = bound(&table, 1, 3, PROTO_UDP, addr(10, 0, 0, 1, 6000));
        {
            let mut state = socket.state.lock().unwrap();
            state.peer = Some(addr(192, 0, 2, 1, 9));
            state.conn = ConnState::Connected;
        }
        match table.match_inbound(PROTO_UDP, addr(10, 0, 0, 1, 6000), addr(192, 0, 2, 2, 9)) {
            MatchResult::PeerMismatch => {}
            _ => panic!("expected a peer mismatch"),
        }
        match table.match_inbound(PROTO_UDP, addr(10, 0, 0, 1, 6000), addr(192, 0, 2, 1, 9)) {
            MatchResult::Match(..) => {}
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn icmp_matches_by_address_and_protocol_only() {
        let table = SocketTable::new(8);
        bound(&table, 1, 3, PROTO_ICMP, addr(10, 0, 0, 1, 0));
        match table.match_inbound(PROTO_ICMP, addr(10, 0, 0, 1, 4242), addr(192, 0, 2, 1, 0)) {
            MatchResult::Match(..) => {}
            _ => panic!("expected a match regardless of port"),
        }
    }

    #[test]
    fn remove_pid_tears_down_all_sockets() {
        let table = SocketTable::new(8);
        bound(&table, 7, 3, PROTO_UDP, addr(10, 0, 0, 1, 1000));
        bound(&table, 7, 4, PROTO_UDP, addr(10, 0, 0, 1, 1001));
        bound(&table, 8, 3, PROTO_UDP, addr(10, 0, 0, 1, 1002));
        let removed = table.remove_pid(7);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
        // The data queues of removed sockets are closed.
        assert!(removed[0].data.is_closed());
    }
}
