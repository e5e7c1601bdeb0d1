//! The Ethernet endpoint: the stack's connection to the link.
//!
//! Two byte streams carry `{u32 little-endian length, frame bytes}` records
//! of complete Ethernet II frames. The capture reader runs as its own
//! thread, strips the Ethernet header, notes the MACs and EtherType in
//! metadata and addresses the datagram to IPv4. The inject side is the
//! module's regular fabric handler: it resolves the next-hop MAC, prepends
//! the header and writes the record out. A failure on either stream raises
//! a fatal alert to the runtime manager and shuts the endpoint down
//! gracefully.
//!
//! Next-hop MACs come from a neighbor cache fed passively by captured
//! frames and by configuration; full ARP resolution is out of scope. An
//! unresolved next hop triggers a resolution request to the ARP module and
//! the packet is buffered for a bounded number of attempts, then dropped.

use arp;
use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlData, CtrlFrame, CtrlOpcode, DataFrame, DestList, Direction, Frame, FrameBody,
            ModuleId};
use metadata::{keys, Metadata};
use queue::FrameQueue;
use rtm::ETHERNET_DOWN;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::util::MacAddr;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Ethernet II header size.
pub const HEADER_SIZE: usize = 14;
/// Upper bound accepted for one captured record.
const MAX_FRAME: u32 = 256 * 1024;

/// Shared IPv4 → MAC mapping. Fed by the capture thread and by
/// configuration, read by the inject path.
#[derive(Clone, Default)]
pub struct NeighborCache {
    inner: Arc<Mutex<HashMap<Ipv4Addr, MacAddr>>>,
}

impl NeighborCache {
    pub fn new() -> NeighborCache {
        NeighborCache::default()
    }

    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.inner.lock().unwrap().insert(ip, mac);
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.inner.lock().unwrap().get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

fn fatal_alert(serial: &AtomicU32) -> CtrlFrame {
    CtrlFrame {
        sender: ModuleId::Ethernet,
        opcode: CtrlOpcode::Alert,
        serial: serial.fetch_add(1, Ordering::SeqCst).wrapping_add(1),
        name: ETHERNET_DOWN.to_owned(),
        data: CtrlData::None,
    }
}

/// Spawns the capture reader. Records are parsed, learned from and pushed
/// onto the Ethernet module's egress queue addressed to IPv4 (or ARP). A
/// zero-length record, end of stream or a read error ends the thread with a
/// fatal alert toward the runtime manager.
pub fn spawn_capture(reader: Box<dyn Read + Send>,
                     egress: FrameQueue,
                     neighbors: NeighborCache,
                     alert_serial: Arc<AtomicU32>)
                     -> JoinHandle<()> {
    thread::Builder::new()
        .name("netfabric-capture".to_owned())
        .spawn(move || {
            let mut reader = reader;
            loop {
                match read_record(&mut reader) {
                    Ok(Some(bytes)) => {
                        if !capture_one(&bytes, &egress, &neighbors) {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("capture stream ended");
                        let alert = Frame::control(DestList::to(ModuleId::Rtm),
                                                   fatal_alert(&alert_serial));
                        let _ = egress.enqueue(alert);
                        break;
                    }
                    Err(e) => {
                        error!("capture stream failed: {}", e);
                        let alert = Frame::control(DestList::to(ModuleId::Rtm),
                                                   fatal_alert(&alert_serial));
                        let _ = egress.enqueue(alert);
                        break;
                    }
                }
            }
            debug!("capture thread quitting");
        })
        .expect("failed to spawn capture thread")
}

/// Reads one length-prefixed record. `None` is the end-of-stream marker
/// (length zero or EOF at the record boundary).
fn read_record(reader: &mut Box<dyn Read + Send>) -> io::Result<Option<Vec<u8>>> {
    let length = match reader.read_u32::<LittleEndian>() {
        Ok(length) => length,
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if length == 0 {
        return Ok(None);
    }
    if length > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData,
                                  format!("captured record of {} bytes", length)));
    }
    let mut bytes = vec![0u8; length as usize];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

/// Parses one captured frame and hands it to the switch. Returns false
/// once the fabric is shutting down.
fn capture_one(bytes: &[u8], egress: &FrameQueue, neighbors: &NeighborCache) -> bool {
    if bytes.len() < HEADER_SIZE {
        debug!("capture: runt frame of {} bytes", bytes.len());
        return true;
    }
    let eth_pkg = EthernetPacket::new(bytes).unwrap();
    let ethertype = eth_pkg.get_ethertype();
    let mut meta = Metadata::new();
    meta.insert_str(keys::ETH_SRC, &eth_pkg.get_source().to_string());
    meta.insert_str(keys::ETH_DST, &eth_pkg.get_destination().to_string());
    meta.insert_u32(keys::ETHERTYPE, ethertype.0 as u32);

    let upper = match ethertype {
        EtherTypes::Ipv4 => {
            // Passive neighbor learning: the sender's MAC answers for its
            // source address.
            if let Some(ip_pkg) = Ipv4Packet::new(eth_pkg.payload()) {
                let src = ip_pkg.get_source();
                if src != Ipv4Addr::new(0, 0, 0, 0) {
                    neighbors.insert(src, eth_pkg.get_source());
                }
            }
            ModuleId::Ipv4
        }
        EtherTypes::Arp => ModuleId::Arp,
        other => {
            trace!("capture: ignoring EtherType {}", other);
            return true;
        }
    };
    let frame = Frame::data(DestList::to(upper),
                            Direction::Up,
                            bytes[HEADER_SIZE..].to_vec(),
                            meta);
    egress.enqueue(frame).is_ok()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EthernetStats {
    pub frames_injected: u64,
    pub dropped_unresolved: u64,
    pub dropped_invalid: u64,
    pub dropped_down: u64,
}

struct PendingNexthop {
    attempts: u32,
    frames: Vec<(Vec<u8>, Metadata)>,
}

/// The inject side of the endpoint; the module's fabric handler.
pub struct EthernetEndpoint {
    writer: Box<dyn Write + Send>,
    local_mac: MacAddr,
    neighbors: NeighborCache,
    pending: HashMap<Ipv4Addr, PendingNexthop>,
    retry_limit: u32,
    alert_serial: Arc<AtomicU32>,
    alive: bool,
    stats: EthernetStats,
}

impl EthernetEndpoint {
    pub fn new(writer: Box<dyn Write + Send>,
               local_mac: MacAddr,
               neighbors: NeighborCache,
               retry_limit: u32,
               alert_serial: Arc<AtomicU32>)
               -> EthernetEndpoint {
        EthernetEndpoint {
            writer: writer,
            local_mac: local_mac,
            neighbors: neighbors,
            pending: HashMap::new(),
            retry_limit: retry_limit,
            alert_serial: alert_serial,
            alive: true,
            stats: EthernetStats::default(),
        }
    }

    pub fn stats(&self) -> &EthernetStats {
        &self.stats
    }

    fn egress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        if !self.alive {
            self.stats.dropped_down += 1;
            return;
        }
        let nexthop = match data.meta
            .ipv4_value(keys::NEXT_HOP)
            .or_else(|| data.meta.ipv4_value(keys::IP_DST)) {
            Some(nexthop) => nexthop,
            None => {
                warn!("ethernet: egress frame without next hop");
                self.stats.dropped_invalid += 1;
                return;
            }
        };
        match self.neighbors.lookup(nexthop) {
            Some(mac) => self.transmit(&data.pdu, mac, ctx),
            None => self.buffer_unresolved(nexthop, data, ctx),
        }
    }

    fn buffer_unresolved(&mut self, nexthop: Ipv4Addr, data: DataFrame, ctx: &mut ModuleContext) {
        trace!("ethernet: no MAC for {}, asking arp", nexthop);
        let _ = ctx.send_exec(ModuleId::Arp,
                              arp::RESOLVE,
                              CtrlData::Bytes(nexthop.octets().to_vec()));
        self.pending
            .entry(nexthop)
            .or_insert_with(|| {
                PendingNexthop {
                    attempts: 0,
                    frames: Vec::new(),
                }
            })
            .frames
            .push((data.pdu, data.meta));
    }

    fn transmit(&mut self, pdu: &[u8], dst_mac: MacAddr, ctx: &mut ModuleContext) {
        let mut buffer = vec![0u8; HEADER_SIZE + pdu.len()];
        {
            let mut eth_pkg = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth_pkg.set_source(self.local_mac);
            eth_pkg.set_destination(dst_mac);
            eth_pkg.set_ethertype(EtherTypes::Ipv4);
            eth_pkg.set_payload(pdu);
        }
        let result = self.writer
            .write_u32::<LittleEndian>(buffer.len() as u32)
            .and_then(|()| self.writer.write_all(&buffer))
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => self.stats.frames_injected += 1,
            Err(e) => self.fatal(e, ctx),
        }
    }

    fn fatal(&mut self, e: io::Error, ctx: &mut ModuleContext) {
        error!("inject stream failed: {}", e);
        self.alive = false;
        self.pending.clear();
        let alert = Frame::control(DestList::to(ModuleId::Rtm), fatal_alert(&self.alert_serial));
        let _ = ctx.send(alert);
    }

    /// Retries buffered frames whose next hop may have been learned since,
    /// drops them once the attempt budget is spent.
    fn retry_pending(&mut self, ctx: &mut ModuleContext) {
        if self.pending.is_empty() {
            return;
        }
        let nexthops: Vec<Ipv4Addr> = self.pending.keys().cloned().collect();
        for nexthop in nexthops {
            let resolved = self.neighbors.lookup(nexthop);
            let mut entry = self.pending.remove(&nexthop).unwrap();
            match resolved {
                Some(mac) => {
                    for (pdu, _meta) in entry.frames {
                        self.transmit(&pdu, mac, ctx);
                    }
                }
                None if entry.attempts >= self.retry_limit => {
                    debug!("ethernet: next hop {} unresolved, dropping {} frames",
                           nexthop,
                           entry.frames.len());
                    self.stats.dropped_unresolved += entry.frames.len() as u64;
                }
                None => {
                    entry.attempts += 1;
                    let _ = ctx.send_exec(ModuleId::Arp,
                                          arp::RESOLVE,
                                          CtrlData::Bytes(nexthop.octets().to_vec()));
                    self.pending.insert(nexthop, entry);
                }
            }
        }
    }
}

impl FrameHandler for EthernetEndpoint {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(data) => {
                match data.direction {
                    Direction::Down => self.egress(data, ctx),
                    Direction::Up => {
                        warn!("ethernet: unexpected UP frame on module ingress");
                        self.stats.dropped_invalid += 1;
                    }
                }
            }
            FrameBody::Control(ctrl) => {
                match ctrl.opcode {
                    // The skeleton ARP module acknowledges without a MAC;
                    // the retry/drop budget is handled from tick.
                    CtrlOpcode::ExecReply => trace!("ethernet: resolve ack {}", ctrl.name),
                    CtrlOpcode::Error => {
                        warn!("ethernet: control error {} from {}", ctrl.name, ctrl.sender)
                    }
                    _ => debug!("ethernet: ignoring {} control frame", ctrl.opcode),
                }
            }
        }
    }

    fn tick(&mut self, ctx: &mut ModuleContext) {
        self.retry_pending(ctx);
    }

    fn stopped(&mut self, _ctx: &mut ModuleContext) {
        debug!("ethernet: final stats {:?}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use fabric::ModuleContext;
    use frame::{DataFrame, Direction, ModuleId};
    use metadata::{keys, Metadata};
    use queue::FrameQueue;

    use byteorder::{LittleEndian, ReadBytesExt};

    use pnet::packet::ethernet::EthernetPacket;
    use pnet::util::MacAddr;

    use std::io::{self, Cursor, Read, Write};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    /// Write half that collects everything into an mpsc channel.
    struct ChannelWriter {
        tx: mpsc::Sender<Vec<u8>>,
    }

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn endpoint() -> (EthernetEndpoint, NeighborCache, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let neighbors = NeighborCache::new();
        let endpoint = EthernetEndpoint::new(Box::new(ChannelWriter { tx: tx }),
                                             MacAddr::new(0, 1, 2, 3, 4, 5),
                                             neighbors.clone(),
                                             2,
                                             Arc::new(AtomicU32::new(0)));
        (endpoint, neighbors, rx)
    }

    fn down_frame(dst: Ipv4Addr) -> DataFrame {
        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_DST, dst);
        meta.insert_ipv4(keys::NEXT_HOP, dst);
        DataFrame {
            direction: Direction::Down,
            pdu: vec![0x45, 0, 0, 20],
            meta: meta,
        }
    }

    fn drain(rx: &mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(100)) {
            bytes.extend_from_slice(&chunk);
            if bytes.len() >= 4 {
                let want = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                if bytes.len() >= 4 + want {
                    break;
                }
            }
        }
        bytes
    }

    #[test]
    fn resolved_frames_are_injected_with_header() {
        let (mut endpoint, neighbors, rx) = endpoint();
        let egress = FrameQueue::new("ethernet2switch", 8);
        let mut ctx = ModuleContext::new(ModuleId::Ethernet, egress);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        neighbors.insert(dst, mac);

        endpoint.egress(down_frame(dst), &mut ctx);

        let bytes = drain(&rx);
        let mut cursor = Cursor::new(&bytes[..]);
        let length = cursor.read_u32::<LittleEndian>().unwrap() as usize;
        assert_eq!(length, HEADER_SIZE + 4);
        let frame = &bytes[4..4 + length];
        let eth_pkg = EthernetPacket::new(frame).unwrap();
        assert_eq!(eth_pkg.get_destination(), mac);
        assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Ipv4);
        assert_eq!(endpoint.stats().frames_injected, 1);
    }

    #[test]
    fn unresolved_frames_ask_arp_then_drop() {
        let (mut endpoint, _neighbors, _rx) = endpoint();
        let egress = FrameQueue::new("ethernet2switch", 8);
        let mut ctx = ModuleContext::new(ModuleId::Ethernet, egress.clone());
        let dst = Ipv4Addr::new(10, 0, 0, 3);

        endpoint.egress(down_frame(dst), &mut ctx);
        // The resolution request went out immediately.
        let request = egress.try_dequeue().unwrap();
        assert_eq!(request.dst.head(), ModuleId::Arp);

        // Burn through the attempt budget.
        endpoint.tick(&mut ctx);
        endpoint.tick(&mut ctx);
        endpoint.tick(&mut ctx);
        assert_eq!(endpoint.stats().dropped_unresolved, 1);
    }

    #[test]
    fn late_resolution_flushes_buffered_frames() {
        let (mut endpoint, neighbors, rx) = endpoint();
        let egress = FrameQueue::new("ethernet2switch", 8);
        let mut ctx = ModuleContext::new(ModuleId::Ethernet, egress);
        let dst = Ipv4Addr::new(10, 0, 0, 4);

        endpoint.egress(down_frame(dst), &mut ctx);
        neighbors.insert(dst, MacAddr::new(1, 1, 1, 1, 1, 1));
        endpoint.tick(&mut ctx);

        let bytes = drain(&rx);
        assert!(bytes.len() > 4);
        assert_eq!(endpoint.stats().frames_injected, 1);
    }

    #[test]
    fn capture_parses_learns_and_strips() {
        let egress = FrameQueue::new("ethernet2switch", 8);
        let neighbors = NeighborCache::new();

        // Ethernet(IPv4(src 10.0.0.2)) with a 20-byte header.
        let mut frame = vec![0u8; HEADER_SIZE + 20];
        {
            use pnet::packet::MutablePacket;
            use pnet::packet::ethernet::MutableEthernetPacket;
            use pnet::packet::ipv4::MutableIpv4Packet;
            let mut eth_pkg = MutableEthernetPacket::new(&mut frame).unwrap();
            eth_pkg.set_source(MacAddr::new(2, 2, 2, 2, 2, 2));
            eth_pkg.set_destination(MacAddr::new(3, 3, 3, 3, 3, 3));
            eth_pkg.set_ethertype(EtherTypes::Ipv4);
            let mut ip_pkg = MutableIpv4Packet::new(eth_pkg.payload_mut()).unwrap();
            ip_pkg.set_version(4);
            ip_pkg.set_header_length(5);
            ip_pkg.set_source(Ipv4Addr::new(10, 0, 0, 2));
            ip_pkg.set_destination(Ipv4Addr::new(10, 0, 0, 1));
        }

        assert!(capture_one(&frame, &egress, &neighbors));
        let delivered = egress.try_dequeue().unwrap();
        assert_eq!(delivered.dst.head(), ModuleId::Ipv4);
        let data = delivered.as_data().unwrap();
        assert_eq!(data.direction, Direction::Up);
        assert_eq!(data.pdu.len(), 20);
        assert_eq!(data.meta.str_value(keys::ETH_SRC), Some("02:02:02:02:02:02"));
        assert_eq!(data.meta.u32_value(keys::ETHERTYPE), Some(0x0800));
        assert_eq!(neighbors.lookup(Ipv4Addr::new(10, 0, 0, 2)),
                   Some(MacAddr::new(2, 2, 2, 2, 2, 2)));
    }

    #[test]
    fn read_record_handles_eof_and_zero() {
        let mut reader: Box<dyn Read + Send> = Box::new(Cursor::new(Vec::new()));
        assert!(read_record(&mut reader).unwrap().is_none());

        let mut zero: Box<dyn Read + Send> = Box::new(Cursor::new(vec![0u8; 4]));
        assert!(read_record(&mut zero).unwrap().is_none());

        let mut record = vec![3u8, 0, 0, 0];
        record.extend_from_slice(&[9, 9, 9]);
        let mut ok: Box<dyn Read + Send> = Box::new(Cursor::new(record));
        assert_eq!(read_record(&mut ok).unwrap().unwrap(), vec![9, 9, 9]);
    }
}
