//! The socket handler: the stack's face toward intercepted clients.
//!
//! Two halves share the logical socket table. The `SocketServer` thread
//! serves socket-call records arriving over the host-local control channel
//! (see `channel`); the `SocketModule` is the regular fabric handler that
//! demultiplexes inbound data frames onto per-socket data queues and turns
//! transport errors relayed by UDP/TCP into pending socket errors.

pub mod channel;
pub mod table;

mod server;

pub use self::channel::{ControlChannel, errno, opcodes};
pub use self::server::SocketServer;
pub use self::table::{ConnState, LogicalSocket, MatchResult, SocketTable};

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlData, CtrlFrame, CtrlOpcode, DataFrame, DestList, ErrorKind, Frame, FrameBody,
            ModuleId, ParamValue};
use icmp;
use ipv4::{self, PROTO_UDP};
use metadata::keys;

use pnet::packet::ipv4::Ipv4Packet;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Waiters for `ExecReply` frames, keyed by the serial of the request the
/// server sent on behalf of a blocked client call.
pub type PendingExecs = Arc<Mutex<HashMap<u32, mpsc::Sender<u32>>>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SocketStats {
    pub delivered: u64,
    pub dropped_no_match: u64,
    pub dropped_peer_mismatch: u64,
    pub dropped_queue_full: u64,
    pub errors_stored: u64,
}

/// The fabric-facing half of the socket handler.
pub struct SocketModule {
    table: Arc<SocketTable>,
    pending_execs: PendingExecs,
    stats: SocketStats,
}

impl SocketModule {
    pub fn new(table: Arc<SocketTable>, pending_execs: PendingExecs) -> SocketModule {
        SocketModule {
            table: table,
            pending_execs: pending_execs,
            stats: SocketStats::default(),
        }
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }

    /// Demultiplexes one inbound data frame onto the owning socket's data
    /// queue.
    fn demux(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        let protocol = match data.meta.u32_value(keys::PROTOCOL) {
            Some(protocol) => protocol as u8,
            None => {
                debug!("socket: inbound frame without protocol metadata");
                self.stats.dropped_no_match += 1;
                return;
            }
        };
        let src = data.meta.ipv4_value(keys::IP_SRC).unwrap_or(Ipv4Addr::new(0, 0, 0, 0));
        let dst = data.meta.ipv4_value(keys::IP_DST).unwrap_or(Ipv4Addr::new(0, 0, 0, 0));
        let sport = data.meta.port_value(keys::PORT_SRC).unwrap_or(0);
        let dport = data.meta.port_value(keys::PORT_DST).unwrap_or(0);
        let local = SocketAddrV4::new(dst, dport);
        let remote = SocketAddrV4::new(src, sport);

        match self.table.match_inbound(protocol, local, remote) {
            MatchResult::Match(socket) => {
                let frame = Frame::data(DestList::to(ctx.id()),
                                        data.direction,
                                        data.pdu,
                                        data.meta);
                if table::offer_frame(&socket, frame) {
                    self.stats.delivered += 1;
                } else {
                    trace!("socket: data queue of fd {} full, dropping", socket.fd);
                    self.stats.dropped_queue_full += 1;
                }
            }
            MatchResult::PeerMismatch => {
                trace!("socket: datagram from foreign peer {}, dropping", remote);
                self.stats.dropped_peer_mismatch += 1;
            }
            MatchResult::NoMatch => {
                debug!("socket: no socket for {}:{} proto {}", dst, dport, protocol);
                self.stats.dropped_no_match += 1;
                if protocol == PROTO_UDP {
                    let offending = ipv4::synthesize_offending(src, dst, protocol, &data.pdu);
                    let _ = icmp::error_request(ctx, ErrorKind::PortUnreachable, offending);
                }
            }
        }
    }

    /// Stores a transport error against the socket that sent the offending
    /// datagram. The report detail embeds the original outbound datagram
    /// (IP header plus 8 transport octets), which is enough to identify
    /// the socket.
    fn store_error(&mut self, ctrl: CtrlFrame) {
        let report = match ctrl.data {
            CtrlData::Error(report) => report,
            other => {
                debug!("socket: error frame without report: {:?}", other);
                return;
            }
        };
        if report.detail.len() < Ipv4Packet::minimum_packet_size() + 4 {
            debug!("socket: error report too short to identify a socket");
            return;
        }
        let (protocol, src, dst, header_len) = {
            let pkg = Ipv4Packet::new(&report.detail).unwrap();
            (pkg.get_next_level_protocol().0,
             pkg.get_source(),
             pkg.get_destination(),
             pkg.get_header_length() as usize * 4)
        };
        if report.detail.len() < header_len + 4 {
            return;
        }
        let transport = &report.detail[header_len..];
        let sport = u16::from_be_bytes([transport[0], transport[1]]);
        let dport = u16::from_be_bytes([transport[2], transport[3]]);

        // The aggrieved socket is the local sender of the original
        // datagram.
        let local = SocketAddrV4::new(src, sport);
        let remote = SocketAddrV4::new(dst, dport);
        match self.table.match_inbound(protocol, local, remote) {
            MatchResult::Match(socket) => {
                let errno = channel::errno_for_kind(report.kind);
                debug!("socket: storing errno {} on fd {} ({})",
                       errno,
                       socket.fd,
                       report.kind);
                socket.state.lock().unwrap().pending_error = Some(errno);
                self.stats.errors_stored += 1;
            }
            _ => trace!("socket: no socket for error report {}", report.kind),
        }
    }

    /// Completes a call the server parked while waiting on another module.
    fn complete_exec(&mut self, ctrl: CtrlFrame) {
        let errno = match ctrl.data {
            CtrlData::Param(ParamValue::U32(errno)) => errno,
            _ => channel::errno::EOPNOTSUPP,
        };
        let waiter = self.pending_execs.lock().unwrap().remove(&ctrl.serial);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(errno);
            }
            None => debug!("socket: stray exec reply serial {}", ctrl.serial),
        }
    }

    fn control(&mut self, ctrl: CtrlFrame, _ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Error if ctrl.sender == ModuleId::Switch => {
                warn!("socket: switch error {}", ctrl.name);
            }
            CtrlOpcode::Error => self.store_error(ctrl),
            CtrlOpcode::ExecReply => self.complete_exec(ctrl),
            _ => debug!("socket: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for SocketModule {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(data) => self.demux(data, ctx),
            FrameBody::Control(ctrl) => self.control(ctrl, ctx),
        }
    }

    fn stopped(&mut self, _ctx: &mut ModuleContext) {
        debug!("socket: final stats {:?}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use fabric::ModuleContext;
    use frame::{CtrlData, CtrlFrame, CtrlOpcode, DestList, Direction, ErrorKind, ErrorReport,
                Frame, ModuleId};
    use ipv4::{self, PROTO_UDP};
    use metadata::{keys, Metadata};
    use queue::FrameQueue;

    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc, Mutex};

    use super::table::ConnState;
    use super::*;

    fn setup() -> (SocketModule, Arc<SocketTable>, ModuleContext, FrameQueue) {
        let table = Arc::new(SocketTable::new(8));
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let module = SocketModule::new(table.clone(), pending);
        let egress = FrameQueue::new("socket2switch", 16);
        let ctx = ModuleContext::new(ModuleId::Socket, egress.clone());
        (module, table, ctx, egress)
    }

    fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Frame {
        let mut pdu = Vec::new();
        pdu.extend_from_slice(&src.port().to_be_bytes());
        pdu.extend_from_slice(&dst.port().to_be_bytes());
        pdu.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        pdu.extend_from_slice(&[0, 0]);
        pdu.extend_from_slice(payload);
        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_SRC, *src.ip());
        meta.insert_ipv4(keys::IP_DST, *dst.ip());
        meta.insert_port(keys::PORT_SRC, src.port());
        meta.insert_port(keys::PORT_DST, dst.port());
        meta.insert_u32(keys::PROTOCOL, PROTO_UDP as u32);
        Frame::data(DestList::to(ModuleId::Socket), Direction::Up, pdu, meta)
    }

    #[test]
    fn matching_datagram_lands_on_socket_queue() {
        let (mut module, table, mut ctx, _egress) = setup();
        let socket = table.create(1, 3, channel::SOCK_DGRAM, PROTO_UDP).unwrap();
        {
            let mut state = socket.state.lock().unwrap();
            state.local = Some(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 5000));
            state.conn = ConnState::Bound;
        }

        let frame = udp_frame(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 40000),
                              SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5000),
                              b"ping");
        module.handle(frame, &mut ctx);
        assert_eq!(module.stats().delivered, 1);
        let queued = socket.data.try_dequeue().unwrap();
        assert_eq!(&queued.as_data().unwrap().pdu[8..], b"ping");
    }

    #[test]
    fn unmatched_udp_asks_for_port_unreachable() {
        let (mut module, _table, mut ctx, egress) = setup();
        let frame = udp_frame(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 40000),
                              SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9999),
                              b"nobody");
        module.handle(frame, &mut ctx);
        assert_eq!(module.stats().dropped_no_match, 1);

        let request = egress.try_dequeue().unwrap();
        assert_eq!(request.dst.head(), ModuleId::Icmp);
        let ctrl = request.as_control().unwrap();
        assert_eq!(ctrl.opcode, CtrlOpcode::Exec);
        assert_eq!(ctrl.name, ErrorKind::PortUnreachable.wire_name());
    }

    #[test]
    fn transport_error_is_stored_on_the_sender_socket() {
        let (mut module, table, mut ctx, _egress) = setup();
        let socket = table.create(1, 3, channel::SOCK_DGRAM, PROTO_UDP).unwrap();
        {
            let mut state = socket.state.lock().unwrap();
            state.local = Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4444));
            state.conn = ConnState::Bound;
        }

        // Original outbound datagram: 10.0.0.1:4444 -> 192.0.2.9:7777.
        let transport = [0x11, 0x5c, 0x1e, 0x61, 0, 12, 0, 0];
        let offending = ipv4::synthesize_offending(Ipv4Addr::new(10, 0, 0, 1),
                                                   Ipv4Addr::new(192, 0, 2, 9),
                                                   PROTO_UDP,
                                                   &transport);
        let error = CtrlFrame {
            sender: ModuleId::Udp,
            opcode: CtrlOpcode::Error,
            serial: 1,
            name: ErrorKind::PortUnreachable.wire_name().to_owned(),
            data: CtrlData::Error(ErrorReport {
                kind: ErrorKind::PortUnreachable,
                detail: offending,
            }),
        };
        module.handle(Frame::control(DestList::to(ModuleId::Socket), error), &mut ctx);
        assert_eq!(module.stats().errors_stored, 1);
        let stored = socket.state.lock().unwrap().take_error();
        assert_eq!(stored, Some(channel::errno::ECONNREFUSED));
    }
}
