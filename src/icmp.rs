//! The ICMP protocol module.
//!
//! Essentially stateless: every frame in produces at most one frame out.
//! Echo requests from the wire are answered in place; echo replies are
//! forwarded up to the socket handler for raw-socket clients; received
//! error messages (destination unreachable, time exceeded) are translated
//! into `CTRL_ERROR` frames for the transport modules; and `CTRL_EXEC`
//! requests from IPv4 or the socket handler synthesize outbound error
//! messages per RFC 792.

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlData, CtrlFrame, CtrlOpcode, DataFrame, DestList, Direction, ErrorKind,
            ErrorReport, Frame, FrameBody, ModuleId};
use ipv4::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use metadata::{keys, Metadata};
use queue::QueueError;

use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ipv4::Ipv4Packet;

pub const ECHO_REPLY: u8 = 0;
pub const DEST_UNREACHABLE: u8 = 3;
pub const ECHO_REQUEST: u8 = 8;
pub const TIME_EXCEEDED: u8 = 11;

/// Size of the fixed ICMP header, type through the unused/rest-of-header
/// word.
pub const HEADER_SIZE: usize = 8;

/// Asks the ICMP module to synthesize an error message of `kind` toward the
/// source of `offending`, which must hold the offending IP header plus the
/// first 8 octets of its transport payload.
pub fn error_request(ctx: &mut ModuleContext,
                     kind: ErrorKind,
                     offending: Vec<u8>)
                     -> Result<(), QueueError> {
    ctx.send_exec(ModuleId::Icmp,
                  kind.wire_name(),
                  CtrlData::Error(ErrorReport {
                      kind: kind,
                      detail: offending,
                  }))
}

/// Like `error_request` for FragNeeded: the next-hop MTU travels as a
/// 2-byte big-endian prefix of the detail and ends up in the rest-of-header
/// word of the message (RFC 1191).
pub fn frag_needed_request(ctx: &mut ModuleContext,
                           mtu: u16,
                           offending: Vec<u8>)
                           -> Result<(), QueueError> {
    let mut detail = vec![(mtu >> 8) as u8, (mtu & 0xff) as u8];
    detail.extend_from_slice(&offending);
    ctx.send_exec(ModuleId::Icmp,
                  ErrorKind::FragNeeded.wire_name(),
                  CtrlData::Error(ErrorReport {
                      kind: ErrorKind::FragNeeded,
                      detail: detail,
                  }))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IcmpStats {
    pub echoes_answered: u64,
    pub replies_forwarded: u64,
    pub errors_translated: u64,
    pub errors_built: u64,
    pub unsupported: u64,
    pub dropped_malformed: u64,
}

#[derive(Default)]
pub struct IcmpModule {
    stats: IcmpStats,
}

impl IcmpModule {
    pub fn new() -> IcmpModule {
        IcmpModule::default()
    }

    pub fn stats(&self) -> &IcmpStats {
        &self.stats
    }

    fn ingress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        if data.pdu.len() < HEADER_SIZE {
            self.stats.dropped_malformed += 1;
            return;
        }
        {
            let pkg = IcmpPacket::new(&data.pdu).unwrap();
            if icmp::checksum(&pkg) != pkg.get_checksum() {
                trace!("icmp: bad checksum, discarding");
                self.stats.dropped_malformed += 1;
                return;
            }
        }
        let icmp_type = data.pdu[0];
        let icmp_code = data.pdu[1];
        match icmp_type {
            ECHO_REQUEST if icmp_code == 0 => self.answer_echo(data, ctx),
            ECHO_REPLY if icmp_code == 0 => {
                // A raw-socket client may be waiting for this reply.
                self.stats.replies_forwarded += 1;
                let frame = Frame::data(DestList::to(ModuleId::Socket),
                                        Direction::Up,
                                        data.pdu,
                                        data.meta);
                let _ = ctx.send(frame);
            }
            DEST_UNREACHABLE | TIME_EXCEEDED => self.translate_error(data, ctx),
            other => {
                debug!("icmp: unsupported type {}, discarding", other);
                self.stats.unsupported += 1;
            }
        }
    }

    /// Turns an echo request into an echo reply: same identifier, sequence
    /// number and payload, swapped addresses, fresh checksum.
    fn answer_echo(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        let mut reply = data.pdu.clone();
        {
            let mut pkg = MutableIcmpPacket::new(&mut reply).unwrap();
            pkg.set_icmp_type(IcmpTypes::EchoReply);
            pkg.set_checksum(0);
            let csum = icmp::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }
        let mut meta = data.meta.clone();
        match (data.meta.ipv4_value(keys::IP_SRC), data.meta.ipv4_value(keys::IP_DST)) {
            (Some(src), Some(dst)) => {
                meta.insert_ipv4(keys::IP_SRC, dst);
                meta.insert_ipv4(keys::IP_DST, src);
            }
            _ => {
                self.stats.dropped_malformed += 1;
                return;
            }
        }
        meta.insert_u32(keys::PROTOCOL, PROTO_ICMP as u32);
        self.stats.echoes_answered += 1;
        let frame = Frame::data(DestList::to(ModuleId::Ipv4), Direction::Down, reply, meta);
        let _ = ctx.send(frame);
    }

    /// Translates a received error message into a `CTRL_ERROR` frame for
    /// the transport the offending datagram belonged to. The control data
    /// carries the embedded original IP header plus 8 transport octets, so
    /// UDP/TCP can find the aggrieved socket.
    fn translate_error(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        let kind = match ErrorKind::from_icmp_type_code(data.pdu[0], data.pdu[1]) {
            Some(kind) => kind,
            None => {
                self.stats.unsupported += 1;
                return;
            }
        };
        let embedded = &data.pdu[HEADER_SIZE..];
        if embedded.len() < Ipv4Packet::minimum_packet_size() {
            self.stats.dropped_malformed += 1;
            return;
        }
        let protocol = Ipv4Packet::new(embedded).unwrap().get_next_level_protocol().0;
        let dst = match protocol {
            PROTO_UDP => DestList::to(ModuleId::Udp),
            PROTO_TCP => DestList::to(ModuleId::Tcp),
            // Protocol not inferable: both transports get a copy.
            _ => DestList::multicast(&[ModuleId::Udp, ModuleId::Tcp]),
        };
        self.stats.errors_translated += 1;
        let frame = ctx.control(dst,
                                CtrlOpcode::Error,
                                kind.wire_name(),
                                CtrlData::Error(ErrorReport {
                                    kind: kind,
                                    detail: embedded.to_vec(),
                                }));
        let _ = ctx.send(frame);
    }

    /// Egress from a raw-socket client: recompute the checksum and pass the
    /// message down unchanged otherwise.
    fn egress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        if data.pdu.len() < HEADER_SIZE {
            self.stats.dropped_malformed += 1;
            return;
        }
        let mut pdu = data.pdu;
        {
            let mut pkg = MutableIcmpPacket::new(&mut pdu).unwrap();
            pkg.set_checksum(0);
            let csum = icmp::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }
        let mut meta = data.meta;
        meta.insert_u32(keys::PROTOCOL, PROTO_ICMP as u32);
        let frame = Frame::data(DestList::to(ModuleId::Ipv4), Direction::Down, pdu, meta);
        let _ = ctx.send(frame);
    }

    /// Synthesizes an error message on request from IPv4 or the socket
    /// handler.
    fn build_error(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        let report = match ctrl.data {
            CtrlData::Error(report) => report,
            other => {
                debug!("icmp: exec {} without error report: {:?}", ctrl.name, other);
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        let (icmp_type, icmp_code) = match report.kind.icmp_type_code() {
            Some(pair) => pair,
            None => {
                debug!("icmp: no wire mapping for {}", report.kind);
                self.stats.unsupported += 1;
                return;
            }
        };
        let (mtu, offending) = if report.kind == ErrorKind::FragNeeded {
            if report.detail.len() < 2 {
                self.stats.dropped_malformed += 1;
                return;
            }
            let mtu = ((report.detail[0] as u16) << 8) | report.detail[1] as u16;
            (Some(mtu), &report.detail[2..])
        } else {
            (None, &report.detail[..])
        };
        if offending.len() < Ipv4Packet::minimum_packet_size() {
            debug!("icmp: offending datagram too short for an error message");
            self.stats.dropped_malformed += 1;
            return;
        }
        let source = Ipv4Packet::new(offending).unwrap().get_source();

        let mut message = vec![0u8; HEADER_SIZE + offending.len()];
        message[0] = icmp_type;
        message[1] = icmp_code;
        // Bytes 4..8 stay zero per RFC 792, except the next-hop MTU of a
        // FragNeeded message (RFC 1191).
        if let Some(mtu) = mtu {
            message[6] = (mtu >> 8) as u8;
            message[7] = (mtu & 0xff) as u8;
        }
        message[HEADER_SIZE..].copy_from_slice(offending);
        {
            let mut pkg = MutableIcmpPacket::new(&mut message).unwrap();
            let csum = icmp::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }

        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_DST, source);
        meta.insert_u32(keys::PROTOCOL, PROTO_ICMP as u32);
        self.stats.errors_built += 1;
        let frame = Frame::data(DestList::to(ModuleId::Ipv4), Direction::Down, message, meta);
        let _ = ctx.send(frame);
    }

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Exec => self.build_error(ctrl, ctx),
            CtrlOpcode::Error => {
                warn!("icmp: control error {} from {}", ctrl.name, ctrl.sender)
            }
            _ => debug!("icmp: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for IcmpModule {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(data) => {
                match data.direction {
                    Direction::Up => self.ingress(data, ctx),
                    Direction::Down => self.egress(data, ctx),
                }
            }
            FrameBody::Control(ctrl) => self.control(ctrl, ctx),
        }
    }

    fn stopped(&mut self, _ctx: &mut ModuleContext) {
        debug!("icmp: final stats {:?}", self.stats);
    }
}
