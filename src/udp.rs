//! The UDP protocol module.
//!
//! Ingress: validates the UDP header, checks the pseudo-header checksum
//! when one is present, records the ports in metadata and forwards the
//! datagram (header intact) up to the socket handler. Egress: builds the
//! UDP header around a client payload and hands the datagram down to IPv4.
//! Transport errors translated by ICMP are relayed up to the socket
//! handler, which owns the socket table.

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlFrame, CtrlOpcode, DataFrame, DestList, Direction, Frame, FrameBody, ModuleId};
use ipv4::PROTO_UDP;
use metadata::keys;

use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};

/// Size of the UDP header.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UdpStats {
    pub received: u64,
    pub delivered: u64,
    pub sent: u64,
    pub errors_relayed: u64,
    pub dropped_malformed: u64,
    pub dropped_bad_checksum: u64,
}

#[derive(Default)]
pub struct UdpModule {
    stats: UdpStats,
}

impl UdpModule {
    pub fn new() -> UdpModule {
        UdpModule::default()
    }

    pub fn stats(&self) -> &UdpStats {
        &self.stats
    }

    fn ingress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        self.stats.received += 1;
        let mut pdu = data.pdu;
        let mut meta = data.meta;
        if pdu.len() < HEADER_SIZE {
            self.stats.dropped_malformed += 1;
            return;
        }
        let (source, destination, length) = {
            let pkg = UdpPacket::new(&pdu).unwrap();
            (pkg.get_source(), pkg.get_destination(), pkg.get_length() as usize)
        };
        if length < HEADER_SIZE || length > pdu.len() {
            self.stats.dropped_malformed += 1;
            return;
        }
        pdu.truncate(length);
        {
            let pkg = UdpPacket::new(&pdu).unwrap();
            // A zero checksum means the sender did not compute one.
            if pkg.get_checksum() != 0 {
                match (meta.ipv4_value(keys::IP_SRC), meta.ipv4_value(keys::IP_DST)) {
                    (Some(src), Some(dst)) => {
                        if udp::ipv4_checksum(&pkg, &src, &dst) != pkg.get_checksum() {
                            trace!("udp: bad checksum from {}:{}", src, source);
                            self.stats.dropped_bad_checksum += 1;
                            return;
                        }
                    }
                    _ => {
                        self.stats.dropped_malformed += 1;
                        return;
                    }
                }
            }
        }
        meta.insert_port(keys::PORT_SRC, source);
        meta.insert_port(keys::PORT_DST, destination);
        self.stats.delivered += 1;
        let frame = Frame::data(DestList::to(ModuleId::Socket), Direction::Up, pdu, meta);
        let _ = ctx.send(frame);
    }

    /// Wraps a client payload into a UDP datagram. The socket handler put
    /// the addresses and ports into the metadata.
    fn egress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        let meta = data.meta;
        let fields = (meta.ipv4_value(keys::IP_SRC),
                      meta.ipv4_value(keys::IP_DST),
                      meta.port_value(keys::PORT_SRC),
                      meta.port_value(keys::PORT_DST));
        let (src, dst, sport, dport) = match fields {
            (Some(src), Some(dst), Some(sport), Some(dport)) => (src, dst, sport, dport),
            _ => {
                warn!("udp: egress frame without full address metadata");
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        if HEADER_SIZE + data.pdu.len() > ::std::u16::MAX as usize {
            self.stats.dropped_malformed += 1;
            return;
        }
        let mut datagram = vec![0u8; HEADER_SIZE + data.pdu.len()];
        {
            let mut pkg = MutableUdpPacket::new(&mut datagram).unwrap();
            pkg.set_source(sport);
            pkg.set_destination(dport);
            pkg.set_length((HEADER_SIZE + data.pdu.len()) as u16);
            pkg.set_payload(&data.pdu);
            let csum = udp::ipv4_checksum(&pkg.to_immutable(), &src, &dst);
            pkg.set_checksum(csum);
        }
        let mut meta = meta;
        meta.insert_u32(keys::PROTOCOL, PROTO_UDP as u32);
        self.stats.sent += 1;
        let frame = Frame::data(DestList::to(ModuleId::Ipv4), Direction::Down, datagram, meta);
        let _ = ctx.send(frame);
    }

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Error if ctrl.sender == ModuleId::Icmp => {
                // Session-level error for one of our sockets; the socket
                // handler owns the table and does the lookup.
                self.stats.errors_relayed += 1;
                let relayed = Frame::control(DestList::to(ModuleId::Socket), ctrl);
                let _ = ctx.send(relayed);
            }
            CtrlOpcode::Error => {
                warn!("udp: control error {} from {}", ctrl.name, ctrl.sender)
            }
            CtrlOpcode::Exec => {
                // Socket bookkeeping notifications (e.g. close); UDP keeps
                // no per-socket state.
                trace!("udp: exec {} from {}", ctrl.name, ctrl.sender);
            }
            _ => debug!("udp: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for UdpModule {
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
        debug!("udp: final stats {:?}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use fabric::ModuleContext;
    use frame::{DataFrame, Direction, ModuleId};
    use metadata::{keys, Metadata};
    use queue::FrameQueue;

    use pnet::packet::Packet;
    use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};

    use std::net::Ipv4Addr;

    use super::*;

    fn context() -> (ModuleContext, FrameQueue) {
        let egress = FrameQueue::new("udp2switch", 16);
        (ModuleContext::new(ModuleId::Udp, egress.clone()), egress)
    }

    fn wire_meta() -> Metadata {
        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_SRC, Ipv4Addr::new(192, 0, 2, 1));
        meta.insert_ipv4(keys::IP_DST, Ipv4Addr::new(10, 0, 0, 1));
        meta.insert_u32(keys::PROTOCOL, PROTO_UDP as u32);
        meta
    }

    fn datagram(sport: u16, dport: u16, payload: &[u8], checksum: bool) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE + payload.len()];
        {
            let mut pkg = MutableUdpPacket::new(&mut bytes).unwrap();
            pkg.set_source(sport);
            pkg.set_destination(dport);
            pkg.set_length((HEADER_SIZE + payload.len()) as u16);
            pkg.set_payload(payload);
            if checksum {
                let csum = udp::ipv4_checksum(&pkg.to_immutable(),
                                              &Ipv4Addr::new(192, 0, 2, 1),
                                              &Ipv4Addr::new(10, 0, 0, 1));
                pkg.set_checksum(csum);
            }
        }
        bytes
    }

    #[test]
    fn ingress_records_ports_and_forwards_up() {
        let mut module = UdpModule::new();
        let (mut ctx, egress) = context();
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: datagram(40000, 5000, b"ping", true),
                           meta: wire_meta(),
                       },
                       &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        assert_eq!(frame.dst.head(), ModuleId::Socket);
        let data = frame.as_data().unwrap();
        assert_eq!(data.meta.port_value(keys::PORT_SRC), Some(40000));
        assert_eq!(data.meta.port_value(keys::PORT_DST), Some(5000));
        // The UDP header stays on; the socket layer strips it at recv.
        let pkg = UdpPacket::new(&data.pdu).unwrap();
        assert_eq!(pkg.payload(), b"ping");
    }

    #[test]
    fn ingress_drops_bad_checksum() {
        let mut module = UdpModule::new();
        let (mut ctx, egress) = context();
        let mut pdu = datagram(40000, 5000, b"ping", true);
        pdu[10] ^= 0xff; // corrupt the payload
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: pdu,
                           meta: wire_meta(),
                       },
                       &mut ctx);
        assert!(egress.try_dequeue().is_err());
        assert_eq!(module.stats().dropped_bad_checksum, 1);
    }

    #[test]
    fn ingress_accepts_zero_checksum() {
        let mut module = UdpModule::new();
        let (mut ctx, egress) = context();
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: datagram(40000, 5000, b"ping", false),
                           meta: wire_meta(),
                       },
                       &mut ctx);
        assert!(egress.try_dequeue().is_ok());
    }

    #[test]
    fn ingress_honors_length_field() {
        let mut module = UdpModule::new();
        let (mut ctx, egress) = context();
        // Trailing link padding beyond the UDP length is cut off.
        let mut pdu = datagram(40000, 5000, b"ping", false);
        pdu.extend_from_slice(&[0u8; 6]);
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: pdu,
                           meta: wire_meta(),
                       },
                       &mut ctx);
        let frame = egress.try_dequeue().unwrap();
        assert_eq!(frame.as_data().unwrap().pdu.len(), HEADER_SIZE + 4);
    }

    #[test]
    fn egress_builds_header_with_checksum() {
        let mut module = UdpModule::new();
        let (mut ctx, egress) = context();
        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_SRC, Ipv4Addr::new(10, 0, 0, 1));
        meta.insert_ipv4(keys::IP_DST, Ipv4Addr::new(192, 0, 2, 1));
        meta.insert_port(keys::PORT_SRC, 5000);
        meta.insert_port(keys::PORT_DST, 40000);
        module.egress(DataFrame {
                          direction: Direction::Down,
                          pdu: b"pong".to_vec(),
                          meta: meta,
                      },
                      &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        assert_eq!(frame.dst.head(), ModuleId::Ipv4);
        let data = frame.as_data().unwrap();
        assert_eq!(data.direction, Direction::Down);
        assert_eq!(data.meta.u32_value(keys::PROTOCOL), Some(PROTO_UDP as u32));
        let pkg = UdpPacket::new(&data.pdu).unwrap();
        assert_eq!(pkg.get_source(), 5000);
        assert_eq!(pkg.get_destination(), 40000);
        assert_eq!(pkg.get_length() as usize, data.pdu.len());
        let expected = udp::ipv4_checksum(&pkg,
                                          &Ipv4Addr::new(10, 0, 0, 1),
                                          &Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(pkg.get_checksum(), expected);
    }
}
