//! The IPv4 protocol module.
//!
//! Ingress: validates headers and checksums, reassembles fragments, decides
//! local delivery versus forwarding, strips the header and dispatches the
//! payload to the upper protocol module. Egress: selects a route, builds
//! the header, fragments when the datagram exceeds the outgoing MTU, and
//! hands the finished datagram to the Ethernet endpoint.

mod reassembly;

pub use self::reassembly::{FragmentKey, ReassemblyError, ReassemblySet};

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlFrame, CtrlOpcode, DataFrame, DestList, Direction, ErrorKind, Frame, FrameBody,
            ModuleId, ParamValue};
use icmp;
use metadata::{keys, Metadata};
use routing::RoutingTable;

use ipnetwork::Ipv4Network;

use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};

use rand;

use std::cmp;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

pub const MORE_FRAGMENTS: u8 = 0b001;
pub const DONT_FRAGMENT: u8 = 0b010;
pub const NO_FLAGS: u8 = 0b000;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Parameter names served to the runtime manager.
pub mod params {
    pub const ROUTING_TABLE: &'static str = "routing_table";
    pub const INTERFACE_ADDR: &'static str = "interface_addr";
    pub const MTU: &'static str = "mtu";
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ipv4Stats {
    pub received: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub fragments_created: u64,
    pub reassemblies_completed: u64,
    pub reassemblies_expired: u64,
    pub dropped_bad_header: u64,
    pub dropped_bad_checksum: u64,
    pub dropped_ttl: u64,
    pub dropped_not_ours: u64,
    pub dropped_no_route: u64,
    pub dropped_unknown_protocol: u64,
    pub dropped_invalid_egress: u64,
}

pub struct Ipv4Module {
    net: Ipv4Network,
    routes: RoutingTable,
    mtu: usize,
    ttl: u8,
    forwarding: bool,
    next_identification: u16,
    reassembly: ReassemblySet,
    stats: Ipv4Stats,
}

impl Ipv4Module {
    pub fn new(net: Ipv4Network,
               routes: RoutingTable,
               mtu: usize,
               ttl: u8,
               forwarding: bool,
               reassembly_timeout: Duration)
               -> Ipv4Module {
        assert!(mtu >= Ipv4Packet::minimum_packet_size() + 8,
                "mtu too small to fit one fragment");
        Ipv4Module {
            net: net,
            routes: routes,
            mtu: mtu,
            ttl: ttl,
            forwarding: forwarding,
            next_identification: rand::random::<u16>(),
            reassembly: ReassemblySet::new(reassembly_timeout),
            stats: Ipv4Stats::default(),
        }
    }

    pub fn stats(&self) -> &Ipv4Stats {
        &self.stats
    }

    fn addr(&self) -> Ipv4Addr {
        self.net.ip()
    }

    fn is_ours(&self, dst: Ipv4Addr) -> bool {
        dst == self.addr() || dst == self.net.broadcast() ||
        dst == Ipv4Addr::new(255, 255, 255, 255) || dst.is_multicast()
    }

    // ---- ingress ----

    fn ingress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        self.stats.received += 1;
        let mut pdu = data.pdu;
        if pdu.len() < Ipv4Packet::minimum_packet_size() {
            self.stats.dropped_bad_header += 1;
            return;
        }
        let (total_len, ttl, dst, is_fragment) = {
            let pkg = Ipv4Packet::new(&pdu).unwrap();
            let header_len = pkg.get_header_length() as usize * 4;
            if pkg.get_version() != 4 || pkg.get_header_length() < 5 || header_len > pdu.len() {
                self.stats.dropped_bad_header += 1;
                return;
            }
            if ipv4::checksum(&pkg) != pkg.get_checksum() {
                trace!("ipv4: bad header checksum from {}", pkg.get_source());
                self.stats.dropped_bad_checksum += 1;
                return;
            }
            let total_len = pkg.get_total_length() as usize;
            if total_len > pdu.len() || total_len < header_len {
                self.stats.dropped_bad_header += 1;
                return;
            }
            let is_fragment = (pkg.get_flags() & MORE_FRAGMENTS) != 0 ||
                              pkg.get_fragment_offset() != 0;
            (total_len, pkg.get_ttl(), pkg.get_destination(), is_fragment)
        };
        pdu.truncate(total_len);

        if ttl == 0 {
            self.stats.dropped_ttl += 1;
            let offending = error_payload(&pdu);
            let _ = icmp::error_request(ctx, ErrorKind::TtlExceeded, offending);
            return;
        }

        if !self.is_ours(dst) {
            if self.forwarding {
                self.forward(pdu, ctx);
            } else {
                trace!("ipv4: not for us ({}), routing disabled", dst);
                self.stats.dropped_not_ours += 1;
            }
            return;
        }

        if is_fragment {
            let inserted = {
                let pkg = Ipv4Packet::new(&pdu).unwrap();
                self.reassembly.insert(&pkg, Instant::now())
            };
            match inserted {
                Ok(Some(datagram)) => {
                    self.stats.reassemblies_completed += 1;
                    self.deliver(datagram, data.meta, ctx);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("ipv4: dropping bad fragment: {:?}", e);
                    self.stats.dropped_bad_header += 1;
                }
            }
            return;
        }

        self.deliver(pdu, data.meta, ctx);
    }

    /// Strips the header of a complete, locally addressed datagram and
    /// forwards the payload to the protocol module for its protocol number.
    fn deliver(&mut self, pdu: Vec<u8>, mut meta: Metadata, ctx: &mut ModuleContext) {
        let (header_len, protocol, src, dst) = {
            let pkg = Ipv4Packet::new(&pdu).unwrap();
            (pkg.get_header_length() as usize * 4,
             pkg.get_next_level_protocol().0,
             pkg.get_source(),
             pkg.get_destination())
        };
        let upper = match protocol {
            PROTO_ICMP => ModuleId::Icmp,
            PROTO_TCP => ModuleId::Tcp,
            PROTO_UDP => ModuleId::Udp,
            other => {
                debug!("ipv4: unknown protocol {} from {}", other, src);
                self.stats.dropped_unknown_protocol += 1;
                let _ = icmp::error_request(ctx, ErrorKind::ProtoUnreachable, error_payload(&pdu));
                return;
            }
        };
        meta.insert_ipv4(keys::IP_SRC, src);
        meta.insert_ipv4(keys::IP_DST, dst);
        meta.insert_u32(keys::PROTOCOL, protocol as u32);
        let payload = pdu[header_len..].to_vec();
        self.stats.delivered += 1;
        let frame = Frame::data(DestList::to(upper), Direction::Up, payload, meta);
        if ctx.send(frame).is_err() {
            warn!("ipv4: egress queue closed, dropping delivery");
        }
    }

    /// Forwards a datagram not addressed to us: TTL decrement, checksum
    /// rewrite, route lookup, re-emit toward the link. The original header
    /// is kept byte for byte (options included) apart from TTL and
    /// checksum.
    fn forward(&mut self, mut pdu: Vec<u8>, ctx: &mut ModuleContext) {
        let dst = {
            let mut pkg = MutableIpv4Packet::new(&mut pdu).unwrap();
            let ttl = pkg.get_ttl();
            if ttl <= 1 {
                drop(pkg);
                self.stats.dropped_ttl += 1;
                let offending = error_payload(&pdu);
                let _ = icmp::error_request(ctx, ErrorKind::TtlExceeded, offending);
                return;
            }
            pkg.set_ttl(ttl - 1);
            let csum = ipv4::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
            pkg.get_destination()
        };
        let (gateway, found) = match self.routes.route(dst) {
            Some(route) => (route.gateway, true),
            None => (None, false),
        };
        if !found {
            self.stats.dropped_no_route += 1;
            let _ = icmp::error_request(ctx, ErrorKind::NetUnreachable, error_payload(&pdu));
            return;
        }
        let df = {
            let pkg = Ipv4Packet::new(&pdu).unwrap();
            (pkg.get_flags() & DONT_FRAGMENT) != 0
        };
        if pdu.len() > self.mtu && df {
            let _ = icmp::frag_needed_request(ctx, self.mtu as u16, error_payload(&pdu));
            return;
        }
        self.stats.forwarded += 1;
        let nexthop = gateway.unwrap_or(dst);
        self.emit(pdu, nexthop, Metadata::new(), ctx);
    }

    // ---- egress ----

    fn egress(&mut self, data: DataFrame, ctx: &mut ModuleContext) {
        let meta = data.meta;
        let dst = match meta.ipv4_value(keys::IP_DST) {
            Some(dst) => dst,
            None => {
                warn!("ipv4: egress frame without ipdst");
                self.stats.dropped_invalid_egress += 1;
                return;
            }
        };
        let protocol = match meta.u32_value(keys::PROTOCOL) {
            Some(protocol) => protocol as u8,
            None => {
                warn!("ipv4: egress frame without protocol");
                self.stats.dropped_invalid_egress += 1;
                return;
            }
        };
        let src = meta.ipv4_value(keys::IP_SRC).unwrap_or_else(|| self.addr());
        let df = meta.u32_value(keys::DONT_FRAGMENT).unwrap_or(0) != 0;

        let (gateway, found) = match self.routes.route(dst) {
            Some(route) => (route.gateway, true),
            None => (None, false),
        };
        if !found {
            debug!("ipv4: no route to {}", dst);
            self.stats.dropped_no_route += 1;
            if let Some(sender) = transport_module(protocol) {
                let _ = ctx.send_error(sender, ErrorKind::NetUnreachable, dst.octets().to_vec());
            }
            return;
        }

        let header_size = Ipv4Packet::minimum_packet_size();
        if header_size + data.pdu.len() > ::std::u16::MAX as usize {
            self.stats.dropped_invalid_egress += 1;
            if let Some(sender) = transport_module(protocol) {
                let _ = ctx.send_error(sender, ErrorKind::FragNeeded, mtu_detail(self.mtu as u16));
            }
            return;
        }
        if header_size + data.pdu.len() > self.mtu && df {
            debug!("ipv4: datagram to {} exceeds mtu {} with DF set", dst, self.mtu);
            if let Some(sender) = transport_module(protocol) {
                let _ = ctx.send_error(sender, ErrorKind::FragNeeded, mtu_detail(self.mtu as u16));
            }
            return;
        }

        let identification = self.next_identification;
        self.next_identification = self.next_identification.wrapping_add(1);

        let mut datagram = vec![0u8; header_size + data.pdu.len()];
        {
            let mut pkg = MutableIpv4Packet::new(&mut datagram).unwrap();
            pkg.set_version(4);
            pkg.set_header_length(5);
            pkg.set_dscp(0);
            pkg.set_ecn(0);
            pkg.set_total_length((header_size + data.pdu.len()) as u16);
            pkg.set_identification(identification);
            pkg.set_flags(if df { DONT_FRAGMENT } else { NO_FLAGS });
            pkg.set_fragment_offset(0);
            pkg.set_ttl(self.ttl);
            pkg.set_next_level_protocol(IpNextHeaderProtocol::new(protocol));
            pkg.set_source(src);
            pkg.set_destination(dst);
            pkg.set_payload(&data.pdu);
            let csum = ipv4::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }
        let nexthop = gateway.unwrap_or(dst);
        self.emit(datagram, nexthop, meta, ctx);
    }

    /// Emits one finished datagram toward the Ethernet endpoint, splitting
    /// it into fragments when it exceeds the MTU. Fragment payload sizes are
    /// multiples of 8 octets; the last fragment clears MF.
    fn emit(&mut self,
            datagram: Vec<u8>,
            nexthop: Ipv4Addr,
            meta: Metadata,
            ctx: &mut ModuleContext) {
        let mut meta = meta;
        meta.insert_ipv4(keys::NEXT_HOP, nexthop);
        if datagram.len() <= self.mtu {
            self.push_down(datagram, meta, ctx);
            return;
        }

        let header_len = (datagram[0] & 0x0f) as usize * 4;
        let chunk = (self.mtu - header_len) & !0b111;
        let payload = &datagram[header_len..];
        let header = &datagram[..header_len];
        let base_offset = {
            let pkg = Ipv4Packet::new(&datagram).unwrap();
            pkg.get_fragment_offset() as usize * 8
        };
        let original_mf = (datagram[6] >> 5 & MORE_FRAGMENTS) != 0;

        let mut offset = 0;
        while offset < payload.len() {
            let end = cmp::min(offset + chunk, payload.len());
            let last = end == payload.len();
            let mut fragment = Vec::with_capacity(header_len + end - offset);
            fragment.extend_from_slice(header);
            fragment.extend_from_slice(&payload[offset..end]);
            {
                let mut pkg = MutableIpv4Packet::new(&mut fragment).unwrap();
                pkg.set_total_length((header_len + end - offset) as u16);
                pkg.set_fragment_offset(((base_offset + offset) / 8) as u16);
                let more = !last || original_mf;
                pkg.set_flags(if more { MORE_FRAGMENTS } else { NO_FLAGS });
                let csum = ipv4::checksum(&pkg.to_immutable());
                pkg.set_checksum(csum);
            }
            self.stats.fragments_created += 1;
            self.push_down(fragment, meta.clone(), ctx);
            offset = end;
        }
    }

    fn push_down(&mut self, datagram: Vec<u8>, meta: Metadata, ctx: &mut ModuleContext) {
        let frame = Frame::data(DestList::to(ModuleId::Ethernet), Direction::Down, datagram, meta);
        if ctx.send(frame).is_err() {
            warn!("ipv4: egress queue closed, dropping datagram");
        }
    }

    // ---- control ----

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        use frame::CtrlData;
        match ctrl.opcode {
            CtrlOpcode::SetParam => {
                match (&ctrl.name[..], ctrl.data) {
                    (params::ROUTING_TABLE, CtrlData::Param(ParamValue::Routes(routes))) => {
                        info!("ipv4: routing table replaced ({} entries)", routes.len());
                        self.routes.replace(routes);
                    }
                    (params::INTERFACE_ADDR, CtrlData::Param(ParamValue::Addr(addr))) => {
                        info!("ipv4: interface address set to {}", addr);
                        self.net = Ipv4Network::new(addr, self.net.prefix())
                            .expect("prefix of an existing network is valid");
                    }
                    (params::MTU, CtrlData::Param(ParamValue::U32(mtu))) => {
                        info!("ipv4: mtu set to {}", mtu);
                        self.mtu = mtu as usize;
                    }
                    (name, _) => debug!("ipv4: ignoring set_param {:?}", name),
                }
            }
            CtrlOpcode::ReadParam => {
                let value = match &ctrl.name[..] {
                    params::ROUTING_TABLE => Some(ParamValue::Routes(self.routes.routes())),
                    params::INTERFACE_ADDR => Some(ParamValue::Addr(self.addr())),
                    params::MTU => Some(ParamValue::U32(self.mtu as u32)),
                    _ => None,
                };
                match value {
                    Some(value) => {
                        let reply = ctx.control(DestList::to(ctrl.sender),
                                                CtrlOpcode::ReadParamReply,
                                                &ctrl.name,
                                                CtrlData::Param(value));
                        let _ = ctx.send(reply);
                    }
                    None => debug!("ipv4: ignoring read_param {:?}", ctrl.name),
                }
            }
            CtrlOpcode::Error => {
                warn!("ipv4: control error {} from {}", ctrl.name, ctrl.sender);
            }
            _ => debug!("ipv4: ignoring {} control frame", ctrl.opcode),
        }
    }

    fn reap(&mut self, ctx: &mut ModuleContext) {
        for (key, header) in self.reassembly.reap(Instant::now()) {
            debug!("ipv4: reassembly of {:?} timed out", key);
            self.stats.reassemblies_expired += 1;
            // RFC 792 only allows the timeout error when fragment zero was
            // received, since its header is what the error must embed.
            if let Some(header) = header {
                let _ = icmp::error_request(ctx, ErrorKind::FragTimeExceeded, header);
            }
        }
    }
}

impl FrameHandler for Ipv4Module {
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

    fn tick(&mut self, ctx: &mut ModuleContext) {
        self.reap(ctx);
    }

    fn stopped(&mut self, _ctx: &mut ModuleContext) {
        debug!("ipv4: final stats {:?}", self.stats);
    }
}

/// The protocol module serving `protocol`, used to route egress errors back
/// to the transport that asked for the transmission.
fn transport_module(protocol: u8) -> Option<ModuleId> {
    match protocol {
        PROTO_ICMP => Some(ModuleId::Icmp),
        PROTO_TCP => Some(ModuleId::Tcp),
        PROTO_UDP => Some(ModuleId::Udp),
        _ => None,
    }
}

/// Detail bytes of a FragNeeded session error: the usable MTU, big endian.
fn mtu_detail(mtu: u16) -> Vec<u8> {
    vec![(mtu >> 8) as u8, (mtu & 0xff) as u8]
}

/// The part of an offending datagram an ICMP error must embed: the IP
/// header plus the first 8 octets of its payload.
pub fn error_payload(pdu: &[u8]) -> Vec<u8> {
    if pdu.is_empty() {
        return Vec::new();
    }
    let header_len = (pdu[0] & 0x0f) as usize * 4;
    let end = cmp::min(pdu.len(), header_len + 8);
    pdu[..end].to_vec()
}

/// Rebuilds the offending-datagram prefix for a transport PDU whose IP
/// header is already gone (the socket handler sees only the transport
/// bytes). Produces a 20-byte header from the metadata the frame carried
/// plus the first 8 octets of the transport PDU.
pub fn synthesize_offending(src: Ipv4Addr,
                            dst: Ipv4Addr,
                            protocol: u8,
                            transport: &[u8])
                            -> Vec<u8> {
    let header_size = Ipv4Packet::minimum_packet_size();
    let take = cmp::min(8, transport.len());
    let mut bytes = vec![0u8; header_size + take];
    {
        let mut pkg = MutableIpv4Packet::new(&mut bytes).unwrap();
        pkg.set_version(4);
        pkg.set_header_length(5);
        pkg.set_total_length((header_size + transport.len()) as u16);
        pkg.set_ttl(64);
        pkg.set_next_level_protocol(IpNextHeaderProtocol::new(protocol));
        pkg.set_source(src);
        pkg.set_destination(dst);
        let csum = ipv4::checksum(&pkg.to_immutable());
        pkg.set_checksum(csum);
    }
    bytes[header_size..].copy_from_slice(&transport[..take]);
    bytes
}

#[cfg(test)]
mod tests {
    use fabric::ModuleContext;
    use frame::{CtrlOpcode, DataFrame, Direction, ErrorKind, FrameBody, ModuleId};
    use metadata::{keys, Metadata};
    use queue::FrameQueue;
    use routing::RoutingTable;

    use ipnetwork::Ipv4Network;

    use pnet::packet::Packet;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};

    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;

    fn module(mtu: usize) -> Ipv4Module {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 1), 24).unwrap();
        let mut routes = RoutingTable::new();
        routes.add_route(net, None, 0, 0);
        routes.add_route(Ipv4Network::new(Ipv4Addr::new(0, 0, 0, 0), 0).unwrap(),
                         Some(Ipv4Addr::new(10, 0, 0, 254)),
                         0,
                         1);
        Ipv4Module::new(net, routes, mtu, 64, false, Duration::from_secs(30))
    }

    fn context() -> (ModuleContext, FrameQueue) {
        let egress = FrameQueue::new("ipv42switch", 64);
        (ModuleContext::new(ModuleId::Ipv4, egress.clone()), egress)
    }

    fn egress_frame(payload_len: usize, df: bool) -> DataFrame {
        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_DST, Ipv4Addr::new(10, 0, 0, 2));
        meta.insert_u32(keys::PROTOCOL, PROTO_UDP as u32);
        if df {
            meta.insert_u32(keys::DONT_FRAGMENT, 1);
        }
        DataFrame {
            direction: Direction::Down,
            pdu: vec![0xabu8; payload_len],
            meta: meta,
        }
    }

    #[test]
    fn header_parse_then_serialize_is_identity() {
        let mut buffer = vec![0u8; 20];
        {
            let mut pkg = MutableIpv4Packet::new(&mut buffer).unwrap();
            pkg.set_version(4);
            pkg.set_header_length(5);
            pkg.set_dscp(11);
            pkg.set_ecn(2);
            pkg.set_total_length(1234);
            pkg.set_identification(0xbeef);
            pkg.set_flags(DONT_FRAGMENT);
            pkg.set_fragment_offset(0);
            pkg.set_ttl(17);
            pkg.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            pkg.set_source(Ipv4Addr::new(192, 0, 2, 1));
            pkg.set_destination(Ipv4Addr::new(198, 51, 100, 2));
            let csum = ipv4::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }

        let parsed = Ipv4Packet::new(&buffer).unwrap();
        let mut rebuilt = vec![0u8; 20];
        {
            let mut pkg = MutableIpv4Packet::new(&mut rebuilt).unwrap();
            pkg.set_version(parsed.get_version());
            pkg.set_header_length(parsed.get_header_length());
            pkg.set_dscp(parsed.get_dscp());
            pkg.set_ecn(parsed.get_ecn());
            pkg.set_total_length(parsed.get_total_length());
            pkg.set_identification(parsed.get_identification());
            pkg.set_flags(parsed.get_flags());
            pkg.set_fragment_offset(parsed.get_fragment_offset());
            pkg.set_ttl(parsed.get_ttl());
            pkg.set_next_level_protocol(parsed.get_next_level_protocol());
            pkg.set_source(parsed.get_source());
            pkg.set_destination(parsed.get_destination());
            pkg.set_checksum(parsed.get_checksum());
        }
        assert_eq!(buffer, rebuilt);
    }

    #[test]
    fn egress_at_mtu_is_one_packet() {
        let mut module = module(1500);
        let (mut ctx, egress) = context();
        module.egress(egress_frame(1480, false), &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        let data = frame.as_data().unwrap();
        assert_eq!(data.pdu.len(), 1500);
        let pkg = Ipv4Packet::new(&data.pdu).unwrap();
        assert_eq!(pkg.get_flags() & MORE_FRAGMENTS, 0);
        assert_eq!(ipv4::checksum(&pkg), pkg.get_checksum());
        assert!(egress.try_dequeue().is_err());
        assert_eq!(module.stats().fragments_created, 0);
    }

    #[test]
    fn egress_over_mtu_fragments() {
        let mut module = module(1500);
        let (mut ctx, egress) = context();
        module.egress(egress_frame(1481, false), &mut ctx);

        let first = egress.try_dequeue().unwrap();
        let second = egress.try_dequeue().unwrap();
        assert!(egress.try_dequeue().is_err());

        let first = first.as_data().unwrap().pdu.clone();
        let second = second.as_data().unwrap().pdu.clone();
        let first_pkg = Ipv4Packet::new(&first).unwrap();
        let second_pkg = Ipv4Packet::new(&second).unwrap();

        assert_eq!(first_pkg.get_flags() & MORE_FRAGMENTS, MORE_FRAGMENTS);
        assert_eq!(second_pkg.get_flags() & MORE_FRAGMENTS, 0);
        assert_eq!(first_pkg.get_fragment_offset(), 0);
        // Fragment payloads are multiples of 8 and cover the original
        // payload disjointly and contiguously.
        assert_eq!(first_pkg.payload().len() % 8, 0);
        assert_eq!(second_pkg.get_fragment_offset() as usize * 8,
                   first_pkg.payload().len());
        assert_eq!(first_pkg.payload().len() + second_pkg.payload().len(),
                   1481);
        assert_eq!(first_pkg.get_identification(),
                   second_pkg.get_identification());
        assert_eq!(ipv4::checksum(&first_pkg), first_pkg.get_checksum());
        assert_eq!(ipv4::checksum(&second_pkg), second_pkg.get_checksum());
        assert_eq!(module.stats().fragments_created, 2);
    }

    #[test]
    fn egress_over_mtu_with_df_reports_frag_needed() {
        let mut module = module(1500);
        let (mut ctx, egress) = context();
        module.egress(egress_frame(1481, true), &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        match frame.body {
            FrameBody::Control(ctrl) => {
                assert_eq!(ctrl.opcode, CtrlOpcode::Error);
                assert_eq!(frame.dst.head(), ModuleId::Udp);
                assert_eq!(ctrl.name, ErrorKind::FragNeeded.wire_name());
            }
            FrameBody::Data(..) => panic!("expected an error control frame"),
        }
        assert!(egress.try_dequeue().is_err());
    }

    #[test]
    fn egress_without_route_reports_netunreach() {
        let net = Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 1), 24).unwrap();
        let mut module = Ipv4Module::new(net,
                                         RoutingTable::new(),
                                         1500,
                                         64,
                                         false,
                                         Duration::from_secs(30));
        let (mut ctx, egress) = context();
        module.egress(egress_frame(100, false), &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        let ctrl = frame.as_control().expect("expected control frame").clone();
        assert_eq!(ctrl.name, ErrorKind::NetUnreachable.wire_name());
        assert_eq!(module.stats().dropped_no_route, 1);
    }

    #[test]
    fn ingress_ttl_zero_asks_icmp_for_time_exceeded() {
        let mut module = module(1500);
        let (mut ctx, egress) = context();

        let mut pdu = vec![0u8; 28];
        {
            let mut pkg = MutableIpv4Packet::new(&mut pdu).unwrap();
            pkg.set_version(4);
            pkg.set_header_length(5);
            pkg.set_total_length(28);
            pkg.set_ttl(0);
            pkg.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            pkg.set_source(Ipv4Addr::new(10, 0, 0, 2));
            pkg.set_destination(Ipv4Addr::new(10, 0, 0, 1));
            let csum = ipv4::checksum(&pkg.to_immutable());
            pkg.set_checksum(csum);
        }
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: pdu,
                           meta: Metadata::new(),
                       },
                       &mut ctx);

        let frame = egress.try_dequeue().unwrap();
        assert_eq!(frame.dst.head(), ModuleId::Icmp);
        let ctrl = frame.as_control().unwrap();
        assert_eq!(ctrl.opcode, CtrlOpcode::Exec);
        assert_eq!(ctrl.name, ErrorKind::TtlExceeded.wire_name());
        assert_eq!(module.stats().dropped_ttl, 1);
    }

    #[test]
    fn ingress_bad_checksum_is_dropped() {
        let mut module = module(1500);
        let (mut ctx, egress) = context();
        let mut pdu = vec![0u8; 20];
        {
            let mut pkg = MutableIpv4Packet::new(&mut pdu).unwrap();
            pkg.set_version(4);
            pkg.set_header_length(5);
            pkg.set_total_length(20);
            pkg.set_ttl(64);
            pkg.set_destination(Ipv4Addr::new(10, 0, 0, 1));
            pkg.set_checksum(0xdead);
        }
        module.ingress(DataFrame {
                           direction: Direction::Up,
                           pdu: pdu,
                           meta: Metadata::new(),
                       },
                       &mut ctx);
        assert!(egress.try_dequeue().is_err());
        assert_eq!(module.stats().dropped_bad_checksum, 1);
    }

    #[test]
    fn synthesized_offending_prefix_is_parseable() {
        let transport = [0x9c, 0x40, 0x13, 0x88, 0x00, 0x0c, 0x00, 0x00, 1, 2, 3, 4];
        let bytes = synthesize_offending(Ipv4Addr::new(192, 0, 2, 1),
                                         Ipv4Addr::new(10, 0, 0, 1),
                                         PROTO_UDP,
                                         &transport);
        assert_eq!(bytes.len(), 28);
        let pkg = Ipv4Packet::new(&bytes).unwrap();
        assert_eq!(pkg.get_source(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(pkg.get_next_level_protocol().0, PROTO_UDP);
        assert_eq!(&bytes[20..], &transport[..8]);
    }
}
