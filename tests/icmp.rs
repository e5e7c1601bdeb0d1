extern crate netfabric;
extern crate pnet;

use netfabric::testing;

use pnet::packet::MutablePacket;
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::util::MacAddr;

use std::net::Ipv4Addr;
use std::time::Duration;

const REMOTE_MAC: MacAddr = MacAddr(0x52, 0x54, 0, 0, 0, 2);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Ethernet(IPv4(payload)) capture frame builder.
fn capture_frame(protocol: u8, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + 20 + payload.len()];
    {
        let mut eth_pkg = MutableEthernetPacket::new(&mut frame).unwrap();
        eth_pkg.set_source(REMOTE_MAC);
        eth_pkg.set_destination(MacAddr(2, 0, 0, 0, 0, 1));
        eth_pkg.set_ethertype(EtherTypes::Ipv4);
        let mut ip_pkg = MutableIpv4Packet::new(eth_pkg.payload_mut()).unwrap();
        ip_pkg.set_version(4);
        ip_pkg.set_header_length(5);
        ip_pkg.set_total_length((20 + payload.len()) as u16);
        ip_pkg.set_ttl(ttl);
        ip_pkg.set_next_level_protocol(pnet::packet::ip::IpNextHeaderProtocol::new(protocol));
        ip_pkg.set_source(REMOTE_IP);
        ip_pkg.set_destination(LOCAL_IP);
        ip_pkg.set_payload(payload);
        let csum = ipv4::checksum(&ip_pkg.to_immutable());
        ip_pkg.set_checksum(csum);
    }
    frame
}

fn echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut message = vec![0u8; 8 + data.len()];
    {
        let mut pkg = MutableEchoRequestPacket::new(&mut message).unwrap();
        pkg.set_icmp_type(IcmpTypes::EchoRequest);
        pkg.set_identifier(identifier);
        pkg.set_sequence_number(sequence);
        pkg.set_payload(data);
    }
    {
        let mut pkg = MutableIcmpPacket::new(&mut message).unwrap();
        let csum = icmp::checksum(&pkg.to_immutable());
        pkg.set_checksum(csum);
    }
    message
}

#[test]
fn echo_round_trip() {
    let mut stack = testing::dummy_stack();

    let request = echo_request(0x1234, 1, b"abcdefgh");
    stack.send_frame(&capture_frame(1, 64, &request));

    let injected = stack.next_injected(Duration::from_secs(5))
        .expect("expected an echo reply on the inject stream");

    let eth_pkg = EthernetPacket::new(&injected).unwrap();
    // The reply goes back to the MAC the request came from.
    assert_eq!(eth_pkg.get_destination(), REMOTE_MAC);
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Ipv4);

    let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
    assert_eq!(ip_pkg.get_source(), LOCAL_IP);
    assert_eq!(ip_pkg.get_destination(), REMOTE_IP);
    assert_eq!(ip_pkg.get_next_level_protocol(), IpNextHeaderProtocols::Icmp);
    assert_eq!(ipv4::checksum(&ip_pkg), ip_pkg.get_checksum());

    let icmp_pkg = IcmpPacket::new(ip_pkg.payload()).unwrap();
    assert_eq!(icmp_pkg.get_icmp_type(), IcmpTypes::EchoReply);
    assert_eq!(icmp::checksum(&icmp_pkg), icmp_pkg.get_checksum());
    // Identifier, sequence and payload are those of the request.
    let message = ip_pkg.payload();
    assert_eq!(&message[4..8], &[0x12, 0x34, 0x00, 0x01][..]);
    assert_eq!(&message[8..], b"abcdefgh");

    stack.shutdown();
}

#[test]
fn ttl_expiry_generates_time_exceeded() {
    let mut stack = testing::dummy_stack();

    // A UDP datagram arriving with TTL 0 never reaches UDP; the source
    // gets an ICMP time exceeded instead.
    let udp = [0x9c, 0x40, 0x13, 0x88, 0x00, 0x0c, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef];
    stack.send_frame(&capture_frame(17, 0, &udp));

    let injected = stack.next_injected(Duration::from_secs(5))
        .expect("expected a time-exceeded message on the inject stream");

    let eth_pkg = EthernetPacket::new(&injected).unwrap();
    let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
    assert_eq!(ip_pkg.get_destination(), REMOTE_IP);
    assert_eq!(ip_pkg.get_next_level_protocol(), IpNextHeaderProtocols::Icmp);

    let message = ip_pkg.payload();
    assert_eq!(message[0], 11);
    assert_eq!(message[1], 0);
    let icmp_pkg = IcmpPacket::new(message).unwrap();
    assert_eq!(icmp::checksum(&icmp_pkg), icmp_pkg.get_checksum());
    // The payload embeds the offending IP header plus 8 transport octets.
    let embedded = Ipv4Packet::new(&message[8..]).unwrap();
    assert_eq!(embedded.get_source(), REMOTE_IP);
    assert_eq!(embedded.get_destination(), LOCAL_IP);
    assert_eq!(&message[8 + 20..8 + 28], &udp[..8]);

    stack.shutdown();
}
