extern crate netfabric;
extern crate pnet;

use netfabric::socket::channel::SOCK_DGRAM;
use netfabric::testing;

use pnet::packet::Packet;
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

const MORE_FRAGMENTS: u8 = 0b001;

#[test]
fn egress_datagram_over_mtu_is_fragmented() {
    let mut stack = testing::dummy_stack();

    assert_eq!(stack.shim.socket(SOCK_DGRAM, 0, 3).0, 0);
    assert_eq!(stack.shim.bind(3, SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 5000)),
               0);

    // 2000 payload bytes + 8 UDP header + 20 IP header > 1500 MTU.
    let payload = vec![0x5au8; 2000];
    let dst = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 7);
    assert_eq!(stack.shim.sendto(3, dst, &payload), 0);

    let first = stack.next_injected(Duration::from_secs(5)).expect("first fragment");
    let second = stack.next_injected(Duration::from_secs(5)).expect("second fragment");
    assert!(stack.next_injected(Duration::from_millis(200)).is_none());

    let first_ip = Ipv4Packet::owned(EthernetPacket::new(&first).unwrap().payload().to_vec())
        .unwrap();
    let second_ip = Ipv4Packet::owned(EthernetPacket::new(&second).unwrap().payload().to_vec())
        .unwrap();

    assert_eq!(first_ip.get_next_level_protocol(), IpNextHeaderProtocols::Udp);
    assert_eq!(first_ip.get_identification(), second_ip.get_identification());
    assert_eq!(first_ip.get_flags() & MORE_FRAGMENTS, MORE_FRAGMENTS);
    assert_eq!(second_ip.get_flags() & MORE_FRAGMENTS, 0);

    // The fragments cover the 2008 transport bytes disjointly and
    // contiguously, in 8-octet units.
    assert_eq!(first_ip.get_fragment_offset(), 0);
    let first_payload = first_ip.get_total_length() as usize - 20;
    assert_eq!(first_payload % 8, 0);
    assert_eq!(second_ip.get_fragment_offset() as usize * 8, first_payload);
    let second_payload = second_ip.get_total_length() as usize - 20;
    assert_eq!(first_payload + second_payload, 2008);

    assert_eq!(ipv4::checksum(&first_ip), first_ip.get_checksum());
    assert_eq!(ipv4::checksum(&second_ip), second_ip.get_checksum());

    stack.shutdown();
}

#[test]
fn egress_at_exact_mtu_is_a_single_frame() {
    let mut stack = testing::dummy_stack();

    assert_eq!(stack.shim.socket(SOCK_DGRAM, 0, 3).0, 0);
    assert_eq!(stack.shim.bind(3, SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 5001)),
               0);

    // 1472 + 8 + 20 = exactly 1500.
    let payload = vec![0x5au8; 1472];
    let dst = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 7);
    assert_eq!(stack.shim.sendto(3, dst, &payload), 0);

    let frame = stack.next_injected(Duration::from_secs(5)).expect("one frame");
    let eth_pkg = EthernetPacket::new(&frame).unwrap();
    let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
    assert_eq!(ip_pkg.get_total_length(), 1500);
    assert_eq!(ip_pkg.get_flags() & MORE_FRAGMENTS, 0);
    assert!(stack.next_injected(Duration::from_millis(200)).is_none());

    stack.shutdown();
}
