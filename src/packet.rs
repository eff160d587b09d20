//! Raw-frame classification and construction.
//!
//! Packet-ins arrive as whole Ethernet frames. The dispatcher only needs a
//! shallow read: is this an ARP reply, a TCP segment, or something else, and
//! what are the addresses. Parsing is delegated to `smoltcp::wire`; anything
//! malformed classifies as `Other` and is dropped upstream.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpPacket,
    TcpSeqNumber,
};
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub enum ParsedFrame {
    /// ARP reply, candidate answer to a liveness probe.
    ArpReply(ArpReply),
    /// ARP traffic we are not interested in (requests, gratuitous ARPs).
    OtherArp,
    Tcp(TcpSegment),
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct ArpReply {
    pub sender_mac: EthernetAddress,
    pub sender_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

pub fn parse_frame(buffer: &[u8]) -> ParsedFrame {
    let Ok(frame) = EthernetFrame::new_checked(buffer) else {
        return ParsedFrame::Other;
    };
    match frame.ethertype() {
        EthernetProtocol::Arp => parse_arp(frame.payload()),
        EthernetProtocol::Ipv4 => parse_ipv4(&frame),
        _ => ParsedFrame::Other,
    }
}

fn parse_arp(payload: &[u8]) -> ParsedFrame {
    let Ok(packet) = ArpPacket::new_checked(payload) else {
        return ParsedFrame::Other;
    };
    let Ok(repr) = ArpRepr::parse(&packet) else {
        return ParsedFrame::Other;
    };
    match repr {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            ..
        } => ParsedFrame::ArpReply(ArpReply {
            sender_mac: source_hardware_addr,
            sender_ip: ipv4_std(source_protocol_addr),
        }),
        _ => ParsedFrame::OtherArp,
    }
}

fn parse_ipv4(frame: &EthernetFrame<&[u8]>) -> ParsedFrame {
    let Ok(ip) = Ipv4Packet::new_checked(frame.payload()) else {
        return ParsedFrame::Other;
    };
    if ip.next_header() != IpProtocol::Tcp {
        return ParsedFrame::Other;
    }
    let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
        return ParsedFrame::Other;
    };
    ParsedFrame::Tcp(TcpSegment {
        src_mac: frame.src_addr(),
        dst_mac: frame.dst_addr(),
        src_ip: ipv4_std(ip.src_addr()),
        dst_ip: ipv4_std(ip.dst_addr()),
        src_port: tcp.src_port(),
        dst_port: tcp.dst_port(),
    })
}

/// ARP request asking `target` to reveal itself, sourced from one of the
/// service addresses so backends learn the virtual IP's MAC in passing.
pub fn build_arp_probe(src_mac: EthernetAddress, proto_src: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: src_mac,
        source_protocol_addr: ipv4_wire(proto_src),
        target_hardware_addr: EthernetAddress::BROADCAST,
        target_protocol_addr: ipv4_wire(target),
    };
    build_arp_frame(src_mac, EthernetAddress::BROADCAST, &arp)
}

/// ARP reply as a backend would answer a probe. Used by the simulator and
/// by tests to drive the live-set.
pub fn build_arp_reply(
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let arp = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: sender_mac,
        source_protocol_addr: ipv4_wire(sender_ip),
        target_hardware_addr: target_mac,
        target_protocol_addr: ipv4_wire(target_ip),
    };
    build_arp_frame(sender_mac, target_mac, &arp)
}

fn build_arp_frame(src: EthernetAddress, dst: EthernetAddress, arp: &ArpRepr) -> Vec<u8> {
    let eth = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Arp,
    };
    let mut buffer = vec![0u8; eth.buffer_len() + arp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
    eth.emit(&mut frame);
    let mut packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp.emit(&mut packet);
    buffer
}

const TCP_HEADER_LEN: usize = 20;

/// Minimal TCP SYN inside IPv4 inside Ethernet, checksummed. The simulator
/// and tests use this to play the client and backend roles.
pub fn build_tcp_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    let src = ipv4_wire(src_ip);
    let dst = ipv4_wire(dst_ip);
    let ip = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Tcp,
        payload_len: TCP_HEADER_LEN,
        hop_limit: 64,
    };
    let eth = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let checksums = ChecksumCapabilities::default();
    let mut buffer = vec![0u8; eth.buffer_len() + ip.buffer_len() + TCP_HEADER_LEN];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
    eth.emit(&mut frame);
    let mut ip_packet = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut ip_packet, &checksums);
    let mut tcp = TcpPacket::new_unchecked(ip_packet.payload_mut());
    tcp.set_src_port(src_port);
    tcp.set_dst_port(dst_port);
    tcp.set_seq_number(TcpSeqNumber(0));
    tcp.set_ack_number(TcpSeqNumber(0));
    tcp.set_header_len(TCP_HEADER_LEN as u8);
    tcp.set_syn(true);
    tcp.set_window_len(4096);
    tcp.set_urgent_at(0);
    tcp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    buffer
}

pub(crate) fn ipv4_std(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

pub(crate) fn ipv4_wire(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}
