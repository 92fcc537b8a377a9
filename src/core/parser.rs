//! Layer extraction from raw frames
//!
//! Splits parsing into distinct stages:
//! - `parse_ip()` - Layer 3 (IPv4/IPv6)
//! - `parse_transport()` - Layer 4 (TCP/UDP)
//!
//! The capture loop only needs `parse_ip()` to compute the flow hash; the
//! full transport parse happens on the owning shard.

use std::net::IpAddr;

use etherparse::SlicedPacket;

/// IP protocol numbers the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

/// Result of parsing the IP layer
#[derive(Debug, Clone)]
pub struct IpInfo {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: IpProtocol,
    pub is_ipv6: bool,
}

/// TCP segment fields needed for stream reassembly
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
}

/// Result of parsing the transport layer
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp: Option<TcpSegment>,
    pub payload: Vec<u8>,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            tcp: None,
            payload: Vec::new(),
        }
    }
}

/// Parse the IP layer from an etherparse SlicedPacket
///
/// Returns None for non-IP packets (ARP, etc.)
pub fn parse_ip(sliced: &SlicedPacket<'_>) -> Option<IpInfo> {
    match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            Some(IpInfo {
                src_ip: IpAddr::from(header.source_addr()),
                dst_ip: IpAddr::from(header.destination_addr()),
                protocol: match header.protocol() {
                    etherparse::IpNumber::TCP => IpProtocol::Tcp,
                    etherparse::IpNumber::UDP => IpProtocol::Udp,
                    other => IpProtocol::Other(other.0),
                },
                is_ipv6: false,
            })
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            Some(IpInfo {
                src_ip: IpAddr::from(header.source_addr()),
                dst_ip: IpAddr::from(header.destination_addr()),
                protocol: match header.next_header() {
                    etherparse::IpNumber::TCP => IpProtocol::Tcp,
                    etherparse::IpNumber::UDP => IpProtocol::Udp,
                    other => IpProtocol::Other(other.0),
                },
                is_ipv6: true,
            })
        }
        _ => None, // ARP, etc.
    }
}

/// Parse the transport layer from an etherparse SlicedPacket
pub fn parse_transport(sliced: &SlicedPacket<'_>) -> TransportInfo {
    match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => TransportInfo {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            tcp: Some(TcpSegment {
                seq: tcp.sequence_number(),
                syn: tcp.syn(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                ack: tcp.ack(),
            }),
            payload: tcp.payload().to_vec(),
        },
        Some(etherparse::TransportSlice::Udp(udp)) => TransportInfo {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            tcp: None,
            payload: udp.payload().to_vec(),
        },
        _ => TransportInfo::default(),
    }
}
