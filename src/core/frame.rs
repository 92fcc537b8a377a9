//! Decoded frame
//!
//! One unit of work for a shard: either a raw captured frame or a DNS
//! payload recovered from a TCP stream. The capture loop owns the pcap
//! buffer, so raw frames copy their bytes up front; everything derived from
//! them afterwards is owned by the frame.

use chrono::{DateTime, Utc};
use etherparse::SlicedPacket;
use hickory_proto::op::Message;

use crate::core::flow::NetFlow;
use crate::core::parser::{self, TransportInfo};
use crate::error::{PdnsError, Result};

pub const PROTO_PACKET: &str = "packet";
pub const PROTO_UDP: &str = "udp";
pub const PROTO_TCP: &str = "tcp";

pub const DNS_PORT: u16 = 53;

/// A single DNS message recovered from a TCP stream, tagged with the
/// network flow it came from. Transport ports are not recoverable here.
#[derive(Debug, Clone)]
pub struct ReassembledPayload {
    pub data: Vec<u8>,
    pub flow: NetFlow,
}

#[derive(Debug)]
enum Kind {
    Raw {
        timestamp: DateTime<Utc>,
        caplen: usize,
    },
    Reassembled {
        flow: NetFlow,
    },
}

#[derive(Debug, Default)]
struct Layers {
    ip: Option<parser::IpInfo>,
    transport: Option<TransportInfo>,
    dns: Option<Message>,
}

/// A raw packet or reassembled payload plus its decoded layer views.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    kind: Kind,
    layers: Option<Layers>,
}

impl Frame {
    /// Frame captured off the wire. `data` must be an owned copy; the
    /// capture buffer is reused by the handle.
    pub fn raw(data: Vec<u8>, timestamp: DateTime<Utc>, caplen: usize) -> Self {
        Self {
            data,
            kind: Kind::Raw { timestamp, caplen },
            layers: None,
        }
    }

    pub fn reassembled(payload: ReassembledPayload) -> Self {
        Self {
            data: payload.data,
            kind: Kind::Reassembled { flow: payload.flow },
            layers: None,
        }
    }

    /// Decode the layer views. For raw frames a failure past Ethernet/IP is
    /// an error (the caller drops the frame with a debug log); for
    /// reassembled payloads a DNS parse failure just leaves the DNS view
    /// empty, which drops the payload silently downstream.
    pub fn parse(&mut self) -> Result<()> {
        let layers = match self.kind {
            Kind::Raw { .. } => {
                let sliced = SlicedPacket::from_ethernet(&self.data)
                    .map_err(|e| PdnsError::Parse(e.to_string()))?;
                let ip = parser::parse_ip(&sliced)
                    .ok_or_else(|| PdnsError::Parse("no IP layer".to_string()))?;
                let transport = parser::parse_transport(&sliced);

                // DNS decoding is only attempted for UDP port 53 payloads;
                // TCP segments always go through reassembly first.
                let dns = if transport.tcp.is_none()
                    && !transport.payload.is_empty()
                    && (transport.src_port == DNS_PORT || transport.dst_port == DNS_PORT)
                {
                    Message::from_vec(&transport.payload).ok()
                } else {
                    None
                };

                Layers {
                    ip: Some(ip),
                    transport: Some(transport),
                    dns,
                }
            }
            Kind::Reassembled { .. } => Layers {
                ip: None,
                transport: None,
                dns: Message::from_vec(&self.data).ok(),
            },
        };
        self.layers = Some(layers);
        Ok(())
    }

    pub fn is_tcp_stream(&self) -> bool {
        matches!(self.kind, Kind::Reassembled { .. })
    }

    pub fn has_tcp_layer(&self) -> bool {
        self.transport().map(|t| t.tcp.is_some()).unwrap_or(false)
    }

    pub fn has_dns_layer(&self) -> bool {
        self.dns().is_some()
    }

    pub fn dns(&self) -> Option<&Message> {
        self.layers.as_ref().and_then(|l| l.dns.as_ref())
    }

    pub fn transport(&self) -> Option<&TransportInfo> {
        self.layers.as_ref().and_then(|l| l.transport.as_ref())
    }

    /// Network flow of the frame; None for raw frames that have not parsed.
    pub fn net_flow(&self) -> Option<NetFlow> {
        match &self.kind {
            Kind::Reassembled { flow } => Some(*flow),
            Kind::Raw { .. } => self
                .layers
                .as_ref()
                .and_then(|l| l.ip.as_ref())
                .map(|ip| NetFlow::new(ip.src_ip, ip.dst_ip)),
        }
    }

    pub fn src_port(&self) -> u16 {
        self.transport().map(|t| t.src_port).unwrap_or(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.transport().map(|t| t.dst_port).unwrap_or(0)
    }

    /// Capture timestamp. Reassembled payloads have none; the worker falls
    /// back to wall time and counts the substitution.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Raw { timestamp, .. } => Some(*timestamp),
            Kind::Reassembled { .. } => None,
        }
    }

    /// Capture length. Reassembled payloads report 0: the size of the full
    /// original stream is not tracked.
    pub fn size(&self) -> usize {
        match &self.kind {
            Kind::Raw { caplen, .. } => *caplen,
            Kind::Reassembled { .. } => 0,
        }
    }

    /// Internal protocol tag; "packet" is rewritten to "udp" when the
    /// record is built.
    pub fn proto(&self) -> &'static str {
        match &self.kind {
            Kind::Raw { .. } => PROTO_PACKET,
            Kind::Reassembled { .. } => PROTO_TCP,
        }
    }
}
