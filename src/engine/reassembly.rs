//! TCP stream reassembly
//!
//! Each shard owns one reassembler; flow-hash sharding guarantees both
//! directions of a connection land here. Streams are directional: the query
//! and the response of a DNS-over-TCP exchange are separate streams that
//! each emit their own payload when the stream closes or goes idle.
//!
//! On close the contiguous byte prefix is framed as a DNS message:
//! at least 2 bytes, a big-endian u16 length prefix, and at least
//! `prefix + 2` bytes buffered; anything else is dropped without comment.
//! The emitted payload re-enters the pipeline through the router so that
//! shard ownership stays consistent for both legs.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::core::flow::NetFlow;
use crate::core::frame::ReassembledPayload;
use crate::core::parser::TransportInfo;

/// Directional stream identity: the network flow plus the port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
}

#[derive(Debug)]
struct Stream {
    flow: NetFlow,
    /// Sequence number of the first payload byte, fixed by the SYN or by
    /// the first data segment on mid-stream pickup.
    isn: Option<u32>,
    /// Payload segments keyed by offset relative to `isn`.
    segments: BTreeMap<u32, Vec<u8>>,
    last_seen: Instant,
}

impl Stream {
    fn new(flow: NetFlow) -> Self {
        Self {
            flow,
            isn: None,
            segments: BTreeMap::new(),
            last_seen: Instant::now(),
        }
    }

    /// Concatenate the contiguous prefix starting at offset zero. Data past
    /// a gap never made it onto the wire in order and is ignored.
    fn assemble(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        for (&offset, data) in &self.segments {
            let offset = offset as usize;
            if offset > buf.len() {
                break;
            }
            if offset + data.len() > buf.len() {
                buf.extend_from_slice(&data[buf.len() - offset..]);
            }
        }
        buf
    }
}

pub struct StreamReassembler {
    streams: HashMap<StreamKey, Stream>,
    out: Sender<ReassembledPayload>,
}

impl StreamReassembler {
    pub fn new(out: Sender<ReassembledPayload>) -> Self {
        Self {
            streams: HashMap::new(),
            out,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Feed one TCP segment. FIN and RST close the stream and emit whatever
    /// framed correctly.
    pub fn process(&mut self, src_ip: IpAddr, dst_ip: IpAddr, transport: &TransportInfo) {
        let Some(segment) = transport.tcp else {
            return;
        };
        let key = StreamKey {
            src_ip,
            dst_ip,
            src_port: transport.src_port,
            dst_port: transport.dst_port,
        };

        let stream = self
            .streams
            .entry(key)
            .or_insert_with(|| Stream::new(NetFlow::new(src_ip, dst_ip)));
        stream.last_seen = Instant::now();

        if segment.syn {
            // SYN consumes one sequence number; payload starts after it.
            stream.isn = Some(segment.seq.wrapping_add(1));
        }

        if !transport.payload.is_empty() {
            let isn = *stream.isn.get_or_insert(segment.seq);
            let offset = segment.seq.wrapping_sub(isn);
            let data = stream.segments.entry(offset).or_default();
            // Retransmits can shrink; keep the longest copy seen.
            if transport.payload.len() > data.len() {
                *data = transport.payload.clone();
            }
        }

        if segment.fin || segment.rst {
            if let Some(stream) = self.streams.remove(&key) {
                self.finalize(stream);
            }
        }
    }

    /// Close and emit every stream idle for at least `max_idle`. Called from
    /// the shard worker's periodic tick.
    pub fn flush_older_than(&mut self, max_idle: Duration) {
        let idle_keys: Vec<StreamKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.last_seen.elapsed() >= max_idle)
            .map(|(key, _)| *key)
            .collect();
        for key in idle_keys {
            if let Some(stream) = self.streams.remove(&key) {
                self.finalize(stream);
            }
        }
    }

    fn finalize(&self, stream: Stream) {
        let flow = stream.flow;
        let data = stream.assemble();
        if data.len() < 2 {
            return;
        }
        let declared = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < declared + 2 {
            return;
        }
        let _ = self.out.send(ReassembledPayload {
            data: data[2..declared + 2].to_vec(),
            flow,
        });
    }
}
