//! Shard worker
//!
//! Single-threaded loop over the shard's queue plus a one-minute tick.
//! Reassembled payloads correlate as "tcp"; raw packets with a TCP layer go
//! into this shard's reassembler, even when a single-segment response would
//! parse as DNS on its own (skipping reassembly would leave the handshake
//! and teardown dangling in the stream table); raw packets with a DNS layer
//! correlate as UDP; everything else is dropped with a debug note.

use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{select, tick, Receiver};
use tracing::debug;

use crate::core::frame::Frame;
use crate::correlate::Correlator;
use crate::engine::reassembly::StreamReassembler;
use crate::metrics::Metrics;

const FLUSH_TICK: Duration = Duration::from_secs(60);
const STREAM_IDLE_LIMIT: Duration = Duration::from_secs(120);

pub struct ShardWorker {
    id: usize,
    queue: Receiver<Frame>,
    reassembler: StreamReassembler,
    correlator: Correlator,
    metrics: Metrics,
}

impl ShardWorker {
    pub fn new(
        id: usize,
        queue: Receiver<Frame>,
        reassembler: StreamReassembler,
        correlator: Correlator,
        metrics: Metrics,
    ) -> Self {
        Self {
            id,
            queue,
            reassembler,
            correlator,
            metrics,
        }
    }

    /// Consume the queue until it closes. Every minute, streams idle for two
    /// minutes or more are flushed out of the reassembler.
    pub fn run(self) {
        let Self {
            id,
            queue,
            mut reassembler,
            correlator,
            metrics,
        } = self;

        let ticker = tick(FLUSH_TICK);
        // Format the per-shard stat names once, not per packet.
        let lookups_stat = format!("{}.dns_lookups", id);
        let wall_time_stat = format!("{}.packet_wall_time", id);

        loop {
            select! {
                recv(queue) -> frame => {
                    let Ok(mut frame) = frame else {
                        // Queue closed: clean shutdown.
                        return;
                    };
                    if let Err(e) = frame.parse() {
                        debug!("error parsing packet: {}", e);
                        continue;
                    }
                    handle_frame(
                        &mut reassembler,
                        &correlator,
                        &metrics,
                        &frame,
                        &lookups_stat,
                        &wall_time_stat,
                    );
                }
                recv(ticker) -> _ => {
                    reassembler.flush_older_than(STREAM_IDLE_LIMIT);
                }
            }
        }
    }
}

fn handle_frame(
    reassembler: &mut StreamReassembler,
    correlator: &Correlator,
    metrics: &Metrics,
    frame: &Frame,
    lookups_stat: &str,
    wall_time_stat: &str,
) {
    let Some(flow) = frame.net_flow() else {
        debug!("frame without network flow");
        return;
    };

    let packet_time = match frame.timestamp() {
        Some(ts) => ts,
        None => {
            debug!("adding wall time not packet time to message");
            metrics.incr(wall_time_stat);
            Utc::now()
        }
    };

    if frame.is_tcp_stream() {
        // Reassembled payloads that fail to parse as DNS are dropped
        // without comment.
        if let Some(message) = frame.dns() {
            correlator.handle_message(
                message,
                flow.src,
                flow.dst,
                frame.src_port(),
                frame.dst_port(),
                frame.size(),
                frame.proto(),
                packet_time,
            );
        }
    } else if frame.has_tcp_layer() {
        if let Some(transport) = frame.transport() {
            reassembler.process(flow.src, flow.dst, transport);
        }
    } else if frame.has_dns_layer() {
        if let Some(message) = frame.dns() {
            correlator.handle_message(
                message,
                flow.src,
                flow.dst,
                frame.src_port(),
                frame.dst_port(),
                frame.size(),
                frame.proto(),
                packet_time,
            );
            metrics.incr(lookups_stat);
        }
    } else {
        // UDP that doesn't parse as DNS?
        debug!("missing a DNS layer?");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::ReassembledPayload;
    use crate::core::NetFlow;
    use crate::correlate::ConnectionTable;
    use crate::output::LogRecord;
    use crossbeam_channel::{bounded, Sender};
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

    struct Harness {
        queue: Sender<Frame>,
        logs: crossbeam_channel::Receiver<LogRecord>,
        reassembled: crossbeam_channel::Receiver<ReassembledPayload>,
        table: Arc<ConnectionTable>,
        handle: thread::JoinHandle<()>,
    }

    fn start_worker() -> Harness {
        let (queue_tx, queue_rx) = bounded(64);
        let (log_tx, log_rx) = bounded(64);
        let (reassembled_tx, reassembled_rx) = bounded(64);
        let table = Arc::new(ConnectionTable::new());
        let correlator = Correlator::new(
            table.clone(),
            log_tx,
            Metrics::disabled(),
            String::new(),
        );
        let worker = ShardWorker::new(
            0,
            queue_rx,
            StreamReassembler::new(reassembled_tx),
            correlator,
            Metrics::disabled(),
        );
        let handle = thread::spawn(move || worker.run());
        Harness {
            queue: queue_tx,
            logs: log_rx,
            reassembled: reassembled_rx,
            table,
            handle,
        }
    }

    fn query_message(id: u16, name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn response_message(id: u16, name: &str, addr: Ipv4Addr) -> Message {
        let mut msg = query_message(id, name);
        msg.set_message_type(MessageType::Response)
            .add_answer(Record::from_rdata(
                Name::from_str(name).unwrap(),
                60,
                RData::A(A(addr)),
            ));
        msg
    }

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, msg: &Message) -> Frame {
        let payload = msg.to_vec().unwrap();
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        )
        .ipv4(src, dst, 64)
        .udp(sport, dport);
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, &payload).unwrap();
        let caplen = data.len();
        Frame::raw(data, Utc::now(), caplen)
    }

    fn tcp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        seq: u32,
        payload: &[u8],
        fin: bool,
    ) -> Frame {
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        )
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 0xffff);
        let builder = if fin { builder.fin() } else { builder };
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();
        let caplen = data.len();
        Frame::raw(data, Utc::now(), caplen)
    }

    #[test]
    fn test_udp_exchange_produces_record() {
        let harness = start_worker();
        let query = query_message(0x4fb8, "www.slashdot.org.");
        let response = response_message(0x4fb8, "www.slashdot.org.", Ipv4Addr::new(216, 34, 181, 48));

        harness
            .queue
            .send(udp_frame([192, 168, 1, 100], [8, 8, 8, 8], 54321, 53, &query))
            .unwrap();
        harness
            .queue
            .send(udp_frame([8, 8, 8, 8], [192, 168, 1, 100], 53, 54321, &response))
            .unwrap();

        let record = harness.logs.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.question, "www.slashdot.org");
        assert_eq!(record.answer, "216.34.181.48");
        assert_eq!(record.proto, "udp");
        assert_eq!(record.server, SERVER);
        assert_eq!(record.client, CLIENT);
        assert!(harness.table.is_empty());

        drop(harness.queue);
        harness.handle.join().unwrap();
    }

    #[test]
    fn test_tcp_segments_go_through_reassembly() {
        let harness = start_worker();
        let response = response_message(0x0101, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        let wire = response.to_vec().unwrap();
        let mut framed = (wire.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&wire);

        // Even though the single segment would parse as DNS, it must take
        // the reassembly path.
        harness
            .queue
            .send(tcp_frame([8, 8, 8, 8], [192, 168, 1, 100], 53, 54321, 100, &framed, false))
            .unwrap();
        harness
            .queue
            .send(tcp_frame(
                [8, 8, 8, 8],
                [192, 168, 1, 100],
                53,
                54321,
                100 + framed.len() as u32,
                &[],
                true,
            ))
            .unwrap();

        let payload = harness
            .reassembled
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(payload.data, wire);
        assert!(harness.logs.is_empty());

        drop(harness.queue);
        harness.handle.join().unwrap();
    }

    #[test]
    fn test_reassembled_payload_correlates_as_tcp() {
        let harness = start_worker();
        let query = query_message(0x0202, "tcp.example.com.");
        let response = response_message(0x0202, "tcp.example.com.", Ipv4Addr::new(5, 6, 7, 8));

        harness
            .queue
            .send(Frame::reassembled(ReassembledPayload {
                data: response.to_vec().unwrap(),
                flow: NetFlow::new(SERVER, CLIENT),
            }))
            .unwrap();
        harness
            .queue
            .send(Frame::reassembled(ReassembledPayload {
                data: query.to_vec().unwrap(),
                flow: NetFlow::new(CLIENT, SERVER),
            }))
            .unwrap();

        let record = harness.logs.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.proto, "tcp");
        assert_eq!(record.server, SERVER);
        assert_eq!(record.client, CLIENT);
        assert_eq!(record.length, 0);
        assert!(harness.table.is_empty());

        drop(harness.queue);
        harness.handle.join().unwrap();
    }

    #[test]
    fn test_non_dns_udp_is_dropped() {
        let harness = start_worker();
        let builder = etherparse::PacketBuilder::ethernet2(
            [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        )
        .ipv4([192, 168, 1, 100], [8, 8, 8, 8], 64)
        .udp(1234, 5678);
        let payload = [0u8; 8];
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, &payload).unwrap();
        harness
            .queue
            .send(Frame::raw(data, Utc::now(), 0))
            .unwrap();

        drop(harness.queue);
        harness.handle.join().unwrap();
        assert!(harness.logs.is_empty());
        assert!(harness.table.is_empty());
    }

    #[test]
    fn test_worker_exits_on_queue_close() {
        let harness = start_worker();
        drop(harness.queue);
        harness.handle.join().unwrap();
    }
}
