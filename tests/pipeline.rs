//! End-to-end pipeline tests: synthetic frames through the router, shard
//! workers, TCP reassembly and the correlator, asserting on the records
//! that come out the far end.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use passivedns::core::frame::{Frame, ReassembledPayload};
use passivedns::core::NetFlow;
use passivedns::correlate::{ConnectionTable, Correlator};
use passivedns::engine::reassembly::StreamReassembler;
use passivedns::engine::router::Router;
use passivedns::engine::worker::ShardWorker;
use passivedns::metrics::Metrics;
use passivedns::output::LogRecord;

const CLIENT: [u8; 4] = [192, 168, 1, 100];
const SERVER: [u8; 4] = [8, 8, 8, 8];
const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
const SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

struct Pipeline {
    router: Router,
    reassembled: Receiver<ReassembledPayload>,
    log_tx: Sender<LogRecord>,
    log_rx: Receiver<LogRecord>,
    table: Arc<ConnectionTable>,
    workers: Vec<JoinHandle<()>>,
}

fn start_pipeline(num_shards: usize) -> Pipeline {
    let (router, queues) = Router::new(num_shards, 64);
    let (reassembled_tx, reassembled_rx) = bounded(256);
    let (log_tx, log_rx) = bounded(1024);
    let table = Arc::new(ConnectionTable::new());

    let mut workers = Vec::new();
    for (i, queue) in queues.into_iter().enumerate() {
        let worker = ShardWorker::new(
            i,
            queue,
            StreamReassembler::new(reassembled_tx.clone()),
            Correlator::new(
                table.clone(),
                log_tx.clone(),
                Metrics::disabled(),
                "DEBUG".to_string(),
            ),
            Metrics::disabled(),
        );
        workers.push(thread::spawn(move || worker.run()));
    }

    Pipeline {
        router,
        reassembled: reassembled_rx,
        log_tx,
        log_rx,
        table,
        workers,
    }
}

impl Pipeline {
    /// Close the shard queues, join the workers, and collect every record.
    fn finish(self) -> Vec<LogRecord> {
        drop(self.router);
        for worker in self.workers {
            worker.join().unwrap();
        }
        drop(self.log_tx);
        self.log_rx.iter().collect()
    }

    fn dispatch_raw(&self, src: [u8; 4], dst: [u8; 4], data: Vec<u8>) {
        let flow = NetFlow::new(IpAddr::V4(src.into()), IpAddr::V4(dst.into()));
        let caplen = data.len();
        assert!(self
            .router
            .dispatch(&flow, Frame::raw(data, Utc::now(), caplen)));
    }

    /// Stand-in for the capture loop's re-route of reassembled payloads.
    fn reroute_one(&self, timeout: Duration) -> NetFlow {
        let payload = self.reassembled.recv_timeout(timeout).unwrap();
        let flow = payload.flow;
        assert!(self.router.dispatch(&flow, Frame::reassembled(payload)));
        flow
    }
}

fn query(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    msg
}

fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, msg: &Message) -> Vec<u8> {
    let payload = msg.to_vec().unwrap();
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
        [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
    )
    .ipv4(src, dst, 64)
    .udp(sport, dport);
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, &payload).unwrap();
    data
}

fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    payload: &[u8],
    fin: bool,
) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb],
        [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
    )
    .ipv4(src, dst, 64)
    .tcp(sport, dport, seq, 0xffff);
    let builder = if fin { builder.fin() } else { builder };
    let mut data = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut data, payload).unwrap();
    data
}

fn length_prefixed(msg: &Message) -> Vec<u8> {
    let wire = msg.to_vec().unwrap();
    let mut framed = (wire.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&wire);
    framed
}

#[test]
fn test_udp_a_record_exchange() {
    let pipeline = start_pipeline(8);

    let q = query(0x4fb8, "www.slashdot.org.", RecordType::A);
    let mut r = q.clone();
    r.set_message_type(MessageType::Response)
        .set_recursion_available(true)
        .add_answer(Record::from_rdata(
            Name::from_str("www.slashdot.org.").unwrap(),
            110,
            RData::A(A(Ipv4Addr::new(216, 34, 181, 48))),
        ));

    pipeline.dispatch_raw(CLIENT, SERVER, udp_frame(CLIENT, SERVER, 54321, 53, &q));
    pipeline.dispatch_raw(SERVER, CLIENT, udp_frame(SERVER, CLIENT, 53, 54321, &r));

    let table = pipeline.table.clone();
    let records = pipeline.finish();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.query_id, 0x4fb8);
    assert_eq!(record.rcode, 0);
    assert_eq!(record.question, "www.slashdot.org");
    assert_eq!(record.question_type, "A");
    assert_eq!(record.answer, "216.34.181.48");
    assert_eq!(record.answer_type, "A");
    assert_eq!(record.ttl, 110);
    assert_eq!(record.proto, "udp");
    assert_eq!(record.server, SERVER_IP);
    assert_eq!(record.client, CLIENT_IP);
    assert_eq!(record.client_port, 54321);
    assert_eq!(record.question_size, 16);
    assert!(record.elapsed >= 0);
    assert!(table.is_empty());
}

#[test]
fn test_ns_multi_answer_batch() {
    let pipeline = start_pipeline(4);

    let q = query(0x6162, "google.com.", RecordType::NS);
    let mut r = q.clone();
    r.set_message_type(MessageType::Response);
    for ns in ["ns1", "ns2", "ns3", "ns4"] {
        r.add_answer(Record::from_rdata(
            Name::from_str("google.com.").unwrap(),
            21581,
            RData::NS(NS(Name::from_str(&format!("{}.google.com.", ns)).unwrap())),
        ));
    }

    pipeline.dispatch_raw(CLIENT, SERVER, udp_frame(CLIENT, SERVER, 40000, 53, &q));
    pipeline.dispatch_raw(SERVER, CLIENT, udp_frame(SERVER, CLIENT, 53, 40000, &r));

    let records = pipeline.finish();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.query_id == 0x6162));
    assert!(records.iter().all(|r| r.question_type == "NS"));
    assert!(records.iter().all(|r| r.ttl == 21581));
    let mut answers: Vec<_> = records.iter().map(|r| r.answer.clone()).collect();
    answers.sort();
    answers.dedup();
    assert_eq!(answers.len(), 4);
}

#[test]
fn test_nxdomain_synthetic_record() {
    use hickory_proto::op::ResponseCode;

    let pipeline = start_pipeline(2);

    let q = query(0x7777, "asdtartfgeasf.asdfgsdf.com.", RecordType::A);
    let mut r = q.clone();
    r.set_message_type(MessageType::Response)
        .set_response_code(ResponseCode::NXDomain);

    pipeline.dispatch_raw(CLIENT, SERVER, udp_frame(CLIENT, SERVER, 41000, 53, &q));
    pipeline.dispatch_raw(SERVER, CLIENT, udp_frame(SERVER, CLIENT, 53, 41000, &r));

    let records = pipeline.finish();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.rcode, 3);
    assert_eq!(record.answer, "Non-Existent Domain");
    assert_eq!(record.answer_type, "");
    assert_eq!(record.ttl, 0);
    assert_eq!(record.response_size, 0);
}

#[test]
fn test_tcp_exchange_via_reassembly() {
    let pipeline = start_pipeline(8);

    let q = query(0x0303, "tcp.example.com.", RecordType::A);
    let mut r = q.clone();
    r.set_message_type(MessageType::Response);
    for addr in [
        Ipv4Addr::new(1, 1, 1, 1),
        Ipv4Addr::new(2, 2, 2, 2),
        Ipv4Addr::new(3, 3, 3, 3),
    ] {
        r.add_answer(Record::from_rdata(
            Name::from_str("tcp.example.com.").unwrap(),
            30,
            RData::A(A(addr)),
        ));
    }

    let query_stream = length_prefixed(&q);
    let reply_stream = length_prefixed(&r);

    // Query leg: client -> server, data then FIN.
    pipeline.dispatch_raw(
        CLIENT,
        SERVER,
        tcp_frame(CLIENT, SERVER, 54321, 53, 1000, &query_stream, false),
    );
    pipeline.dispatch_raw(
        CLIENT,
        SERVER,
        tcp_frame(
            CLIENT,
            SERVER,
            54321,
            53,
            1000 + query_stream.len() as u32,
            &[],
            true,
        ),
    );
    // Response leg: server -> client.
    pipeline.dispatch_raw(
        SERVER,
        CLIENT,
        tcp_frame(SERVER, CLIENT, 53, 54321, 5000, &reply_stream, false),
    );
    pipeline.dispatch_raw(
        SERVER,
        CLIENT,
        tcp_frame(
            SERVER,
            CLIENT,
            53,
            54321,
            5000 + reply_stream.len() as u32,
            &[],
            true,
        ),
    );

    // Both stream closes emit payloads that re-enter through the router.
    let flow_a = pipeline.reroute_one(Duration::from_secs(2));
    let flow_b = pipeline.reroute_one(Duration::from_secs(2));
    assert_eq!(flow_a.shard(7), flow_b.shard(7));

    let table = pipeline.table.clone();
    let records = pipeline.finish();

    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.proto == "tcp"));
    assert!(records.iter().all(|r| r.query_id == 0x0303));
    assert!(records.iter().all(|r| r.length == 0));
    assert_eq!(records[0].server, SERVER_IP);
    assert_eq!(records[0].client, CLIENT_IP);
    assert!(table.is_empty());
}

#[test]
fn test_mixed_exchanges_count() {
    // Half of the lookups get answers, the other half get empty rcode-0
    // responses, which produce no records at all.
    let pipeline = start_pipeline(4);

    for i in 0..10u16 {
        let name = format!("host{}.example.com.", i);
        let sport = 42000 + i;
        let q = query(0x1000 + i, &name, RecordType::A);
        let mut r = q.clone();
        r.set_message_type(MessageType::Response);
        if i % 2 == 0 {
            r.add_answer(Record::from_rdata(
                Name::from_str(&name).unwrap(),
                60,
                RData::A(A(Ipv4Addr::new(10, 0, (i >> 8) as u8, i as u8))),
            ));
        }

        pipeline.dispatch_raw(CLIENT, SERVER, udp_frame(CLIENT, SERVER, sport, 53, &q));
        pipeline.dispatch_raw(SERVER, CLIENT, udp_frame(SERVER, CLIENT, 53, sport, &r));
    }

    let table = pipeline.table.clone();
    let records = pipeline.finish();
    assert_eq!(records.len(), 5);
    assert!(table.is_empty());
}

#[test]
fn test_stranded_query_is_swept_not_logged() {
    let pipeline = start_pipeline(2);

    let q = query(0x9999, "stranded.example.com.", RecordType::A);
    pipeline.dispatch_raw(CLIENT, SERVER, udp_frame(CLIENT, SERVER, 43210, 53, &q));

    // Wait for the worker to insert the entry.
    let table = pipeline.table.clone();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while table.is_empty() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(table.len(), 1);

    // A sweep with gc_age in the future relative to insertion clears it.
    let dropped = table.sweep(Utc::now() + chrono::Duration::seconds(1));
    assert_eq!(dropped, 1);
    assert!(table.is_empty());

    let records = pipeline.finish();
    assert!(records.is_empty());
}

#[test]
fn test_both_legs_share_a_shard_across_families() {
    for last in 1..=50u8 {
        let flow = NetFlow::new(
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, last)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
        );
        assert_eq!(flow.shard(7), flow.reversed().shard(7));
    }
    let v6 = NetFlow::new(
        "2001:db8::1".parse().unwrap(),
        "2607:f8b0:4001:c02::93".parse().unwrap(),
    );
    assert_eq!(v6.shard(7), v6.reversed().shard(7));
}
