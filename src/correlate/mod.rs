//! Query/response correlation
//!
//! A process-wide table maps a flow-qualified query id to the first-observed
//! leg of an exchange. When the second leg arrives, whichever order the legs
//! came in, the pair is turned into log records and the entry is deleted.
//! Entries whose partner never shows up are swept by the GC task.

pub mod record;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick, Receiver, Sender};
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode};
use tracing::debug;

use crate::core::flow::NetFlow;
use crate::core::frame::DNS_PORT;
use crate::metrics::Metrics;
use crate::output::LogRecord;

/// First-seen leg of an exchange plus when it went in. Never mutated.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub message: Message,
    pub inserted: DateTime<Utc>,
}

/// The shared connection table. DashMap stripes its locks, so lookups and
/// inserts on different shards of the map do not contend and the GC sweep
/// never stalls the whole table.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: DashMap<String, MapEntry>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, key: &str) -> Option<MapEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    fn insert(&self, key: String, entry: MapEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete every entry inserted before `cutoff`; returns how many went.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        self.entries.retain(|key, entry| {
            if entry.inserted < cutoff {
                debug!("conntable GC: cleanup query ID {}", key);
                dropped += 1;
                false
            } else {
                true
            }
        });
        dropped
    }
}

/// Key both legs of one exchange collapse onto.
///
/// The DNS id alone is far from unique, so the key also carries the port
/// pair, normalized so that both directions agree, and the unordered address
/// pair, so that NAT'd clients reusing a source port with the same id stay
/// separate. Reassembled TCP legs have unknown ports (0:0) and rely on the
/// address pair.
pub fn correlation_key(id: u16, flow: &NetFlow, src_port: u16, dst_port: u16) -> String {
    let (lo, hi) = flow.normalized();
    if dst_port == DNS_PORT {
        format!("{}->{}:{}@{}|{}", id, src_port, dst_port, lo, hi)
    } else {
        format!("{}->{}:{}@{}|{}", id, dst_port, src_port, lo, hi)
    }
}

/// Per-shard handle on the shared table and the log channel.
#[derive(Clone)]
pub struct Correlator {
    table: Arc<ConnectionTable>,
    log_tx: Sender<LogRecord>,
    metrics: Metrics,
    level: String,
}

impl Correlator {
    pub fn new(
        table: Arc<ConnectionTable>,
        log_tx: Sender<LogRecord>,
        metrics: Metrics,
        level: String,
    ) -> Self {
        Self {
            table,
            log_tx,
            metrics,
            level,
        }
    }

    /// Feed one observed DNS message through the table.
    ///
    /// On a hit the QR bit of the new leg decides which side is the
    /// response; the entry is deleted and one batch of records goes out
    /// contiguously. On a miss the leg is stored under the packet time.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_message(
        &self,
        message: &Message,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        length: usize,
        proto: &str,
        packet_time: DateTime<Utc>,
    ) {
        // Updates, AXFRs and friends still correlate; they are just noted.
        if message.op_code() != OpCode::Query {
            debug!("saw non-query DNS message");
        }

        let flow = NetFlow::new(src_ip, dst_ip);
        let key = correlation_key(message.id(), &flow, src_port, dst_port);

        match self.table.remove(&key) {
            Some(entry) => {
                let records = if message.message_type() == MessageType::Response {
                    self.metrics.incr("log_qr");
                    debug!("got 'answer' leg of query ID: {}", message.id());
                    // New leg is the response: it runs server -> client.
                    record::build_records(
                        &self.level,
                        src_ip,
                        dst_ip,
                        dst_port,
                        length,
                        proto,
                        &entry.message,
                        message,
                        entry.inserted,
                        packet_time,
                    )
                } else {
                    self.metrics.incr("log_no_qr");
                    debug!("got the 'question' leg of query ID {}", message.id());
                    // Response arrived first (common on TCP); the new leg is
                    // the question and runs client -> server.
                    record::build_records(
                        &self.level,
                        dst_ip,
                        src_ip,
                        src_port,
                        length,
                        proto,
                        message,
                        &entry.message,
                        entry.inserted,
                        packet_time,
                    )
                };

                for record in records {
                    if self.log_tx.send(record).is_err() {
                        return;
                    }
                }
            }
            None => {
                debug!("got a leg of query ID {}", message.id());
                self.table.insert(
                    key,
                    MapEntry {
                        message: message.clone(),
                        inserted: packet_time,
                    },
                );
            }
        }
    }
}

/// Background sweep of stale correlation entries.
///
/// `max_age` is non-positive: the cutoff is `now + max_age` and everything
/// inserted before it is dropped and counted.
pub fn run_gc(
    table: Arc<ConnectionTable>,
    max_age: chrono::Duration,
    interval: Duration,
    metrics: Metrics,
    finished: Receiver<()>,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let cutoff = Utc::now() + max_age;
                let dropped = table.sweep(cutoff);
                if dropped > 0 {
                    metrics.count("cache_entries_dropped", dropped as i64);
                }
            }
            recv(finished) -> _ => {
                debug!("conntable GC cleanly exiting");
                return;
            }
        }
    }
}
