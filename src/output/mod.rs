//! Log records and the sink fan-out
//!
//! Every resolved answer becomes one `LogRecord`. The fan-out stage receives
//! records on a single inbound channel and broadcasts each one to every
//! configured sink's own channel; a slow sink fills its channel and
//! backpressure propagates through the fan-out to the correlator and,
//! ultimately, the capture loop.

pub mod file;
pub mod fluentd;
pub mod kafka;
pub mod stdout;
pub mod syslog;

use std::net::IpAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, PACKET_QUEUE_DEPTH};
use crate::engine::join_timeout;
use crate::error::Result;
use crate::metrics::Metrics;

/// One log line. Field names are part of the output contract and must not
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "query_id")]
    pub query_id: u16,
    #[serde(rename = "rcode")]
    pub rcode: u16,
    #[serde(rename = "q")]
    pub question: String,
    #[serde(rename = "qtype")]
    pub question_type: String,
    #[serde(rename = "a")]
    pub answer: String,
    #[serde(rename = "atype")]
    pub answer_type: String,
    #[serde(rename = "ttl")]
    pub ttl: u32,
    #[serde(rename = "dst")]
    pub server: IpAddr,
    #[serde(rename = "src")]
    pub client: IpAddr,
    #[serde(rename = "tstamp")]
    pub timestamp: String,
    #[serde(rename = "elapsed")]
    pub elapsed: i64,
    #[serde(rename = "sport")]
    pub client_port: u16,
    #[serde(rename = "level")]
    pub level: String,
    #[serde(rename = "bytes")]
    pub length: usize,
    #[serde(rename = "protocol")]
    pub proto: String,
    #[serde(rename = "truncated")]
    pub truncated: bool,
    #[serde(rename = "aa")]
    pub authoritative: bool,
    #[serde(rename = "rd")]
    pub recursion_desired: bool,
    #[serde(rename = "ra")]
    pub recursion_available: bool,
    #[serde(rename = "response_size")]
    pub response_size: u16,
    #[serde(rename = "question_size")]
    pub question_size: u16,
    #[serde(rename = "additionals")]
    pub additionals: bool,
}

impl LogRecord {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Which sinks are enabled and how, distilled from the runtime config.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub quiet: bool,
    pub filename: String,
    pub fluentd_socket: String,
    pub max_age: u32,
    pub max_backups: usize,
    pub max_size: usize,
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub syslog_facility: String,
    pub syslog_priority: String,
    pub sensor_name: String,
}

impl LogOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quiet: config.quiet,
            filename: config.log_file.clone(),
            fluentd_socket: config.fluentd_socket.clone(),
            max_age: config.log_max_age,
            max_backups: config.log_max_backups,
            max_size: config.log_max_size,
            kafka_brokers: config.kafka_brokers.clone(),
            kafka_topic: config.kafka_topic.clone(),
            syslog_facility: config.syslog_facility.clone(),
            syslog_priority: config.syslog_priority.clone(),
            sensor_name: config.resolved_sensor_name(),
        }
    }

    pub fn log_to_stdout(&self) -> bool {
        !self.quiet
    }

    pub fn log_to_file(&self) -> bool {
        !self.filename.is_empty()
    }

    pub fn log_to_kafka(&self) -> bool {
        !(self.kafka_brokers.is_empty() && self.kafka_topic.is_empty())
    }

    pub fn log_to_syslog(&self) -> bool {
        !self.syslog_facility.is_empty() && !self.syslog_priority.is_empty()
    }

    pub fn log_to_fluentd(&self) -> bool {
        !self.fluentd_socket.is_empty()
    }
}

struct Sink {
    tx: Sender<LogRecord>,
    handle: JoinHandle<()>,
}

/// The fan-out stage plus its sink threads.
pub struct LogPipeline {
    tx: Option<Sender<LogRecord>>,
    fanout: Option<JoinHandle<()>>,
    stats_stop: Option<Sender<()>>,
    stats: Option<JoinHandle<()>>,
}

impl LogPipeline {
    /// Connect every configured sink (fatal if syslog or fluentd cannot be
    /// reached) and start the fan-out. `capacity` is the inbound channel
    /// depth, `packet_queue_depth x shards`.
    pub fn start(opts: &LogOptions, capacity: usize, metrics: Metrics) -> Result<Self> {
        let (tx, rx) = bounded::<LogRecord>(capacity);
        let mut sinks: Vec<Sink> = Vec::new();

        if opts.log_to_stdout() {
            debug!("stdout logging enabled");
            sinks.push(spawn_sink("log-stdout", stdout::run));
        }

        if opts.log_to_file() {
            debug!("file logging enabled to {}", opts.filename);
            let writer = file::open(opts);
            sinks.push(spawn_sink("log-file", move |rx| file::run(rx, writer)));
        }

        if opts.log_to_kafka() {
            debug!("kafka logging enabled");
            sinks.push(spawn_sink("log-kafka", kafka::run));
        }

        if opts.log_to_syslog() {
            debug!("syslog logging enabled");
            let logger = syslog::connect(&opts.syslog_facility)?;
            let priority = syslog::parse_priority(&opts.syslog_priority)?;
            sinks.push(spawn_sink("log-syslog", move |rx| {
                syslog::run(rx, logger, priority)
            }));
        }

        if opts.log_to_fluentd() {
            debug!("fluentd logging enabled");
            let writer = fluentd::connect(&opts.fluentd_socket)?;
            let tag = format!("{}.service", opts.sensor_name);
            sinks.push(spawn_sink("log-fluentd", move |rx| {
                fluentd::run(rx, writer, tag)
            }));
        }

        let (stats_stop, stats) = if metrics.enabled() {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let inbound = tx.clone();
            let sink_txs: Vec<Sender<LogRecord>> = sinks.iter().map(|s| s.tx.clone()).collect();
            let handle = thread::Builder::new()
                .name("log-stats".to_string())
                .spawn(move || watch_log_stats(metrics, inbound, sink_txs, stop_rx))
                .expect("spawn log stats thread");
            (Some(stop_tx), Some(handle))
        } else {
            (None, None)
        };

        let fanout = thread::Builder::new()
            .name("log-fanout".to_string())
            .spawn(move || fanout_loop(rx, sinks))
            .expect("spawn fanout thread");

        Ok(Self {
            tx: Some(tx),
            fanout: Some(fanout),
            stats_stop,
            stats,
        })
    }

    /// Handle producers use to submit records.
    pub fn sender(&self) -> Sender<LogRecord> {
        self.tx
            .as_ref()
            .expect("log pipeline already shut down")
            .clone()
    }

    /// Close the inbound channel and wait up to `drain` for the fan-out and
    /// its sinks to finish. Remaining records past the cap are lost by
    /// design.
    pub fn shutdown(mut self, drain: Duration) {
        if let Some(stop) = self.stats_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.stats.take() {
            let _ = handle.join();
        }
        // The last sender closes the channel; the fan-out then closes each
        // sink channel in turn.
        drop(self.tx.take());
        if let Some(handle) = self.fanout.take() {
            if !join_timeout(handle, drain) {
                debug!("exited with messages remaining in log queue");
            }
        }
    }
}

fn spawn_sink<F>(name: &str, run: F) -> Sink
where
    F: FnOnce(Receiver<LogRecord>) + Send + 'static,
{
    let (tx, rx) = bounded::<LogRecord>(PACKET_QUEUE_DEPTH);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(rx))
        .expect("spawn sink thread");
    Sink { tx, handle }
}

/// Broadcast each inbound record to every sink, then shut the sinks down
/// when the inbound channel closes.
fn fanout_loop(rx: Receiver<LogRecord>, sinks: Vec<Sink>) {
    for record in rx.iter() {
        for sink in &sinks {
            if sink.tx.send(record.clone()).is_err() {
                debug!("sink channel closed, dropping record");
            }
        }
    }

    for sink in sinks {
        drop(sink.tx);
        let _ = sink.handle.join();
    }
}

fn watch_log_stats(
    metrics: Metrics,
    inbound: Sender<LogRecord>,
    sinks: Vec<Sender<LogRecord>>,
    stop: Receiver<()>,
) {
    let ticker = tick(Duration::from_secs(15));
    loop {
        select! {
            recv(ticker) -> _ => {
                metrics.gauge("incoming_log_depth", inbound.len() as u64);
                for (i, sink) in sinks.iter().enumerate() {
                    metrics.gauge(&format!("{}.log_depth", i), sink.len() as u64);
                }
            }
            recv(stop) -> _ => return,
        }
    }
}
