//! fluentd sink
//!
//! Writes each record to a local fluentd forward socket as a MessagePack
//! 3-element array: `[tag, unix_seconds, record]`. The record is encoded as
//! a map keyed by the same names as the JSON output, with `level` omitted
//! when empty and IP addresses rendered as strings.

use std::io::{BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{PdnsError, Result};

use super::LogRecord;

const CONNECT_RETRIES: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Shape of the record inside the fluentd envelope. Same field names as the
/// JSON output; `level` is dropped when empty and addresses are strings.
#[derive(Debug, Serialize)]
struct FluentdRecord<'a> {
    query_id: u16,
    rcode: u16,
    q: &'a str,
    qtype: &'a str,
    a: &'a str,
    atype: &'a str,
    ttl: u32,
    dst: String,
    src: String,
    tstamp: &'a str,
    elapsed: i64,
    sport: u16,
    #[serde(skip_serializing_if = "str::is_empty")]
    level: &'a str,
    bytes: usize,
    protocol: &'a str,
    truncated: bool,
    aa: bool,
    rd: bool,
    ra: bool,
    response_size: u16,
    question_size: u16,
    additionals: bool,
}

impl<'a> From<&'a LogRecord> for FluentdRecord<'a> {
    fn from(record: &'a LogRecord) -> Self {
        Self {
            query_id: record.query_id,
            rcode: record.rcode,
            q: &record.question,
            qtype: &record.question_type,
            a: &record.answer,
            atype: &record.answer_type,
            ttl: record.ttl,
            dst: record.server.to_string(),
            src: record.client.to_string(),
            tstamp: &record.timestamp,
            elapsed: record.elapsed,
            sport: record.client_port,
            level: &record.level,
            bytes: record.length,
            protocol: &record.proto,
            truncated: record.truncated,
            aa: record.authoritative,
            rd: record.recursion_desired,
            ra: record.recursion_available,
            response_size: record.response_size,
            question_size: record.question_size,
            additionals: record.additionals,
        }
    }
}

/// Encode the full forward envelope for one record.
pub fn encode_envelope(tag: &str, unix_seconds: i64, record: &LogRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    rmp::encode::write_array_len(&mut buf, 3)
        .map_err(|e| PdnsError::Sink(format!("fluentd envelope: {}", e)))?;
    rmp::encode::write_str(&mut buf, tag)
        .map_err(|e| PdnsError::Sink(format!("fluentd envelope: {}", e)))?;
    rmp::encode::write_sint(&mut buf, unix_seconds)
        .map_err(|e| PdnsError::Sink(format!("fluentd envelope: {}", e)))?;
    rmp_serde::encode::write_named(&mut buf, &FluentdRecord::from(record))
        .map_err(|e| PdnsError::Sink(format!("fluentd record: {}", e)))?;
    Ok(buf)
}

/// Connect to the forward socket. fluentd can take a while to come up, so
/// retry for a while before giving up; giving up is fatal.
pub fn connect(path: &str) -> Result<BufWriter<UnixStream>> {
    for attempt in 1..=CONNECT_RETRIES {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, stream)),
            Err(e) => {
                warn!(
                    "failed to connect to fluentd socket: {}, retrying in {}s ({}/{})",
                    e,
                    CONNECT_RETRY_DELAY.as_secs(),
                    attempt,
                    CONNECT_RETRIES
                );
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
    Err(PdnsError::Sink(format!(
        "unable to open connection to fluentd socket {} after {} retries",
        path, CONNECT_RETRIES
    )))
}

/// A failed socket write is fatal: fluentd delivery is the one sink this
/// sensor is not allowed to silently lose.
pub fn run(rx: Receiver<LogRecord>, mut writer: BufWriter<UnixStream>, tag: String) {
    for record in rx.iter() {
        let encoded = match encode_envelope(&tag, Utc::now().timestamp(), &record) {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("failed to encode fluentd record: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&encoded).and_then(|_| writer.flush()) {
            error!("unable to write to fluentd socket: {}", e);
            std::process::exit(1);
        }
    }
}
