//! Log record construction
//!
//! Multiple questions are not a thing in practice, so the question section
//! comes from the first query and one record goes out per answer RR. A
//! successful ANY lookup can therefore produce a pile of records sharing one
//! query id. Error responses produce exactly one synthetic record carrying
//! the rendered response code.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use hickory_proto::op::{Message, ResponseCode};
use tracing::debug;

use crate::core::dns;
use crate::core::frame::{PROTO_PACKET, PROTO_UDP};
use crate::output::LogRecord;

/// Build the record batch for a matched (question, response) pair.
///
/// `server`/`client`/`client_port` describe the exchange from the response
/// leg's point of view: the server is the response's source. `length` and
/// `proto` come from the second-observed packet; the "packet" tag is
/// rewritten to "udp" here, just before anything becomes visible.
#[allow(clippy::too_many_arguments)]
pub fn build_records(
    level: &str,
    server: IpAddr,
    client: IpAddr,
    client_port: u16,
    length: usize,
    proto: &str,
    question: &Message,
    response: &Message,
    inserted: DateTime<Utc>,
    packet_time: DateTime<Utc>,
) -> Vec<LogRecord> {
    let Some(query) = question.queries().first() else {
        debug!("question leg without a question section, dropping");
        return Vec::new();
    };

    let proto = if proto == PROTO_PACKET { PROTO_UDP } else { proto };
    let question_name = dns::name_string(query.name());
    let question_size = question_name.len() as u16;
    let elapsed = (packet_time - inserted).num_nanoseconds().unwrap_or(0).max(0);
    let timestamp = Utc::now().to_string();
    let additionals = !response.additionals().is_empty();
    let rcode = response.response_code();

    let base = LogRecord {
        query_id: response.id(),
        rcode: u16::from(rcode),
        question: question_name,
        question_type: dns::type_string(query.query_type()),
        answer: String::new(),
        answer_type: String::new(),
        ttl: 0,
        server,
        client,
        timestamp,
        elapsed,
        client_port,
        level: level.to_string(),
        length,
        proto: proto.to_string(),
        truncated: response.truncated(),
        authoritative: response.authoritative(),
        recursion_desired: question.recursion_desired(),
        recursion_available: question.recursion_available(),
        response_size: 0,
        question_size,
        additionals,
    };

    // A response code other than 0 means failure of some kind; the answer
    // section is not meaningful.
    if rcode != ResponseCode::NoError {
        return vec![LogRecord {
            answer: dns::rcode_string(rcode),
            ..base
        }];
    }

    response
        .answers()
        .iter()
        .map(|answer| LogRecord {
            answer: dns::rr_string(answer),
            answer_type: dns::type_string(answer.record_type()),
            ttl: answer.ttl(),
            response_size: dns::rdata_len(answer),
            ..base.clone()
        })
        .collect()
}
