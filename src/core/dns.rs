//! DNS message view helpers
//!
//! The wire decoder is hickory-proto; these helpers render the pieces of a
//! decoded message the way the log schema wants them: bare names without the
//! trailing root dot, well-known type mnemonics with a decimal fallback, and
//! one string per resource record value.

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

/// Record type mnemonic, or the decimal value for anything unrecognized so
/// no data is lost.
pub fn type_string(rt: RecordType) -> String {
    match rt {
        RecordType::A => "A".to_string(),
        RecordType::AAAA => "AAAA".to_string(),
        RecordType::CNAME => "CNAME".to_string(),
        RecordType::MX => "MX".to_string(),
        RecordType::NS => "NS".to_string(),
        RecordType::PTR => "PTR".to_string(),
        RecordType::TXT => "TXT".to_string(),
        RecordType::SOA => "SOA".to_string(),
        RecordType::SRV => "SRV".to_string(),
        RecordType::ANY => "ANY".to_string(),
        other => u16::from(other).to_string(),
    }
}

/// Name rendered without the trailing root dot.
pub fn name_string(name: &Name) -> String {
    let mut s = name.to_utf8();
    if s.len() > 1 && s.ends_with('.') {
        s.pop();
    }
    s
}

/// The value of a resource record as a single string.
pub fn rr_string(record: &Record) -> String {
    match record.data() {
        Some(RData::A(a)) => a.0.to_string(),
        Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
        Some(RData::CNAME(cname)) => name_string(&cname.0),
        Some(RData::MX(mx)) => name_string(mx.exchange()),
        Some(RData::NS(ns)) => name_string(&ns.0),
        Some(RData::PTR(ptr)) => name_string(&ptr.0),
        Some(RData::TXT(txt)) => txt
            .txt_data()
            .iter()
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(""),
        Some(RData::SOA(soa)) => name_string(soa.rname()),
        Some(RData::SRV(srv)) => name_string(srv.target()),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Human rendering of a response code, e.g. "Non-Existent Domain".
pub fn rcode_string(rcode: ResponseCode) -> String {
    rcode.to_str().to_string()
}

/// Wire length of a record's data, as reported in the `response_size` field.
pub fn rdata_len(record: &Record) -> u16 {
    record
        .data()
        .and_then(|data| data.to_bytes().ok())
        .map(|bytes| bytes.len() as u16)
        .unwrap_or(0)
}

/// Name of the first (and in practice only) question.
pub fn question_name(message: &Message) -> Option<String> {
    message.queries().first().map(|q| name_string(q.name()))
}
