//! Kafka sink placeholder
//!
//! Prints records with a "Kafka:" prefix instead of producing to a broker;
//! the broker/topic options are accepted so deployments can stage the
//! configuration before the producer is wired up.

use crossbeam_channel::Receiver;
use tracing::debug;

use super::LogRecord;

pub fn run(rx: Receiver<LogRecord>) {
    for record in rx.iter() {
        match record.encode() {
            Ok(line) => println!("Kafka: {}", line),
            Err(e) => debug!("failed to encode record: {}", e),
        }
    }
}
