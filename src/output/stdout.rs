//! stdout sink: one JSON object per line.

use crossbeam_channel::Receiver;
use tracing::debug;

use super::LogRecord;

pub fn run(rx: Receiver<LogRecord>) {
    for record in rx.iter() {
        match record.encode() {
            Ok(line) => println!("{}", line),
            Err(e) => debug!("failed to encode record: {}", e),
        }
    }
}
