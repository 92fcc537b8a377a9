//! Rolling file sink
//!
//! Newline-delimited JSON with size-based rotation and a bounded number of
//! rotated files kept on disk.

use std::io::Write;

use crossbeam_channel::Receiver;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use tracing::debug;

use super::{LogOptions, LogRecord};

pub type RollingFile = FileRotate<AppendCount>;

pub fn open(opts: &LogOptions) -> RollingFile {
    FileRotate::new(
        &opts.filename,
        AppendCount::new(opts.max_backups),
        ContentLimit::Bytes(opts.max_size * 1024 * 1024),
        Compression::None,
        #[cfg(unix)]
        None,
    )
}

pub fn run(rx: Receiver<LogRecord>, mut writer: RollingFile) {
    for record in rx.iter() {
        let line = match record.encode() {
            Ok(line) => line,
            Err(e) => {
                debug!("failed to encode record: {}", e);
                continue;
            }
        };
        if let Err(e) = writeln!(writer, "{}", line) {
            debug!("failed to write log file: {}", e);
        }
    }
    if let Err(e) = writer.flush() {
        debug!("failed to flush log file: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_file_sink_writes_json_lines() {
        let dir = std::env::temp_dir().join("passivedns-file-sink-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");
        let _ = std::fs::remove_file(&path);

        let opts = LogOptions {
            quiet: true,
            filename: path.to_string_lossy().into_owned(),
            fluentd_socket: String::new(),
            max_age: 28,
            max_backups: 3,
            max_size: 100,
            kafka_brokers: String::new(),
            kafka_topic: String::new(),
            syslog_facility: String::new(),
            syslog_priority: String::new(),
            sensor_name: "test".to_string(),
        };

        let (tx, rx) = bounded(4);
        let writer = open(&opts);
        tx.send(crate::output::tests::sample_record()).unwrap();
        tx.send(crate::output::tests::sample_record()).unwrap();
        drop(tx);
        run(rx, writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["q"], "www.slashdot.org");
    }
}
