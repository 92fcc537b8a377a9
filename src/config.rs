//! Runtime configuration
//!
//! Every option is a long flag with a `PDNS_*` environment fallback, so the
//! sensor can be driven from systemd units or container environments without
//! a config file.

use std::time::Duration;

use clap::Parser;

use crate::error::{PdnsError, Result};

/// Capacity of each shard's input queue. A full queue blocks the dispatcher,
/// which is the backpressure path from the sinks back to the capture handle.
pub const PACKET_QUEUE_DEPTH: usize = 500;

#[derive(Parser, Debug, Clone)]
#[command(name = "passivedns", version, about = "Passive DNS capture and correlation sensor")]
pub struct Config {
    /// Device to capture from (mutually exclusive with --pcap-file)
    #[arg(long = "dev", env = "PDNS_DEV", default_value = "")]
    pub device: String,

    /// Read packets from a capture file instead of a live device
    #[arg(long, env = "PDNS_PCAP_FILE", default_value = "")]
    pub pcap_file: String,

    /// BPF filter applied to the capture handle
    #[arg(long, env = "PDNS_BPF", default_value = "port 53")]
    pub bpf: String,

    /// Capture snapshot length
    #[arg(long, env = "PDNS_SNAPLEN", default_value_t = 4096)]
    pub snap_len: i32,

    /// Use the PF_RING live capture path
    #[arg(long, env = "PDNS_PFRING", default_value_t = false)]
    pub pfring: bool,

    /// Number of worker shards; must be a power of two
    #[arg(long, env = "PDNS_THREADS", default_value_t = 8)]
    pub num_procs: usize,

    /// Maximum age of an unmatched correlation entry, as a non-positive
    /// duration relative to now (e.g. "-1m")
    #[arg(long, env = "PDNS_GC_AGE", default_value = "-1m")]
    pub gc_age: String,

    /// How often the correlation table is swept
    #[arg(long, env = "PDNS_GC_INTERVAL", default_value = "3m")]
    pub gc_interval: String,

    /// Sensor name used in the fluentd tag and metric prefix
    /// (defaults to the host name)
    #[arg(long, env = "PDNS_NAME")]
    pub sensor_name: Option<String>,

    /// Write records to this file, with rotation
    #[arg(long, env = "PDNS_LOG_FILE", default_value = "")]
    pub log_file: String,

    /// Maximum age of a rotated log file, in days
    #[arg(long, env = "PDNS_LOG_AGE", default_value_t = 28)]
    pub log_max_age: u32,

    /// Number of rotated log files to keep
    #[arg(long, env = "PDNS_LOG_BACKUP", default_value_t = 3)]
    pub log_max_backups: usize,

    /// Size of the log file before rotation, in megabytes
    #[arg(long, env = "PDNS_LOG_SIZE", default_value_t = 100)]
    pub log_max_size: usize,

    /// Comma-separated Kafka broker list
    #[arg(long, env = "PDNS_KAFKA_PEERS", default_value = "")]
    pub kafka_brokers: String,

    /// Kafka topic for records
    #[arg(long, env = "PDNS_KAFKA_TOPIC", default_value = "")]
    pub kafka_topic: String,

    /// Syslog facility name (KERN, USER, ... LOCAL7); enables syslog output
    /// together with --syslog-priority
    #[arg(long, env = "PDNS_SYSLOG_FACILITY", default_value = "")]
    pub syslog_facility: String,

    /// Syslog priority name (EMERG ... DEBUG)
    #[arg(long, env = "PDNS_SYSLOG_PRIORITY", default_value = "")]
    pub syslog_priority: String,

    /// Path of a local fluentd forward socket
    #[arg(long, env = "PDNS_FLUENTD_SOCKET", default_value = "")]
    pub fluentd_socket: String,

    /// Suppress stdout output
    #[arg(long, env = "PDNS_QUIET", default_value_t = false)]
    pub quiet: bool,

    /// statsd host:port; enables metrics
    #[arg(long, env = "PDNS_STATSD_HOST", default_value = "")]
    pub statsd_host: String,

    /// Seconds between capture-handle statistics reports
    #[arg(long, env = "PDNS_STATSD_INTERVAL", default_value_t = 15)]
    pub statsd_interval: u64,

    /// Prefix for statsd metric names
    #[arg(long, env = "PDNS_STATSD_PREFIX", default_value = "pdns")]
    pub statsd_prefix: String,

    /// Write a CPU flamegraph to this path on shutdown
    #[arg(long, env = "PDNS_PROFILE_FILE", default_value = "")]
    pub cpuprofile: String,

    /// Enable debug logging
    #[arg(long, env = "PDNS_DEBUG", default_value_t = false)]
    pub debug: bool,
}

impl Config {
    /// Check everything that must be fatal before the pipeline starts.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() == self.pcap_file.is_empty() {
            return Err(PdnsError::Config(
                "specify either a capture device or a pcap file".into(),
            ));
        }
        if self.num_procs == 0 || !self.num_procs.is_power_of_two() {
            return Err(PdnsError::Config(format!(
                "num_procs must be a power of two, got {}",
                self.num_procs
            )));
        }
        if self.gc_age()?.num_nanoseconds().unwrap_or(0) > 0 {
            return Err(PdnsError::Config(format!(
                "gc_age must be non-positive, got {:?}",
                self.gc_age
            )));
        }
        if self.gc_interval()?.is_zero() {
            return Err(PdnsError::Config("gc_interval must be positive".into()));
        }
        if self.statsd_interval == 0 {
            return Err(PdnsError::Config("statsd_interval must be positive".into()));
        }
        Ok(())
    }

    /// Signed correlation-entry age cutoff ("-1m" means entries older than
    /// one minute are collected).
    pub fn gc_age(&self) -> Result<chrono::Duration> {
        parse_signed_duration(&self.gc_age)
    }

    pub fn gc_interval(&self) -> Result<Duration> {
        let d = parse_signed_duration(&self.gc_interval)?;
        d.to_std()
            .map_err(|_| PdnsError::Config(format!("gc_interval not positive: {}", self.gc_interval)))
    }

    /// Sensor identifier: configured name, else host name, else "UNKNOWN".
    pub fn resolved_sensor_name(&self) -> String {
        if let Some(name) = &self.sensor_name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }
}

/// Parse a possibly negative duration string of the form used by the
/// gc options: an optional sign followed by number+unit pairs, where the
/// unit is one of "ms", "s", "m", "h" (e.g. "-1m", "90s", "1h30m").
pub fn parse_signed_duration(s: &str) -> Result<chrono::Duration> {
    let err = || PdnsError::Config(format!("unparseable duration: {:?}", s));

    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest.is_empty() {
        return Err(err());
    }

    let mut total = Duration::ZERO;
    let mut chars = rest.char_indices().peekable();
    while let Some(&(start, _)) = chars.peek() {
        let mut end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_digit() {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let value: u64 = rest[start..end].parse().map_err(|_| err())?;

        let mut unit_end = end;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit_end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        total += match &rest[end..unit_end] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return Err(err()),
        };
    }

    let signed = chrono::Duration::from_std(total).map_err(|_| err())?;
    Ok(if negative { -signed } else { signed })
}
