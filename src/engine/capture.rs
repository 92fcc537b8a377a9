//! Packet capture
//!
//! Opens a live device (plain libpcap or the PF_RING path) or an offline
//! capture file, applies the BPF filter, and runs the capture loop: decode
//! the outer IP layer of each frame just enough to compute the flow hash,
//! copy the frame out of the reusable capture buffer, and dispatch it to its
//! shard. Live reads use a timeout so the loop can observe shutdown and
//! report handle statistics.
//!
//! Reassembled TCP payloads re-enter through `run_reroute`, which consumes
//! the shared reassembly channel and dispatches through the same router.
//! Keeping that on its own thread breaks the worker -> reassembler ->
//! router -> worker cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver};
use etherparse::SlicedPacket;
use pcap::{Active, Capture, Offline};
use tracing::{debug, info};

use crate::config::Config;
use crate::core::flow::NetFlow;
use crate::core::frame::{Frame, ReassembledPayload};
use crate::core::parser;
use crate::engine::router::Router;
use crate::engine::DRAIN_LIMIT;
use crate::error::Result;
use crate::metrics::Metrics;

/// Read timeout for live captures, so shutdown is noticed promptly.
const READ_TIMEOUT_MS: i32 = 500;

pub enum CaptureHandle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

impl CaptureHandle {
    /// Open the configured capture source and apply the BPF filter.
    /// Any failure here is fatal.
    pub fn open(config: &Config) -> Result<Self> {
        if !config.device.is_empty() {
            if config.pfring {
                debug!("PF_RING capture path selected for {}", config.device);
            }
            let mut capture = Capture::from_device(config.device.as_str())?
                .snaplen(config.snap_len)
                .promisc(true)
                .timeout(READ_TIMEOUT_MS)
                .open()?;
            capture.filter(&config.bpf, true)?;
            Ok(Self::Live(capture))
        } else {
            let mut capture = Capture::from_file(&config.pcap_file)?;
            capture.filter(&config.bpf, true)?;
            Ok(Self::Offline(capture))
        }
    }

    fn next_packet(&mut self) -> std::result::Result<pcap::Packet<'_>, pcap::Error> {
        match self {
            Self::Live(capture) => capture.next_packet(),
            Self::Offline(capture) => capture.next_packet(),
        }
    }

    fn report_stats(&mut self, metrics: &Metrics) {
        let Self::Live(capture) = self else {
            return;
        };
        match capture.stats() {
            Ok(stats) => {
                info!(
                    "statistics received: {}, dropped: {}, interface dropped {}",
                    stats.received, stats.dropped, stats.if_dropped
                );
                metrics.count("packets_received", stats.received as i64);
                metrics.count("packets_dropped", stats.dropped as i64);
                metrics.count("packets_ifdropped", stats.if_dropped as i64);
            }
            Err(e) => debug!("error getting handle stats: {}", e),
        }
    }
}

/// The capture loop. Runs until the source is exhausted (offline) or the
/// shutdown flag is raised (live).
pub fn run_capture(
    mut handle: CaptureHandle,
    router: Router,
    metrics: Metrics,
    shutdown: Arc<AtomicBool>,
    stats_interval: Duration,
) {
    let mut last_stats = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("capture loop cleanly exiting");
            break;
        }

        match handle.next_packet() {
            Ok(packet) => {
                let timestamp = packet_time(&packet);
                let caplen = packet.header.caplen as usize;

                // Only the outer layers are decoded here; the shard does
                // the rest. The capture buffer is reused, so the frame
                // copies its bytes now.
                let Ok(sliced) = SlicedPacket::from_ethernet(packet.data) else {
                    debug!("frame failed to decode, skipping");
                    continue;
                };
                let Some(ip) = parser::parse_ip(&sliced) else {
                    debug!("frame without an IP layer, skipping");
                    continue;
                };

                let flow = NetFlow::new(ip.src_ip, ip.dst_ip);
                let frame = Frame::raw(packet.data.to_vec(), timestamp, caplen);
                if !router.dispatch(&flow, frame) {
                    return;
                }
                metrics.incr(if ip.is_ipv6 { "packets_v6" } else { "packets" });
            }
            Err(pcap::Error::TimeoutExpired) => {}
            Err(pcap::Error::NoMorePackets) => {
                debug!("packet source exhausted");
                break;
            }
            Err(e) => {
                debug!("capture read failed: {}", e);
                break;
            }
        }

        if last_stats.elapsed() >= stats_interval {
            handle.report_stats(&metrics);
            last_stats = Instant::now();
        }
    }
}

fn packet_time(packet: &pcap::Packet<'_>) -> DateTime<Utc> {
    let ts = packet.header.ts;
    DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32).saturating_mul(1000))
        .unwrap_or_else(Utc::now)
}

/// Consume reassembled payloads and send them back through the router so
/// both legs of a flow keep the same owner. After the drain signal, keeps
/// re-routing for up to the drain cap, then exits; dropping its router
/// clone is what lets the shard queues close.
pub fn run_reroute(
    rx: Receiver<ReassembledPayload>,
    router: Router,
    metrics: Metrics,
    drain: Receiver<()>,
) {
    loop {
        select! {
            recv(rx) -> payload => {
                let Ok(payload) = payload else { return };
                if !dispatch_payload(&router, &metrics, payload) {
                    return;
                }
            }
            recv(drain) -> _ => break,
        }
    }

    debug!("draining TCP data...");
    let deadline = Instant::now() + DRAIN_LIMIT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(payload) => {
                if !dispatch_payload(&router, &metrics, payload) {
                    return;
                }
            }
            Err(_) => break,
        }
    }
}

fn dispatch_payload(router: &Router, metrics: &Metrics, payload: ReassembledPayload) -> bool {
    let flow = payload.flow;
    if router.dispatch(&flow, Frame::reassembled(payload)) {
        metrics.incr("reassembled_tcp");
        true
    } else {
        false
    }
}
