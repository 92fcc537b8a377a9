//! statsd metrics
//!
//! Thin wrapper around a cadence client so call sites can count
//! unconditionally; everything is a no-op when no statsd host is configured,
//! and all emission is best-effort.

use std::net::UdpSocket;
use std::sync::Arc;

use cadence::{Counted, CountedExt, Gauged, StatsdClient, UdpMetricSink};

use crate::error::{PdnsError, Result};

#[derive(Clone, Default)]
pub struct Metrics {
    client: Option<Arc<StatsdClient>>,
}

impl Metrics {
    /// Metrics that go nowhere.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// Connect a UDP statsd client. `prefix` should already carry the
    /// sensor name (e.g. "pdns.sensor01").
    pub fn new(host: &str, prefix: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from(host, socket)
            .map_err(|e| PdnsError::Sink(format!("statsd sink: {}", e)))?;
        Ok(Self {
            client: Some(Arc::new(StatsdClient::from_sink(prefix, sink))),
        })
    }

    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn incr(&self, key: &str) {
        if let Some(client) = &self.client {
            let _ = client.incr(key);
        }
    }

    pub fn count(&self, key: &str, value: i64) {
        if let Some(client) = &self.client {
            let _ = client.count(key, value);
        }
    }

    pub fn gauge(&self, key: &str, value: u64) {
        if let Some(client) = &self.client {
            let _ = client.gauge(key, value);
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_are_noops() {
        let metrics = Metrics::disabled();
        assert!(!metrics.enabled());
        metrics.incr("packets");
        metrics.count("packets", 10);
        metrics.gauge("depth", 3);
    }

    #[test]
    fn test_udp_client() {
        let metrics = Metrics::new("127.0.0.1:8125", "pdns.test").unwrap();
        assert!(metrics.enabled());
        metrics.incr("packets");
    }
}
