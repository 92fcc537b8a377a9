//! Pipeline wiring and lifecycle
//!
//! Spawns the shard workers, the correlation-table GC, the reassembly
//! re-route thread and the capture loop, watches for SIGINT/SIGTERM, and
//! runs the ordered drain on the way out:
//!
//! 1. the capture loop stops and drops its router;
//! 2. the re-route thread drains reassembly output into the shard queues
//!    for up to the drain cap, then drops the last router, closing the
//!    shard queues;
//! 3. workers exit on queue close and are joined;
//! 4. the GC task is stopped;
//! 5. the log pipeline is closed and given the drain cap to flush.

pub mod capture;
pub mod reassembly;
pub mod router;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::config::{Config, PACKET_QUEUE_DEPTH};
use crate::correlate::{self, ConnectionTable, Correlator};
use crate::error::{PdnsError, Result};
use crate::metrics::Metrics;
use crate::output::LogPipeline;

use capture::CaptureHandle;
use reassembly::StreamReassembler;
use router::Router;
use worker::ShardWorker;

/// Cap applied to each drain stage during shutdown. Anything still queued
/// past it is lost by design.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(6);

/// Join a thread, giving up after `limit`. Returns false if the thread was
/// abandoned.
pub(crate) fn join_timeout(handle: JoinHandle<()>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "thread {} did not stop within the drain cap",
                handle.thread().name().unwrap_or("<unnamed>")
            );
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
    let _ = handle.join();
    true
}

/// Run the whole pipeline until the capture source is exhausted or a signal
/// arrives, then drain and return.
pub fn run(config: &Config, handle: CaptureHandle, log: LogPipeline, metrics: Metrics) -> Result<()> {
    let gc_age = config.gc_age()?;
    let gc_interval = config.gc_interval()?;
    let level = config.syslog_priority.clone();

    let (router, shard_queues) = Router::new(config.num_procs, PACKET_QUEUE_DEPTH);
    let (reassembled_tx, reassembled_rx) = bounded(PACKET_QUEUE_DEPTH);
    let table = Arc::new(ConnectionTable::new());

    let (gc_stop_tx, gc_stop_rx) = bounded::<()>(1);
    let gc_handle = {
        let table = table.clone();
        let metrics = metrics.clone();
        thread::Builder::new()
            .name("conntable-gc".to_string())
            .spawn(move || correlate::run_gc(table, gc_age, gc_interval, metrics, gc_stop_rx))
            .expect("spawn gc thread")
    };

    let mut workers = Vec::with_capacity(config.num_procs);
    for (i, queue) in shard_queues.into_iter().enumerate() {
        debug!("starting packet processing shard {}", i);
        let worker = ShardWorker::new(
            i,
            queue,
            StreamReassembler::new(reassembled_tx.clone()),
            Correlator::new(table.clone(), log.sender(), metrics.clone(), level.clone()),
            metrics.clone(),
        );
        workers.push(
            thread::Builder::new()
                .name(format!("shard-{}", i))
                .spawn(move || worker.run())
                .expect("spawn shard thread"),
        );
    }
    // Workers hold their own clones; only they feed the reassembly channel.
    drop(reassembled_tx);

    let (drain_tx, drain_rx) = bounded::<()>(1);
    let reroute_handle = {
        let router = router.clone();
        let metrics = metrics.clone();
        thread::Builder::new()
            .name("tcp-reroute".to_string())
            .spawn(move || capture::run_reroute(reassembled_rx, router, metrics, drain_rx))
            .expect("spawn reroute thread")
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("caught signal, about to cleanly exit");
            shutdown.store(true, Ordering::Relaxed);
        })
        .map_err(|e| PdnsError::Config(format!("cannot install signal handler: {}", e)))?;
    }

    // The capture loop runs here; it owns the primary router clone and
    // drops it on return.
    capture::run_capture(
        handle,
        router,
        metrics.clone(),
        shutdown,
        Duration::from_secs(config.statsd_interval),
    );

    // The GC task stops together with the capture loop; the table needs no
    // more upkeep once the drain starts.
    let _ = gc_stop_tx.send(());

    let _ = drain_tx.send(());
    join_timeout(reroute_handle, DRAIN_LIMIT + Duration::from_secs(1));

    debug!("stopping packet processing...");
    for worker in workers {
        join_timeout(worker, DRAIN_LIMIT);
    }

    let _ = gc_handle.join();

    debug!("waiting for log pipeline to flush...");
    log.shutdown(DRAIN_LIMIT);

    Ok(())
}
