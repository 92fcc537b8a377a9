use anyhow::Result;
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use passivedns::config::{Config, PACKET_QUEUE_DEPTH};
use passivedns::engine::{self, capture::CaptureHandle};
use passivedns::metrics::Metrics;
use passivedns::output::{LogOptions, LogPipeline};

fn main() {
    let config = Config::parse();

    // Initialize logging
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run(&config) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<()> {
    config.validate()?;

    let profiler = if config.cpuprofile.is_empty() {
        None
    } else {
        Some(
            pprof::ProfilerGuardBuilder::default()
                .frequency(100)
                .build()?,
        )
    };

    let metrics = if config.statsd_host.is_empty() {
        Metrics::disabled()
    } else {
        Metrics::new(
            &config.statsd_host,
            &format!("{}.{}", config.statsd_prefix, config.resolved_sensor_name()),
        )?
    };

    let handle = CaptureHandle::open(config)?;

    let log_options = LogOptions::from_config(config);
    let log = LogPipeline::start(
        &log_options,
        PACKET_QUEUE_DEPTH * config.num_procs,
        metrics.clone(),
    )?;

    engine::run(config, handle, log, metrics)?;

    if let Some(profiler) = profiler {
        let report = profiler.report().build()?;
        let file = std::fs::File::create(&config.cpuprofile)?;
        report.flamegraph(file)?;
    }

    debug!("done, goodbye");
    Ok(())
}
