//! # idlescope - Main Entry Point
//!
//! Runs the measurement on a blocking thread while the async side waits for
//! completion or Ctrl+C. Committed rounds stream to a printer thread.

// Output formatting converts counters to floats for display
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use idlescope_common::{RoundRecord, MAX_NUMBER_OF_MEASUREMENTS};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use idlescope::cli::Args;
use idlescope::config::MeasurementConfig;
use idlescope::domain::{ConfigError, MeasureError, Nanos, ProviderError};
use idlescope::export::{write_attribute_tree, JsonExporter};
use idlescope::measure::Orchestrator;
use idlescope::platform::online_cpus;
use idlescope::preflight::run_preflight_checks;
use idlescope::provider::select_provider;
use idlescope::results::{ChannelSink, LogSink, RoundSink};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let is_config = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<MeasureError>(),
                Some(MeasureError::Config(_) | MeasureError::Provider(ProviderError::Config(_)))
            )
    });
    if is_config {
        return EXIT_USAGE;
    }

    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn build_config(args: &Args) -> Result<MeasurementConfig> {
    let mut cpus = online_cpus().context("Failed to enumerate online CPUs")?;
    if let Some(requested) = args.cores {
        if requested > cpus.len() {
            return Err(ConfigError::TooManyCores { requested, available: cpus.len() }.into());
        }
        cpus.truncate(requested);
    }
    Ok(MeasurementConfig::build(args.config_input(cpus))?)
}

/// Print one line per committed round until the sender goes away
fn print_rounds(rx: &Receiver<RoundRecord>) {
    for record in rx {
        let energy = record
            .global
            .energy_uj
            .map_or_else(|| "-".to_string(), |uj| format!("{:.3}mJ", uj as f64 / 1000.0));
        let sleepers: Vec<&_> = record.cores.iter().filter(|c| c.mechanism != "POLL").collect();
        let mean_latency = if sleepers.is_empty() {
            0
        } else {
            sleepers.iter().map(|c| c.wakeup_latency_ns).sum::<u64>() / sleepers.len() as u64
        };
        let marker = if record.valid { "" } else { "  INVALID" };
        println!(
            "round {:>4}: {}  energy {}  wakeup {}  redos {}{}",
            record.index,
            Nanos(record.global.duration_ns),
            energy,
            Nanos(mean_latency),
            record.redos(),
            marker
        );
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let cfg = build_config(&args)?;

    // Run pre-flight checks before touching any register
    run_preflight_checks(args.provider, &cfg)?;

    let provider = select_provider(args.provider).context("Failed to initialize counter provider")?;
    let provider_name = provider.name();

    if !quiet {
        println!("idlescope v{}", env!("CARGO_PKG_VERSION"));
        println!("provider: {provider_name}");
        println!(
            "cores: {} ({} sleeping, selection {})",
            cfg.core_count(),
            cfg.idle_cores(),
            cfg.cpu_selection()
        );
        println!(
            "rounds: {} x {} using {}",
            cfg.measurement_count(),
            Nanos::from(cfg.target_duration()),
            cfg.requested_mechanism()
        );
    }

    let mut orchestrator = Orchestrator::new(cfg, provider);

    // Printer thread fed by committed rounds; quiet runs only log
    let mut sink: Box<dyn RoundSink + Send> = Box::new(LogSink);
    let mut printer = None;
    if !quiet {
        let (tx, rx) = bounded(MAX_NUMBER_OF_MEASUREMENTS);
        printer = Some(std::thread::spawn(move || print_rounds(&rx)));
        sink = Box::new(ChannelSink::new(tx));
    }

    // Ctrl+C stops the run after the round in progress
    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c_cancel = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, finishing the current round...");
            ctrl_c_cancel.store(true, Ordering::Relaxed);
        }
    });

    let (orchestrator, result) = tokio::task::spawn_blocking(move || {
        let result = orchestrator.run_all(sink.as_mut(), &cancel);
        // Dropping the sink closes the channel and ends the printer
        drop(sink);
        (orchestrator, result)
    })
    .await
    .context("Measurement task failed")?;

    if let Some(handle) = printer {
        handle.join().ok();
    }

    let series = result?;
    let cancelled = !series.is_complete();
    let invalid = series.invalid_rounds();
    let redos: u32 = series.iter().map(RoundRecord::redos).sum();
    if invalid > 0 {
        warn!("{invalid} round(s) accepted without a valid measurement");
    }
    info!("{} rounds, {redos} redos, {invalid} invalid", series.len());

    if !quiet {
        eprintln!("\ndone: {} rounds, {redos} redos, {invalid} invalid", series.len());
    }

    if let Some(ref path) = args.export {
        JsonExporter::new(provider_name, orchestrator.config(), &series)
            .export(path)
            .context("Failed to export results")?;
        if !quiet {
            println!("saved: {}", path.display());
        }
    }

    if let Some(ref dir) = args.export_dir {
        let root = write_attribute_tree(dir, &series).context("Failed to write attribute tree")?;
        if !quiet {
            println!("saved: {}", root.display());
        }
    }

    // Rounds finished before Ctrl+C are exported above, the run still fails
    if cancelled {
        return Err(MeasureError::Cancelled {
            completed: series.len(),
            requested: series.capacity(),
        }
        .into());
    }

    Ok(())
}
