//! # memlat - Main Entry Point
//!
//! Samples a core group every `--interval-ms` and prints one table per
//! sample, either from the hardware PMU (`perf_event_open`) or from simulated
//! counters (`--synthetic`). Snapshots can be exported as JSON.

// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use memlat::cli::Args;
use memlat::counters::{CounterProvider, SyntheticCounters};
use memlat::dispatch::CpuExecutor;
use memlat::domain::{CpuId, CpuMask, EventSlot, Micros, MonitorError};
use memlat::preflight::{check_cpus_online, run_preflight_checks};
use memlat::report::{display_snapshot, Snapshot, SnapshotExporter};
use memlat::topology::{ManualTopology, SysfsTopology, Topology};
use memlat::workqueue::{DeferredQueue, WorkEvent};
use memlat::{CoreGroup, Hwmon};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Simulated core clock, MHz
const SYNTHETIC_MHZ: u64 = 1_800;

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
    if matches!(err.downcast_ref::<MonitorError>(), Some(MonitorError::InvalidConfig(_))) {
        return EXIT_USAGE;
    }
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    if args.synthetic {
        let online = available_cpus();
        let cpus = args.cpus.unwrap_or(online);
        check_cpus_online(cpus, online)?;

        let counters = Arc::new(synthetic_counters(cpus, args.interval_ms, args.stall_cycle_ev));
        let topology = Arc::new(ManualTopology::new(online));
        return monitor(&args, cpus, counters, topology).await;
    }

    #[cfg(target_os = "linux")]
    {
        let topology = Arc::new(SysfsTopology::new().context("Failed to read online CPUs")?);
        let online = topology.online();
        let cpus = args.cpus.unwrap_or(online);
        run_preflight_checks(cpus, online)?;

        let counters = Arc::new(memlat::counters::PerfCounters::new());
        monitor(&args, cpus, counters, topology).await
    }

    #[cfg(not(target_os = "linux"))]
    {
        run_preflight_checks(CpuMask::EMPTY, CpuMask::EMPTY)
    }
}

/// Cores the synthetic mode pretends are online
fn available_cpus() -> CpuMask {
    let count = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    CpuMask::from_cpus((0..count.min(memlat_common::MAX_CPUS)).filter_map(|c| u32::try_from(c).ok().map(CpuId)))
}

/// Counters stepping like a `SYNTHETIC_MHZ` core, stalling more on higher
/// core ids
fn synthetic_counters(cpus: CpuMask, interval_ms: u64, stall_ev: Option<u32>) -> SyntheticCounters {
    let cycles = SYNTHETIC_MHZ * interval_ms * 1_000;
    let counters = SyntheticCounters::new(cycles);

    for cpu in cpus {
        let stall_pct = 10 + u64::from(cpu.0 % 8) * 10;
        counters.set_step(memlat_common::INST_EV, cpu, cycles * 6 / 5);
        counters.set_step(memlat_common::L2DM_EV, cpu, cycles / 200 * (1 + u64::from(cpu.0 % 4)));
        if let Some(ev) = stall_ev {
            counters.set_step(ev, cpu, cycles * stall_pct / 100);
        }
    }
    counters
}

async fn monitor<P: CounterProvider>(
    args: &Args,
    cpus: CpuMask,
    counters: Arc<P>,
    topology: Arc<dyn Topology>,
) -> Result<()> {
    let quiet = args.quiet;
    let config = args.group_config(cpus);
    let event_ids = config.effective_event_ids();

    if !quiet {
        println!("memlat v{}", env!("CARGO_PKG_VERSION"));
        println!("cpus: {cpus}");
        println!("counters: {}", if args.synthetic { "synthetic" } else { "perf" });
        for slot in EventSlot::ALL.into_iter().filter(|s| event_ids.is_monitored(*s)) {
            println!("  {}: 0x{:x}", slot.name(), event_ids.get(slot));
        }
        println!("interval: {}ms", args.interval_ms);
    }

    let executor = Arc::new(CpuExecutor::spawn(cpus).context("Failed to spawn per-CPU workers")?);
    let mut group: Box<dyn Hwmon> =
        Box::new(CoreGroup::new(config, counters, Arc::clone(&topology), executor)?);
    group.start().context("Failed to start counters")?;

    // Reports run off the sampling path; a report still pending when the
    // next sample lands is coalesced into showing the newest one
    let latest: Arc<Mutex<Option<Snapshot>>> = Arc::new(Mutex::new(None));
    let report_queue = DeferredQueue::spawn("memlat-report").context("Failed to spawn report queue")?;
    let report_event = {
        let latest = Arc::clone(&latest);
        WorkEvent::new(move |_| {
            let snapshot = latest.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(snapshot) = snapshot {
                display_snapshot(&snapshot, cpus);
            }
        })
    };

    let mut exporter = args.export.as_ref().map(|_| SnapshotExporter::new(cpus, event_ids, args.interval_ms));
    if !quiet {
        if let Some(ref export_path) = args.export {
            println!("export: {}", export_path.display());
        }
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interval = Duration::from_millis(args.interval_ms);
    let monitoring_start = Instant::now();
    let mut exit_reason = "interrupted";
    let mut samples: u64 = 0;
    let mut skipped_cores: usize = 0;
    let mut coalesced_reports: u64 = 0;

    info!("Monitoring {cpus} every {}ms", args.interval_ms);

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }

        samples += 1;
        let cores = group.sample();
        skipped_cores += cpus.len() - cores.len();
        let snapshot = Snapshot { seq: samples, timestamp_us: Micros(topology.now_us()), cores };

        if let Some(exporter) = exporter.as_mut() {
            exporter.push(snapshot.clone());
        }
        if !quiet {
            *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
            if !report_queue.enqueue(&report_event) {
                coalesced_reports += 1;
            }
        }

        if args.count > 0 && samples >= args.count {
            exit_reason = "sample count reached";
            break;
        }
    }

    group.stop();
    drop(group);
    // Runs the last pending report before returning
    drop(report_queue);

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} samples ({} cores skipped, {} reports coalesced)",
            exit_reason,
            monitoring_start.elapsed().as_secs_f64(),
            samples,
            skipped_cores,
            coalesced_reports
        );
    }
    if skipped_cores > 0 {
        warn!("{skipped_cores} core samples were skipped (offline, busy or dispatch failure)");
    }

    if let (Some(exporter), Some(export_path)) = (exporter, args.export.as_ref()) {
        let file = File::create(export_path).context("Failed to create export file")?;
        let writer = BufWriter::new(file);
        exporter.export(writer).context("Failed to export snapshots")?;

        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}
