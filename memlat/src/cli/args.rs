//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::domain::{CpuMask, EventSlot};
use crate::group::GroupConfig;
use crate::topology::parse_cpu_list;

#[derive(Parser, Debug)]
#[command(
    name = "memlat",
    about = "Sample per-core memory latency counters",
    after_help = "\
EXAMPLES:
    sudo memlat                                  Monitor every online CPU
    sudo memlat --cpus 0-3 --stall-cycle-ev 0x24 Big cluster with stall cycles
    memlat --synthetic --count 10 --export s.json Simulated counters, no root needed"
)]
pub struct Args {
    /// CPUs to monitor, e.g. 0-3,6 (default: all online CPUs)
    #[arg(long, value_name = "LIST", value_parser = parse_cpus)]
    pub cpus: Option<CpuMask>,

    /// Raw event id counting instructions
    #[arg(long, value_name = "ID", default_value = "0x08", value_parser = parse_event_id)]
    pub inst_ev: u32,

    /// Raw event id counting memory stalls (cache misses)
    #[arg(long, value_name = "ID", default_value = "0x17", value_parser = parse_event_id)]
    pub cachemiss_ev: u32,

    /// Raw event id counting stalled cycles (not monitored if omitted)
    #[arg(long, value_name = "ID", value_parser = parse_event_id)]
    pub stall_cycle_ev: Option<u32>,

    /// Raw event id counting cycles
    #[arg(long, value_name = "ID", default_value = "0x11", value_parser = parse_event_id)]
    pub cycle_ev: u32,

    /// Only count cycles (frequency monitor)
    #[arg(long)]
    pub compute: bool,

    /// Sampling interval in milliseconds
    #[arg(long, value_name = "MS", default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_ms: u64,

    /// Stop after N samples (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub count: u64,

    /// Export snapshots to a JSON file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Use simulated counters (no privileges needed)
    #[arg(long)]
    pub synthetic: bool,

    /// Suppress per-sample output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Group configuration for `cpus` from the event arguments
    #[must_use]
    pub fn group_config(&self, cpus: CpuMask) -> GroupConfig {
        let config = if self.compute { GroupConfig::compute(cpus) } else { GroupConfig::memory_latency(cpus) };

        let config = config
            .with_event(EventSlot::Instructions, self.inst_ev)
            .with_event(EventSlot::MemoryStalls, self.cachemiss_ev)
            .with_event(EventSlot::Cycles, self.cycle_ev);
        match self.stall_cycle_ev {
            Some(ev) => config.with_event(EventSlot::StallCycles, ev),
            None => config,
        }
    }
}

fn parse_cpus(s: &str) -> Result<CpuMask, String> {
    let mask = parse_cpu_list(s).map_err(|e| e.to_string())?;
    if mask.is_empty() {
        return Err("CPU list is empty".to_string());
    }
    Ok(mask)
}

/// Decimal or `0x`-prefixed hex
fn parse_event_id(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid event id {s:?}: {e}"))
}
