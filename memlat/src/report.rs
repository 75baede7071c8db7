//! Headless reporting: per-sample tables and JSON export

// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use crate::domain::{CpuMask, EventIds, EventSlot, ExportError, Micros};
use crate::metrics::CoreStats;

/// The cores updated by one sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub seq: u64,
    /// Monitor clock at sample time
    pub timestamp_us: Micros,
    pub cores: Vec<CoreStats>,
}

/// Display one snapshot as a per-core table
///
/// `cpus` is the monitored set; cores missing from the snapshot are listed
/// as skipped.
pub fn display_snapshot(snapshot: &Snapshot, cpus: CpuMask) {
    print!("{}", format_snapshot(snapshot, cpus));
}

/// Render a snapshot the way [`display_snapshot`] prints it
#[must_use]
pub fn format_snapshot(snapshot: &Snapshot, cpus: CpuMask) -> String {
    let mut out = format!(
        "\n[SAMPLE {}] t={:.1}ms cores={}/{}\n",
        snapshot.seq,
        snapshot.timestamp_us.as_millis(),
        snapshot.cores.len(),
        cpus.len()
    );
    out.push_str("  cpu        inst      mem     freq  stall\n");
    for stats in &snapshot.cores {
        out.push_str(&format!(
            "  {:<6} {:>10} {:>8} {:>5}MHz {:>5}%\n",
            stats.cpu.to_string(),
            stats.inst_count,
            stats.mem_count,
            stats.freq,
            stats.stall_pct
        ));
    }

    let skipped = cpus.difference(snapshot.cores.iter().map(|s| s.cpu).collect());
    if !skipped.is_empty() {
        out.push_str(&format!("  skipped: {skipped}\n"));
    }
    out
}

/// Collects snapshots and writes them as one JSON document
pub struct SnapshotExporter {
    cpus: CpuMask,
    event_ids: EventIds,
    interval_ms: u64,
    snapshots: Vec<Snapshot>,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    version: &'static str,
    cpus: String,
    interval_ms: u64,
    /// Slot name to raw event code, monitored slots only
    events: BTreeMap<&'static str, String>,
    snapshots: &'a [Snapshot],
}

impl SnapshotExporter {
    #[must_use]
    pub fn new(cpus: CpuMask, event_ids: EventIds, interval_ms: u64) -> Self {
        Self { cpus, event_ids, interval_ms, snapshots: Vec::new() }
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Write every collected snapshot to `writer`
    ///
    /// # Errors
    /// Returns [`ExportError::Empty`] when nothing was collected, or the
    /// underlying serialization / I/O error.
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        if self.snapshots.is_empty() {
            return Err(ExportError::Empty);
        }

        let events = EventSlot::ALL
            .into_iter()
            .filter(|slot| self.event_ids.is_monitored(*slot))
            .map(|slot| (slot.name(), format!("0x{:x}", self.event_ids.get(slot))))
            .collect();

        let document = ExportDocument {
            version: env!("CARGO_PKG_VERSION"),
            cpus: self.cpus.to_string(),
            interval_ms: self.interval_ms,
            events,
            snapshots: &self.snapshots,
        };

        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
