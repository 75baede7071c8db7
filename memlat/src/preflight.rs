//! Pre-flight checks for memlat
//!
//! Validates system requirements before opening hardware counters.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};

use crate::domain::CpuMask;

const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

/// Highest `perf_event_paranoid` level that still allows unprivileged
/// cpu-wide counters
const MAX_UNPRIVILEGED_PARANOID: i32 = 0;

/// Run all pre-flight checks before opening counters on `cpus`
pub fn run_preflight_checks(cpus: CpuMask, online: CpuMask) -> Result<()> {
    check_platform()?;
    check_privileges()?;
    check_cpus_online(cpus, online)?;
    Ok(())
}

fn check_platform() -> Result<()> {
    if cfg!(target_os = "linux") {
        return Ok(());
    }
    bail!(
        "Hardware counters are only supported on Linux.\n\n\
         Run with --synthetic to use simulated counters."
    );
}

/// Check if the counters can be opened with the current privileges
fn check_privileges() -> Result<()> {
    // Root may open cpu-wide counters whatever the paranoid level
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    let level = read_paranoid_level()?;
    check_paranoid_level(level)
}

fn read_paranoid_level() -> Result<i32> {
    let raw = std::fs::read_to_string(PARANOID_PATH)
        .with_context(|| format!("Failed to read {PARANOID_PATH}"))?;
    raw.trim().parse().with_context(|| format!("Unexpected content in {PARANOID_PATH}: {raw:?}"))
}

fn check_paranoid_level(level: i32) -> Result<()> {
    if level <= MAX_UNPRIVILEGED_PARANOID {
        return Ok(());
    }
    bail!(
        "Permission denied: cpu-wide counters need root or perf_event_paranoid <= {MAX_UNPRIVILEGED_PARANOID} \
         (current: {level}).\n\n\
         Run with: sudo memlat ...\n\
         or:       sudo sysctl kernel.perf_event_paranoid={MAX_UNPRIVILEGED_PARANOID}"
    );
}

/// Check that every requested core is online
pub fn check_cpus_online(cpus: CpuMask, online: CpuMask) -> Result<()> {
    let offline = cpus.difference(online);
    if !offline.is_empty() {
        bail!(
            "CPUs {offline} are not online.\n\n\
             Online CPUs: {online}"
        );
    }
    Ok(())
}
