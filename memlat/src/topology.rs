//! Core topology view
//!
//! Which cores are online, which are tied up in a long-latency privileged
//! call, and a monotonic microsecond clock.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::warn;

use crate::domain::{CpuId, CpuMask, MonitorError};

const ONLINE_PATH: &str = "/sys/devices/system/cpu/online";

/// Core-topology provider consumed by the sampler
pub trait Topology: Send + Sync {
    /// Consistent snapshot of the online cores
    fn online(&self) -> CpuMask;

    /// True while `cpu` runs a call that can delay remote requests for
    /// tens of milliseconds
    fn in_long_latency_call(&self, cpu: CpuId) -> bool;

    /// Monotonic time in microseconds
    fn now_us(&self) -> u64;
}

/// Parse a kernel cpu list such as `"0-3"` or `"0-3,8-11"`.
///
/// # Errors
/// Returns [`MonitorError::InvalidConfig`] for malformed entries, reversed
/// ranges and cores that do not fit in a [`CpuMask`].
pub fn parse_cpu_list(list: &str) -> Result<CpuMask, MonitorError> {
    let invalid = |what: &str| MonitorError::InvalidConfig(format!("bad cpu list {list:?}: {what}"));
    let parse_cpu = |s: &str| -> Result<CpuId, MonitorError> {
        let cpu = CpuId(s.trim().parse().map_err(|_| invalid(s))?);
        if cpu.fits_mask() {
            Ok(cpu)
        } else {
            Err(invalid(&format!("{cpu} out of range")))
        }
    };

    let mut mask = CpuMask::EMPTY;
    for range in list.trim().split(',').filter(|r| !r.trim().is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let (start, end) = (parse_cpu(start)?, parse_cpu(end)?);
            if start > end {
                return Err(invalid(range));
            }
            for cpu in start.0..=end.0 {
                mask.insert(CpuId(cpu));
            }
        } else {
            // Single CPU like "5"
            mask.insert(parse_cpu(range)?);
        }
    }

    Ok(mask)
}

/// Read the online cpu list from sysfs
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn online_cpus() -> Result<CpuMask, MonitorError> {
    let content = fs::read_to_string(ONLINE_PATH)?;
    parse_cpu_list(&content)
}

/// Cores currently inside a long-latency call
///
/// Callers that issue such calls bracket them with
/// [`enter`](Self::enter)/[`exit`](Self::exit).
#[derive(Debug, Default)]
pub struct LongLatencyTracker(AtomicU64);

impl LongLatencyTracker {
    pub fn enter(&self, cpu: CpuId) {
        self.0.fetch_or(CpuMask::bit(cpu).0, Ordering::AcqRel);
    }

    pub fn exit(&self, cpu: CpuId) {
        self.0.fetch_and(!CpuMask::bit(cpu).0, Ordering::AcqRel);
    }

    #[must_use]
    pub fn contains(&self, cpu: CpuId) -> bool {
        CpuMask(self.0.load(Ordering::Acquire)).contains(cpu)
    }
}

/// Topology backed by `/sys/devices/system/cpu/online`
#[derive(Debug)]
pub struct SysfsTopology {
    last_online: AtomicU64,
    long_latency: LongLatencyTracker,
    epoch: Instant,
}

impl SysfsTopology {
    /// # Errors
    /// Returns an error if the online cpu list cannot be read
    pub fn new() -> Result<Self, MonitorError> {
        Ok(Self {
            last_online: AtomicU64::new(online_cpus()?.0),
            long_latency: LongLatencyTracker::default(),
            epoch: Instant::now(),
        })
    }

    #[must_use]
    pub fn long_latency(&self) -> &LongLatencyTracker {
        &self.long_latency
    }
}

impl Topology for SysfsTopology {
    fn online(&self) -> CpuMask {
        match online_cpus() {
            Ok(mask) => {
                self.last_online.store(mask.0, Ordering::Relaxed);
                mask
            }
            Err(e) => {
                warn!("Failed to refresh online cpus, using last known set: {e}");
                CpuMask(self.last_online.load(Ordering::Relaxed))
            }
        }
    }

    fn in_long_latency_call(&self, cpu: CpuId) -> bool {
        self.long_latency.contains(cpu)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

#[derive(Debug)]
enum Clock {
    Real(Instant),
    Manual(AtomicU64),
}

/// Caller-driven topology
///
/// Online set, long-latency cores and (optionally) the clock are all set
/// explicitly. Used for simulated groups and tests.
#[derive(Debug)]
pub struct ManualTopology {
    online: AtomicU64,
    long_latency: LongLatencyTracker,
    clock: Clock,
}

impl ManualTopology {
    /// Topology with the given online cores and a real monotonic clock
    #[must_use]
    pub fn new(online: CpuMask) -> Self {
        Self {
            online: AtomicU64::new(online.0),
            long_latency: LongLatencyTracker::default(),
            clock: Clock::Real(Instant::now()),
        }
    }

    /// Topology whose clock only moves through [`advance_us`](Self::advance_us)
    #[must_use]
    pub fn with_manual_clock(online: CpuMask, start_us: u64) -> Self {
        Self { clock: Clock::Manual(AtomicU64::new(start_us)), ..Self::new(online) }
    }

    pub fn set_online(&self, cpu: CpuId, online: bool) {
        if online {
            self.online.fetch_or(CpuMask::bit(cpu).0, Ordering::AcqRel);
        } else {
            self.online.fetch_and(!CpuMask::bit(cpu).0, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn long_latency(&self) -> &LongLatencyTracker {
        &self.long_latency
    }

    /// Move a manual clock forward (no-op on a real clock)
    pub fn advance_us(&self, us: u64) {
        if let Clock::Manual(now) = &self.clock {
            now.fetch_add(us, Ordering::AcqRel);
        }
    }
}

impl Topology for ManualTopology {
    fn online(&self) -> CpuMask {
        CpuMask(self.online.load(Ordering::Acquire))
    }

    fn in_long_latency_call(&self, cpu: CpuId) -> bool {
        self.long_latency.contains(cpu)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn now_us(&self) -> u64 {
        match &self.clock {
            Clock::Real(epoch) => epoch.elapsed().as_micros() as u64,
            Clock::Manual(now) => now.load(Ordering::Acquire),
        }
    }
}
