//! # Derived Metrics
//!
//! Turns one core's raw counter deltas into the values a memory-latency
//! governor consumes:
//!
//! - **frequency**: cycles per microsecond since the core's previous sample
//!   (MHz). Each core keeps its own previous timestamp; elapsed time is
//!   floored to 1us.
//! - **stall percentage**: `100 * min(stall, cycles) / cycles` when the
//!   stall-cycle counter exists on the core, `100` when it does not. With
//!   the counter present and no cycles counted the result is `0`.

use serde::Serialize;

use crate::domain::{CpuId, EventSlot, Micros, NUM_EVENTS};

/// Per-core record handed to the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CoreStats {
    pub cpu: CpuId,
    pub inst_count: u64,
    pub mem_count: u64,
    /// Cycles per microsecond (MHz)
    pub freq: u64,
    /// 0..=100
    pub stall_pct: u32,
}

impl CoreStats {
    #[must_use]
    pub fn new(cpu: CpuId) -> Self {
        Self { cpu, ..Self::default() }
    }

    /// Zero every metric, keeping the core id
    pub fn clear(&mut self) {
        *self = Self::new(self.cpu);
    }
}

/// Frequency since `prev_ts`; moves `prev_ts` to `now`
pub fn compute_freq(prev_ts: &mut Micros, now: Micros, cyc_cnt: u64) -> u64 {
    let elapsed = now.elapsed_since(*prev_ts);
    *prev_ts = now;
    cyc_cnt / elapsed
}

/// Stall percentage; `stall_cnt` is `None` when no stall-cycle counter is
/// allocated on the core
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn stall_pct(stall_cnt: Option<u64>, cyc_cnt: u64) -> u32 {
    let Some(stall_cnt) = stall_cnt else {
        return 100;
    };
    if cyc_cnt == 0 {
        return 0;
    }
    // Stall counts can nominally exceed cycles through measurement skew
    let stall_cnt = stall_cnt.min(cyc_cnt);
    (u128::from(stall_cnt) * 100 / u128::from(cyc_cnt)) as u32
}

/// Fill `stats` from one sample's deltas
///
/// `has_stall_counter` tells whether the stall-cycle slot is allocated on
/// this core.
pub fn compute_core_stats(
    stats: &mut CoreStats,
    prev_ts: &mut Micros,
    now: Micros,
    counts: &[u64; NUM_EVENTS],
    has_stall_counter: bool,
) {
    let cyc_cnt = counts[EventSlot::Cycles.index()];

    stats.inst_count = counts[EventSlot::Instructions.index()];
    stats.mem_count = counts[EventSlot::MemoryStalls.index()];
    stats.freq = compute_freq(prev_ts, now, cyc_cnt);
    stats.stall_pct =
        stall_pct(has_stall_counter.then(|| counts[EventSlot::StallCycles.index()]), cyc_cnt);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stats_describe_cpu_0() {
        assert_eq!(CoreStats::default(), CoreStats::new(CpuId(0)));
        assert_eq!(CoreStats::new(CpuId(3)).cpu, CpuId(3));
    }

    #[test]
    fn test_freq_is_cycles_per_us() {
        let mut prev = Micros(1_000);
        assert_eq!(compute_freq(&mut prev, Micros(2_000), 2_000_000), 2_000);
        assert_eq!(prev, Micros(2_000));
    }

    #[test]
    fn test_freq_floors_elapsed_at_one_us() {
        let mut prev = Micros(500);
        assert_eq!(compute_freq(&mut prev, Micros(500), 1_234), 1_234);
        assert_eq!(compute_freq(&mut prev, Micros(500), 0), 0);
    }

    #[test]
    fn test_stall_pct_unconfigured_is_100() {
        assert_eq!(stall_pct(None, 0), 100);
        assert_eq!(stall_pct(None, 1_000), 100);
    }

    #[test]
    fn test_stall_pct_ratio_and_clamp() {
        assert_eq!(stall_pct(Some(100), 1_000), 10);
        assert_eq!(stall_pct(Some(3_000), 2_000), 100);
        assert_eq!(stall_pct(Some(0), 500), 0);
        assert_eq!(stall_pct(Some(1), 3), 33);
    }

    #[test]
    fn test_stall_pct_zero_cycles_is_0() {
        assert_eq!(stall_pct(Some(0), 0), 0);
        assert_eq!(stall_pct(Some(50), 0), 0);
    }

    #[test]
    fn test_stall_pct_large_counts_do_not_overflow() {
        assert_eq!(stall_pct(Some(u64::MAX / 2), u64::MAX), 49);
        assert_eq!(stall_pct(Some(u64::MAX), u64::MAX), 100);
    }

    #[test]
    fn test_stall_pct_stays_in_range() {
        for cyc in [0u64, 1, 7, 1_000, u64::MAX] {
            for stall in [0u64, 1, 7, 999, 1_000, 5_000, u64::MAX] {
                assert!(stall_pct(Some(stall), cyc) <= 100);
            }
        }
    }

    #[test]
    fn test_compute_core_stats() {
        let mut stats = CoreStats::new(CpuId(2));
        let mut prev = Micros(0);
        let counts = [4_000, 30, 1_000, 100];

        compute_core_stats(&mut stats, &mut prev, Micros(1_000), &counts, true);
        assert_eq!(
            stats,
            CoreStats { cpu: CpuId(2), inst_count: 4_000, mem_count: 30, freq: 1, stall_pct: 10 }
        );

        compute_core_stats(&mut stats, &mut prev, Micros(2_000), &counts, false);
        assert_eq!(stats.stall_pct, 100);

        stats.clear();
        assert_eq!(stats, CoreStats::new(CpuId(2)));
    }
}
