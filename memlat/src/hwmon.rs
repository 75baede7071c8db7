//! Surface consumed by a memory-latency governor
//!
//! A governor only needs to start and stop monitoring and to pull fresh
//! per-core metrics; it does not care how the counters are read.

use crate::counters::CounterProvider;
use crate::domain::{CpuMask, MonitorError};
use crate::group::CoreGroup;
use crate::metrics::CoreStats;

/// A hardware monitor feeding one set of cores
pub trait Hwmon: Send {
    /// Cores this monitor covers
    fn cpus(&self) -> CpuMask;

    /// # Errors
    /// Returns [`MonitorError::Allocation`] if a counter could not be set up
    fn start(&mut self) -> Result<(), MonitorError>;

    fn stop(&mut self);

    /// Refresh the metrics of every available core and return the updated
    /// records
    fn sample(&mut self) -> Vec<CoreStats>;

    /// Latest metrics of every core, updated or not
    fn core_stats(&self) -> &[CoreStats];
}

impl<P: CounterProvider> Hwmon for CoreGroup<P> {
    fn cpus(&self) -> CpuMask {
        CoreGroup::cpus(self)
    }

    fn start(&mut self) -> Result<(), MonitorError> {
        CoreGroup::start(self)
    }

    fn stop(&mut self) {
        CoreGroup::stop(self);
    }

    fn sample(&mut self) -> Vec<CoreStats> {
        CoreGroup::sample(self)
    }

    fn core_stats(&self) -> &[CoreStats] {
        CoreGroup::core_stats(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::counters::SyntheticCounters;
    use crate::dispatch::CpuExecutor;
    use crate::group::GroupConfig;
    use crate::topology::ManualTopology;

    #[test]
    fn test_group_behind_trait_object() {
        let cpus = CpuMask(0b11);
        let counters = Arc::new(SyntheticCounters::new(2_000));
        let topology = Arc::new(ManualTopology::with_manual_clock(cpus, 0));
        let group = CoreGroup::new(
            GroupConfig::compute(cpus),
            Arc::clone(&counters),
            Arc::clone(&topology) as _,
            Arc::new(CpuExecutor::spawn(cpus).unwrap()),
        )
        .unwrap();

        let mut hwmon: Box<dyn Hwmon> = Box::new(group);
        assert_eq!(hwmon.cpus(), cpus);
        hwmon.start().unwrap();
        assert_eq!(counters.live_counters(), 2);

        topology.advance_us(1_000);
        let stats = hwmon.sample();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.freq == 2 && s.inst_count == 0));
        assert_eq!(hwmon.core_stats(), stats.as_slice());

        hwmon.stop();
        assert_eq!(counters.live_counters(), 0);
    }
}
