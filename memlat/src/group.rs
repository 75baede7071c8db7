//! # Core Groups
//!
//! A [`CoreGroup`] is a fixed set of cores sampled together. It owns:
//!
//! - the event slot registry: which raw event backs each slot, and which
//!   slots are readable from any core
//! - one counter state per member core (counter handles and the previous
//!   raw count of each slot)
//! - one [`CoreStats`] record and previous-sample timestamp per member core
//!
//! The collaborators (counter provider, topology, dispatcher) are passed in
//! explicitly and shared through `Arc`.
//!
//! `start`/`stop` manage the counters; sampling lives in
//! [`sampler`](crate::sampler).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::{info, warn};
use memlat_common::{INST_EV, L2DM_EV};

use crate::counters::{CounterProvider, ReadScope};
use crate::dispatch::Dispatcher;
use crate::domain::{CounterError, CpuId, CpuMask, EventIds, EventSlot, Micros, MonitorError, NUM_EVENTS};
use crate::metrics::CoreStats;
use crate::topology::Topology;

/// Flavour of monitor a group feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorKind {
    /// Instructions, memory stalls, cycles and optional stall cycles
    #[default]
    MemoryLatency,
    /// Cycles only
    Compute,
}

/// Caller-owned description of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub cpus: CpuMask,
    pub event_ids: EventIds,
    pub kind: MonitorKind,
}

impl GroupConfig {
    /// Memory-latency group with the default event codes and no stall-cycle
    /// event
    #[must_use]
    pub fn memory_latency(cpus: CpuMask) -> Self {
        Self {
            cpus,
            event_ids: EventIds::memory_latency(INST_EV, L2DM_EV, None),
            kind: MonitorKind::MemoryLatency,
        }
    }

    #[must_use]
    pub fn compute(cpus: CpuMask) -> Self {
        Self { cpus, event_ids: EventIds::compute(), kind: MonitorKind::Compute }
    }

    #[must_use]
    pub fn with_event(mut self, slot: EventSlot, event_id: u32) -> Self {
        self.event_ids.set(slot, event_id);
        self
    }

    /// Event ids actually allocated: a compute group only counts cycles
    #[must_use]
    pub fn effective_event_ids(&self) -> EventIds {
        match self.kind {
            MonitorKind::MemoryLatency => self.event_ids,
            MonitorKind::Compute => {
                let mut ids = EventIds::default();
                ids.set(EventSlot::Cycles, self.event_ids.get(EventSlot::Cycles));
                ids
            }
        }
    }

    /// # Errors
    /// Returns [`MonitorError::InvalidConfig`] for an empty core set or a
    /// missing cycle event. Core ids are bounded by [`CpuMask`] itself.
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.cpus.is_empty() {
            return Err(MonitorError::InvalidConfig("CPU list is empty".into()));
        }
        if !self.event_ids.is_monitored(EventSlot::Cycles) {
            return Err(MonitorError::InvalidConfig("cycle event is required".into()));
        }
        Ok(())
    }
}

/// One slot's counter on one core
pub(crate) struct EventData<H> {
    pub(crate) counter: Option<H>,
    pub(crate) prev_count: AtomicU64,
}

impl<H> EventData<H> {
    fn empty() -> Self {
        Self { counter: None, prev_count: AtomicU64::new(0) }
    }
}

/// Counter state of one member core
pub(crate) struct CpuCounters<H> {
    pub(crate) cpu: CpuId,
    pub(crate) events: [EventData<H>; NUM_EVENTS],
}

impl<H> CpuCounters<H> {
    pub(crate) fn has_counter(&self, slot: EventSlot) -> bool {
        self.events[slot.index()].counter.is_some()
    }
}

/// Counter state of every member core, in ascending core order
pub(crate) struct GroupCounters<H> {
    pub(crate) cpus: Vec<CpuCounters<H>>,
}

impl<H> GroupCounters<H> {
    pub(crate) fn empty(members: CpuMask) -> Self {
        Self {
            cpus: members
                .iter()
                .map(|cpu| CpuCounters { cpu, events: std::array::from_fn(|_| EventData::empty()) })
                .collect(),
        }
    }

    pub(crate) fn get(&self, cpu: CpuId) -> Option<&CpuCounters<H>> {
        self.cpus.binary_search_by_key(&cpu, |c| c.cpu).ok().map(|i| &self.cpus[i])
    }

    fn allocated(&self) -> usize {
        self.cpus.iter().flat_map(|c| &c.events).filter(|e| e.counter.is_some()).count()
    }
}

/// A set of cores sampled together
pub struct CoreGroup<P: CounterProvider> {
    pub(crate) config: GroupConfig,
    pub(crate) provider: Arc<P>,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) counters: Arc<GroupCounters<P::Handle>>,
    /// Slots whose counters can be read from any core
    pub(crate) any_cpu_ev_mask: u8,
    pub(crate) prev_ts: Vec<Micros>,
    pub(crate) core_stats: Vec<CoreStats>,
}

impl<P: CounterProvider> CoreGroup<P> {
    /// # Errors
    /// Returns [`MonitorError::InvalidConfig`] if `config` does not validate
    pub fn new(
        config: GroupConfig,
        provider: Arc<P>,
        topology: Arc<dyn Topology>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let members = config.cpus;

        Ok(Self {
            counters: Arc::new(GroupCounters::empty(members)),
            any_cpu_ev_mask: 0,
            prev_ts: vec![Micros::default(); members.len()],
            core_stats: members.iter().map(CoreStats::new).collect(),
            config,
            provider,
            topology,
            dispatcher,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    #[must_use]
    pub fn cpus(&self) -> CpuMask {
        self.config.cpus
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Latest metrics of every member core, in ascending core order
    ///
    /// Cores skipped by a sample keep the values of their last update.
    #[must_use]
    pub fn core_stats(&self) -> &[CoreStats] {
        &self.core_stats
    }

    /// Slots classified as readable from any core
    #[must_use]
    pub fn any_cpu_slots(&self) -> Vec<EventSlot> {
        EventSlot::ALL.into_iter().filter(|s| self.any_cpu_ev_mask & s.bit() != 0).collect()
    }

    /// Number of counters currently allocated
    #[must_use]
    pub fn allocated_counters(&self) -> usize {
        self.counters.allocated()
    }

    /// Position of `cpu` in the per-core vectors
    pub(crate) fn position(&self, cpu: CpuId) -> Option<usize> {
        self.config.cpus.contains(cpu).then(|| self.config.cpus.iter().take_while(|c| *c != cpu).count())
    }

    /// Allocate and enable the counters of every member core
    ///
    /// Counters allocated before a failure stay allocated until
    /// [`stop`](Self::stop).
    ///
    /// # Errors
    /// Returns [`MonitorError::Allocation`] naming the first core and slot
    /// whose counter could not be created or enabled.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        self.release_counters();

        let ids = self.config.effective_event_ids();
        let mut counters = GroupCounters::empty(self.config.cpus);
        let mut result = Ok(());

        'cpus: for cpu_counters in &mut counters.cpus {
            let cpu = cpu_counters.cpu;
            for slot in EventSlot::ALL {
                let event_id = ids.get(slot);
                if event_id == 0 {
                    continue;
                }

                match self.allocate(event_id, cpu) {
                    Ok((handle, scope)) => {
                        if scope == ReadScope::AnyCpu {
                            self.any_cpu_ev_mask |= slot.bit();
                        }
                        cpu_counters.events[slot.index()].counter = Some(handle);
                    }
                    Err(source) => {
                        warn!("Perf event init failed on {cpu}");
                        result = Err(MonitorError::Allocation { cpu, slot, event_id, source });
                        break 'cpus;
                    }
                }
            }
        }

        self.counters = Arc::new(counters);
        if result.is_ok() {
            info!(
                "✓ Started group {} ({} counters, any-cpu slots: {:?})",
                self.config.cpus,
                self.counters.allocated(),
                self.any_cpu_slots()
            );
        }
        result
    }

    fn allocate(&self, event_id: u32, cpu: CpuId) -> Result<(P::Handle, ReadScope), CounterError> {
        let handle = self.provider.create(event_id, cpu)?;
        if let Err(e) = self.provider.enable(&handle) {
            self.provider.release(handle);
            return Err(e);
        }
        let scope = self.provider.read_scope(&handle);
        Ok((handle, scope))
    }

    /// Release every counter and zero all per-core state and metrics
    ///
    /// Safe to call repeatedly.
    pub fn stop(&mut self) {
        let released = self.release_counters();
        for stats in &mut self.core_stats {
            stats.clear();
        }
        self.prev_ts.fill(Micros::default());

        if released > 0 {
            info!("✓ Stopped group {} ({released} counters released)", self.config.cpus);
        }
    }

    fn release_counters(&mut self) -> usize {
        let counters =
            std::mem::replace(&mut self.counters, Arc::new(GroupCounters::empty(self.config.cpus)));
        self.any_cpu_ev_mask = 0;

        match Arc::try_unwrap(counters) {
            Ok(counters) => {
                let mut released = 0;
                for cpu_counters in counters.cpus {
                    for event in cpu_counters.events {
                        if let Some(handle) = event.counter {
                            self.provider.release(handle);
                            released += 1;
                        }
                    }
                }
                released
            }
            Err(_) => {
                warn!("Counters of group {} still referenced, dropping without release", self.config.cpus);
                0
            }
        }
    }
}

impl<P: CounterProvider> Drop for CoreGroup<P> {
    fn drop(&mut self) {
        self.release_counters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::SyntheticCounters;
    use crate::dispatch::CpuExecutor;
    use crate::topology::ManualTopology;
    use memlat_common::CYC_EV;

    fn group(config: GroupConfig, counters: &Arc<SyntheticCounters>) -> CoreGroup<SyntheticCounters> {
        let cpus = config.cpus;
        CoreGroup::new(
            config,
            Arc::clone(counters),
            Arc::new(ManualTopology::new(cpus)),
            Arc::new(CpuExecutor::spawn(cpus).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(GroupConfig::memory_latency(CpuMask::EMPTY).validate().is_err());
        assert!(GroupConfig::memory_latency(CpuMask(0b11)).validate().is_ok());
        assert!(GroupConfig::memory_latency(CpuMask(0b11))
            .with_event(EventSlot::Cycles, 0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_compute_group_only_allocates_cycles() {
        let config = GroupConfig::compute(CpuMask(0b11)).with_event(EventSlot::Instructions, 0x08);
        assert_eq!(config.effective_event_ids(), EventIds::compute());

        let counters = Arc::new(SyntheticCounters::new(100));
        let mut group = group(config, &counters);
        group.start().unwrap();
        assert_eq!(group.allocated_counters(), 2);
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let counters = Arc::new(SyntheticCounters::new(100));
        let config = GroupConfig::memory_latency(CpuMask(0b111)).with_event(EventSlot::StallCycles, 0x24);
        let mut group = group(config, &counters);

        group.start().unwrap();
        assert_eq!(group.allocated_counters(), 12);
        assert_eq!(counters.live_counters(), 12);
        assert!(group.any_cpu_slots().is_empty());

        group.stop();
        assert_eq!(group.allocated_counters(), 0);
        assert_eq!(counters.live_counters(), 0);

        // stop is idempotent
        group.stop();
        assert_eq!(counters.live_counters(), 0);
    }

    #[test]
    fn test_start_failure_reports_core_and_slot() {
        let counters = Arc::new(SyntheticCounters::new(100));
        counters.fail_create(L2DM_EV, CpuId(1));
        let mut group = group(GroupConfig::memory_latency(CpuMask(0b111)), &counters);

        let err = group.start().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Allocation { cpu: CpuId(1), slot: EventSlot::MemoryStalls, event_id: L2DM_EV, .. }
        ));

        // Core 0 fully, core 1 up to the failing slot
        assert_eq!(counters.live_counters(), 4);
        group.stop();
        assert_eq!(counters.live_counters(), 0);
    }

    #[test]
    fn test_any_cpu_classification() {
        let counters = Arc::new(SyntheticCounters::new(100));
        counters.set_any_cpu(CYC_EV);
        let mut group = group(GroupConfig::memory_latency(CpuMask(0b11)), &counters);

        group.start().unwrap();
        assert_eq!(group.any_cpu_slots(), vec![EventSlot::Cycles]);
        group.stop();
        assert!(group.any_cpu_slots().is_empty());
    }

    #[test]
    fn test_drop_releases_counters() {
        let counters = Arc::new(SyntheticCounters::new(100));
        {
            let mut group = group(GroupConfig::memory_latency(CpuMask(0b1)), &counters);
            group.start().unwrap();
            assert_eq!(counters.live_counters(), 3);
        }
        assert_eq!(counters.live_counters(), 0);
    }

    #[test]
    fn test_position_follows_core_order() {
        let counters = Arc::new(SyntheticCounters::new(100));
        let group = group(GroupConfig::memory_latency(CpuMask(0b1010_0100)), &counters);
        assert_eq!(group.position(CpuId(2)), Some(0));
        assert_eq!(group.position(CpuId(7)), Some(2));
        assert_eq!(group.position(CpuId(3)), None);
        assert_eq!(group.core_stats()[1].cpu, CpuId(5));
    }
}
