//! # Raw PMU Counters via `perf_event_open(2)`
//!
//! Each counter observes every process on one core (`one_cpu` + `any_pid`)
//! and is pinned to the PMU so it is never multiplexed out. Event ids are
//! raw PMU event numbers (`PERF_TYPE_RAW`, `config = event_id`).
//!
//! PMU counters live in per-core registers, so they are reported as
//! [`ReadScope::OwningCpu`]: the sampler reads them from the dispatch worker
//! pinned to the owning core.

use std::sync::Mutex;

use log::debug;
use perf_event::events::Event;

use super::{CounterProvider, ReadScope};
use crate::domain::{CounterError, CpuId};

const PERF_TYPE_RAW: u32 = 4;

/// Raw PMU event number, not counting while the core idles
struct RawEvent(u64);

impl Event for RawEvent {
    fn update_attrs(self, attr: &mut perf_event_open_sys::bindings::perf_event_attr) {
        attr.type_ = PERF_TYPE_RAW;
        attr.config = self.0;
        attr.set_exclude_idle(1);
    }
}

/// One open PMU counter
pub struct PerfCounter {
    // Counter::read needs &mut; only one reader touches a counter per cycle
    counter: Mutex<perf_event::Counter>,
    cpu: CpuId,
    event_id: u32,
}

impl PerfCounter {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[must_use]
    pub fn event_id(&self) -> u32 {
        self.event_id
    }
}

/// Provider backed by the kernel perf subsystem
#[derive(Debug, Default)]
pub struct PerfCounters;

impl PerfCounters {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl CounterProvider for PerfCounters {
    type Handle = PerfCounter;

    fn create(&self, event_id: u32, cpu: CpuId) -> Result<PerfCounter, CounterError> {
        let counter = perf_event::Builder::new(RawEvent(u64::from(event_id)))
            .one_cpu(cpu.index())
            .any_pid()
            .exclude_hv(false)
            .exclude_kernel(false)
            .pinned(true)
            .build()
            .map_err(|e| CounterError::Create { event_id, cpu, reason: e.to_string() })?;

        debug!("Opened perf counter 0x{event_id:x} on {cpu}");
        Ok(PerfCounter { counter: Mutex::new(counter), cpu, event_id })
    }

    fn enable(&self, handle: &PerfCounter) -> Result<(), CounterError> {
        let cpu = handle.cpu;
        let mut counter = handle
            .counter
            .lock()
            .map_err(|_| CounterError::Enable { cpu, reason: "counter lock poisoned".into() })?;
        counter.enable().map_err(|e| CounterError::Enable { cpu, reason: e.to_string() })
    }

    fn read_scope(&self, _handle: &PerfCounter) -> ReadScope {
        ReadScope::OwningCpu
    }

    fn read_current_value(&self, handle: &PerfCounter) -> Result<u64, CounterError> {
        let cpu = handle.cpu;
        let mut counter = handle
            .counter
            .lock()
            .map_err(|_| CounterError::Read { cpu, reason: "counter lock poisoned".into() })?;
        counter.read().map_err(|e| CounterError::Read { cpu, reason: e.to_string() })
    }

    fn release(&self, handle: PerfCounter) {
        debug!("Closing perf counter 0x{:x} on {}", handle.event_id, handle.cpu);
        // Closing the fd frees the PMU slot
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf_event_open_sys::bindings::perf_event_attr;

    #[test]
    fn test_raw_event_excludes_idle() {
        let mut attr = perf_event_attr::default();
        RawEvent(0x11).update_attrs(&mut attr);

        assert_eq!(attr.type_, PERF_TYPE_RAW);
        assert_eq!(attr.config, 0x11);
        assert_eq!(attr.exclude_idle(), 1);
        assert_eq!(attr.exclude_kernel(), 0);
    }
}
