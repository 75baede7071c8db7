//! Deterministic in-memory counters
//!
//! Every read advances a counter by its configured step and returns the new
//! total, so each sample observes exactly one step as its delta. Owning-core
//! reads are checked against the calling dispatch worker, which makes the
//! backend strict about where reads happen.
//!
//! Failures can be scripted per (event, core) for creation and for reads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{CounterProvider, ReadScope};
use crate::dispatch::current_cpu;
use crate::domain::{CounterError, CpuId};

type Key = (u32, CpuId);

#[derive(Debug, Default)]
struct Script {
    steps: HashMap<Key, u64>,
    any_cpu_events: HashSet<u32>,
    fail_create: HashSet<Key>,
    fail_read: HashSet<Key>,
}

/// Handle to one synthetic counter
#[derive(Debug)]
pub struct SyntheticCounter {
    event_id: u32,
    cpu: CpuId,
    scope: ReadScope,
    value: AtomicU64,
    enabled: AtomicBool,
}

impl SyntheticCounter {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[must_use]
    pub fn event_id(&self) -> u32 {
        self.event_id
    }
}

/// Scriptable provider
#[derive(Debug)]
pub struct SyntheticCounters {
    default_step: u64,
    script: Mutex<Script>,
    live: AtomicUsize,
    reads: AtomicUsize,
}

impl SyntheticCounters {
    /// Every counter advances by `default_step` per read unless scripted
    #[must_use]
    pub fn new(default_step: u64) -> Self {
        Self {
            default_step,
            script: Mutex::new(Script::default()),
            live: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut script)
    }

    /// Per-read increment of `event_id` on `cpu`
    pub fn set_step(&self, event_id: u32, cpu: CpuId, step: u64) {
        self.with_script(|s| s.steps.insert((event_id, cpu), step));
    }

    /// Make counters for `event_id` readable from any core
    pub fn set_any_cpu(&self, event_id: u32) {
        self.with_script(|s| s.any_cpu_events.insert(event_id));
    }

    pub fn fail_create(&self, event_id: u32, cpu: CpuId) {
        self.with_script(|s| s.fail_create.insert((event_id, cpu)));
    }

    pub fn set_read_failure(&self, event_id: u32, cpu: CpuId, failing: bool) {
        self.with_script(|s| {
            if failing {
                s.fail_read.insert((event_id, cpu));
            } else {
                s.fail_read.remove(&(event_id, cpu));
            }
        });
    }

    /// Counters created and not yet released
    #[must_use]
    pub fn live_counters(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Successful reads so far
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl CounterProvider for SyntheticCounters {
    type Handle = SyntheticCounter;

    fn create(&self, event_id: u32, cpu: CpuId) -> Result<SyntheticCounter, CounterError> {
        let (failing, any_cpu) = self.with_script(|s| {
            (s.fail_create.contains(&(event_id, cpu)), s.any_cpu_events.contains(&event_id))
        });
        if failing {
            return Err(CounterError::Create { event_id, cpu, reason: "scripted failure".into() });
        }

        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(SyntheticCounter {
            event_id,
            cpu,
            scope: if any_cpu { ReadScope::AnyCpu } else { ReadScope::OwningCpu },
            value: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
        })
    }

    fn enable(&self, handle: &SyntheticCounter) -> Result<(), CounterError> {
        handle.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn read_scope(&self, handle: &SyntheticCounter) -> ReadScope {
        handle.scope
    }

    fn read_current_value(&self, handle: &SyntheticCounter) -> Result<u64, CounterError> {
        let cpu = handle.cpu;
        if handle.scope == ReadScope::OwningCpu && current_cpu() != Some(cpu) {
            return Err(CounterError::WrongCpu { cpu, current: current_cpu() });
        }
        if !handle.enabled.load(Ordering::Acquire) {
            return Err(CounterError::Read { cpu, reason: "counter not enabled".into() });
        }

        let key = (handle.event_id, cpu);
        let (failing, step) = self.with_script(|s| {
            (s.fail_read.contains(&key), s.steps.get(&key).copied().unwrap_or(self.default_step))
        });
        if failing {
            return Err(CounterError::Read { cpu, reason: "scripted failure".into() });
        }

        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(handle.value.fetch_add(step, Ordering::AcqRel).wrapping_add(step))
    }

    fn release(&self, handle: SyntheticCounter) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        drop(handle);
    }
}
