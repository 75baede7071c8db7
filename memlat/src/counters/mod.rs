//! Counter-resource providers
//!
//! A provider creates one counter per (event, core), enables it, reports
//! where it can be read from, and reads its running total.
//!
//! - [`perf`]: raw PMU events through `perf_event_open(2)` (Linux)
//! - [`synthetic`]: deterministic in-memory counters

#[cfg(target_os = "linux")]
pub mod perf;
pub mod synthetic;

#[cfg(target_os = "linux")]
pub use perf::PerfCounters;
pub use synthetic::SyntheticCounters;

use crate::domain::{CounterError, CpuId};

/// Where a counter's value can be read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    /// Only code running on the owning core may read it
    OwningCpu,
    /// Any core may read it
    AnyCpu,
}

/// Source of per-core event counters
pub trait CounterProvider: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Allocate a counter for `event_id` on `cpu`
    ///
    /// # Errors
    /// Returns [`CounterError::Create`] if the counter cannot be allocated
    fn create(&self, event_id: u32, cpu: CpuId) -> Result<Self::Handle, CounterError>;

    /// Start counting
    ///
    /// # Errors
    /// Returns [`CounterError::Enable`] if the counter cannot be enabled
    fn enable(&self, handle: &Self::Handle) -> Result<(), CounterError>;

    /// Readability reported by the resource, inspected once at enable time
    fn read_scope(&self, handle: &Self::Handle) -> ReadScope;

    /// Current running total
    ///
    /// # Errors
    /// Fails if the read itself fails, or if the counter is
    /// [`ReadScope::OwningCpu`] and the caller is not on the owning core.
    fn read_current_value(&self, handle: &Self::Handle) -> Result<u64, CounterError>;

    /// Free the counter
    fn release(&self, handle: Self::Handle);
}
