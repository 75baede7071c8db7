//! Domain model for memlat
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use memlat_common::{EventIds, EventSlot, NUM_EVENTS};
pub use types::{CpuId, CpuMask, CpuMaskIter, Micros};

pub use errors::{CounterError, DispatchError, ExportError, MonitorError};
