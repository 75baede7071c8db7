//! Structured error types for memlat
//!
//! Using thiserror for automatic Display implementation and error chaining.

use memlat_common::EventSlot;
use thiserror::Error;

use super::types::CpuId;

/// Errors surfaced by group lifecycle operations
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to allocate {} counter (event 0x{event_id:x}) on {cpu}: {source}", .slot.name())]
    Allocation {
        cpu: CpuId,
        slot: EventSlot,
        event_id: u32,
        #[source]
        source: CounterError,
    },

    #[error("Invalid group configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported by a counter-resource provider
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Failed to create counter for event 0x{event_id:x} on {cpu}: {reason}")]
    Create { event_id: u32, cpu: CpuId, reason: String },

    #[error("Failed to enable counter on {cpu}: {reason}")]
    Enable { cpu: CpuId, reason: String },

    #[error("Failed to read counter on {cpu}: {reason}")]
    Read { cpu: CpuId, reason: String },

    #[error("Counter owned by {cpu} read from {}", .current.map_or_else(|| "a foreign thread".to_string(), |c| c.to_string()))]
    WrongCpu { cpu: CpuId, current: Option<CpuId> },
}

/// Errors scheduling a remote read on a core
///
/// Never fatal while sampling: the core is treated as unavailable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No dispatch worker for {0}")]
    NoWorker(CpuId),

    #[error("Dispatch queue for {0} is full")]
    Busy(CpuId),

    #[error("Dispatch worker for {0} has stopped")]
    Stopped(CpuId),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No snapshots to export")]
    Empty,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
