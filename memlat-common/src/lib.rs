//! # Shared Event-Slot Vocabulary
//!
//! Definitions shared by everything that talks about a memory-latency core
//! group: the four logical event slots, their default raw PMU event codes and
//! the per-group event id table.
//!
//! ## Key Types
//!
//! - [`EventSlot`] - One of the four logical counters sampled per core
//! - [`EventIds`] - Raw event code per slot (`0` = not monitored)
//!
//! The raw codes are ARMv8 PMUv3 common event numbers.

#![no_std]

// ============================================================================
// Limits
// ============================================================================

/// Number of logical event slots sampled per core
pub const NUM_EVENTS: usize = 4;

/// Highest number of cores a single group can describe
///
/// Core sets are carried as 64-bit masks, so core ids must be below this.
pub const MAX_CPUS: usize = 64;

// ============================================================================
// Default Raw Event Codes
// ============================================================================

/// `INST_RETIRED`: instructions architecturally executed
pub const INST_EV: u32 = 0x08;

/// `L2D_CACHE_REFILL`: level 2 data cache refill (memory stall proxy)
pub const L2DM_EV: u32 = 0x17;

/// `CPU_CYCLES`: processor cycles
pub const CYC_EV: u32 = 0x11;

// ============================================================================
// Event Slots
// ============================================================================

/// Logical counter tracked for every core of a group
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventSlot {
    /// Instructions retired
    Instructions = 0,
    /// Memory-stall events (cache misses reaching memory)
    MemoryStalls = 1,
    /// Core cycles
    Cycles = 2,
    /// Cycles the core spent stalled
    StallCycles = 3,
}

impl EventSlot {
    /// All slots in index order
    pub const ALL: [EventSlot; NUM_EVENTS] = [
        EventSlot::Instructions,
        EventSlot::MemoryStalls,
        EventSlot::Cycles,
        EventSlot::StallCycles,
    ];

    /// Position of this slot in per-core arrays
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit of this slot in a slot mask
    #[must_use]
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Short lowercase name, used in logs and exports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            EventSlot::Instructions => "instructions",
            EventSlot::MemoryStalls => "memory-stalls",
            EventSlot::Cycles => "cycles",
            EventSlot::StallCycles => "stall-cycles",
        }
    }
}

// ============================================================================
// Event Id Table
// ============================================================================

/// Raw event code for every slot of a group
///
/// An id of `0` means the slot is not monitored.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventIds {
    pub ids: [u32; NUM_EVENTS],
}

impl EventIds {
    /// Memory-latency table: instructions, memory stalls and cycles, plus
    /// stall cycles when the platform provides an event for it.
    #[must_use]
    pub const fn memory_latency(inst_ev: u32, mem_ev: u32, stall_ev: Option<u32>) -> Self {
        let stall = match stall_ev {
            Some(ev) => ev,
            None => 0,
        };
        Self { ids: [inst_ev, mem_ev, CYC_EV, stall] }
    }

    /// Compute table: only cycles are monitored
    #[must_use]
    pub const fn compute() -> Self {
        Self { ids: [0, 0, CYC_EV, 0] }
    }

    #[must_use]
    pub const fn get(&self, slot: EventSlot) -> u32 {
        self.ids[slot.index()]
    }

    pub fn set(&mut self, slot: EventSlot, event_id: u32) {
        self.ids[slot.index()] = event_id;
    }

    #[must_use]
    pub const fn is_monitored(&self, slot: EventSlot) -> bool {
        self.ids[slot.index()] != 0
    }
}
