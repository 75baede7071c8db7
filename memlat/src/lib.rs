//! # memlat - Per-Core Memory Latency Sampling
//!
//! memlat samples hardware performance counters on a group of cores and turns
//! them into the per-core metrics a memory-latency governor consumes:
//! instructions retired, memory stalls, effective frequency and the share of
//! cycles spent stalled.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Governor / memlat binary                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ Hwmon::sample()
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      CoreGroup (sampler)                        │
//! │                                                                 │
//! │  ┌──────────────┐   dispatch   ┌──────────────┐                 │
//! │  │   Waiting    │─────────────▶│  CpuExecutor │ one pinned      │
//! │  │   caller     │◀─────────────│   workers    │ thread per core │
//! │  └──────┬───────┘  countdown   └──────┬───────┘                 │
//! │         │          + unpark           │ read owning-cpu slots   │
//! │         ▼                             ▼                         │
//! │  ┌──────────────┐              ┌──────────────┐                 │
//! │  │   Metrics    │              │   Counter    │ perf_event_open │
//! │  │ (freq/stall) │              │   Provider   │ or synthetic    │
//! │  └──────────────┘              └──────────────┘                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`group`]: group configuration, counter allocation (`start`/`stop`)
//! - [`sampler`]: the remote sampling protocol behind [`CoreGroup::sample`]
//! - [`metrics`]: [`CoreStats`] and the frequency / stall derivations
//! - [`hwmon`]: the [`Hwmon`] surface exposed to a governor
//! - [`counters`]: the [`CounterProvider`] seam with `perf` and `synthetic`
//!   backends
//! - [`dispatch`]: run-on-core primitive and its thread-per-core executor
//! - [`topology`]: online cores, long-latency calls and the monotonic clock
//! - [`workqueue`]: deferred work on a dedicated thread
//! - [`report`], [`preflight`], [`cli`]: pieces of the `memlat` binary
//! - [`domain`]: core ids, masks, errors
//!
//! ## Sampling Guarantees
//!
//! - A counter with an owning core is only ever read on that core
//! - Offline cores and cores inside a long-latency call are skipped, never
//!   waited on
//! - A failed read counts as zero for that cycle; the next successful read
//!   covers the gap
//! - `sample` returns once every dispatched read has completed
//!
//! ## Typical Usage
//!
//! ```bash
//! # Monitor every online CPU, 100ms interval
//! sudo ./memlat
//!
//! # Simulated counters, 10 samples, export to JSON
//! ./memlat --synthetic --count 10 --export samples.json
//! ```

pub mod cli;
pub mod counters;
pub mod dispatch;
pub mod domain;
pub mod group;
pub mod hwmon;
pub mod metrics;
pub mod preflight;
pub mod report;
pub mod sampler;
pub mod topology;
pub mod workqueue;

pub use counters::{CounterProvider, ReadScope};
pub use group::{CoreGroup, GroupConfig, MonitorKind};
pub use hwmon::Hwmon;
pub use metrics::CoreStats;
