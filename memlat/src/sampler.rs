//! # Remote Sampling Protocol
//!
//! One [`CoreGroup::sample`] call reads every member core's counters and
//! derives its metrics, with latency bounded by the slowest *available* core.
//!
//! ## Flow
//!
//! 1. Snapshot the online cores. Offline cores and cores inside a
//!    long-latency call are skipped for this cycle.
//! 2. Dispatch a remote read to every other target core. A failed dispatch
//!    skips that core.
//! 3. Read the caller's own core inline (when the caller runs on a member
//!    core), then the any-cpu slots of every target core.
//! 4. Clear skipped cores from the countdown and wait for it to reach zero,
//!    deriving each core's metrics as soon as its bit clears.
//!
//! ## Countdown and wake-up
//!
//! The countdown is a bitmask of cores still reading. A remote read stores
//! its deltas, drops its share of the request, clones the waiter's
//! [`Thread`] handle and only then clears its bit. Nothing shared is touched
//! after the clear; the cloned handle keeps the waiter valid for the final
//! `unpark`. The waiter parks for at most one quantum at a time, so spurious
//! and periodic wake-ups overlap metric derivation with the remaining reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use log::{debug, warn};

use crate::counters::CounterProvider;
use crate::domain::{CpuId, CpuMask, EventSlot, Micros, NUM_EVENTS};
use crate::group::{CoreGroup, EventData, GroupCounters};
use crate::metrics::{compute_core_stats, CoreStats};

/// Longest the waiter parks before re-checking the countdown
const WAIT_QUANTUM: Duration = Duration::from_millis(1);

/// Read one counter's delta since the previous read
///
/// Unallocated counters and failed reads count as zero; a failed read keeps
/// the previous total so the next successful read covers both cycles.
fn read_event<P: CounterProvider>(provider: &P, event: &EventData<P::Handle>) -> u64 {
    let Some(counter) = &event.counter else {
        return 0;
    };

    match provider.read_current_value(counter) {
        Ok(total) => total.wrapping_sub(event.prev_count.swap(total, Ordering::Relaxed)),
        Err(e) => {
            debug!("Counter read failed, counting zero: {e}");
            0
        }
    }
}

/// Scratch state shared with the remote reads of one sample
struct SampleRequest<P: CounterProvider> {
    provider: Arc<P>,
    counters: Arc<GroupCounters<P::Handle>>,
    any_cpu_ev_mask: u8,
    /// Deltas indexed by core id; each row has a single writer per sample
    cnts: Vec<[AtomicU64; NUM_EVENTS]>,
}

impl<P: CounterProvider> SampleRequest<P> {
    fn new(group: &CoreGroup<P>) -> Self {
        let rows = group.config.cpus.last().map_or(0, |cpu| cpu.index() + 1);
        Self {
            provider: Arc::clone(&group.provider),
            counters: Arc::clone(&group.counters),
            any_cpu_ev_mask: group.any_cpu_ev_mask,
            cnts: (0..rows).map(|_| Default::default()).collect(),
        }
    }

    /// Read the owning-core slots of `cpu`; must run on `cpu`
    fn read_perf_counters(&self, cpu: CpuId) {
        let Some(cpu_counters) = self.counters.get(cpu) else {
            return;
        };

        for slot in EventSlot::ALL {
            if self.any_cpu_ev_mask & slot.bit() == 0 {
                let delta = read_event(&*self.provider, &cpu_counters.events[slot.index()]);
                self.cnts[cpu.index()][slot.index()].store(delta, Ordering::Relaxed);
            }
        }
    }

    /// Read the any-cpu slots of every core in `cpus` from here
    fn read_any_cpu_events(&self, cpus: CpuMask) {
        if self.any_cpu_ev_mask == 0 {
            return;
        }

        for cpu in cpus {
            let Some(cpu_counters) = self.counters.get(cpu) else {
                continue;
            };
            for slot in EventSlot::ALL.into_iter().filter(|s| self.any_cpu_ev_mask & s.bit() != 0) {
                let delta = read_event(&*self.provider, &cpu_counters.events[slot.index()]);
                self.cnts[cpu.index()][slot.index()].store(delta, Ordering::Relaxed);
            }
        }
    }

    fn counts(&self, cpu: CpuId) -> [u64; NUM_EVENTS] {
        std::array::from_fn(|i| self.cnts[cpu.index()][i].load(Ordering::Relaxed))
    }

    fn has_stall_counter(&self, cpu: CpuId) -> bool {
        self.counters.get(cpu).is_some_and(|c| c.has_counter(EventSlot::StallCycles))
    }
}

/// Countdown of cores still reading, plus the thread waiting on it
struct Completion {
    cpus_left: AtomicU64,
    waiter: Thread,
}

impl Completion {
    /// Block until the countdown reaches zero
    ///
    /// `outstanding` holds every core not yet handed to `on_done`, including
    /// cores read by the waiter itself. `on_done` receives each batch of
    /// newly finished cores. Parks for at most `quantum` between checks.
    fn wait(&self, mut outstanding: CpuMask, quantum: Duration, mut on_done: impl FnMut(CpuMask)) {
        loop {
            let cpus_left = CpuMask(self.cpus_left.load(Ordering::Acquire));
            let cpus_done = CpuMask(cpus_left.0 ^ outstanding.0);

            if cpus_done.is_empty() {
                thread::park_timeout(quantum);
                continue;
            }

            on_done(cpus_done);
            if cpus_left.is_empty() {
                return;
            }
            outstanding = cpus_left;
        }
    }
}

/// Remote action, runs on `cpu`
fn read_evs_remote<P: CounterProvider>(
    request: Arc<SampleRequest<P>>,
    completion: Arc<Completion>,
    cpu: CpuId,
) {
    request.read_perf_counters(cpu);
    drop(request);

    // Clone the waiter before clearing our bit: once the count hits zero the
    // waiter may return and tear the sample down.
    let waiter = completion.waiter.clone();
    let bit = CpuMask::bit(cpu).0;
    let cpus_left = completion.cpus_left.fetch_and(!bit, Ordering::AcqRel);
    drop(completion);

    if cpus_left == bit {
        waiter.unpark();
    }
}

impl<P: CounterProvider> CoreGroup<P> {
    /// Read every available member core and derive its metrics
    ///
    /// Returns the cores updated this cycle in ascending order. Offline
    /// cores, cores inside a long-latency call and cores whose dispatch
    /// failed are omitted and keep their previous [`CoreStats`].
    ///
    /// Takes `&mut self`: concurrent samples of one group are not allowed.
    pub fn sample(&mut self) -> Vec<CoreStats> {
        let members = self.config.cpus;
        let request = Arc::new(SampleRequest::new(self));
        let mut updated = Vec::with_capacity(members.len());

        let this_cpu = self.dispatcher.current_cpu().filter(|cpu| members.contains(*cpu));
        let remote = this_cpu.map_or(members, |cpu| members.difference(CpuMask::bit(cpu)));
        let completion =
            Arc::new(Completion { cpus_left: AtomicU64::new(remote.0), waiter: thread::current() });

        // Dispatch asynchronous reads to each core
        let online = self.topology.online();
        let mut cpus_read = members;
        for cpu in remote {
            if !online.contains(cpu) {
                debug!("Skipping offline {cpu}");
                cpus_read.remove(cpu);
                continue;
            }
            // A long-latency call would stall the whole sample behind it
            if self.topology.in_long_latency_call(cpu) {
                debug!("Skipping {cpu}: inside a long-latency call");
                cpus_read.remove(cpu);
                continue;
            }

            let (req, comp) = (Arc::clone(&request), Arc::clone(&completion));
            if let Err(e) = self.dispatcher.dispatch(cpu, Box::new(move || read_evs_remote(req, comp, cpu))) {
                warn!("Skipping {cpu}: {e}");
                cpus_read.remove(cpu);
            }
        }

        // Read this core's events while the remote reads run
        if let Some(cpu) = this_cpu {
            request.read_perf_counters(cpu);
        }

        if cpus_read.is_empty() {
            debug!("No cpus of group {members} available");
            return updated;
        }

        request.read_any_cpu_events(cpus_read);

        // Nothing will ever clear the skipped cores
        completion.cpus_left.fetch_and(!remote.difference(cpus_read).0, Ordering::AcqRel);

        completion.wait(cpus_read, WAIT_QUANTUM, |cpus_done| {
            for cpu in cpus_done {
                if let Some(stats) = self.compute_perf_counters(&request, cpu) {
                    updated.push(stats);
                }
            }
        });

        debug!("Sampled {} of {} cpus in group {members}", updated.len(), members.len());
        updated.sort_by_key(|stats| stats.cpu);
        updated
    }

    fn compute_perf_counters(&mut self, request: &SampleRequest<P>, cpu: CpuId) -> Option<CoreStats> {
        let idx = self.position(cpu)?;
        let now = Micros(self.topology.now_us());

        compute_core_stats(
            &mut self.core_stats[idx],
            &mut self.prev_ts[idx],
            now,
            &request.counts(cpu),
            request.has_stall_counter(cpu),
        );
        Some(self.core_stats[idx])
    }
}
