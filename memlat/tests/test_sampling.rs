use memlat::counters::SyntheticCounters;
use memlat::dispatch::{CpuExecutor, Dispatcher, Job};
use memlat::domain::{CpuId, CpuMask, DispatchError, EventSlot};
use memlat::topology::ManualTopology;
use memlat::{CoreGroup, GroupConfig, Hwmon};
use memlat_common::{CYC_EV, INST_EV, L2DM_EV};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const STALL_EV: u32 = 0x24;

/// Executor wrapper that counts dispatches and can refuse or slow down cores
struct Instrumented {
    inner: CpuExecutor,
    dispatched: Mutex<Vec<CpuId>>,
    refuse: CpuMask,
    slow: Option<(CpuId, Duration)>,
}

impl Instrumented {
    fn new(cpus: CpuMask) -> Self {
        Self {
            inner: CpuExecutor::spawn(cpus).unwrap(),
            dispatched: Mutex::new(Vec::new()),
            refuse: CpuMask::EMPTY,
            slow: None,
        }
    }

    fn take_dispatched(&self) -> Vec<CpuId> {
        let mut cpus = std::mem::take(&mut *self.dispatched.lock().unwrap());
        cpus.sort();
        cpus
    }
}

impl Dispatcher for Instrumented {
    fn current_cpu(&self) -> Option<CpuId> {
        self.inner.current_cpu()
    }

    fn dispatch(&self, cpu: CpuId, job: Job) -> Result<(), DispatchError> {
        if self.refuse.contains(cpu) {
            return Err(DispatchError::Busy(cpu));
        }
        self.dispatched.lock().unwrap().push(cpu);

        let job: Job = match self.slow {
            Some((slow_cpu, delay)) if slow_cpu == cpu => Box::new(move || {
                thread::sleep(delay);
                job();
            }),
            _ => job,
        };
        self.inner.dispatch(cpu, job)
    }
}

struct Setup {
    counters: Arc<SyntheticCounters>,
    topology: Arc<ManualTopology>,
    dispatcher: Arc<Instrumented>,
    group: CoreGroup<SyntheticCounters>,
}

fn setup(config: GroupConfig, dispatcher: Instrumented) -> Setup {
    let counters = Arc::new(SyntheticCounters::new(1_000));
    let topology = Arc::new(ManualTopology::with_manual_clock(config.cpus, 0));
    let dispatcher = Arc::new(dispatcher);
    let group = CoreGroup::new(
        config,
        Arc::clone(&counters),
        Arc::clone(&topology) as _,
        Arc::clone(&dispatcher) as _,
    )
    .unwrap();
    Setup { counters, topology, dispatcher, group }
}

#[test]
fn test_four_core_reference_cycle() {
    let cpus = CpuMask(0b1111);
    let config = GroupConfig::memory_latency(cpus).with_event(EventSlot::StallCycles, STALL_EV);
    let mut s = setup(config, Instrumented::new(cpus));

    let steps = [(1_000, 100), (2_000, 3_000), (500, 0), (0, 0)];
    for (cpu, (cyc, stall)) in (0u32..).zip(steps) {
        s.counters.set_step(CYC_EV, CpuId(cpu), cyc);
        s.counters.set_step(STALL_EV, CpuId(cpu), stall);
    }

    let hwmon: &mut dyn Hwmon = &mut s.group;
    hwmon.start().unwrap();
    s.topology.advance_us(1_000);
    let stats = hwmon.sample();

    let freq: Vec<u64> = stats.iter().map(|c| c.freq).collect();
    let stall: Vec<u32> = stats.iter().map(|c| c.stall_pct).collect();
    assert_eq!(freq, vec![1, 2, 0, 0]);
    assert_eq!(stall, vec![10, 100, 0, 0]);

    // Exactly one remote read per core
    assert_eq!(s.dispatcher.take_dispatched(), cpus.iter().collect::<Vec<_>>());
}

#[test]
fn test_unconfigured_stall_event_reports_100() {
    let cpus = CpuMask(0b11);
    let mut s = setup(GroupConfig::memory_latency(cpus), Instrumented::new(cpus));
    s.group.start().unwrap();

    s.topology.advance_us(10);
    let stats = s.group.sample();
    assert!(stats.iter().all(|c| c.stall_pct == 100));
    assert!(stats.iter().all(|c| c.freq == 100));
}

#[test]
fn test_unavailable_cores_keep_previous_metrics() {
    let cpus = CpuMask(0b1111);
    let mut dispatcher = Instrumented::new(cpus);
    dispatcher.refuse = CpuMask::bit(CpuId(2));
    let mut s = setup(GroupConfig::memory_latency(cpus), dispatcher);
    s.group.start().unwrap();

    s.topology.advance_us(1_000);
    let first = s.group.sample();
    assert_eq!(first.len(), 3);
    assert_eq!(s.dispatcher.take_dispatched(), vec![CpuId(0), CpuId(1), CpuId(3)]);

    // Core 2 was never sampled: its record is still the initial one
    assert_eq!(s.group.core_stats()[2].freq, 0);

    s.topology.set_online(CpuId(0), false);
    s.topology.long_latency().enter(CpuId(1));
    for cpu in cpus {
        s.counters.set_step(CYC_EV, cpu, 9_000);
    }
    s.topology.advance_us(1_000);
    let second = s.group.sample();

    assert_eq!(second.iter().map(|c| c.cpu).collect::<Vec<_>>(), vec![CpuId(3)]);
    assert_eq!(second[0].freq, 9);
    // Skipped cores are neither dispatched to nor updated
    assert_eq!(s.dispatcher.take_dispatched(), vec![CpuId(3)]);
    assert_eq!(s.group.core_stats()[0].freq, 1);
    assert_eq!(s.group.core_stats()[1].freq, 1);

    // Back online: elapsed time spans both cycles for those cores
    s.topology.set_online(CpuId(0), true);
    s.topology.long_latency().exit(CpuId(1));
    s.topology.advance_us(1_000);
    let third = s.group.sample();
    assert_eq!(third.len(), 3);
    assert_eq!(third[0].freq, 4);
    assert_eq!(third[2].freq, 9);
}

#[test]
fn test_read_failure_counts_as_zero() {
    let cpus = CpuMask(0b111);
    let mut s = setup(GroupConfig::memory_latency(cpus), Instrumented::new(cpus));
    s.group.start().unwrap();

    s.counters.set_read_failure(INST_EV, CpuId(1), true);
    s.topology.advance_us(1_000);
    let stats = s.group.sample();
    assert_eq!(stats.len(), 3);
    assert_eq!(stats[1].inst_count, 0);
    assert_eq!(stats[1].mem_count, 1_000);
    assert_eq!(stats[0].inst_count, 1_000);

    s.counters.set_read_failure(INST_EV, CpuId(1), false);
    s.topology.advance_us(1_000);
    let stats = s.group.sample();
    assert_eq!(stats[1].inst_count, 1_000);
}

#[test]
fn test_any_cpu_events_are_not_read_remotely() {
    let cpus = CpuMask(0b11);
    let mut s = setup(GroupConfig::memory_latency(cpus), Instrumented::new(cpus));
    s.counters.set_any_cpu(L2DM_EV);
    s.counters.set_any_cpu(CYC_EV);
    s.group.start().unwrap();
    assert_eq!(s.group.any_cpu_slots(), vec![EventSlot::MemoryStalls, EventSlot::Cycles]);

    s.topology.advance_us(1_000);
    let stats = s.group.sample();
    assert!(stats.iter().all(|c| c.mem_count == 1_000 && c.freq == 1 && c.inst_count == 1_000));
    assert_eq!(s.counters.reads(), 6);
}

#[test]
fn test_sample_waits_for_slow_core() {
    let cpus = CpuMask(0b111);
    let mut dispatcher = Instrumented::new(cpus);
    dispatcher.slow = Some((CpuId(1), Duration::from_millis(30)));
    let mut s = setup(GroupConfig::memory_latency(cpus), dispatcher);
    s.group.start().unwrap();

    let started = Instant::now();
    s.topology.advance_us(1_000);
    let stats = s.group.sample();

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(stats.len(), 3);
    assert_eq!(stats[1].inst_count, 1_000);
}

#[test]
fn test_stop_zeroes_and_sample_reads_nothing() {
    let cpus = CpuMask(0b11);
    let config = GroupConfig::memory_latency(cpus).with_event(EventSlot::StallCycles, STALL_EV);
    let mut s = setup(config, Instrumented::new(cpus));
    s.group.start().unwrap();
    s.topology.advance_us(1_000);
    s.group.sample();

    s.group.stop();
    assert_eq!(s.counters.live_counters(), 0);
    assert!(s.group.core_stats().iter().all(|c| *c == memlat::CoreStats::new(c.cpu)));

    let reads = s.counters.reads();
    s.topology.advance_us(1_000);
    let stats = s.group.sample();
    assert_eq!(s.counters.reads(), reads);
    assert!(stats.iter().all(|c| c.freq == 0 && c.inst_count == 0 && c.stall_pct == 100));
}

#[test]
fn test_repeated_sampling_with_jitter() {
    let cpus = CpuMask(0xff);
    let executor = Arc::new(CpuExecutor::spawn(cpus).unwrap());
    let counters = Arc::new(SyntheticCounters::new(1_000));
    let topology = Arc::new(ManualTopology::with_manual_clock(cpus, 0));
    let mut group = CoreGroup::new(
        GroupConfig::memory_latency(cpus),
        Arc::clone(&counters),
        Arc::clone(&topology) as _,
        Arc::clone(&executor) as _,
    )
    .unwrap();
    group.start().unwrap();

    // Keep the workers busy with unrelated jobs between samples
    let noise = Arc::new(AtomicUsize::new(0));
    for round in 0..200u32 {
        for cpu in cpus.iter().filter(|c| (c.0 + round) % 3 == 0) {
            let noise = Arc::clone(&noise);
            let _ = executor.dispatch(
                cpu,
                Box::new(move || {
                    noise.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }

        topology.advance_us(100);
        let stats = group.sample();
        assert_eq!(stats.len(), 8, "round {round}");
        assert!(stats.iter().all(|c| c.inst_count == 1_000 && c.freq == 10));
    }

    group.stop();
    assert_eq!(counters.live_counters(), 0);
}
