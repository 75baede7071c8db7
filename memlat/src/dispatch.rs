//! # Run-on-core Dispatch
//!
//! Hardware counters can only be read by code running on the core that owns
//! them. [`CpuExecutor`] keeps one worker thread per core, pinned with
//! `core_affinity`, and runs submitted jobs on it.
//!
//! Dispatch never blocks: each worker is fed through a bounded channel and a
//! full or closed channel is reported to the caller immediately, so the
//! sampler knows at dispatch time which cores will answer.

use std::cell::Cell;
use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, info, warn};

use crate::domain::{CpuId, CpuMask, DispatchError};

/// Work executed on a specific core
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Jobs that may wait in one core's queue
const QUEUE_DEPTH: usize = 16;

thread_local! {
    static CURRENT_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Core the calling thread serves, if it is a dispatch worker
#[must_use]
pub fn current_cpu() -> Option<CpuId> {
    CURRENT_CPU.with(Cell::get)
}

/// Async "run this action on core X" primitive
pub trait Dispatcher: Send + Sync {
    /// Core the calling thread is bound to, if any
    fn current_cpu(&self) -> Option<CpuId>;

    /// Queue `job` on `cpu`.
    ///
    /// # Errors
    /// Returns a [`DispatchError`] if the job will never run; the job is
    /// dropped in that case.
    fn dispatch(&self, cpu: CpuId, job: Job) -> Result<(), DispatchError>;
}

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

/// One pinned worker thread per core
pub struct CpuExecutor {
    workers: HashMap<CpuId, Worker>,
}

impl CpuExecutor {
    /// Spawn a worker for every core in `cpus`
    ///
    /// A worker whose pinning fails keeps serving its core logically; a
    /// warning is logged.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned
    pub fn spawn(cpus: CpuMask) -> std::io::Result<Self> {
        let mut workers = HashMap::with_capacity(cpus.len());

        for cpu in cpus {
            let (tx, rx) = bounded::<Job>(QUEUE_DEPTH);
            let handle = thread::Builder::new().name(format!("memlat-cpu{}", cpu.0)).spawn(
                move || {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu.index() }) {
                        warn!("Failed to pin dispatch worker for {cpu}");
                    }
                    CURRENT_CPU.with(|c| c.set(Some(cpu)));

                    for job in rx {
                        job();
                    }
                    debug!("Dispatch worker for {cpu} exiting");
                },
            )?;
            workers.insert(cpu, Worker { tx, handle });
        }

        info!("✓ Spawned {} dispatch workers ({cpus})", workers.len());
        Ok(Self { workers })
    }

    /// Cores served by this executor
    #[must_use]
    pub fn cpus(&self) -> CpuMask {
        self.workers.keys().copied().collect()
    }
}

impl Dispatcher for CpuExecutor {
    fn current_cpu(&self) -> Option<CpuId> {
        current_cpu().filter(|cpu| self.workers.contains_key(cpu))
    }

    fn dispatch(&self, cpu: CpuId, job: Job) -> Result<(), DispatchError> {
        let worker = self.workers.get(&cpu).ok_or(DispatchError::NoWorker(cpu))?;
        worker.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Busy(cpu),
            TrySendError::Disconnected(_) => DispatchError::Stopped(cpu),
        })
    }
}

impl Drop for CpuExecutor {
    fn drop(&mut self) {
        let me = thread::current().id();
        for (cpu, worker) in self.workers.drain() {
            drop(worker.tx);
            // Dropped from one of our own jobs: that worker exits once the job returns
            if worker.handle.thread().id() == me {
                debug!("Detaching dispatch worker for {cpu}, dropped from its own job");
                continue;
            }
            if worker.handle.join().is_err() {
                warn!("Dispatch worker for {cpu} panicked");
            }
        }
    }
}
