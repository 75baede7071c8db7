//! # Deferred Work
//!
//! A single dedicated thread running callbacks handed over from latency
//! sensitive paths. Each [`WorkEvent`] carries a pending flag: enqueueing an
//! event that has not run yet is a no-op, so a burst of requests coalesces
//! into one run.
//!
//! The pending flag is cleared *before* the callback runs, which lets a
//! callback re-enqueue its own event.
//!
//! Shutting the queue down refuses further enqueues and then drains what was
//! already accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

type WorkFn = Box<dyn Fn(&Arc<WorkEvent>) + Send + Sync>;

/// A unit of deferred work, reusable across runs
pub struct WorkEvent {
    pending: AtomicBool,
    func: WorkFn,
}

impl WorkEvent {
    pub fn new(func: impl Fn(&Arc<WorkEvent>) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { pending: AtomicBool::new(false), func: Box::new(func) })
    }

    /// Queued and not yet started
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WorkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkEvent").field("pending", &self.is_pending()).finish_non_exhaustive()
    }
}

/// Cloneable enqueue side of a [`DeferredQueue`], usable from callbacks
///
/// The sender is taken out when the queue shuts down, so every event accepted
/// by [`enqueue`](Self::enqueue) is guaranteed to run.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Arc<Mutex<Option<Sender<Arc<WorkEvent>>>>>,
}

impl QueueHandle {
    /// Queue `event` for the worker
    ///
    /// Returns `false` if the event is already pending or the queue is
    /// shutting down.
    pub fn enqueue(&self, event: &Arc<WorkEvent>) -> bool {
        if event.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = tx.as_ref().is_some_and(|tx| tx.send(Arc::clone(event)).is_ok());
        if !sent {
            event.pending.store(false, Ordering::Release);
        }
        sent
    }

    /// The owning queue started shutting down
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// One worker thread running [`WorkEvent`]s in arrival order
pub struct DeferredQueue {
    name: String,
    handle: QueueHandle,
    worker: Option<JoinHandle<()>>,
}

impl DeferredQueue {
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let worker = std::thread::Builder::new().name(name.to_string()).spawn(move || run_worker(&rx))?;
        debug!("Spawned deferred work queue {name}");

        Ok(Self {
            name: name.to_string(),
            handle: QueueHandle { tx: Arc::new(Mutex::new(Some(tx))) },
            worker: Some(worker),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`QueueHandle::enqueue`]
    pub fn enqueue(&self, event: &Arc<WorkEvent>) -> bool {
        self.handle.enqueue(event)
    }

    #[must_use]
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }
}

/// Runs until the sender is gone and the channel is drained
fn run_worker(rx: &Receiver<Arc<WorkEvent>>) {
    for event in rx {
        event.pending.store(false, Ordering::Release);
        (event.func)(&event);
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        // Later enqueues fail; already accepted events still run
        self.handle.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Deferred work queue {} panicked", self.name);
            }
        }
    }
}
