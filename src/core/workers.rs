//! Background pool for preview decode jobs.
//!
//! Decoding a PNG/WebP payload takes longer than a redraw tick, so payloads
//! are decoded off the owner thread. Results travel back over a channel and
//! are committed by `PreviewTracker::pump_decoded()`.
//!
//! Epoch mechanism: every job carries the epoch it was scheduled in. When the
//! tracker tears everything down (`end_all`) it bumps the epoch, and queued
//! jobs from the old epoch are skipped without decoding.

use crossbeam::deque::{Injector, Steal};
use log::trace;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where decode jobs run.
///
/// `execute_with_epoch` must skip `f` if the shared epoch no longer equals
/// `epoch` when the job is picked up.
pub trait WorkerPool: Send + Sync {
    fn execute_with_epoch(&self, epoch: u64, f: Job);
}

/// Multi-threaded pool fed from a single global injector.
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    current_epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    /// Spawn `num_threads` decode threads sharing `epoch` with the tracker.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> std::io::Result<Self> {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(num_threads);

        for worker_id in 0..num_threads {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);

            let handle = thread::Builder::new()
                .name(format!("preview-decode-{}", worker_id))
                .spawn(move || {
                    trace!("Decode worker {} started", worker_id);
                    loop {
                        match injector.steal() {
                            Steal::Success(job) => job(),
                            Steal::Retry => continue,
                            Steal::Empty => {
                                if shutdown.load(Ordering::Relaxed) {
                                    break;
                                }
                                // Idle: 1ms nap keeps CPU usage down
                                thread::sleep(Duration::from_millis(1));
                            }
                        }
                    }
                    trace!("Decode worker {} stopped", worker_id);
                })?;
            handles.push(handle);
        }

        trace!("Decode workers initialized: {} threads", num_threads);

        Ok(Self {
            injector,
            handles,
            current_epoch: epoch,
            shutdown,
        })
    }

    /// Recommended thread count: 75% of cores, leaving room for the host loop
    pub fn default_threads() -> usize {
        (num_cpus::get() * 3 / 4).max(1)
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

impl WorkerPool for Workers {
    fn execute_with_epoch(&self, epoch: u64, f: Job) {
        let current_epoch = Arc::clone(&self.current_epoch);
        // Epoch checked when the job runs, not when it is queued
        self.injector.push(Box::new(move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            }
        }));
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Decode workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Pending stale jobs are skipped by the epoch check, so threads exit fast.
        // Anything still running after the deadline dies with the process.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Decode worker shutdown timeout reached, detaching");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} decode workers stopped", num_threads);
    }
}

/// Runs jobs immediately on the calling thread.
///
/// For hosts that are genuinely single-threaded, and for deterministic tests.
pub struct InlinePool {
    current_epoch: Arc<AtomicU64>,
}

impl InlinePool {
    pub fn new(epoch: Arc<AtomicU64>) -> Self {
        Self { current_epoch: epoch }
    }
}

impl WorkerPool for InlinePool {
    fn execute_with_epoch(&self, epoch: u64, f: Job) {
        if self.current_epoch.load(Ordering::Relaxed) == epoch {
            f();
        }
    }
}
