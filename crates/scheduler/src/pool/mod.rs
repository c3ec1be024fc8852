//! Bounded worker pools and per-query execution tokens.
//!
//! A [`WorkerPool`] is a set of named OS threads pulling jobs from a
//! bounded queue. Submission never blocks: once `max_threads` jobs are
//! running and `max_queue_size` more are waiting, the next submit is
//! reported as [`ScanError::QueueFull`] so callers can turn it into
//! backpressure.
//!
//! Pools are elastic between `min_threads` and `max_threads`. Extra
//! threads are spawned on submit when accepted jobs outnumber live
//! threads, and retire after sitting idle for `idle_timeout`.

mod token;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use scanflow_core::ScanError;

pub use token::{ExecutionMode, PoolToken};

/// A unit of work run on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ── Builder ─────────────────────────────────────────────────────────

/// Builder for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
}

impl WorkerPoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_threads: 0,
            max_threads: 1,
            max_queue_size: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn min_threads(mut self, n: usize) -> Self {
        self.min_threads = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Jobs that may wait for a thread on top of the ones running. 0 means
    /// a job is only accepted while fewer than `max_threads` jobs are in flight.
    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Start the pool with `min_threads` live workers.
    pub fn build(self) -> Result<WorkerPool, ScanError> {
        let max_threads = self.max_threads.max(1);
        let min_threads = self.min_threads.min(max_threads);
        // Admission is decided by `in_flight`; the channel only needs room
        // for every job that can be accepted at once.
        let (sender, receiver) = bounded(self.max_queue_size.saturating_add(max_threads));

        let inner = Arc::new(PoolInner {
            name: self.name,
            min_threads,
            max_threads,
            max_queue_size: self.max_queue_size,
            idle_timeout: self.idle_timeout,
            sender: RwLock::new(Some(sender)),
            receiver,
            threads: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        for _ in 0..min_threads {
            if let Err(e) = inner.spawn_worker() {
                inner.shutdown();
                inner.join_all();
                return Err(e);
            }
        }

        info!(
            pool = %inner.name,
            min_threads,
            max_threads,
            max_queue_size = inner.max_queue_size,
            "worker pool started"
        );
        Ok(WorkerPool { inner })
    }
}

// ── Pool ────────────────────────────────────────────────────────────

/// A bounded, elastic pool of named worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
    /// Taken on shutdown, which disconnects the workers once the queue drains.
    sender: RwLock<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    /// Live worker threads.
    threads: AtomicUsize,
    /// Workers currently running a job.
    busy: AtomicUsize,
    /// Jobs accepted and not yet finished, queued or running.
    in_flight: AtomicUsize,
    next_thread_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    pub fn builder(name: impl Into<String>) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(name)
    }

    /// Enqueue a job without blocking.
    pub fn submit(&self, job: Job) -> Result<(), ScanError> {
        self.inner.submit(job)
    }

    /// Create a token that bounds how many of its jobs run at once.
    pub fn new_token(&self, mode: ExecutionMode, max_concurrency: usize) -> PoolToken {
        PoolToken::new(Arc::clone(&self.inner), mode, max_concurrency)
    }

    /// Stop accepting jobs. Already queued jobs still run.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Block until every worker has exited. Call after [`shutdown`](Self::shutdown);
    /// must not be called from one of this pool's own threads.
    pub fn wait(&self) {
        self.inner.join_all();
    }

    /// Shutdown, then wait for queued work to drain.
    pub fn stop(&self) {
        self.shutdown();
        self.wait();
        info!(pool = %self.inner.name, "worker pool stopped");
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn num_threads(&self) -> usize {
        self.inner.threads.load(Ordering::Acquire)
    }

    pub fn active_threads(&self) -> usize {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    pub fn min_threads(&self) -> usize {
        self.inner.min_threads
    }

    pub fn max_queue_size(&self) -> usize {
        self.inner.max_queue_size
    }

    /// Jobs waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Jobs accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue drains.
        self.inner.shutdown();
    }
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn submit(self: &Arc<Self>, job: Job) -> Result<(), ScanError> {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(ScanError::PoolShutdown {
                pool: self.name.clone(),
            });
        };

        let in_flight = self.reserve_slot()?;
        self.maybe_grow(in_flight);

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(self.queue_full())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(ScanError::PoolShutdown {
                    pool: self.name.clone(),
                })
            }
        }
    }

    /// Count a new job against `max_threads + max_queue_size`. Returns the
    /// in-flight count including the new job.
    fn reserve_slot(&self) -> Result<usize, ScanError> {
        let capacity = self.max_threads.saturating_add(self.max_queue_size);
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= capacity {
                return Err(self.queue_full());
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    fn queue_full(&self) -> ScanError {
        ScanError::QueueFull {
            pool: self.name.clone(),
            capacity: self.max_queue_size,
        }
    }

    /// Spawn one more worker when accepted jobs outnumber live workers.
    fn maybe_grow(self: &Arc<Self>, in_flight: usize) {
        let threads = self.threads.load(Ordering::SeqCst);
        if threads >= self.max_threads || in_flight <= threads {
            return;
        }
        if let Err(e) = self.spawn_worker() {
            // The job can still be queued for the existing workers.
            error!(pool = %self.name, error = %e, "failed to grow worker pool");
        }
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<(), ScanError> {
        // Reserve the slot first so concurrent submitters cannot overshoot max.
        if !self.claim_thread_slot() {
            return Ok(());
        }
        self.start_worker()
    }

    fn claim_thread_slot(&self) -> bool {
        let mut current = self.threads.load(Ordering::SeqCst);
        loop {
            if current >= self.max_threads {
                return false;
            }
            match self.threads.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start a worker for a slot already counted in `threads`.
    fn start_worker(self: &Arc<Self>) -> Result<(), ScanError> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || inner.worker_loop());

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.threads.fetch_sub(1, Ordering::SeqCst);
                Err(ScanError::ThreadSpawn {
                    pool: self.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            match self.receiver.recv_timeout(self.idle_timeout) {
                Ok(job) => {
                    self.busy.fetch_add(1, Ordering::AcqRel);
                    run_job(&self.name, job);
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.try_retire() {
                        debug!(pool = %self.name, "idle worker retired");
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.threads.fetch_sub(1, Ordering::SeqCst);
    }

    /// Give up this worker's slot if the pool is above its minimum and the
    /// remaining workers still cover every accepted job.
    fn try_retire(&self) -> bool {
        let mut current = self.threads.load(Ordering::SeqCst);
        loop {
            if current <= self.min_threads || self.in_flight.load(Ordering::SeqCst) >= current {
                return false;
            }
            match self.threads.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // A submit may have counted its job against the slot just released.
        if self.in_flight.load(Ordering::SeqCst) >= current && self.claim_thread_slot() {
            return false;
        }
        true
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.sender.write().take();
    }

    fn join_all(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!(pool = %self.name, "worker thread exited with a panic");
                }
            }
        }
    }
}

/// Run a job, keeping the worker alive if it panics.
pub(crate) fn run_job(pool: &str, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let err = ScanError::from_panic(payload);
        error!(pool, error = %err, "job panicked on worker thread");
    }
}
