use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use scanflow_core::ScanError;

use super::{run_job, Job, PoolInner};

/// How a [`PoolToken`] runs its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One job at a time, in submission order.
    Serial,
    /// Up to `max_concurrency` jobs at once.
    Concurrent,
}

/// A per-query handle onto a shared [`WorkerPool`](super::WorkerPool) that caps
/// how many of the query's jobs occupy pool threads at the same time.
///
/// Jobs wait in the token's own backlog, bounded by the pool's queue size.
/// Dropping the token discards jobs that have not started yet.
pub struct PoolToken {
    pool: Arc<PoolInner>,
    shared: Arc<TokenShared>,
    mode: ExecutionMode,
    max_concurrency: usize,
    next_seq: AtomicU64,
}

struct TokenShared {
    state: Mutex<TokenState>,
    idle: Condvar,
}

#[derive(Default)]
struct TokenState {
    pending: VecDeque<(u64, Job)>,
    /// Runners currently occupying a pool thread on behalf of this token.
    active: usize,
    shut_down: bool,
}

impl PoolToken {
    pub(crate) fn new(pool: Arc<PoolInner>, mode: ExecutionMode, max_concurrency: usize) -> Self {
        Self {
            pool,
            shared: Arc::new(TokenShared {
                state: Mutex::new(TokenState::default()),
                idle: Condvar::new(),
            }),
            mode,
            max_concurrency: max_concurrency.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Jobs of this token allowed to run at once.
    pub fn concurrency_limit(&self) -> usize {
        match self.mode {
            ExecutionMode::Serial => 1,
            ExecutionMode::Concurrent => self.max_concurrency,
        }
    }

    /// Queue a job on the token without blocking.
    pub fn submit(&self, job: Job) -> Result<(), ScanError> {
        if self.pool.is_shutdown() {
            return Err(ScanError::PoolShutdown {
                pool: self.pool.name().to_string(),
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let limit = self.concurrency_limit();
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(ScanError::PoolShutdown {
                    pool: format!("{} token", self.pool.name()),
                });
            }
            if state.active >= limit && state.pending.len() >= self.pool.max_queue_size() {
                return Err(ScanError::QueueFull {
                    pool: format!("{} token", self.pool.name()),
                    capacity: self.pool.max_queue_size(),
                });
            }
            state.pending.push_back((seq, job));
            if state.active >= limit {
                return Ok(());
            }
            state.active += 1;
        }

        let shared = Arc::clone(&self.shared);
        let pool_name = self.pool.name().to_string();
        let runner: Job = Box::new(move || drain_token(&shared, &pool_name));
        if let Err(e) = self.pool.submit(runner) {
            let reclaimed = {
                let mut state = self.shared.state.lock();
                state.active -= 1;
                if state.active == 0 {
                    self.shared.idle.notify_all();
                }
                // Another runner may already have picked the job up, in which case it was accepted.
                let pos = state.pending.iter().position(|(s, _)| *s == seq);
                pos.and_then(|pos| state.pending.remove(pos))
            };
            if reclaimed.is_some() {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Jobs waiting for a runner.
    pub fn num_pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Runners currently executing this token's jobs.
    pub fn num_active(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Reject further jobs and drop those that have not started.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.pending)
        };
        // Run destructors of captured state outside the lock.
        drop(dropped);
    }

    /// Block until no job of this token is running. Must not be called from
    /// inside one of the token's own jobs.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.active > 0 {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Drop for PoolToken {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_token(shared: &TokenShared, pool_name: &str) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            match state.pending.pop_front() {
                Some((_, job)) => job,
                None => {
                    state.active -= 1;
                    if state.active == 0 {
                        shared.idle.notify_all();
                    }
                    return;
                }
            }
        };
        run_job(pool_name, job);
    }
}
