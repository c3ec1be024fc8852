//! Scan scheduler: owns the scan worker pools and routes scan tasks to them.
//!
//! Three pools exist once [`ScannerScheduler::init`] succeeds:
//! - `local_scan`: fixed size, serves scanners over co-located storage
//! - `RemoteScanThreadPool`: elastic and much larger, serves scanners that
//!   block on network or object storage
//! - `LimitedScanThreadPool`: only reachable through per-query tokens from
//!   [`ScannerScheduler::new_limited_scan_pool_token`]
//!
//! Split into focused submodules:
//! - `submit`: liveness checks, pool routing and backpressure
//! - `quantum`: the bounded unit of scan work run on a worker thread

mod quantum;
mod submit;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::info;

use scanflow_core::{ScanError, ScanResult, ScannerConfig};

use crate::metrics::SchedulerMetrics;
use crate::pool::{ExecutionMode, PoolToken, WorkerPool};

pub const LOCAL_SCAN_POOL: &str = "local_scan";
pub const REMOTE_SCAN_POOL: &str = "RemoteScanThreadPool";
pub const LIMITED_SCAN_POOL: &str = "LimitedScanThreadPool";

/// Budget limits for one scan quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantumConfig {
    /// Stop reading once this many block bytes were produced.
    pub row_bytes: usize,
    /// Yield once the quantum ran this long.
    pub max_run_time: Duration,
    /// Nice value for scan threads. 0 leaves priority alone.
    pub nice_value: i32,
}

impl From<&ScannerConfig> for QuantumConfig {
    fn from(config: &ScannerConfig) -> Self {
        Self {
            row_bytes: config.scanner_row_bytes,
            max_run_time: config.max_run_time(),
            nice_value: config.scan_thread_nice_value,
        }
    }
}

pub(crate) struct ScanPools {
    pub(crate) local: WorkerPool,
    pub(crate) remote: WorkerPool,
    pub(crate) limited: WorkerPool,
    pub(crate) quantum: QuantumConfig,
}

/// Process-wide scan scheduler. Create once, [`init`](Self::init) once,
/// [`stop`](Self::stop) at shutdown.
pub struct ScannerScheduler {
    pools: OnceLock<ScanPools>,
    is_closed: AtomicBool,
    metrics: Arc<SchedulerMetrics>,
}

impl Default for ScannerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerScheduler {
    pub fn new() -> Self {
        Self {
            pools: OnceLock::new(),
            is_closed: AtomicBool::new(false),
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    /// Start the local, remote and limited pools.
    ///
    /// Fails if any pool cannot start; pools already started are stopped
    /// again. Calling `init` twice is an error.
    pub fn init(&self, config: &ScannerConfig, num_cores: usize) -> ScanResult<()> {
        if self.pools.get().is_some() {
            return Err(ScanError::AlreadyInitialized);
        }

        let local = WorkerPool::builder(LOCAL_SCAN_POOL)
            .min_threads(config.scanner_thread_pool_thread_num)
            .max_threads(config.scanner_thread_pool_thread_num)
            .max_queue_size(config.scanner_thread_pool_queue_size)
            .build()?;

        let remote_max = config.remote_scan_thread_num(num_cores);
        let remote = match WorkerPool::builder(REMOTE_SCAN_POOL)
            .min_threads(config.remote_scan_min_thread_num(num_cores))
            .max_threads(remote_max)
            .max_queue_size(config.remote_scanner_thread_pool_queue_size)
            .idle_timeout(config.pool_idle_timeout())
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                local.stop();
                return Err(e);
            }
        };

        let limited = match WorkerPool::builder(LIMITED_SCAN_POOL)
            .min_threads(config.scanner_thread_pool_thread_num)
            .max_threads(config.scanner_thread_pool_thread_num)
            .max_queue_size(config.scanner_thread_pool_queue_size)
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                local.stop();
                remote.stop();
                return Err(e);
            }
        };

        let pools = ScanPools {
            local,
            remote,
            limited,
            quantum: QuantumConfig::from(config),
        };
        if let Err(lost) = self.pools.set(pools) {
            // Another caller won the race.
            lost.limited.stop();
            lost.local.stop();
            lost.remote.stop();
            return Err(ScanError::AlreadyInitialized);
        }

        info!(
            local_threads = config.scanner_thread_pool_thread_num,
            remote_max_threads = remote_max,
            "ScannerScheduler initialized"
        );
        Ok(())
    }

    /// Stop all pools, draining in-flight work. A no-op if `init` never
    /// succeeded or `stop` already ran.
    pub fn stop(&self) {
        let Some(pools) = self.pools.get() else {
            return;
        };
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }

        pools.limited.shutdown();
        pools.limited.wait();

        pools.local.stop();
        pools.remote.stop();

        info!("ScannerScheduler stopped");
    }

    /// A private token on the limited pool, capped at `max_concurrency`.
    pub fn new_limited_scan_pool_token(
        &self,
        mode: ExecutionMode,
        max_concurrency: usize,
    ) -> ScanResult<PoolToken> {
        let pools = self.pools.get().ok_or(ScanError::NotInitialized)?;
        Ok(pools.limited.new_token(mode, max_concurrency))
    }

    pub fn is_initialized(&self) -> bool {
        self.pools.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    pub fn local_pool(&self) -> Option<&WorkerPool> {
        self.pools.get().map(|p| &p.local)
    }

    pub fn remote_pool(&self) -> Option<&WorkerPool> {
        self.pools.get().map(|p| &p.remote)
    }

    pub fn limited_pool(&self) -> Option<&WorkerPool> {
        self.pools.get().map(|p| &p.limited)
    }

    pub fn quantum_config(&self) -> Option<QuantumConfig> {
        self.pools.get().map(|p| p.quantum)
    }
}

impl Drop for ScannerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
