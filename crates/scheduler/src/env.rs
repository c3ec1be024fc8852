//! Process-wide execution environment.
//!
//! Owns the scan scheduler behind an explicit `init` / `shutdown` lifecycle.
//! Components receive an `Arc` handle instead of looking up a global.

use std::sync::Arc;

use tracing::info;

use scanflow_core::{ScanResult, ScannerConfig};

use crate::scheduler::ScannerScheduler;

pub struct ExecEnv {
    config: ScannerConfig,
    num_cores: usize,
    scanner_scheduler: Arc<ScannerScheduler>,
}

impl ExecEnv {
    /// Environment sized for this machine's available parallelism.
    pub fn new(config: ScannerConfig) -> Self {
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_num_cores(config, num_cores)
    }

    pub fn with_num_cores(config: ScannerConfig, num_cores: usize) -> Self {
        Self {
            config,
            num_cores: num_cores.max(1),
            scanner_scheduler: Arc::new(ScannerScheduler::new()),
        }
    }

    /// Start the scan pools.
    pub fn init(&self) -> ScanResult<()> {
        self.config.log_summary(self.num_cores);
        self.scanner_scheduler.init(&self.config, self.num_cores)?;
        info!(num_cores = self.num_cores, "execution environment ready");
        Ok(())
    }

    pub fn scanner_scheduler(&self) -> &Arc<ScannerScheduler> {
        &self.scanner_scheduler
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Stop the scan pools, draining in-flight work. Safe to call twice.
    pub fn shutdown(&self) {
        self.scanner_scheduler.stop();
    }
}
