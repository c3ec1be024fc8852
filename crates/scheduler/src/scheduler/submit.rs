use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, info, warn};

use scanflow_core::{ScanError, ScanResult, StorageType};

use crate::context::ScanContext;
use crate::metrics::SchedulerMetrics;
use crate::pool::Job;
use crate::task::ScanTask;

use super::quantum::scanner_scan;
use super::{QuantumConfig, ScannerScheduler};

impl ScannerScheduler {
    /// Schedule one quantum of `task` on a worker.
    ///
    /// Returns `Ok` without scheduling anything when the query is done, its
    /// fragment is gone or the scanner was torn down. A pool that refuses the
    /// task yields [`ScanError::TooManyTasks`], which is also recorded on the
    /// task.
    pub fn submit(&self, ctx: Arc<dyn ScanContext>, task: Arc<ScanTask>) -> ScanResult<()> {
        if ctx.done() {
            self.metrics.record_dropped();
            return Ok(());
        }
        let Some(_task_lock) = ctx.task_exec_ctx() else {
            info!(
                ctx = %ctx.debug_string(),
                "could not lock task execution context, query maybe finished"
            );
            self.metrics.record_dropped();
            return Ok(());
        };
        let Some(delegate) = task.scanner() else {
            self.metrics.record_dropped();
            return Ok(());
        };
        let pools = self.pools.get().ok_or(ScanError::NotInitialized)?;
        let storage = delegate.storage_type();

        delegate.start_wait_worker_timer();
        let work = scan_job(
            Arc::clone(&ctx),
            Arc::clone(&task),
            pools.quantum,
            Arc::clone(&self.metrics),
        );

        let submitted = match ctx.thread_token() {
            Some(token) => token.submit(work),
            None => match storage {
                StorageType::Local => pools.local.submit(work),
                StorageType::Remote => pools.remote.submit(work),
            },
        };

        match submitted {
            Ok(()) => {
                self.metrics.record_submitted();
                Ok(())
            }
            Err(cause) => {
                warn!(error = %cause, storage = %storage, "scan pool rejected task");
                self.metrics.record_rejected();
                let too_many = || ScanError::TooManyTasks {
                    reason: cause.to_string(),
                    storage,
                };
                task.set_status(too_many());
                Err(too_many())
            }
        }
    }
}

/// Wrap a quantum so a fault on the worker still hands the task back.
fn scan_job(
    ctx: Arc<dyn ScanContext>,
    task: Arc<ScanTask>,
    quantum: QuantumConfig,
    metrics: Arc<SchedulerMetrics>,
) -> Job {
    Box::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            scanner_scan(&ctx, &task, &quantum, &metrics)
        }));
        if let Err(payload) = outcome {
            let err = ScanError::from_panic(payload);
            error!(error = %err, "scan job faulted outside the quantum");
            metrics.record_fault();
            task.set_status(err);
            task.set_eos(true);
            ctx.push_back_scan_task(task);
        }
    })
}
