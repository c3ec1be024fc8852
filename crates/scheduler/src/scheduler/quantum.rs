use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info_span, warn};

use scanflow_core::{ScanError, ScanResult};

use crate::context::ScanContext;
use crate::metrics::SchedulerMetrics;
use crate::task::{RuntimeState, ScanTask, ScannerDelegate, ScannerState, FILE_SCANNER_NAME};
use crate::thread::{self, CpuTimer};

use super::QuantumConfig;

/// Decrements the running-scanner count on every exit path.
struct RunningScanner<'a>(&'a dyn ScanContext);

impl<'a> RunningScanner<'a> {
    fn enter(ctx: &'a dyn ScanContext) -> Self {
        ctx.update_peak_running_scanner(1);
        Self(ctx)
    }
}

impl Drop for RunningScanner<'_> {
    fn drop(&mut self) {
        self.0.update_peak_running_scanner(-1);
    }
}

/// Run one bounded quantum of `task` on the current worker thread.
///
/// Always hands the task back to the context unless the fragment or the
/// scanner disappeared first, in which case it returns silently.
pub(crate) fn scanner_scan(
    ctx: &Arc<dyn ScanContext>,
    task: &Arc<ScanTask>,
    quantum: &QuantumConfig,
    metrics: &SchedulerMetrics,
) {
    let Some(_task_lock) = ctx.task_exec_ctx() else {
        metrics.record_dropped();
        return;
    };

    let _running = RunningScanner::enter(ctx.as_ref());

    let Some(delegate) = task.scanner() else {
        metrics.record_dropped();
        return;
    };

    let state = Arc::clone(ctx.state());
    let _attach = thread::attach_query(state.query_id);
    let span = info_span!(
        "scanner_scan",
        query_id = %state.query_id,
        scanner = delegate.name()
    );
    let _entered = span.enter();

    if ctx.should_reset_thread_name() {
        thread::set_self_name("_scanner_scan");
    }
    if quantum.nice_value != 0 && delegate.name() != FILE_SCANNER_NAME {
        thread::set_thread_nice_value(quantum.nice_value);
    }

    let max_run_time_watch = Instant::now();
    delegate.update_wait_worker_timer();
    let cpu_timer = CpuTimer::start();

    let (status, mut eos) = match panic::catch_unwind(AssertUnwindSafe(|| {
        run_quantum(ctx.as_ref(), task, &delegate, &state, quantum, max_run_time_watch, metrics)
    })) {
        Ok(outcome) => outcome,
        Err(payload) => {
            metrics.record_fault();
            (Err(ScanError::from_panic(payload)), true)
        }
    };

    if let Err(e) = status {
        task.set_status(e);
        eos = true;
    }

    delegate.add_scan_cpu_time(cpu_timer.elapsed());
    metrics.record_quantum();
    if eos {
        delegate.mark_to_need_to_close();
    }
    task.set_eos(eos);
    ctx.push_back_scan_task(Arc::clone(task));
}

/// Lazy open plus the budgeted read loop. Returns the quantum's status and
/// whether the scanner reached end of stream.
fn run_quantum(
    ctx: &dyn ScanContext,
    task: &ScanTask,
    delegate: &ScannerDelegate,
    state: &RuntimeState,
    quantum: &QuantumConfig,
    max_run_time_watch: Instant,
    metrics: &SchedulerMetrics,
) -> (ScanResult<()>, bool) {
    let mut slot = delegate.lock_scanner();
    let mut status: ScanResult<()> = Ok(());
    let mut eos = false;

    if slot.state == ScannerState::Uninitialized {
        match slot.scanner.init() {
            Ok(()) => slot.state = ScannerState::Initialized,
            Err(e) => {
                status = Err(e);
                eos = true;
            }
        }
    }

    if !eos && slot.state == ScannerState::Initialized {
        if let Err(e) = slot.scanner.open(state) {
            status = Err(e);
            eos = true;
        }
        slot.state = ScannerState::Opened;
    }

    if let Err(e) = slot.scanner.try_append_late_arrival_runtime_filter() {
        warn!(error = %e, "Failed to append late arrival runtime filter");
    }

    let raw_bytes_threshold = quantum.row_bytes;
    let batch_size = ctx.batch_size();
    let limit = slot.scanner.limit();
    let mut raw_bytes_read = 0usize;
    let mut first_read = true;

    while !eos && raw_bytes_read < raw_bytes_threshold {
        if ctx.done() {
            eos = true;
            break;
        }
        if max_run_time_watch.elapsed() > quantum.max_run_time {
            break;
        }
        let Some(mut free_block) = ctx.get_free_block(first_read) else {
            break;
        };

        let read = slot.scanner.get_block_after_projects(state, &mut free_block);
        first_read = false;
        match read {
            Ok(reached_end) => eos = reached_end,
            Err(e) => {
                warn!(error = %e, "Scan thread read scanner failed");
                ctx.return_free_block(free_block);
                status = Err(e);
                break;
            }
        }

        // Projection may drop columns, so measure after the read.
        let free_block_bytes = free_block.allocated_bytes();
        raw_bytes_read += free_block_bytes;

        // An empty first block is still cached; later reads merge into it.
        let mut inner = task.lock_inner();
        if let Some((last, last_bytes)) = inner
            .cached_blocks
            .last_mut()
            .filter(|(last, _)| last.rows() + free_block.rows() <= batch_size)
        {
            let block_size = last.allocated_bytes();
            if let Err(e) = last.merge(&free_block) {
                warn!(error = %e, "Block merge failed");
                drop(inner);
                ctx.return_free_block(free_block);
                status = Err(e);
                break;
            }
            let merged_size = last.allocated_bytes();
            *last_bytes = merged_size;
            drop(inner);
            // The free block is done with either way; the pool may keep it.
            ctx.return_free_block(free_block);
            ctx.inc_block_usage(merged_size as i64 - block_size as i64);
            metrics.record_merged();
        } else {
            ctx.inc_block_usage(free_block_bytes as i64);
            inner.cached_blocks.push((free_block, free_block_bytes));
            metrics.record_appended();
        }

        // A small limit is usually satisfied by a few blocks across all
        // scanners; don't keep reading toward the byte threshold. Large
        // limits skip this to avoid many tiny quanta.
        if limit > 0 && (limit as usize) < batch_size {
            break;
        }
    }

    (status, eos)
}
