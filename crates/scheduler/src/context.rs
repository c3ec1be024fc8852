//! Per-fragment scan context: the scheduler's view of a running query.
//!
//! [`ScanContext`] is the seam the scheduler and the quantum executor talk
//! to. [`ScannerContext`] is the in-process implementation: it owns the free
//! block pool, block memory accounting and the ready queue the consumer
//! drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use scanflow_core::{Block, SchemaRef};

use crate::lifetime::{LivenessHandle, TaskExecGuard};
use crate::pool::PoolToken;
use crate::task::{RuntimeState, ScanTask};

const DEFAULT_BATCH_SIZE: usize = 4064;
const DEFAULT_MAX_BYTES_IN_BLOCKS_QUEUE: i64 = 100 * 1024 * 1024;

/// Shared state of one query fragment's scans, as seen by the scheduler.
///
/// Implementations must be safe to call from several workers at once;
/// tasks of the same fragment run concurrently.
pub trait ScanContext: Send + Sync {
    /// The query was cancelled or has finished.
    fn done(&self) -> bool;

    /// Pin the fragment for the current call. `None` means it is gone.
    fn task_exec_ctx(&self) -> Option<TaskExecGuard>;

    /// Private bounded token, when the query wants deterministic parallelism.
    fn thread_token(&self) -> Option<&PoolToken>;

    fn state(&self) -> &Arc<RuntimeState>;

    /// A block to read into. `force` is set for the first request of a
    /// quantum so every quantum can make progress. `None` is backpressure.
    fn get_free_block(&self, force: bool) -> Option<Block>;

    fn return_free_block(&self, block: Block);

    /// Adjust bytes held in cached blocks. May be negative.
    fn inc_block_usage(&self, delta: i64);

    fn batch_size(&self) -> usize;

    /// Hand a task back to the consumer side.
    fn push_back_scan_task(&self, task: Arc<ScanTask>);

    fn update_peak_running_scanner(&self, delta: i32);

    /// Rename the worker thread while it scans for this context.
    fn should_reset_thread_name(&self) -> bool {
        false
    }

    fn debug_string(&self) -> String;
}

// ── ScannerContext ──────────────────────────────────────────────────

/// Builder for [`ScannerContext`].
pub struct ScannerContextBuilder {
    state: Arc<RuntimeState>,
    liveness: LivenessHandle,
    schema: SchemaRef,
    batch_size: usize,
    max_bytes_in_blocks_queue: i64,
    thread_token: Option<PoolToken>,
    reset_thread_name: bool,
}

impl ScannerContextBuilder {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Cap on cached plus free block memory before new blocks are refused.
    pub fn max_bytes_in_blocks_queue(mut self, bytes: i64) -> Self {
        self.max_bytes_in_blocks_queue = bytes;
        self
    }

    pub fn thread_token(mut self, token: PoolToken) -> Self {
        self.thread_token = Some(token);
        self
    }

    pub fn reset_thread_name(mut self, reset: bool) -> Self {
        self.reset_thread_name = reset;
        self
    }

    pub fn build(self) -> Arc<ScannerContext> {
        Arc::new(ScannerContext {
            state: self.state,
            liveness: self.liveness,
            schema: self.schema,
            batch_size: self.batch_size,
            max_bytes_in_blocks_queue: self.max_bytes_in_blocks_queue,
            thread_token: self.thread_token,
            reset_thread_name: self.reset_thread_name,
            done: AtomicBool::new(false),
            free_blocks: Mutex::new(Vec::new()),
            free_blocks_memory_usage: AtomicI64::new(0),
            block_memory_usage: AtomicI64::new(0),
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            num_running_scanners: AtomicI32::new(0),
            peak_running_scanners: AtomicI32::new(0),
        })
    }
}

/// In-process [`ScanContext`] for one fragment.
pub struct ScannerContext {
    state: Arc<RuntimeState>,
    liveness: LivenessHandle,
    schema: SchemaRef,
    batch_size: usize,
    max_bytes_in_blocks_queue: i64,
    thread_token: Option<PoolToken>,
    reset_thread_name: bool,
    done: AtomicBool,
    free_blocks: Mutex<Vec<Block>>,
    free_blocks_memory_usage: AtomicI64,
    /// Bytes held by blocks cached on tasks. Signed: merges can shrink.
    block_memory_usage: AtomicI64,
    ready: Mutex<VecDeque<Arc<ScanTask>>>,
    ready_cv: Condvar,
    num_running_scanners: AtomicI32,
    peak_running_scanners: AtomicI32,
}

impl ScannerContext {
    pub fn builder(
        state: Arc<RuntimeState>,
        liveness: LivenessHandle,
        schema: SchemaRef,
    ) -> ScannerContextBuilder {
        ScannerContextBuilder {
            state,
            liveness,
            schema,
            batch_size: DEFAULT_BATCH_SIZE,
            max_bytes_in_blocks_queue: DEFAULT_MAX_BYTES_IN_BLOCKS_QUEUE,
            thread_token: None,
            reset_thread_name: false,
        }
    }

    /// Mark the query done. Running quanta stop at their next loop check.
    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
        self.ready_cv.notify_all();
    }

    /// Wait up to `timeout` for a task handed back by a worker.
    pub fn get_ready_task(&self, timeout: Duration) -> Option<Arc<ScanTask>> {
        let mut ready = self.ready.lock();
        if ready.is_empty() {
            self.ready_cv.wait_for(&mut ready, timeout);
        }
        ready.pop_front()
    }

    pub fn num_ready_tasks(&self) -> usize {
        self.ready.lock().len()
    }

    /// Drain a task's blocks for the consumer and release their accounting.
    pub fn take_blocks(&self, task: &ScanTask) -> Vec<Block> {
        let blocks = task.take_cached_blocks();
        let charged: usize = blocks.iter().map(|(_, n)| *n).sum();
        self.inc_block_usage(-(charged as i64));
        blocks.into_iter().map(|(b, _)| b).collect()
    }

    pub fn block_memory_usage(&self) -> i64 {
        self.block_memory_usage.load(Ordering::Acquire)
    }

    pub fn free_blocks_memory_usage(&self) -> i64 {
        self.free_blocks_memory_usage.load(Ordering::Acquire)
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.lock().len()
    }

    pub fn num_running_scanners(&self) -> i32 {
        self.num_running_scanners.load(Ordering::Acquire)
    }

    pub fn peak_running_scanners(&self) -> i32 {
        self.peak_running_scanners.load(Ordering::Acquire)
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }
}

impl ScanContext for ScannerContext {
    fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn task_exec_ctx(&self) -> Option<TaskExecGuard> {
        self.liveness.acquire()
    }

    fn thread_token(&self) -> Option<&PoolToken> {
        self.thread_token.as_ref()
    }

    fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    fn get_free_block(&self, force: bool) -> Option<Block> {
        if !force && self.block_memory_usage() >= self.max_bytes_in_blocks_queue {
            return None;
        }
        if let Some(block) = self.free_blocks.lock().pop() {
            self.free_blocks_memory_usage
                .fetch_sub(block.allocated_bytes() as i64, Ordering::AcqRel);
            return Some(block);
        }
        Some(Block::empty(Arc::clone(&self.schema), self.batch_size))
    }

    fn return_free_block(&self, mut block: Block) {
        block.clear_column_data();
        let bytes = block.allocated_bytes() as i64;
        let pooled = self.free_blocks_memory_usage() + self.block_memory_usage();
        if pooled + bytes <= self.max_bytes_in_blocks_queue {
            self.free_blocks_memory_usage
                .fetch_add(bytes, Ordering::AcqRel);
            self.free_blocks.lock().push(block);
        }
    }

    fn inc_block_usage(&self, delta: i64) {
        self.block_memory_usage.fetch_add(delta, Ordering::AcqRel);
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn push_back_scan_task(&self, task: Arc<ScanTask>) {
        self.ready.lock().push_back(task);
        self.ready_cv.notify_one();
    }

    fn update_peak_running_scanner(&self, delta: i32) {
        let now = self.num_running_scanners.fetch_add(delta, Ordering::AcqRel) + delta;
        if delta > 0 {
            self.peak_running_scanners.fetch_max(now, Ordering::AcqRel);
        }
    }

    fn should_reset_thread_name(&self) -> bool {
        self.reset_thread_name
    }

    fn debug_string(&self) -> String {
        format!(
            "ScannerContext(query_id={}, fragment={}, done={}, running={}, ready={}, block_usage={})",
            self.state.query_id,
            self.state.fragment_id,
            self.done(),
            self.num_running_scanners(),
            self.num_ready_tasks(),
            self.block_memory_usage()
        )
    }
}
