use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use uuid::Uuid;

use scanflow_core::{Block, ScanError, ScanResult, StorageType};

/// Name reported by the streaming file scanner. Scans with this name keep
/// their thread's default priority because they often feed writes.
pub const FILE_SCANNER_NAME: &str = "FileScanner";

/// Query-level state handed to scanners when they open and read.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub query_id: Uuid,
    pub fragment_id: u32,
}

impl RuntimeState {
    pub fn new(query_id: Uuid, fragment_id: u32) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            fragment_id,
        })
    }
}

/// A scan operator: reads rows from some storage into blocks.
///
/// The scheduler drives it through `init` → `open` → repeated
/// `get_block_after_projects` calls. Calls are never concurrent.
pub trait Scanner: Send {
    /// Operator name, used for logging and thread policy.
    fn name(&self) -> &str;

    fn storage_type(&self) -> StorageType;

    fn init(&mut self) -> ScanResult<()>;

    fn open(&mut self, state: &RuntimeState) -> ScanResult<()>;

    /// Apply runtime filters that arrived after the scan started.
    fn try_append_late_arrival_runtime_filter(&mut self) -> ScanResult<()> {
        Ok(())
    }

    /// Fill `block` with the next projected rows. Returns `true` at end of stream.
    fn get_block_after_projects(
        &mut self,
        state: &RuntimeState,
        block: &mut Block,
    ) -> ScanResult<bool>;

    /// Row limit pushed into the scan. 0 or negative means none.
    fn limit(&self) -> i64 {
        -1
    }
}

/// Where a scanner is in its lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ScannerState {
    Uninitialized,
    Initialized,
    Opened,
    Closing,
}

pub(crate) struct ScannerSlot {
    pub(crate) scanner: Box<dyn Scanner>,
    pub(crate) state: ScannerState,
}

/// Timing and progress counters kept per scanner.
#[derive(Debug, Default)]
pub struct ScannerCounters {
    wait_worker_ns: AtomicU64,
    scan_cpu_ns: AtomicU64,
    quanta: AtomicU64,
    wait_started: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`ScannerCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScannerCountersSnapshot {
    pub wait_worker_ns: u64,
    pub scan_cpu_ns: u64,
    pub quanta: u64,
}

/// Shared, reference-counted owner of a scan operator.
///
/// The fragment holds the strong reference; [`ScanTask`]s only hold a weak
/// one so cancelling a query can tear the operator down while tasks that
/// mention it are still queued.
pub struct ScannerDelegate {
    name: String,
    storage_type: StorageType,
    slot: Mutex<ScannerSlot>,
    counters: ScannerCounters,
}

impl ScannerDelegate {
    pub fn new(scanner: Box<dyn Scanner>) -> Arc<Self> {
        Arc::new(Self {
            name: scanner.name().to_string(),
            storage_type: scanner.storage_type(),
            slot: Mutex::new(ScannerSlot {
                scanner,
                state: ScannerState::Uninitialized,
            }),
            counters: ScannerCounters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn state(&self) -> ScannerState {
        self.slot.lock().state
    }

    pub(crate) fn lock_scanner(&self) -> MutexGuard<'_, ScannerSlot> {
        self.slot.lock()
    }

    /// Start timing how long the scanner waits for a worker thread.
    pub fn start_wait_worker_timer(&self) {
        *self.counters.wait_started.lock() = Some(Instant::now());
    }

    /// Stop the wait timer started at submission, if any.
    pub fn update_wait_worker_timer(&self) {
        if let Some(started) = self.counters.wait_started.lock().take() {
            self.counters
                .wait_worker_ns
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub fn add_scan_cpu_time(&self, elapsed: Duration) {
        self.counters
            .scan_cpu_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.counters.quanta.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand the scanner over to its owner for closing.
    pub fn mark_to_need_to_close(&self) {
        self.slot.lock().state = ScannerState::Closing;
    }

    pub fn need_to_close(&self) -> bool {
        self.state() == ScannerState::Closing
    }

    pub fn counters(&self) -> ScannerCountersSnapshot {
        ScannerCountersSnapshot {
            wait_worker_ns: self.counters.wait_worker_ns.load(Ordering::Relaxed),
            scan_cpu_ns: self.counters.scan_cpu_ns.load(Ordering::Relaxed),
            quanta: self.counters.quanta.load(Ordering::Relaxed),
        }
    }
}

// ── ScanTask ────────────────────────────────────────────────────────

pub(crate) struct ScanTaskInner {
    /// Blocks produced so far with the byte size charged for each.
    pub(crate) cached_blocks: Vec<(Block, usize)>,
    pub(crate) status: Option<ScanError>,
    pub(crate) eos: bool,
}

/// One schedulable slice of scan work.
///
/// A task is queued for execution, running on one worker, or waiting for
/// the consumer; never more than one of these at once.
pub struct ScanTask {
    scanner: Weak<ScannerDelegate>,
    inner: Mutex<ScanTaskInner>,
}

impl ScanTask {
    pub fn new(scanner: &Arc<ScannerDelegate>) -> Arc<Self> {
        Arc::new(Self {
            scanner: Arc::downgrade(scanner),
            inner: Mutex::new(ScanTaskInner {
                cached_blocks: Vec::new(),
                status: None,
                eos: false,
            }),
        })
    }

    /// Upgrade to the scanner. `None` means the operator was torn down.
    pub fn scanner(&self) -> Option<Arc<ScannerDelegate>> {
        self.scanner.upgrade()
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ScanTaskInner> {
        self.inner.lock()
    }

    pub fn set_status(&self, status: ScanError) {
        self.inner.lock().status = Some(status);
    }

    pub fn status(&self) -> ScanResult<()> {
        match &self.inner.lock().status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn set_eos(&self, eos: bool) {
        self.inner.lock().eos = eos;
    }

    pub fn is_eos(&self) -> bool {
        self.inner.lock().eos
    }

    pub fn cached_block_count(&self) -> usize {
        self.inner.lock().cached_blocks.len()
    }

    pub fn cached_rows(&self) -> usize {
        self.inner
            .lock()
            .cached_blocks
            .iter()
            .map(|(b, _)| b.rows())
            .sum()
    }

    /// Bytes charged to the context for the blocks this task holds.
    pub fn cached_bytes(&self) -> usize {
        self.inner.lock().cached_blocks.iter().map(|(_, n)| *n).sum()
    }

    /// Remove and return every cached block with its charged size.
    pub fn take_cached_blocks(&self) -> Vec<(Block, usize)> {
        std::mem::take(&mut self.inner.lock().cached_blocks)
    }
}
