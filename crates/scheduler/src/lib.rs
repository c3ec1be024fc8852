pub mod context;
pub mod env;
pub mod lifetime;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod task;
pub mod thread;

pub use context::{ScanContext, ScannerContext, ScannerContextBuilder};
pub use env::ExecEnv;
pub use lifetime::{LivenessHandle, TaskExecGuard, TaskExecutionContext};
pub use memory::{memory_schema, MemoryScanner, MemoryScannerBuilder};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use pool::{ExecutionMode, Job, PoolToken, WorkerPool, WorkerPoolBuilder};
pub use scheduler::{
    QuantumConfig, ScannerScheduler, LIMITED_SCAN_POOL, LOCAL_SCAN_POOL, REMOTE_SCAN_POOL,
};
pub use task::{
    RuntimeState, ScanTask, Scanner, ScannerCountersSnapshot, ScannerDelegate, ScannerState,
    FILE_SCANNER_NAME,
};
