use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use scanflow_core::{Column, ScannerConfig, StorageType};
use scanflow_scheduler::{
    memory_schema, ExecEnv, MemoryScanner, RuntimeState, ScanContext, ScanTask, ScannerContext,
    ScannerContextBuilder, ScannerDelegate, ScannerScheduler, TaskExecutionContext,
};

/// Small pools so tests stay cheap and saturation is easy to reach.
pub fn small_config() -> ScannerConfig {
    ScannerConfig {
        scanner_thread_pool_thread_num: 2,
        scanner_thread_pool_queue_size: 64,
        max_remote_scanner_thread_pool_thread_num: 4,
        scanner_min_thread_pool_thread_num: 1,
        remote_scanner_thread_pool_queue_size: 64,
        ..ScannerConfig::default()
    }
}

pub fn started_env(config: ScannerConfig) -> ExecEnv {
    let env = ExecEnv::with_num_cores(config, 2);
    env.init().unwrap();
    env
}

/// A query fragment plus the scan context its scanners report to.
pub struct Query {
    pub fragment: Option<Arc<TaskExecutionContext>>,
    pub ctx: Arc<ScannerContext>,
}

pub fn query(batch_size: usize) -> Query {
    query_with(|b| b.batch_size(batch_size))
}

pub fn query_with(
    configure: impl FnOnce(ScannerContextBuilder) -> ScannerContextBuilder,
) -> Query {
    let fragment = TaskExecutionContext::new(Uuid::new_v4(), 0);
    let builder = ScannerContext::builder(
        RuntimeState::new(fragment.query_id(), 0),
        fragment.handle(),
        memory_schema(),
    );
    Query {
        ctx: configure(builder).build(),
        fragment: Some(fragment),
    }
}

pub fn memory_delegates(
    count: usize,
    rows: usize,
    rows_per_read: usize,
    storage: StorageType,
) -> Vec<Arc<ScannerDelegate>> {
    (0..count)
        .map(|_| {
            let scanner = MemoryScanner::builder(rows)
                .rows_per_read(rows_per_read)
                .storage(storage)
                .build();
            ScannerDelegate::new(Box::new(scanner))
        })
        .collect()
}

pub fn slow_delegate(latency: Duration, storage: StorageType) -> Arc<ScannerDelegate> {
    let scanner = MemoryScanner::builder(1)
        .storage(storage)
        .latency(latency)
        .build();
    ScannerDelegate::new(Box::new(scanner))
}

#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub rows: usize,
    pub blocks: usize,
    /// Sum of the `id` column across every delivered row.
    pub id_sum: i64,
    pub failed: usize,
}

/// Submit one task per delegate and keep resubmitting until every scanner
/// reaches end of stream. Panics if the scan stalls.
pub fn drain(
    scheduler: &ScannerScheduler,
    ctx: &Arc<ScannerContext>,
    delegates: &[Arc<ScannerDelegate>],
) -> DrainOutcome {
    let mut outcome = DrainOutcome::default();
    for delegate in delegates {
        scheduler
            .submit(ctx.clone(), ScanTask::new(delegate))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut active = delegates.len();
    while active > 0 {
        assert!(Instant::now() < deadline, "scan stalled with {active} active scanners");
        let Some(task) = ctx.get_ready_task(Duration::from_millis(50)) else {
            continue;
        };
        for block in ctx.take_blocks(&task) {
            outcome.rows += block.rows();
            outcome.blocks += 1;
            if let Column::Int64(ids) = &block.columns()[0] {
                outcome.id_sum += ids.iter().sum::<i64>();
            }
            ctx.return_free_block(block);
        }
        if task.status().is_err() {
            outcome.failed += 1;
            active -= 1;
        } else if task.is_eos() {
            active -= 1;
        } else {
            scheduler.submit(ctx.clone(), task).unwrap();
        }
    }
    outcome
}

/// Poll until `cond` holds or a few seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
