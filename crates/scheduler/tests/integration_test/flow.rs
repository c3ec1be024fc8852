use std::time::Duration;

use scanflow_core::{ScannerConfig, StorageType};
use scanflow_scheduler::{ExecutionMode, MemoryScanner, ScannerDelegate};

use crate::helpers::{drain, memory_delegates, query, query_with, small_config, started_env};

fn id_sum(rows: usize) -> i64 {
    let n = rows as i64;
    n * (n - 1) / 2
}

#[test]
fn test_every_row_delivered_once() {
    let env = started_env(small_config());
    let q = query(4064);
    let mut delegates = memory_delegates(4, 10_000, 512, StorageType::Local);
    delegates.extend(memory_delegates(4, 10_000, 512, StorageType::Remote));

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.failed, 0);
    assert_eq!(out.rows, 80_000);
    assert_eq!(out.id_sum, 8 * id_sum(10_000));
    assert_eq!(q.ctx.block_memory_usage(), 0);
    // 512-row reads merge into batches of up to 4064 rows.
    assert!(out.blocks < 80_000 / 512, "blocks were not merged: {}", out.blocks);

    env.shutdown();
    let m = env.scanner_scheduler().metrics().snapshot();
    assert_eq!(m.rejected, 0);
    assert!(m.blocks_merged > 0);
}

#[test]
fn test_tiny_byte_budget_takes_many_quanta() {
    let config = ScannerConfig {
        scanner_row_bytes: 1,
        ..small_config()
    };
    let env = started_env(config);
    let q = query(4064);
    let delegates = memory_delegates(1, 1_000, 100, StorageType::Local);

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.rows, 1_000);
    let counters = delegates[0].counters();
    assert!(counters.quanta >= 10, "only {} quanta", counters.quanta);
    env.shutdown();
}

#[test]
fn test_small_limit_is_respected() {
    let env = started_env(small_config());
    let q = query(4064);
    let delegates: Vec<_> = (0..3)
        .map(|_| {
            let scanner = MemoryScanner::builder(100_000)
                .rows_per_read(4)
                .limit(10)
                .build();
            ScannerDelegate::new(Box::new(scanner))
        })
        .collect();

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.rows, 30);
    assert_eq!(out.id_sum, 3 * id_sum(10));
    // A limit below the batch size ends each quantum after one read.
    assert!(delegates[0].counters().quanta >= 3);
    env.shutdown();
}

#[test]
fn test_serial_token_runs_one_quantum_at_a_time() {
    let env = started_env(small_config());
    let token = env
        .scanner_scheduler()
        .new_limited_scan_pool_token(ExecutionMode::Serial, 4)
        .unwrap();
    let q = query_with(|b| b.batch_size(256).thread_token(token));
    let delegates = memory_delegates(4, 2_000, 128, StorageType::Remote);

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.rows, 8_000);
    assert_eq!(q.ctx.peak_running_scanners(), 1);
    drop(q);
    env.shutdown();
}

#[test]
fn test_concurrent_token_caps_parallelism() {
    let config = ScannerConfig {
        scanner_thread_pool_thread_num: 4,
        ..small_config()
    };
    let env = started_env(config);
    let token = env
        .scanner_scheduler()
        .new_limited_scan_pool_token(ExecutionMode::Concurrent, 2)
        .unwrap();
    let q = query_with(|b| b.batch_size(64).thread_token(token));
    let delegates: Vec<_> = (0..6)
        .map(|_| {
            let scanner = MemoryScanner::builder(64)
                .rows_per_read(16)
                .latency(Duration::from_millis(2))
                .build();
            ScannerDelegate::new(Box::new(scanner))
        })
        .collect();

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.rows, 6 * 64);
    assert!(q.ctx.peak_running_scanners() <= 2);
    drop(q);
    env.shutdown();
}

#[test]
fn test_memory_cap_still_makes_progress() {
    let env = started_env(small_config());
    let q = query_with(|b| b.batch_size(4064).max_bytes_in_blocks_queue(1));
    let delegates = memory_delegates(2, 2_000, 100, StorageType::Local);

    let out = drain(env.scanner_scheduler(), &q.ctx, &delegates);

    assert_eq!(out.rows, 4_000);
    // Only the forced first block is granted per quantum.
    assert!(delegates[0].counters().quanta >= 20);
    assert_eq!(q.ctx.num_free_blocks(), 0);
    env.shutdown();
}
