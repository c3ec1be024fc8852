use std::time::Duration;

use scanflow_core::{ScannerConfig, StorageType};
use scanflow_scheduler::ScanTask;

use crate::helpers::{memory_delegates, query, slow_delegate, small_config, started_env, wait_until};

fn saturating_config() -> ScannerConfig {
    ScannerConfig {
        scanner_thread_pool_thread_num: 1,
        scanner_thread_pool_queue_size: 1,
        max_remote_scanner_thread_pool_thread_num: 1,
        scanner_min_thread_pool_thread_num: 1,
        remote_scanner_thread_pool_queue_size: 1,
        ..ScannerConfig::default()
    }
}

fn assert_saturates(storage: StorageType, suffix: &str) {
    let env = started_env(saturating_config());
    let scheduler = env.scanner_scheduler();
    let pool = match storage {
        StorageType::Local => scheduler.local_pool().unwrap(),
        StorageType::Remote => scheduler.remote_pool().unwrap(),
    };
    let q = query(1024);

    let slow = slow_delegate(Duration::from_millis(300), storage);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&slow)).unwrap();
    assert!(wait_until(|| pool.active_threads() == 1));

    let rest = memory_delegates(2, 10, 10, storage);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&rest[0])).unwrap();

    let rejected = ScanTask::new(&rest[1]);
    let err = scheduler.submit(q.ctx.clone(), rejected.clone()).unwrap_err();
    assert!(err.is_too_many_tasks());
    assert!(err.to_string().contains(suffix), "got {err}");
    assert!(err.to_string().contains("queue is full"), "got {err}");
    assert_eq!(rejected.status(), Err(err));

    env.shutdown();
    let m = scheduler.metrics().snapshot();
    assert_eq!(m.submitted, 2);
    assert_eq!(m.rejected, 1);
    assert_eq!(q.ctx.num_ready_tasks(), 2);
}

#[test]
fn test_local_pool_backpressure() {
    assert_saturates(StorageType::Local, "|type:local");
}

#[test]
fn test_remote_pool_backpressure() {
    assert_saturates(StorageType::Remote, "|type:remote");
}

#[test]
fn test_saturated_local_pool_leaves_remote_open() {
    let env = started_env(saturating_config());
    let scheduler = env.scanner_scheduler();
    let q = query(1024);

    let slow = slow_delegate(Duration::from_millis(300), StorageType::Local);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&slow)).unwrap();
    let locals = memory_delegates(1, 10, 10, StorageType::Local);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&locals[0])).unwrap();

    let remote = memory_delegates(1, 10, 10, StorageType::Remote);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&remote[0])).unwrap();
    let back = q.ctx.get_ready_task(Duration::from_secs(5)).unwrap();
    assert!(back.is_eos());
    assert_eq!(back.scanner().unwrap().storage_type(), StorageType::Remote);

    env.shutdown();
}

#[test]
fn test_remote_pool_grows_under_load() {
    let env = started_env(small_config());
    let scheduler = env.scanner_scheduler();
    let remote = scheduler.remote_pool().unwrap();
    assert_eq!(remote.num_threads(), 1);

    let q = query(1024);
    let slow: Vec<_> = (0..4)
        .map(|_| slow_delegate(Duration::from_millis(100), StorageType::Remote))
        .collect();
    for delegate in &slow {
        scheduler.submit(q.ctx.clone(), ScanTask::new(delegate)).unwrap();
    }

    assert!(remote.num_threads() > 1);
    assert!(remote.num_threads() <= remote.max_threads());
    env.shutdown();
    assert_eq!(q.ctx.num_ready_tasks(), 4);
}

#[test]
fn test_remote_burst_fills_threads_before_rejecting() {
    let config = ScannerConfig {
        max_remote_scanner_thread_pool_thread_num: 4,
        scanner_min_thread_pool_thread_num: 1,
        remote_scanner_thread_pool_queue_size: 1,
        ..small_config()
    };
    let env = started_env(config);
    let scheduler = env.scanner_scheduler();
    let q = query(1024);

    // Four threads plus one queue slot take five scans submitted back to back.
    let slow: Vec<_> = (0..6)
        .map(|_| slow_delegate(Duration::from_millis(300), StorageType::Remote))
        .collect();
    for delegate in &slow[..5] {
        scheduler.submit(q.ctx.clone(), ScanTask::new(delegate)).unwrap();
    }
    let err = scheduler
        .submit(q.ctx.clone(), ScanTask::new(&slow[5]))
        .unwrap_err();
    assert!(err.is_too_many_tasks());
    assert!(err.to_string().ends_with("|type:remote"), "got {err}");

    env.shutdown();
    assert_eq!(q.ctx.num_ready_tasks(), 5);
    assert_eq!(scheduler.metrics().snapshot().rejected, 1);
}
