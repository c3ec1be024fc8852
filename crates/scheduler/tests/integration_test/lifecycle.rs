use std::time::Duration;

use scanflow_core::{ScannerConfig, StorageType};
use scanflow_scheduler::{ExecEnv, ScanTask};

use crate::helpers::{memory_delegates, query, slow_delegate, small_config, started_env};

#[test]
fn test_env_lifecycle() {
    let env = ExecEnv::with_num_cores(small_config(), 2);
    assert!(!env.scanner_scheduler().is_initialized());
    // Stopping before init does nothing.
    env.shutdown();
    assert!(!env.scanner_scheduler().is_closed());

    env.init().unwrap();
    assert_eq!(env.scanner_scheduler().local_pool().unwrap().num_threads(), 2);
    assert!(env.init().is_err());

    env.shutdown();
    env.shutdown();
    assert!(env.scanner_scheduler().is_closed());
}

#[test]
fn test_submit_after_shutdown_is_rejected() {
    let env = started_env(small_config());
    env.shutdown();

    let q = query(1024);
    let delegates = memory_delegates(1, 10, 10, StorageType::Local);
    let task = ScanTask::new(&delegates[0]);

    let err = env
        .scanner_scheduler()
        .submit(q.ctx.clone(), task.clone())
        .unwrap_err();
    assert!(err.is_too_many_tasks());
    assert!(err.to_string().ends_with("|type:local"), "got {err}");
    assert_eq!(task.status(), Err(err));
}

#[test]
fn test_submit_after_query_done_is_dropped() {
    let env = started_env(small_config());
    let q = query(1024);
    let delegates = memory_delegates(1, 10, 10, StorageType::Remote);
    q.ctx.set_done();

    env.scanner_scheduler()
        .submit(q.ctx.clone(), ScanTask::new(&delegates[0]))
        .unwrap();
    env.shutdown();

    assert_eq!(q.ctx.num_ready_tasks(), 0);
    let m = env.scanner_scheduler().metrics().snapshot();
    assert_eq!(m.submitted, 0);
    assert_eq!(m.dropped, 1);
}

#[test]
fn test_fragment_teardown_drops_queued_quanta() {
    let config = ScannerConfig {
        scanner_thread_pool_thread_num: 1,
        ..small_config()
    };
    let env = started_env(config);
    let mut q = query(1024);
    let scheduler = env.scanner_scheduler();

    let slow = slow_delegate(Duration::from_millis(200), StorageType::Local);
    scheduler.submit(q.ctx.clone(), ScanTask::new(&slow)).unwrap();
    let queued = memory_delegates(2, 10, 10, StorageType::Local);
    for delegate in &queued {
        scheduler.submit(q.ctx.clone(), ScanTask::new(delegate)).unwrap();
    }

    // The query finishes while two quanta still wait behind the slow one.
    q.fragment.take();
    env.shutdown();

    assert!(q.ctx.num_ready_tasks() <= 1);
    assert!(scheduler.metrics().snapshot().dropped >= 2);
    for delegate in &queued {
        assert_eq!(delegate.counters().quanta, 0);
    }
}

#[test]
fn test_stop_drains_running_scans() {
    let env = started_env(small_config());
    let q = query(1024);
    let delegates = memory_delegates(6, 500, 50, StorageType::Remote);
    for delegate in &delegates {
        env.scanner_scheduler()
            .submit(q.ctx.clone(), ScanTask::new(delegate))
            .unwrap();
    }

    env.shutdown();

    assert_eq!(q.ctx.num_ready_tasks(), delegates.len());
    assert_eq!(q.ctx.num_running_scanners(), 0);
}

#[test]
fn test_cancelled_scan_returns_with_eos() {
    let env = started_env(small_config());
    let q = query(1024);
    let slow = slow_delegate(Duration::from_millis(50), StorageType::Local);
    let task = ScanTask::new(&slow);
    env.scanner_scheduler()
        .submit(q.ctx.clone(), task.clone())
        .unwrap();

    // Cancel after the worker has picked the quantum up.
    std::thread::sleep(Duration::from_millis(10));
    q.ctx.set_done();

    let back = q.ctx.get_ready_task(Duration::from_secs(5)).unwrap();
    assert!(back.is_eos());
    assert!(back.status().is_ok());
    env.shutdown();
}
