use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use scanflow_core::config::load_dotenv;
use scanflow_core::{ScannerConfig, StorageType};
use scanflow_scheduler::{
    memory_schema, ExecEnv, ExecutionMode, MemoryScanner, MetricsSnapshot, RuntimeState,
    ScanContext, ScanTask, ScannerContext, ScannerDelegate, TaskExecutionContext,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TokenMode {
    Serial,
    Concurrent,
}

/// Drive in-memory scanners through the scan scheduler and report throughput.
#[derive(Parser, Debug)]
#[command(name = "scan-bench", about = "Scan scheduler benchmark")]
struct Args {
    /// Scanner config TOML (defaults plus env overrides when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scanners reading local storage
    #[arg(long, default_value = "8")]
    local_scanners: usize,

    /// Scanners reading remote storage
    #[arg(long, default_value = "0")]
    remote_scanners: usize,

    /// Rows produced by each scanner
    #[arg(long, default_value = "100000")]
    rows: usize,

    #[arg(long, default_value = "1024")]
    rows_per_read: usize,

    /// Row limit pushed into every scanner (-1 = none)
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    limit: i64,

    /// Simulated storage latency per read
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    #[arg(long, default_value = "4064")]
    batch_size: usize,

    /// Cap on buffered block bytes for the query
    #[arg(long, default_value = "104857600")]
    max_bytes_in_blocks_queue: i64,

    /// Run through a private token on the limited pool
    #[arg(long, value_enum)]
    token: Option<TokenMode>,

    #[arg(long, default_value = "4")]
    token_concurrency: usize,

    /// Abort if the scan has not finished after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct BenchSummary {
    query_id: Uuid,
    scanners: usize,
    failed_scanners: usize,
    rows: usize,
    expected_rows: usize,
    blocks: usize,
    elapsed_ms: u128,
    rows_per_sec: f64,
    peak_running_scanners: i32,
    wait_worker_ms: f64,
    scan_cpu_ms: f64,
    metrics: MetricsSnapshot,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ScannerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ScannerConfig::from_env().context("invalid scanner config from environment")?,
    };

    let env = ExecEnv::new(config);
    env.init().context("failed to start scan scheduler")?;
    let outcome = run(&env, &args);
    env.shutdown();

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed_scanners > 0 {
        bail!("{} scanner(s) failed", summary.failed_scanners);
    }
    Ok(())
}

fn run(env: &ExecEnv, args: &Args) -> Result<BenchSummary> {
    let scheduler = env.scanner_scheduler();
    let fragment = TaskExecutionContext::new(Uuid::new_v4(), 0);

    let mut builder = ScannerContext::builder(
        RuntimeState::new(fragment.query_id(), fragment.fragment_id()),
        fragment.handle(),
        memory_schema(),
    )
    .batch_size(args.batch_size)
    .max_bytes_in_blocks_queue(args.max_bytes_in_blocks_queue)
    .reset_thread_name(true);
    if let Some(mode) = args.token {
        let mode = match mode {
            TokenMode::Serial => ExecutionMode::Serial,
            TokenMode::Concurrent => ExecutionMode::Concurrent,
        };
        let token = scheduler.new_limited_scan_pool_token(mode, args.token_concurrency)?;
        builder = builder.thread_token(token);
    }
    let ctx = builder.build();

    let storages = std::iter::repeat(StorageType::Local)
        .take(args.local_scanners)
        .chain(std::iter::repeat(StorageType::Remote).take(args.remote_scanners));
    let delegates: Vec<Arc<ScannerDelegate>> = storages
        .map(|storage| {
            let mut scanner = MemoryScanner::builder(args.rows)
                .storage(storage)
                .rows_per_read(args.rows_per_read)
                .limit(args.limit);
            if args.latency_ms > 0 {
                scanner = scanner.latency(Duration::from_millis(args.latency_ms));
            }
            ScannerDelegate::new(Box::new(scanner.build()))
        })
        .collect();

    let per_scanner = if args.limit > 0 {
        args.rows.min(args.limit as usize)
    } else {
        args.rows
    };
    info!(
        query_id = %fragment.query_id(),
        scanners = delegates.len(),
        rows_per_scanner = per_scanner,
        "starting scan"
    );

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout_secs);
    let mut active = 0usize;
    let mut failed = 0usize;
    for delegate in &delegates {
        let task = ScanTask::new(delegate);
        match scheduler.submit(ctx.clone(), task) {
            Ok(()) => active += 1,
            Err(e) => {
                warn!(error = %e, "initial submit rejected");
                failed += 1;
            }
        }
    }

    let mut rows = 0usize;
    let mut blocks = 0usize;
    while active > 0 {
        if Instant::now() > deadline {
            ctx.set_done();
            bail!("scan did not finish within {}s", args.timeout_secs);
        }
        let Some(task) = ctx.get_ready_task(Duration::from_millis(100)) else {
            continue;
        };
        for block in ctx.take_blocks(&task) {
            rows += block.rows();
            blocks += 1;
            ctx.return_free_block(block);
        }

        if let Err(e) = task.status() {
            warn!(error = %e, "scanner failed");
            failed += 1;
            active -= 1;
        } else if task.is_eos() {
            active -= 1;
        } else if let Err(e) = scheduler.submit(ctx.clone(), task) {
            warn!(error = %e, "resubmit rejected");
            failed += 1;
            active -= 1;
        }
    }
    let elapsed = started.elapsed();
    ctx.set_done();

    let (wait_ns, cpu_ns) = delegates.iter().fold((0u64, 0u64), |(w, c), d| {
        let counters = d.counters();
        (w + counters.wait_worker_ns, c + counters.scan_cpu_ns)
    });

    Ok(BenchSummary {
        query_id: fragment.query_id(),
        scanners: delegates.len(),
        failed_scanners: failed,
        rows,
        expected_rows: per_scanner * delegates.len(),
        blocks,
        elapsed_ms: elapsed.as_millis(),
        rows_per_sec: rows as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        peak_running_scanners: ctx.peak_running_scanners(),
        wait_worker_ms: wait_ns as f64 / 1e6,
        scan_cpu_ms: cpu_ns as f64 / 1e6,
        metrics: scheduler.metrics().snapshot(),
    })
}
