//! poolfs benchmark - file creation throughput
//!
//! Spawns a number of threads that create files in the root directory until
//! the deadline, printing the number of files created every second.

use anyhow::{Context, Result, bail};
use clap::Parser;
use poolfs_common::{Config, PoolConfig, PoolKind};
use poolfs_namespace::Filesystem;
use poolfs_store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LINES_PER_HEADER: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "poolfs-bench")]
#[command(about = "Measure file creation throughput of a poolfs namespace")]
#[command(version)]
struct Args {
    /// Duration of the benchmark in seconds
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    duration: u64,

    /// Number of concurrent threads
    #[arg(default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    num_threads: u64,

    /// Configuration file path
    #[arg(long, env = "POOLFS_BENCHMARK_CONF")]
    conf: Option<PathBuf>,

    /// Log filter (overrides namespace.log_level)
    #[arg(long)]
    log_level: Option<String>,

    /// Capacity of each in-memory pool in bytes
    #[arg(long, default_value = "17179869184")]
    pool_capacity: u64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

/// What one worker observed
#[derive(Debug, Clone, Copy)]
struct WorkerStats {
    created: u64,
    failed: u64,
    min_creation: Duration,
    max_creation: Duration,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            created: 0,
            failed: 0,
            min_creation: Duration::MAX,
            max_creation: Duration::ZERO,
        }
    }
}

impl WorkerStats {
    fn record(&mut self, elapsed: Duration) {
        self.created += 1;
        self.min_creation = self.min_creation.min(elapsed);
        self.max_creation = self.max_creation.max(elapsed);
    }

    fn merge(&mut self, other: &Self) {
        self.created += other.created;
        self.failed += other.failed;
        self.min_creation = self.min_creation.min(other.min_creation);
        self.max_creation = self.max_creation.max(other.max_creation);
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.conf {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if config.pools.is_empty() {
        config.pools = vec![
            PoolConfig {
                kind: PoolKind::Metadata,
                name: "meta".into(),
                prefix: "/".into(),
                quota: 0,
            },
            PoolConfig {
                kind: PoolKind::Data,
                name: "data".into(),
                prefix: "/".into(),
                quota: 0,
            },
        ];
    }
    Ok(config)
}

fn build_filesystem(config: &Config, pool_capacity: u64) -> Result<Filesystem> {
    let store = Arc::new(MemoryStore::new());
    let mut names: Vec<&str> = config.pools.iter().map(|pool| pool.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    for name in names {
        store
            .create_pool(name, pool_capacity)
            .with_context(|| format!("failed to create pool {name}"))?;
    }
    Filesystem::from_config(store, config).context("failed to set up the namespace")
}

fn create_files(
    fs: &Filesystem,
    thread_id: u64,
    stop: &AtomicBool,
    counter: &AtomicU64,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let mut i = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let path = format!("/t{thread_id}-{i}");
        i += 1;

        let started = Instant::now();
        match fs.create(&path) {
            Ok(()) => {
                stats.record(started.elapsed());
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed += 1;
                warn!("Problem in thread {}: {}", thread_id, e);
            }
        }
    }
    stats
}

fn print_header() {
    println!(
        "\n{:>4} | {:>10} | {:>10} | {:>12}",
        "sec", "# files", "files/sec", "files/thread"
    );
}

#[allow(clippy::cast_precision_loss)]
fn run(fs: &Filesystem, duration: u64, num_threads: u64) -> Result<(u64, WorkerStats)> {
    let stop = AtomicBool::new(false);
    let counter = AtomicU64::new(0);

    let workers = thread::scope(|s| {
        let handles: Vec<_> = (0..num_threads)
            .map(|id| {
                let (stop, counter) = (&stop, &counter);
                s.spawn(move || create_files(fs, id, stop, counter))
            })
            .collect();

        let start = Instant::now();
        let mut previous = 0u64;
        for sec in 0..duration {
            if sec % LINES_PER_HEADER == 0 {
                print_header();
            }
            let tick = start + Duration::from_secs(sec + 1);
            thread::sleep(tick.saturating_duration_since(Instant::now()));

            let current = counter.load(Ordering::Relaxed);
            let created = current - previous;
            println!(
                "{:>4} | {:>10} | {:>10} | {:>12.2}",
                sec + 1,
                current,
                created,
                created as f64 / num_threads as f64
            );
            previous = current;
        }
        stop.store(true, Ordering::Relaxed);

        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    let mut total = WorkerStats::default();
    for (id, worker) in workers.into_iter().enumerate() {
        match worker {
            Ok(stats) => total.merge(&stats),
            Err(_) => bail!("benchmark thread {id} panicked"),
        }
    }
    Ok((counter.load(Ordering::Relaxed), total))
}

#[allow(clippy::cast_precision_loss)]
fn print_summary(files: u64, stats: &WorkerStats, args: &Args) {
    let per_sec = files as f64 / args.duration as f64;
    let per_thread = per_sec / args.num_threads as f64;
    let min = if stats.created == 0 { Duration::ZERO } else { stats.min_creation };

    if args.json {
        let summary = serde_json::json!({
            "duration_secs": args.duration,
            "threads": args.num_threads,
            "files": files,
            "failed": stats.failed,
            "files_per_sec": per_sec,
            "files_per_thread": per_thread,
            "min_creation_secs": min.as_secs_f64(),
            "max_creation_secs": stats.max_creation.as_secs_f64(),
        });
        println!("{summary:#}");
        return;
    }

    println!("\nResult:\n");
    println!("\tNumber of files:      {files:>10}");
    println!("\tFailed creations:     {:>10}", stats.failed);
    println!("\tAverage files/sec:    {per_sec:>10.2}");
    println!("\tAverage files/thread: {per_thread:>10.2}");
    println!("\tMin creation time:    {:>10.6} sec", min.as_secs_f64());
    println!("\tMax creation time:    {:>10.6} sec", stats.max_creation.as_secs_f64());
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.namespace.log_level.as_filter().to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let fs = build_filesystem(&config, args.pool_capacity)?;
    info!(
        "Running for {} seconds with {} threads on pools {:?}",
        args.duration,
        args.num_threads,
        fs.all_pools_in_cluster()?
    );
    eprintln!(
        "\n*** poolfs benchmark ***\n\nRunning for {} seconds with {} threads...",
        args.duration, args.num_threads
    );

    let (files, stats) = run(&fs, args.duration, args.num_threads)?;
    print_summary(files, &stats, &args);
    Ok(())
}
