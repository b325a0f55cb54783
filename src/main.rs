//! blockcache soak tool
//!
//! Opens a cache, hammers it with a mixed put/get/delete workload from
//! several threads, optionally forces maintenance passes and prints the
//! resulting statistics.
//!
//! ```text
//! blockcache --dir /tmp/bc --mode offheap --threads 8 --ops 200000 --purge --merge
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockcache::{BlockCache, CacheConfig, CacheStats, StorageMode};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Exercise a block cache and report its statistics
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache data directory (wiped on start)
    #[arg(long, env = "BLOCKCACHE_DIR", default_value = "./blockcache-data")]
    dir: PathBuf,

    /// JSON configuration file; flags below override its values
    #[arg(long, env = "BLOCKCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage mode (file, mmap, offheap)
    #[arg(long, env = "BLOCKCACHE_MODE")]
    mode: Option<StorageMode>,

    /// Block capacity in MiB
    #[arg(long, env = "BLOCKCACHE_BLOCK_MB")]
    block_mb: Option<u32>,

    /// Blocks allocated up front
    #[arg(long, env = "BLOCKCACHE_INITIAL_BLOCKS")]
    initial_blocks: Option<u32>,

    /// Stripe lock bit width (0-11)
    #[arg(long, env = "BLOCKCACHE_CONCURRENCY_LEVEL")]
    concurrency_level: Option<u8>,

    /// Off-heap / mmap budget in MiB
    #[arg(long, env = "BLOCKCACHE_OFFHEAP_MB")]
    offheap_mb: Option<u64>,

    /// Purge interval in milliseconds
    #[arg(long, env = "BLOCKCACHE_PURGE_INTERVAL_MS")]
    purge_interval_ms: Option<u64>,

    /// Merge interval in milliseconds
    #[arg(long, env = "BLOCKCACHE_MERGE_INTERVAL_MS")]
    merge_interval_ms: Option<u64>,

    /// Dirty ratio above which blocks are compacted
    #[arg(long, env = "BLOCKCACHE_DIRTY_RATIO")]
    dirty_ratio: Option<f64>,

    /// Worker threads
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Operations per thread
    #[arg(long, default_value = "100000")]
    ops: usize,

    /// Distinct keys
    #[arg(long, default_value = "10000")]
    keys: usize,

    /// Value size in bytes
    #[arg(long, default_value = "1024")]
    value_size: usize,

    /// Idle timeout for stored values in milliseconds (0 = never)
    #[arg(long, default_value = "0")]
    tti_ms: u64,

    /// Force a purge pass after the workload
    #[arg(long)]
    purge: bool,

    /// Force a merge pass after the workload
    #[arg(long)]
    merge: bool,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = build_config(&args)?;
    info!(
        dir = %args.dir.display(),
        mode = %config.storage_mode,
        threads = args.threads,
        ops = args.ops,
        "Starting blockcache soak"
    );

    let cache: Arc<BlockCache<u64>> = Arc::new(
        BlockCache::open(&args.dir, config)
            .with_context(|| format!("opening cache in {}", args.dir.display()))?,
    );

    let started = Instant::now();
    let before = cache.stats();
    run_workload(&cache, &args)?;
    let elapsed = started.elapsed();

    if args.purge {
        let report = cache.run_purge().context("purge pass")?;
        info!(removed = report.removed, reclaimed = report.reclaimed_blocks, "Forced purge");
    }
    if args.merge {
        let report = cache.run_merge().context("merge pass")?;
        info!(relocated = report.relocated, reclaimed = report.reclaimed_blocks, "Forced merge");
    }

    let stats = cache.stats().delta(&before);
    print_stats(&stats, elapsed, args.json)?;

    cache.close().context("closing cache")?;
    Ok(())
}

fn build_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            CacheConfig::from_json_str(&raw)?
        }
        None => CacheConfig::default(),
    };

    if let Some(mode) = args.mode {
        config = config.with_storage_mode(mode);
    }
    if let Some(mb) = args.block_mb {
        config = config.with_capacity_per_block(mb.saturating_mul(1024 * 1024))?;
    }
    if let Some(blocks) = args.initial_blocks {
        config = config.with_initial_block_count(blocks)?;
    }
    if let Some(level) = args.concurrency_level {
        config = config.with_concurrency_level(level)?;
    }
    if let Some(mb) = args.offheap_mb {
        config = config.with_max_offheap_bytes(mb.saturating_mul(1024 * 1024))?;
    }
    if let Some(ms) = args.purge_interval_ms {
        config = config.with_purge_interval(Duration::from_millis(ms))?;
    }
    if let Some(ms) = args.merge_interval_ms {
        config = config.with_merge_interval(Duration::from_millis(ms))?;
    }
    if let Some(ratio) = args.dirty_ratio {
        config = config.with_dirty_ratio_threshold(ratio)?;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Workload
// =============================================================================

/// 60% gets, 30% puts, 10% deletes over a fixed key space
fn run_workload(cache: &Arc<BlockCache<u64>>, args: &Args) -> Result<()> {
    let keys = args.keys.max(1) as u64;
    let tti = (args.tti_ms > 0).then(|| Duration::from_millis(args.tti_ms));

    let handles: Vec<_> = (0..args.threads.max(1))
        .map(|t| {
            let cache = Arc::clone(cache);
            let ops = args.ops;
            let value_size = args.value_size;
            thread::Builder::new()
                .name(format!("soak-{t}"))
                .spawn(move || -> blockcache::Result<()> {
                    let mut rng = XorShift::new(t as u64 + 1);
                    let value = vec![t as u8; value_size];
                    for _ in 0..ops {
                        let key = rng.next() % keys;
                        match rng.next() % 10 {
                            0..=5 => {
                                cache.get(&key)?;
                            }
                            6..=8 => match tti {
                                Some(tti) => cache.put_with_idle(key, &value, tti)?,
                                None => cache.put(key, &value)?,
                            },
                            _ => {
                                cache.delete(&key)?;
                            }
                        }
                    }
                    Ok(())
                })
        })
        .collect::<std::io::Result<_>>()?;

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("workload thread panicked"))??;
    }
    Ok(())
}

/// Small deterministic PRNG for key selection
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn print_stats(stats: &CacheStats, elapsed: Duration, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    let ops = stats.gets + stats.puts + stats.deletes;
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("elapsed: {:.3}s ({:.0} ops/s)", secs, ops as f64 / secs);
    println!("{stats}");
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
