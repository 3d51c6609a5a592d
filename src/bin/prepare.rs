//! adlytics-prepare - Builds the optimized store from CSV shards.
//!
//! Reads `events_part_*.csv` shards, partitions them by event type and
//! day into compressed columnar files, and materializes the rollup
//! tables the query engine routes to.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use adlytics::ingest::{IngestProfile, run_ingest};
use adlytics::storage::StoreLayout;

/// Builds the optimized columnar store from raw event CSV shards.
#[derive(Parser)]
#[command(name = "adlytics-prepare", about = "Ad-event store preparation", version)]
struct Args {
    /// Input directory containing events_part_*.csv shards.
    #[arg(long)]
    data_dir: PathBuf,

    /// Output directory for the optimized store. Recreated from scratch.
    #[arg(long)]
    optimized_dir: PathBuf,

    /// Number of parallel workers (default: profile-dependent).
    #[arg(long)]
    workers: Option<usize>,

    /// Preparation profile: compression level, in-partition ordering and
    /// rollup coverage.
    #[arg(long, value_enum, default_value_t = ProfileArg::Balanced)]
    profile: ProfileArg,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfileArg {
    /// zstd level 3, all rollups.
    Balanced,
    /// zstd level 3, partitions sorted by timestamp, all rollups.
    Archival,
    /// zstd level 1, essential rollups only, maximum parallelism.
    UltraFast,
}

impl ProfileArg {
    fn to_profile(self) -> IngestProfile {
        match self {
            ProfileArg::Balanced => IngestProfile::balanced(),
            ProfileArg::Archival => IngestProfile::archival(),
            ProfileArg::UltraFast => IngestProfile::ultra_fast(),
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("adlytics={}", level).parse().unwrap())
        .add_directive(format!("adlytics_prepare={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let profile = args.profile.to_profile();
    let workers = args.workers.unwrap_or_else(|| profile.default_workers());

    info!("adlytics-prepare {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: data={}, optimized={}, workers={}, compression=zstd:{}, rollups={}",
        args.data_dir.display(),
        args.optimized_dir.display(),
        workers,
        profile.compression_level,
        profile.rollups.len()
    );

    let layout = StoreLayout::new(&args.optimized_dir);
    let start = Instant::now();

    match run_ingest(&args.data_dir, &layout, &profile, workers) {
        Ok(summary) => {
            info!(
                "Prepared {} partitions from {} shards ({} rows, {} skipped) in {:.2}s",
                summary.partitions,
                summary.shards,
                summary.rows,
                summary.skipped_rows,
                start.elapsed().as_secs_f64()
            );
            info!("Optimized store ready at {}", args.optimized_dir.display());
        }
        Err(e) => {
            error!("Preparation failed: {}", e);
            std::process::exit(1);
        }
    }
}
