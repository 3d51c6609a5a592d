//! Parallel ingest: CSV shards in, partitioned columnar store plus
//! rollups out.
//!
//! Shards are processed by a pool of workers, each writing to a private
//! `temp/worker_<W>/` subtree; a single coordinator then merges the
//! worker-private partition files, builds the rollups and writes the
//! store statistics. No stage holds more than one shard or one
//! `(type, day)` group in memory.

pub mod rollup;
pub mod shard;

pub use rollup::RollupKind;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::storage::model::EventType;
use crate::storage::{
    Column, ColumnData, ColumnarReader, DATA_EXT, StoreLayout, Table, write_table,
};

/// Worker-count policy of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPolicy {
    /// Caps workers to protect peak memory: `min(6, ceil(0.75 * cores))`.
    Conservative,
    /// Maximizes throughput: `min(10, cores)`.
    Speed,
}

/// Tunable knobs of the ingest pipeline. The presets trade compression,
/// in-partition ordering and rollup coverage against wall-clock time.
#[derive(Debug, Clone)]
pub struct IngestProfile {
    pub compression_level: i32,
    pub sort_within_partition: bool,
    pub rollups: Vec<RollupKind>,
    pub workers: WorkerPolicy,
}

impl IngestProfile {
    /// zstd level 3, unsorted partitions, every rollup.
    pub fn balanced() -> Self {
        Self {
            compression_level: 3,
            sort_within_partition: false,
            rollups: RollupKind::ALL.to_vec(),
            workers: WorkerPolicy::Conservative,
        }
    }

    /// Like `balanced`, plus rows sorted by `ts` within each partition for
    /// better scan locality on time-ordered reads.
    pub fn archival() -> Self {
        Self {
            sort_within_partition: true,
            ..Self::balanced()
        }
    }

    /// zstd level 1, no sorting, only the rollups that pay for themselves
    /// on every workload.
    pub fn ultra_fast() -> Self {
        Self {
            compression_level: 1,
            sort_within_partition: false,
            rollups: vec![
                RollupKind::DailyRevenue,
                RollupKind::CountryPurchases,
                RollupKind::AdvertiserTypeCounts,
            ],
            workers: WorkerPolicy::Speed,
        }
    }

    /// Worker count for this profile on the current host.
    pub fn default_workers(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self.workers {
            WorkerPolicy::Conservative => (cores * 3).div_ceil(4).clamp(1, 6),
            WorkerPolicy::Speed => cores.clamp(1, 10),
        }
    }
}

/// Counters reported after a successful ingest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub shards: usize,
    pub rows: u64,
    pub skipped_rows: u64,
    pub partitions: usize,
}

/// Runs the full pipeline. Any error is fatal; a partial `temp/` tree may
/// remain after a failure and is removed by the next run's clean start.
pub fn run_ingest(
    data_dir: &Path,
    layout: &StoreLayout,
    profile: &IngestProfile,
    workers: usize,
) -> Result<IngestSummary> {
    let shards = list_shards(data_dir)?;
    info!("found {} CSV shards in {}", shards.len(), data_dir.display());

    // Clean start: the store is rebuilt from scratch every time.
    if layout.root().exists() {
        std::fs::remove_dir_all(layout.root())?;
    }
    std::fs::create_dir_all(layout.partitioned_dir())?;

    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

    info!("processing shards with {} workers", workers);
    let counts: Vec<(u64, u64)> = pool.install(|| {
        shards
            .par_iter()
            .enumerate()
            .map(|(index, path)| process_shard(index, path, layout, profile, workers))
            .collect::<Result<Vec<_>>>()
    })?;
    let rows: u64 = counts.iter().map(|(r, _)| r).sum();
    let skipped_rows: u64 = counts.iter().map(|(_, s)| s).sum();

    let partitions = merge_temp_partitions(layout, profile.compression_level)?;
    info!("merged {} partitions", partitions);

    std::fs::create_dir_all(layout.aggregates_dir())?;
    for kind in &profile.rollups {
        kind.build(layout, profile.compression_level)?;
    }

    write_stats(layout, profile.compression_level)?;

    Ok(IngestSummary {
        shards: shards.len(),
        rows,
        skipped_rows,
        partitions,
    })
}

/// Lists `events_part_*.csv` shards, sorted by name.
fn list_shards(data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !data_dir.is_dir() {
        return Err(EngineError::InputNotFound(format!(
            "CSV directory {} does not exist",
            data_dir.display()
        )));
    }
    let mut shards: Vec<PathBuf> = std::fs::read_dir(data_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "csv")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("events_part_"))
        })
        .collect();
    shards.sort();
    if shards.is_empty() {
        return Err(EngineError::InputNotFound(format!(
            "no events_part_*.csv files in {}",
            data_dir.display()
        )));
    }
    Ok(shards)
}

/// Parses one shard and writes its `(type, day)` buckets into the worker's
/// private temp subtree. Paths embed the shard stem, so tasks sharing a
/// worker id never collide.
fn process_shard(
    index: usize,
    path: &Path,
    layout: &StoreLayout,
    profile: &IngestProfile,
    workers: usize,
) -> Result<(u64, u64)> {
    let worker = index % workers;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("shard")
        .to_string();

    let data = shard::parse_shard(path)?;
    debug!(
        "shard {}: {} rows, {} buckets (worker {})",
        stem,
        data.rows,
        data.buckets.len(),
        worker
    );

    for ((event_type, day), mut table) in data.buckets {
        if profile.sort_within_partition {
            table = table.sort_by("ts", false)?;
        }
        let dir = layout
            .worker_dir(worker)
            .join(format!("type={}", event_type));
        std::fs::create_dir_all(&dir)?;
        let file = dir.join(format!(
            "day={}_{}.{}",
            day.format("%Y-%m-%d"),
            stem,
            DATA_EXT
        ));
        write_table(&file, &table, profile.compression_level)?;
    }
    Ok((data.rows, data.skipped))
}

/// Merges worker-private partition files into the final layout. A
/// `(type, day)` group with a single file is renamed into place; groups
/// with several files are concatenated and rewritten. Runs single-threaded
/// and holds one group at a time.
fn merge_temp_partitions(layout: &StoreLayout, compression_level: i32) -> Result<usize> {
    let temp = layout.temp_dir();
    if !temp.exists() {
        return Ok(0);
    }

    let mut groups: BTreeMap<(EventType, NaiveDate), Vec<PathBuf>> = BTreeMap::new();
    for worker_entry in std::fs::read_dir(&temp)? {
        let worker_dir = worker_entry?.path();
        if !worker_dir.is_dir() {
            continue;
        }
        for type_entry in std::fs::read_dir(&worker_dir)? {
            let type_dir = type_entry?.path();
            let Some(event_type) = type_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("type="))
                .and_then(EventType::parse)
            else {
                continue;
            };
            for file_entry in std::fs::read_dir(&type_dir)? {
                let file = file_entry?.path();
                if let Some(day) = StoreLayout::day_of_partition(&file) {
                    groups.entry((event_type, day)).or_default().push(file);
                }
            }
        }
    }

    let count = groups.len();
    for ((event_type, day), mut files) in groups {
        files.sort();
        let target = layout.partition_path(event_type, day);
        std::fs::create_dir_all(layout.type_dir(event_type))?;
        if files.len() == 1 {
            std::fs::rename(&files[0], &target)?;
        } else {
            let mut merged = Table::default();
            for file in &files {
                merged.append(ColumnarReader::open(file)?.read_all()?);
            }
            write_table(&target, &merged, compression_level)?;
        }
    }

    std::fs::remove_dir_all(&temp)?;
    Ok(count)
}

/// Writes the top-level `stats.col` key/value table: total and per-type
/// row counts (taken from partition headers, no data reads) and the day
/// range across impression partitions.
fn write_stats(layout: &StoreLayout, compression_level: i32) -> Result<()> {
    let mut keys: Vec<Option<String>> = Vec::new();
    let mut values: Vec<Option<String>> = Vec::new();

    let mut total_rows = 0u64;
    for event_type in EventType::ALL {
        let mut type_rows = 0u64;
        for path in layout.partition_files(event_type)? {
            type_rows += ColumnarReader::open(&path)?.row_count() as u64;
        }
        keys.push(Some(format!("count_{}", event_type)));
        values.push(Some(type_rows.to_string()));
        total_rows += type_rows;
    }
    keys.insert(0, Some("total_rows".to_string()));
    values.insert(0, Some(total_rows.to_string()));

    let impression_files = layout.partition_files(EventType::Impression)?;
    let first = impression_files.first().and_then(|p| StoreLayout::day_of_partition(p));
    let last = impression_files.last().and_then(|p| StoreLayout::day_of_partition(p));
    let range = match (first, last) {
        (Some(min), Some(max)) => format!("{} to {}", min, max),
        _ => "unknown".to_string(),
    };
    keys.push(Some("date_range".to_string()));
    values.push(Some(range));

    let table = Table::new(vec![
        Column {
            name: "key".to_string(),
            data: ColumnData::Utf8(keys),
        },
        Column {
            name: "value".to_string(),
            data: ColumnData::Utf8(values),
        },
    ]);
    write_table(&layout.stats_path(), &table, compression_level)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;
    use std::io::Write;

    const HEADER: &str =
        "ts,type,auction_id,advertiser_id,publisher_id,bid_price,user_id,total_price,country";

    // 2024-01-01T00:00:00Z and one day later.
    const DAY1: i64 = 1_704_067_200_000;
    const DAY2: i64 = 1_704_153_600_000;

    fn write_shard(dir: &Path, name: &str, rows: &[String]) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        writeln!(f, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(f, "{}", row).unwrap();
        }
    }

    fn seed_corpus(dir: &Path) {
        write_shard(
            dir,
            "events_part_0000.csv",
            &[
                format!("{},impression,a1,1,10,0.50,100,null,US", DAY1),
                format!("{},impression,a2,1,10,1.50,101,null,US", DAY1 + 60_000),
                format!("{},purchase,a4,1,10,null,100,30.00,US", DAY1),
            ],
        );
        write_shard(
            dir,
            "events_part_0001.csv",
            &[
                format!("{},impression,a3,2,11,2.00,102,null,DE", DAY2),
                format!("{},purchase,a5,2,11,null,102,10.00,DE", DAY2),
            ],
        );
    }

    fn prepared_store(profile: &IngestProfile, workers: usize) -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        seed_corpus(&data_dir);
        let layout = StoreLayout::new(dir.path().join("optimized"));
        run_ingest(&data_dir, &layout, profile, workers).unwrap();
        (dir, layout)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_partition_exactness() {
        let (_dir, layout) = prepared_store(&IngestProfile::balanced(), 2);

        let part = ColumnarReader::open(layout.partition_path(EventType::Impression, day("2024-01-01")))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(part.len(), 2);
        let type_idx = part.column_index("type").unwrap();
        let day_idx = part.column_index("day").unwrap();
        for row in 0..part.len() {
            assert_eq!(part.value(row, type_idx), Value::Str("impression".to_string()));
            assert_eq!(part.value(row, day_idx), Value::Date(day("2024-01-01")));
        }

        let part = ColumnarReader::open(layout.partition_path(EventType::Purchase, day("2024-01-02")))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(part.len(), 1);

        // No serve or click data arrived, so those directories don't exist.
        assert!(layout.partition_files(EventType::Serve).unwrap().is_empty());
    }

    #[test]
    fn test_temp_removed_and_summary_counts() {
        let (_dir, layout) = prepared_store(&IngestProfile::balanced(), 2);
        assert!(!layout.temp_dir().exists());

        let dir2 = tempfile::tempdir().unwrap();
        let data_dir = dir2.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        seed_corpus(&data_dir);
        let layout2 = StoreLayout::new(dir2.path().join("optimized"));
        let summary = run_ingest(&data_dir, &layout2, &IngestProfile::balanced(), 2).unwrap();
        assert_eq!(summary.shards, 2);
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.skipped_rows, 0);
        // (impression, day1), (impression, day2), (purchase, day1), (purchase, day2)
        assert_eq!(summary.partitions, 4);
    }

    #[test]
    fn test_merge_combines_worker_outputs() {
        // One worker processes both shards; both write the same (type, day)
        // only when the days overlap, so craft overlapping shards.
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        write_shard(
            &data_dir,
            "events_part_0000.csv",
            &[format!("{},impression,a1,1,10,0.50,100,null,US", DAY1)],
        );
        write_shard(
            &data_dir,
            "events_part_0001.csv",
            &[format!("{},impression,a2,2,11,2.00,101,null,DE", DAY1 + 1_000)],
        );
        let layout = StoreLayout::new(dir.path().join("optimized"));
        run_ingest(&data_dir, &layout, &IngestProfile::balanced(), 2).unwrap();

        let part = ColumnarReader::open(layout.partition_path(EventType::Impression, day("2024-01-01")))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(part.len(), 2);
    }

    #[test]
    fn test_ingest_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        seed_corpus(&data_dir);
        let layout = StoreLayout::new(dir.path().join("optimized"));

        run_ingest(&data_dir, &layout, &IngestProfile::balanced(), 2).unwrap();
        let first = ColumnarReader::open(layout.rollup_path("daily_revenue"))
            .unwrap()
            .read_all()
            .unwrap();

        run_ingest(&data_dir, &layout, &IngestProfile::balanced(), 2).unwrap();
        let second = ColumnarReader::open(layout.rollup_path("daily_revenue"))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rollup_contents() {
        let (_dir, layout) = prepared_store(&IngestProfile::balanced(), 1);

        // daily_revenue is sorted ascending by day.
        let daily = ColumnarReader::open(layout.rollup_path("daily_revenue"))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(daily.names(), vec!["day", "sum_bid_price", "count_impressions"]);
        assert_eq!(
            daily.row(0),
            vec![Value::Date(day("2024-01-01")), Value::Float(2.0), Value::Int(2)]
        );
        assert_eq!(
            daily.row(1),
            vec![Value::Date(day("2024-01-02")), Value::Float(2.0), Value::Int(1)]
        );

        let purchases = ColumnarReader::open(layout.rollup_path("country_purchases"))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(purchases.len(), 2);
        let country_idx = purchases.column_index("country").unwrap();
        let avg_idx = purchases.column_index("avg_total_price").unwrap();
        for row in 0..purchases.len() {
            match purchases.value(row, country_idx) {
                Value::Str(c) if c == "US" => {
                    assert_eq!(purchases.value(row, avg_idx), Value::Float(30.0))
                }
                Value::Str(c) if c == "DE" => {
                    assert_eq!(purchases.value(row, avg_idx), Value::Float(10.0))
                }
                other => panic!("unexpected country {:?}", other),
            }
        }

        let counts = ColumnarReader::open(layout.rollup_path("advertiser_type_counts"))
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(counts.len(), 4);
    }

    #[test]
    fn test_ultra_fast_profile_skips_rollups() {
        let (_dir, layout) = prepared_store(&IngestProfile::ultra_fast(), 2);
        assert!(layout.rollup_path("daily_revenue").exists());
        assert!(layout.rollup_path("country_purchases").exists());
        assert!(layout.rollup_path("advertiser_type_counts").exists());
        assert!(!layout.rollup_path("minute_revenue").exists());
        assert!(!layout.rollup_path("publisher_day_country_revenue").exists());
    }

    #[test]
    fn test_stats_file() {
        let (_dir, layout) = prepared_store(&IngestProfile::balanced(), 2);
        let stats = ColumnarReader::open(layout.stats_path())
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(stats.names(), vec!["key", "value"]);
        assert_eq!(stats.value(0, 0), Value::Str("total_rows".to_string()));
        assert_eq!(stats.value(0, 1), Value::Str("5".to_string()));
        let last = stats.len() - 1;
        assert_eq!(stats.value(last, 0), Value::Str("date_range".to_string()));
        assert_eq!(
            stats.value(last, 1),
            Value::Str("2024-01-01 to 2024-01-02".to_string())
        );
    }

    #[test]
    fn test_missing_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("optimized"));
        let err = run_ingest(
            &dir.path().join("nope"),
            &layout,
            &IngestProfile::balanced(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InputNotFound(_)));
    }

    #[test]
    fn test_archival_profile_sorts_by_ts() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        write_shard(
            &data_dir,
            "events_part_0000.csv",
            &[
                format!("{},impression,a2,1,10,1.50,101,null,US", DAY1 + 60_000),
                format!("{},impression,a1,1,10,0.50,100,null,US", DAY1),
            ],
        );
        let layout = StoreLayout::new(dir.path().join("optimized"));
        run_ingest(&data_dir, &layout, &IngestProfile::archival(), 1).unwrap();

        let part = ColumnarReader::open(layout.partition_path(EventType::Impression, day("2024-01-01")))
            .unwrap()
            .read_all()
            .unwrap();
        let ts_idx = part.column_index("ts").unwrap();
        assert_eq!(part.value(0, ts_idx), Value::Int(DAY1));
        assert_eq!(part.value(1, ts_idx), Value::Int(DAY1 + 60_000));
    }
}
