//! Columnar store: file format, partition layout and in-memory tables.

pub mod column;
pub mod file;
pub mod model;
pub mod pool;
pub mod table;

pub use column::{ColumnData, ColumnStats, DataType, Op, Predicate, Value};
pub use file::{ColumnarReader, write_table};
pub use model::{DerivedKeys, EventType, derive_keys};
pub use pool::StringPool;
pub use table::{AggExpr, AggFunc, Column, Table};

use chrono::NaiveDate;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Extension of columnar data files.
pub const DATA_EXT: &str = "col";

/// Directory convention of a prepared store:
///
/// ```text
/// <root>/partitioned/type=<T>/day=<YYYY-MM-DD>.col
/// <root>/aggregates/<rollup>.col
/// <root>/stats.col
/// <root>/temp/worker_<W>/...          (only while ingest runs)
/// ```
///
/// Partition pruning reasons over these names alone; there is no separate
/// metadata index.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partitioned_dir(&self) -> PathBuf {
        self.root.join("partitioned")
    }

    pub fn type_dir(&self, event_type: EventType) -> PathBuf {
        self.partitioned_dir().join(format!("type={}", event_type))
    }

    pub fn partition_path(&self, event_type: EventType, day: NaiveDate) -> PathBuf {
        self.type_dir(event_type)
            .join(format!("day={}.{}", day.format("%Y-%m-%d"), DATA_EXT))
    }

    pub fn aggregates_dir(&self) -> PathBuf {
        self.root.join("aggregates")
    }

    pub fn rollup_path(&self, name: &str) -> PathBuf {
        self.aggregates_dir().join(format!("{}.{}", name, DATA_EXT))
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join(format!("stats.{}", DATA_EXT))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn worker_dir(&self, worker: usize) -> PathBuf {
        self.temp_dir().join(format!("worker_{}", worker))
    }

    /// Lists the partition files of one type directory, sorted by name
    /// (hence by day). A missing directory means absent data, not an error.
    pub fn partition_files(&self, event_type: EventType) -> io::Result<Vec<PathBuf>> {
        let dir = self.type_dir(event_type);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == DATA_EXT)
                    && p.file_stem()
                        .and_then(|s| s.to_str())
                        .is_some_and(|s| s.starts_with("day="))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Parses the day out of a `day=YYYY-MM-DD[...].col` file name.
    pub fn day_of_partition(path: &Path) -> Option<NaiveDate> {
        let stem = path.file_stem()?.to_str()?;
        let date = stem.strip_prefix("day=")?.split('_').next()?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }

    /// Loads the requested columns from every partition of the given types,
    /// optionally restricted to a day list (judged by file name). Files
    /// whose statistics contradict a predicate are skipped without reading
    /// their data section. Partitions are stacked one at a time; with no
    /// matching data the result is an empty table carrying the projected
    /// schema so downstream grouping still sees its columns.
    pub fn scan_partitions(
        &self,
        types: &[EventType],
        days: Option<&[NaiveDate]>,
        columns: &[String],
        predicates: &[Predicate],
    ) -> Result<Table> {
        let mut out = Table::default();
        for event_type in types {
            for path in self.partition_files(*event_type)? {
                if let Some(days) = days
                    && let Some(day) = Self::day_of_partition(&path)
                    && !days.contains(&day)
                {
                    continue;
                }
                let reader = ColumnarReader::open(&path)?;
                if !reader.stats_allow(predicates) {
                    continue;
                }
                out.append(reader.read(Some(columns))?);
            }
        }
        if out.width() == 0 {
            let columns = columns
                .iter()
                .filter_map(|name| {
                    model::column_dtype(name).map(|dtype| Column {
                        name: name.clone(),
                        data: ColumnData::empty(dtype),
                    })
                })
                .collect();
            out = Table::new(columns);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StoreLayout::new("/data/optimized");
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            layout.partition_path(EventType::Impression, day),
            PathBuf::from("/data/optimized/partitioned/type=impression/day=2024-01-01.col")
        );
        assert_eq!(
            layout.rollup_path("daily_revenue"),
            PathBuf::from("/data/optimized/aggregates/daily_revenue.col")
        );
        assert_eq!(
            layout.worker_dir(3),
            PathBuf::from("/data/optimized/temp/worker_3")
        );
    }

    #[test]
    fn test_day_of_partition() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(
            StoreLayout::day_of_partition(Path::new("day=2024-01-02.col")),
            Some(day)
        );
        // Worker-private shard files carry a disambiguating stem suffix.
        assert_eq!(
            StoreLayout::day_of_partition(Path::new("day=2024-01-02_events_part_0007.col")),
            Some(day)
        );
        assert_eq!(StoreLayout::day_of_partition(Path::new("stats.col")), None);
    }

    #[test]
    fn test_missing_type_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        assert!(layout.partition_files(EventType::Click).unwrap().is_empty());
    }

    #[test]
    fn test_scan_empty_store_keeps_projected_schema() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let columns = vec!["day".to_string(), "bid_price".to_string()];
        let table = layout
            .scan_partitions(&[EventType::Impression], None, &columns, &[])
            .unwrap();
        assert!(table.is_empty());
        assert_eq!(table.names(), vec!["day", "bid_price"]);
    }
}
