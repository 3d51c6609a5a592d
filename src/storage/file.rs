//! Self-describing columnar file format.
//!
//! Layout:
//!
//! ```text
//! magic "ADCF" | format version u16 | header length u64
//! header (bincode): row count + per-column name, type, min/max stats,
//!                   byte offset and length within the data section
//! data section: one zstd-compressed bincode block per column
//! ```
//!
//! The header carries everything a reader needs to project a subset of
//! columns or to skip the whole file from its statistics without touching
//! the data section.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::column::{ColumnData, ColumnStats, DataType, Predicate};
use crate::storage::pool::StringPool;
use crate::storage::table::{Column, Table};

const MAGIC: &[u8; 4] = b"ADCF";
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub dtype: DataType,
    pub stats: ColumnStats,
    offset: u64,
    length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    row_count: u64,
    columns: Vec<ColumnMeta>,
}

/// On-disk encoding of one column. String columns are dictionary-encoded
/// through a [`StringPool`].
#[derive(Serialize, Deserialize)]
enum ColumnBlock {
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8 {
        pool: StringPool,
        codes: Vec<Option<u64>>,
    },
    Date(Vec<Option<chrono::NaiveDate>>),
}

impl ColumnBlock {
    fn encode(data: &ColumnData) -> ColumnBlock {
        match data {
            ColumnData::Int32(v) => ColumnBlock::Int32(v.clone()),
            ColumnData::Int64(v) => ColumnBlock::Int64(v.clone()),
            ColumnData::Float64(v) => ColumnBlock::Float64(v.clone()),
            ColumnData::Date(v) => ColumnBlock::Date(v.clone()),
            ColumnData::Utf8(v) => {
                let (pool, codes) = StringPool::encode(v);
                ColumnBlock::Utf8 { pool, codes }
            }
        }
    }

    fn decode(self) -> io::Result<ColumnData> {
        Ok(match self {
            ColumnBlock::Int32(v) => ColumnData::Int32(v),
            ColumnBlock::Int64(v) => ColumnData::Int64(v),
            ColumnBlock::Float64(v) => ColumnData::Float64(v),
            ColumnBlock::Date(v) => ColumnData::Date(v),
            ColumnBlock::Utf8 { pool, codes } => ColumnData::Utf8(pool.decode(codes)?),
        })
    }
}

/// Writes a table as a columnar file with per-column statistics.
/// The file appears atomically: data goes to `<path>.tmp` first and is
/// renamed into place after fsync.
pub fn write_table(path: &Path, table: &Table, compression_level: i32) -> io::Result<()> {
    let mut metas = Vec::with_capacity(table.width());
    let mut blocks = Vec::with_capacity(table.width());
    let mut offset = 0u64;

    for col in table.columns() {
        let raw = bincode::serialize(&ColumnBlock::encode(&col.data)).map_err(io::Error::other)?;
        let compressed = zstd::encode_all(&raw[..], compression_level)?;
        metas.push(ColumnMeta {
            name: col.name.clone(),
            dtype: col.data.dtype(),
            stats: col.data.stats(),
            offset,
            length: compressed.len() as u64,
        });
        offset += compressed.len() as u64;
        blocks.push(compressed);
    }

    let header = FileHeader {
        row_count: table.len() as u64,
        columns: metas,
    };
    let header_bytes = bincode::serialize(&header).map_err(io::Error::other)?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(MAGIC)?;
        f.write_all(&FORMAT_VERSION.to_le_bytes())?;
        f.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        f.write_all(&header_bytes)?;
        for block in &blocks {
            f.write_all(block)?;
        }
        f.sync_all()?;
    }
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

/// Lazy reader: opening parses only the header. Column data is read on
/// demand, restricted to a projection.
pub struct ColumnarReader {
    path: PathBuf,
    header: FileHeader,
    data_start: u64,
}

impl ColumnarReader {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut f = File::open(&path)?;

        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::other(format!(
                "{}: not a columnar data file",
                path.display()
            )));
        }
        let mut version = [0u8; 2];
        f.read_exact(&mut version)?;
        let version = u16::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(io::Error::other(format!(
                "{}: unsupported format version {}",
                path.display(),
                version
            )));
        }
        let mut len = [0u8; 8];
        f.read_exact(&mut len)?;
        let header_len = u64::from_le_bytes(len);

        let mut header_bytes = vec![0u8; header_len as usize];
        f.read_exact(&mut header_bytes)?;
        let header: FileHeader =
            bincode::deserialize(&header_bytes).map_err(io::Error::other)?;

        let data_start = 4 + 2 + 8 + header_len;
        Ok(Self {
            path,
            header,
            data_start,
        })
    }

    pub fn row_count(&self) -> usize {
        self.header.row_count as usize
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.header.columns.iter().map(|c| c.name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.header.columns.iter().any(|c| c.name == name)
    }

    pub fn stats(&self, name: &str) -> Option<&ColumnStats> {
        self.header
            .columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.stats)
    }

    /// Returns false when some predicate provably excludes every row of
    /// this file, judged by column min/max statistics. Predicates over
    /// columns the file does not carry are ignored.
    pub fn stats_allow(&self, predicates: &[Predicate]) -> bool {
        predicates.iter().all(|p| {
            self.stats(&p.col)
                .map(|stats| p.allowed_by(stats))
                .unwrap_or(true)
        })
    }

    /// Reads the file, restricted to `projection` when given. Projected
    /// columns absent from the file are skipped, not errors.
    pub fn read(&self, projection: Option<&[String]>) -> io::Result<Table> {
        let mut f = File::open(&self.path)?;
        let mut columns = Vec::new();
        for meta in &self.header.columns {
            if let Some(wanted) = projection
                && !wanted.iter().any(|n| n == &meta.name)
            {
                continue;
            }
            f.seek(SeekFrom::Start(self.data_start + meta.offset))?;
            let mut compressed = vec![0u8; meta.length as usize];
            f.read_exact(&mut compressed)?;
            let raw = zstd::decode_all(&compressed[..])?;
            let block: ColumnBlock = bincode::deserialize(&raw).map_err(io::Error::other)?;
            columns.push(Column {
                name: meta.name.clone(),
                data: block.decode()?,
            });
        }
        Ok(Table::new(columns))
    }

    pub fn read_all(&self) -> io::Result<Table> {
        self.read(None)
    }
}
