//! Typed parsing of one CSV shard into per-(type, day) column batches.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::storage::model::{self, DerivedKeys, EventType};
use crate::storage::{Column, ColumnData, Table};

/// One shard, bucketed by `(type, day)` and ready to write.
#[derive(Debug)]
pub struct ShardData {
    pub buckets: Vec<((EventType, NaiveDate), Table)>,
    pub rows: u64,
    pub skipped: u64,
}

/// Column builders for one partition bucket.
#[derive(Default)]
struct PartitionBuilder {
    ts: Vec<Option<i64>>,
    event_type: Vec<Option<String>>,
    auction_id: Vec<Option<String>>,
    advertiser_id: Vec<Option<i32>>,
    publisher_id: Vec<Option<i32>>,
    bid_price: Vec<Option<f64>>,
    user_id: Vec<Option<i64>>,
    total_price: Vec<Option<f64>>,
    country: Vec<Option<String>>,
    day: Vec<Option<NaiveDate>>,
    week: Vec<Option<NaiveDate>>,
    hour: Vec<Option<i64>>,
    minute: Vec<Option<String>>,
}

impl PartitionBuilder {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        ts: i64,
        event_type: EventType,
        auction_id: Option<String>,
        advertiser_id: Option<i32>,
        publisher_id: Option<i32>,
        bid_price: Option<f64>,
        user_id: Option<i64>,
        total_price: Option<f64>,
        country: Option<String>,
        keys: DerivedKeys,
    ) {
        self.ts.push(Some(ts));
        self.event_type.push(Some(event_type.as_str().to_string()));
        self.auction_id.push(auction_id);
        self.advertiser_id.push(advertiser_id);
        self.publisher_id.push(publisher_id);
        self.bid_price.push(bid_price);
        self.user_id.push(user_id);
        self.total_price.push(total_price);
        self.country.push(country);
        self.day.push(Some(keys.day));
        self.week.push(Some(keys.week));
        self.hour.push(Some(keys.hour));
        self.minute.push(Some(keys.minute));
    }

    fn finish(self) -> Table {
        Table::new(vec![
            Column {
                name: "ts".to_string(),
                data: ColumnData::Int64(self.ts),
            },
            Column {
                name: "type".to_string(),
                data: ColumnData::Utf8(self.event_type),
            },
            Column {
                name: "auction_id".to_string(),
                data: ColumnData::Utf8(self.auction_id),
            },
            Column {
                name: "advertiser_id".to_string(),
                data: ColumnData::Int32(self.advertiser_id),
            },
            Column {
                name: "publisher_id".to_string(),
                data: ColumnData::Int32(self.publisher_id),
            },
            Column {
                name: "bid_price".to_string(),
                data: ColumnData::Float64(self.bid_price),
            },
            Column {
                name: "user_id".to_string(),
                data: ColumnData::Int64(self.user_id),
            },
            Column {
                name: "total_price".to_string(),
                data: ColumnData::Float64(self.total_price),
            },
            Column {
                name: "country".to_string(),
                data: ColumnData::Utf8(self.country),
            },
            Column {
                name: "day".to_string(),
                data: ColumnData::Date(self.day),
            },
            Column {
                name: "week".to_string(),
                data: ColumnData::Date(self.week),
            },
            Column {
                name: "hour".to_string(),
                data: ColumnData::Int64(self.hour),
            },
            Column {
                name: "minute".to_string(),
                data: ColumnData::Utf8(self.minute),
            },
        ])
    }
}

fn null_field(s: &str) -> bool {
    s.is_empty() || s == "null"
}

fn parse_num<T: std::str::FromStr>(s: &str, name: &str, line: usize) -> Result<Option<T>> {
    if null_field(s) {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|_| {
        EngineError::SchemaMismatch(format!("line {}: invalid {} value '{}'", line, name, s))
    })
}

fn parse_str(s: &str) -> Option<String> {
    if null_field(s) { None } else { Some(s.to_string()) }
}

/// Parses one shard under the fixed event schema. Empty string and the
/// literal `null` denote nulls; numeric parse failures are fatal. Rows
/// without a usable timestamp or with an unrecognized event type are
/// skipped and counted.
pub fn parse_shard(path: &Path) -> Result<ShardData> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let expected: Vec<&str> = model::CSV_HEADER.to_vec();
    if headers.iter().collect::<Vec<_>>() != expected {
        return Err(EngineError::SchemaMismatch(format!(
            "{}: header mismatch, expected {}",
            path.display(),
            expected.join(",")
        )));
    }

    let mut builders: BTreeMap<(EventType, NaiveDate), PartitionBuilder> = BTreeMap::new();
    let mut rows = 0u64;
    let mut skipped = 0u64;

    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let line = i + 2; // 1-based, after the header
        if record.len() != model::CSV_HEADER.len() {
            return Err(EngineError::SchemaMismatch(format!(
                "{}: line {}: expected {} fields, got {}",
                path.display(),
                line,
                model::CSV_HEADER.len(),
                record.len()
            )));
        }

        let ts: Option<i64> = parse_num(&record[0], "ts", line)?;
        let Some(ts) = ts else {
            skipped += 1;
            continue;
        };
        let Some(keys) = model::derive_keys(ts) else {
            debug!("line {}: timestamp {} out of range, skipping", line, ts);
            skipped += 1;
            continue;
        };
        let Some(event_type) = EventType::parse(&record[1]) else {
            debug!("line {}: unrecognized event type '{}', skipping", line, &record[1]);
            skipped += 1;
            continue;
        };

        let auction_id = parse_str(&record[2]);
        let advertiser_id: Option<i32> = parse_num(&record[3], "advertiser_id", line)?;
        let publisher_id: Option<i32> = parse_num(&record[4], "publisher_id", line)?;
        let bid_price: Option<f64> = parse_num(&record[5], "bid_price", line)?;
        let user_id: Option<i64> = parse_num(&record[6], "user_id", line)?;
        let total_price: Option<f64> = parse_num(&record[7], "total_price", line)?;
        let country = parse_str(&record[8]);

        builders
            .entry((event_type, keys.day))
            .or_default()
            .push(
                ts,
                event_type,
                auction_id,
                advertiser_id,
                publisher_id,
                bid_price,
                user_id,
                total_price,
                country,
                keys,
            );
        rows += 1;
    }

    let buckets = builders
        .into_iter()
        .map(|(key, builder)| (key, builder.finish()))
        .collect();
    Ok(ShardData {
        buckets,
        rows,
        skipped,
    })
}
