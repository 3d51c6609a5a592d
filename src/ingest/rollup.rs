//! Pre-aggregated rollup tables.
//!
//! Each rollup streams only the type directories and columns it needs,
//! folding one partition at a time into a group accumulator, and lands as
//! a single columnar file under `aggregates/`.

use std::collections::HashMap;

use tracing::info;

use crate::error::Result;
use crate::storage::model::{self, EventType};
use crate::storage::{Column, ColumnData, ColumnarReader, StoreLayout, Table, Value, write_table};

/// The recognized rollup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupKind {
    DailyRevenue,
    CountryRevenue,
    CountryPurchases,
    PublisherDayCountryRevenue,
    AdvertiserTypeCounts,
    MinuteRevenue,
}

impl RollupKind {
    pub const ALL: [RollupKind; 6] = [
        RollupKind::DailyRevenue,
        RollupKind::CountryRevenue,
        RollupKind::CountryPurchases,
        RollupKind::PublisherDayCountryRevenue,
        RollupKind::AdvertiserTypeCounts,
        RollupKind::MinuteRevenue,
    ];

    /// File stem under `aggregates/`.
    pub fn name(&self) -> &'static str {
        match self {
            RollupKind::DailyRevenue => "daily_revenue",
            RollupKind::CountryRevenue => "country_revenue",
            RollupKind::CountryPurchases => "country_purchases",
            RollupKind::PublisherDayCountryRevenue => "publisher_day_country_revenue",
            RollupKind::AdvertiserTypeCounts => "advertiser_type_counts",
            RollupKind::MinuteRevenue => "minute_revenue",
        }
    }

    fn source_types(&self) -> &'static [EventType] {
        match self {
            RollupKind::DailyRevenue
            | RollupKind::CountryRevenue
            | RollupKind::PublisherDayCountryRevenue
            | RollupKind::MinuteRevenue => &[EventType::Impression],
            RollupKind::CountryPurchases => &[EventType::Purchase],
            RollupKind::AdvertiserTypeCounts => &EventType::ALL,
        }
    }

    fn key_columns(&self) -> &'static [&'static str] {
        match self {
            RollupKind::DailyRevenue => &["day"],
            RollupKind::CountryRevenue | RollupKind::CountryPurchases => &["country"],
            RollupKind::PublisherDayCountryRevenue => &["publisher_id", "day", "country"],
            RollupKind::AdvertiserTypeCounts => &["advertiser_id", "type"],
            RollupKind::MinuteRevenue => &["day", "minute"],
        }
    }

    fn value_column(&self) -> Option<&'static str> {
        match self {
            RollupKind::DailyRevenue
            | RollupKind::CountryRevenue
            | RollupKind::PublisherDayCountryRevenue
            | RollupKind::MinuteRevenue => Some("bid_price"),
            RollupKind::CountryPurchases => Some("total_price"),
            RollupKind::AdvertiserTypeCounts => None,
        }
    }

    /// Computes the rollup and writes `aggregates/<name>.col`. With no
    /// source partitions at all nothing is written, matching the semantics
    /// of an absent rollup. Deterministic given identical partition input.
    pub fn build(&self, layout: &StoreLayout, compression_level: i32) -> Result<()> {
        let key_cols = self.key_columns();
        let Some(groups) = accumulate(layout, self.source_types(), key_cols, self.value_column())?
        else {
            info!("rollup {}: no source partitions, skipped", self.name());
            return Ok(());
        };

        let mut key_data: Vec<Vec<Value>> = vec![Vec::with_capacity(groups.keys.len()); key_cols.len()];
        for key in &groups.keys {
            for (pos, value) in key.iter().enumerate() {
                key_data[pos].push(value.clone());
            }
        }
        let mut columns: Vec<Column> = key_cols
            .iter()
            .zip(key_data)
            .map(|(name, values)| Column {
                name: name.to_string(),
                data: ColumnData::from_values(
                    model::column_dtype(name).expect("rollup keys are schema columns"),
                    values,
                ),
            })
            .collect();

        let sums = || groups.accs.iter().map(|a| Some(a.sum)).collect::<Vec<_>>();
        let non_null = || {
            groups
                .accs
                .iter()
                .map(|a| Some(a.non_null as i64))
                .collect::<Vec<_>>()
        };
        match self {
            RollupKind::DailyRevenue | RollupKind::CountryRevenue => {
                columns.push(Column {
                    name: "sum_bid_price".to_string(),
                    data: ColumnData::Float64(sums()),
                });
                columns.push(Column {
                    name: "count_impressions".to_string(),
                    data: ColumnData::Int64(non_null()),
                });
            }
            RollupKind::CountryPurchases => {
                columns.push(Column {
                    name: "sum_total_price".to_string(),
                    data: ColumnData::Float64(sums()),
                });
                columns.push(Column {
                    name: "avg_total_price".to_string(),
                    data: ColumnData::Float64(
                        groups
                            .accs
                            .iter()
                            .map(|a| {
                                if a.non_null == 0 {
                                    None
                                } else {
                                    Some(a.sum / a.non_null as f64)
                                }
                            })
                            .collect(),
                    ),
                });
                columns.push(Column {
                    name: "count_purchases".to_string(),
                    data: ColumnData::Int64(non_null()),
                });
            }
            RollupKind::PublisherDayCountryRevenue | RollupKind::MinuteRevenue => {
                columns.push(Column {
                    name: "sum_bid_price".to_string(),
                    data: ColumnData::Float64(sums()),
                });
            }
            RollupKind::AdvertiserTypeCounts => {
                columns.push(Column {
                    name: "count".to_string(),
                    data: ColumnData::Int64(
                        groups.accs.iter().map(|a| Some(a.rows as i64)).collect(),
                    ),
                });
            }
        }

        let mut table = Table::new(columns);
        if *self == RollupKind::DailyRevenue {
            table = table.sort_by("day", false)?;
        }
        write_table(&layout.rollup_path(self.name()), &table, compression_level)?;
        info!("rollup {}: {} groups", self.name(), table.len());
        Ok(())
    }
}

#[derive(Default, Clone)]
struct Acc {
    sum: f64,
    non_null: u64,
    rows: u64,
}

struct Groups {
    keys: Vec<Vec<Value>>,
    accs: Vec<Acc>,
}

/// Folds every matching partition into per-group sums, keeping one
/// partition table in memory at a time. Returns None when the selected
/// type directories hold no files.
fn accumulate(
    layout: &StoreLayout,
    types: &[EventType],
    key_cols: &[&str],
    value_col: Option<&str>,
) -> Result<Option<Groups>> {
    let mut projection: Vec<String> = key_cols.iter().map(|s| s.to_string()).collect();
    if let Some(col) = value_col {
        projection.push(col.to_string());
    }

    let mut group_of: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut keys: Vec<Vec<Value>> = Vec::new();
    let mut accs: Vec<Acc> = Vec::new();
    let mut files = 0usize;

    for event_type in types {
        for path in layout.partition_files(*event_type)? {
            files += 1;
            let table = ColumnarReader::open(&path)?.read(Some(&projection))?;
            let key_idx: Vec<usize> = key_cols
                .iter()
                .filter_map(|k| table.column_index(k))
                .collect();
            if key_idx.len() != key_cols.len() {
                continue;
            }
            let value_idx = value_col.and_then(|c| table.column_index(c));
            for row in 0..table.len() {
                let key: Vec<Value> = key_idx.iter().map(|&i| table.value(row, i)).collect();
                let gi = match group_of.get(&key) {
                    Some(&gi) => gi,
                    None => {
                        let gi = keys.len();
                        group_of.insert(key.clone(), gi);
                        keys.push(key);
                        accs.push(Acc::default());
                        gi
                    }
                };
                let acc = &mut accs[gi];
                acc.rows += 1;
                if let Some(vi) = value_idx {
                    match table.value(row, vi) {
                        Value::Int(i) => {
                            acc.sum += i as f64;
                            acc.non_null += 1;
                        }
                        Value::Float(f) => {
                            acc.sum += f;
                            acc.non_null += 1;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    if files == 0 {
        return Ok(None);
    }
    Ok(Some(Groups { keys, accs }))
}
