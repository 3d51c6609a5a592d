//! The query engine: caches, rollup routing and scan fallback.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value as Json;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{EngineError, Result};
use crate::query::document::{Query, parse_query};
use crate::query::planner::{self, RollupRoute};
use crate::query::scan;
use crate::storage::column::Op;
use crate::storage::table::{AggExpr, AggFunc};
use crate::storage::{ColumnarReader, StoreLayout, Table};

/// Executes query documents against a prepared store.
///
/// Holds two process-scoped memos: loaded rollup tables keyed by file
/// stem, and materialized results keyed by a fingerprint of the query
/// document. Both hand out independent copies, so callers can mutate
/// results freely. Not synchronized; one caller at a time.
#[derive(Debug)]
pub struct QueryEngine {
    layout: StoreLayout,
    rollup_cache: HashMap<&'static str, Table>,
    result_cache: HashMap<u64, Table>,
    result_cache_enabled: bool,
}

impl QueryEngine {
    /// Opens a prepared store. The directory must exist; its partitions
    /// and rollups are read on demand.
    pub fn new(optimized_dir: impl Into<PathBuf>) -> Result<Self> {
        let layout = StoreLayout::new(optimized_dir);
        if !layout.root().is_dir() {
            return Err(EngineError::InputNotFound(format!(
                "optimized directory {} does not exist",
                layout.root().display()
            )));
        }
        Ok(Self {
            layout,
            rollup_cache: HashMap::new(),
            result_cache: HashMap::new(),
            result_cache_enabled: true,
        })
    }

    /// Disables or re-enables the result cache.
    pub fn set_result_cache(&mut self, enabled: bool) {
        self.result_cache_enabled = enabled;
        if !enabled {
            self.result_cache.clear();
        }
    }

    /// Executes one query document.
    pub fn execute(&mut self, doc: &Json) -> Result<Table> {
        let fingerprint = query_fingerprint(doc)?;
        if self.result_cache_enabled
            && let Some(cached) = self.result_cache.get(&fingerprint)
        {
            debug!("result cache hit");
            return Ok(cached.clone());
        }

        let q = parse_query(doc)?;
        let result = match planner::route(&q) {
            Some(route) => match self.load_rollup(route.source())? {
                Some(rollup) => {
                    debug!("serving from rollup {}", route.source());
                    execute_rollup(route, &q, rollup)?
                }
                // The profile that built this store skipped the rollup.
                None => scan::execute_scan(&self.layout, &q)?,
            },
            None => scan::execute_scan(&self.layout, &q)?,
        };

        if self.result_cache_enabled {
            self.result_cache.insert(fingerprint, result.clone());
        }
        Ok(result)
    }

    /// Loads a rollup table by file stem, memoized. Returns an
    /// independent copy; None when the file does not exist.
    fn load_rollup(&mut self, name: &'static str) -> Result<Option<Table>> {
        if let Some(table) = self.rollup_cache.get(name) {
            return Ok(Some(table.clone()));
        }
        let path = self.layout.rollup_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let table = ColumnarReader::open(&path)?.read_all()?;
        self.rollup_cache.insert(name, table.clone());
        Ok(Some(table))
    }
}

/// Cache key: hash of the canonical JSON encoding. serde_json keeps
/// object keys sorted, so logically equal documents share an encoding.
fn query_fingerprint(doc: &Json) -> Result<u64> {
    Ok(xxh3_64(serde_json::to_string(doc)?.as_bytes()))
}

/// Answers a routed query from its rollup: filter, regroup when the
/// rollup grain is finer than requested, rename the internal aggregate
/// columns to the output convention, project in select order and sort.
fn execute_rollup(route: RollupRoute, q: &Query, rollup: Table) -> Result<Table> {
    let mut table = rollup;
    match route {
        RollupRoute::DailyRevenue => {
            table.rename("sum_bid_price", "sum(bid_price)");
        }
        RollupRoute::PublisherRevenue => {
            // The type filter is already baked into the rollup.
            let filters: Vec<_> = q
                .filters
                .iter()
                .filter(|p| p.col != "type")
                .cloned()
                .collect();
            table = scan::apply_filters(table, &filters);
            table = table.group_by_agg(
                &q.group_by,
                &[AggExpr::new(AggFunc::Sum, "sum_bid_price").with_alias("sum(bid_price)")],
            )?;
        }
        RollupRoute::CountryPurchases => {
            table.rename("avg_total_price", "avg(total_price)");
        }
        RollupRoute::AdvertiserType => {
            table.rename("count", "count(*)");
        }
        RollupRoute::MinuteRevenue => {
            let filters: Vec<_> = q
                .filters
                .iter()
                .filter(|p| p.col == "day" && p.op == Op::Eq)
                .cloned()
                .collect();
            table = scan::apply_filters(table, &filters);
            // Stored at (day, minute) grain; collapse to the minute grain.
            table = table.group_by_agg(
                &["minute".to_string()],
                &[AggExpr::new(AggFunc::Sum, "sum_bid_price").with_alias("sum(bid_price)")],
            )?;
        }
    }

    let names: Vec<String> = q
        .select
        .iter()
        .map(crate::query::document::SelectItem::output_name)
        .collect();
    let table = table.select(&names)?;
    Ok(scan::apply_order_by(table, &q.order_by))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestProfile, run_ingest};
    use crate::storage::Value;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::io::Write;
    use std::path::Path;

    const HEADER: &str =
        "ts,type,auction_id,advertiser_id,publisher_id,bid_price,user_id,total_price,country";

    // 2024-01-01T00:00:00Z and one day later.
    const DAY1: i64 = 1_704_067_200_000;
    const DAY2: i64 = 1_704_153_600_000;

    fn seed_corpus(dir: &Path) {
        let mut f = std::fs::File::create(dir.join("events_part_0000.csv")).unwrap();
        writeln!(f, "{}", HEADER).unwrap();
        writeln!(f, "{},impression,a1,1,10,0.50,100,null,US", DAY1).unwrap();
        writeln!(f, "{},impression,a2,1,10,1.50,101,null,US", DAY1 + 60_000).unwrap();
        writeln!(f, "{},impression,a3,2,11,2.00,102,null,DE", DAY2).unwrap();
        writeln!(f, "{},purchase,a4,1,10,null,100,30.00,US", DAY1).unwrap();
        writeln!(f, "{},purchase,a5,2,11,null,102,10.00,DE", DAY2).unwrap();
    }

    fn prepared_engine(profile: IngestProfile) -> (tempfile::TempDir, QueryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        seed_corpus(&data_dir);
        let layout = StoreLayout::new(dir.path().join("optimized"));
        run_ingest(&data_dir, &layout, &profile, 2).unwrap();
        let engine = QueryEngine::new(dir.path().join("optimized")).unwrap();
        (dir, engine)
    }

    fn day(s: &str) -> Value {
        Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn sorted_rows(table: &Table) -> Vec<Vec<Value>> {
        let mut rows: Vec<Vec<Value>> = (0..table.len()).map(|r| table.row(r)).collect();
        rows.sort();
        rows
    }

    #[test]
    fn test_daily_revenue() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["day", {"SUM": "bid_price"}],
                "from": "events",
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["day"],
            }))
            .unwrap();
        assert_eq!(result.names(), vec!["day", "sum(bid_price)"]);
        assert_eq!(
            sorted_rows(&result),
            vec![
                vec![day("2024-01-01"), Value::Float(2.0)],
                vec![day("2024-01-02"), Value::Float(2.0)],
            ]
        );
    }

    #[test]
    fn test_country_purchases() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["country", {"AVG": "total_price"}],
                "from": "events",
                "where": [{"col": "type", "op": "eq", "val": "purchase"}],
                "group_by": ["country"],
            }))
            .unwrap();
        assert_eq!(
            sorted_rows(&result),
            vec![
                vec![Value::Str("DE".to_string()), Value::Float(10.0)],
                vec![Value::Str("US".to_string()), Value::Float(30.0)],
            ]
        );
    }

    #[test]
    fn test_advertiser_type_counts() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["advertiser_id", "type", {"COUNT": "*"}],
                "from": "events",
                "group_by": ["advertiser_id", "type"],
            }))
            .unwrap();
        assert_eq!(
            sorted_rows(&result),
            vec![
                vec![Value::Int(1), Value::Str("impression".to_string()), Value::Int(2)],
                vec![Value::Int(1), Value::Str("purchase".to_string()), Value::Int(1)],
                vec![Value::Int(2), Value::Str("impression".to_string()), Value::Int(1)],
                vec![Value::Int(2), Value::Str("purchase".to_string()), Value::Int(1)],
            ]
        );
    }

    #[test]
    fn test_publisher_revenue_with_between() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["publisher_id", {"SUM": "bid_price"}],
                "from": "events",
                "where": [
                    {"col": "type", "op": "eq", "val": "impression"},
                    {"col": "day", "op": "between", "val": ["2024-01-01", "2024-01-01"]},
                ],
                "group_by": ["publisher_id"],
            }))
            .unwrap();
        assert_eq!(
            sorted_rows(&result),
            vec![vec![Value::Int(10), Value::Float(2.0)]]
        );
    }

    #[test]
    fn test_minute_revenue_filtered_and_ordered() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["minute", {"SUM": "bid_price"}],
                "from": "events",
                "where": [
                    {"col": "type", "op": "eq", "val": "impression"},
                    {"col": "day", "op": "eq", "val": "2024-01-01"},
                ],
                "group_by": ["minute"],
                "order_by": [{"col": "minute", "dir": "asc"}],
            }))
            .unwrap();
        assert_eq!(
            (0..result.len()).map(|r| result.row(r)).collect::<Vec<_>>(),
            vec![
                vec![Value::Str("2024-01-01 00:00".to_string()), Value::Float(0.5)],
                vec![Value::Str("2024-01-01 00:01".to_string()), Value::Float(1.5)],
            ]
        );
    }

    #[test]
    fn test_scan_fallback_country_in() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["country", {"SUM": "bid_price"}],
                "from": "events",
                "where": [
                    {"col": "type", "op": "eq", "val": "impression"},
                    {"col": "country", "op": "in", "val": ["US"]},
                ],
                "group_by": ["country"],
            }))
            .unwrap();
        assert_eq!(
            sorted_rows(&result),
            vec![vec![Value::Str("US".to_string()), Value::Float(2.0)]]
        );
    }

    /// Every routed shape must agree with its scan-based execution.
    #[test]
    fn test_routing_equivalence() {
        let queries = [
            json!({
                "select": ["day", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["day"],
            }),
            json!({
                "select": ["publisher_id", {"SUM": "bid_price"}],
                "where": [
                    {"col": "type", "op": "eq", "val": "impression"},
                    {"col": "country", "op": "eq", "val": "US"},
                ],
                "group_by": ["publisher_id"],
            }),
            json!({
                "select": ["country", {"AVG": "total_price"}],
                "where": [{"col": "type", "op": "eq", "val": "purchase"}],
                "group_by": ["country"],
            }),
            json!({
                "select": ["advertiser_id", "type", {"COUNT": "*"}],
                "group_by": ["advertiser_id", "type"],
            }),
            json!({
                "select": ["minute", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["minute"],
            }),
        ];

        let (_dir, mut routed_engine) = prepared_engine(IngestProfile::balanced());
        for doc in &queries {
            let q = parse_query(doc).unwrap();
            assert!(planner::route(&q).is_some(), "query should route: {}", doc);
            let routed = routed_engine.execute(doc).unwrap();
            let scanned = scan::execute_scan(&routed_engine.layout, &q).unwrap();
            assert_eq!(
                sorted_rows(&routed),
                sorted_rows(&scanned),
                "rollup and scan disagree for {}",
                doc
            );
        }
    }

    #[test]
    fn test_absent_rollup_falls_back_to_scan() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::ultra_fast());
        // minute_revenue is not built by the ultra-fast profile.
        let result = engine
            .execute(&json!({
                "select": ["minute", {"SUM": "bid_price"}],
                "where": [{"col": "type", "op": "eq", "val": "impression"}],
                "group_by": ["minute"],
                "order_by": [{"col": "minute", "dir": "asc"}],
            }))
            .unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_cache_returns_independent_copies() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let doc = json!({
            "select": ["day", {"SUM": "bid_price"}],
            "where": [{"col": "type", "op": "eq", "val": "impression"}],
            "group_by": ["day"],
        });
        let mut first = engine.execute(&doc).unwrap();
        let second = engine.execute(&doc).unwrap();
        assert_eq!(sorted_rows(&first), sorted_rows(&second));

        // Mutating one copy must not leak into the cache.
        first.rename("day", "mutated");
        let third = engine.execute(&doc).unwrap();
        assert_eq!(third.names(), vec!["day", "sum(bid_price)"]);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"group_by": ["day"], "select": ["day"]});
        let b = json!({"select": ["day"], "group_by": ["day"]});
        assert_eq!(
            query_fingerprint(&a).unwrap(),
            query_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn test_missing_store_is_input_not_found() {
        let err = QueryEngine::new("/definitely/not/here").unwrap_err();
        assert!(matches!(err, EngineError::InputNotFound(_)));
    }

    #[test]
    fn test_query_over_empty_type_directory() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let result = engine
            .execute(&json!({
                "select": ["country", {"COUNT": "*"}],
                "where": [{"col": "type", "op": "eq", "val": "serve"}],
                "group_by": ["country"],
            }))
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.names(), vec!["country", "count(*)"]);
    }

    #[test]
    fn test_malformed_query_is_rejected() {
        let (_dir, mut engine) = prepared_engine(IngestProfile::balanced());
        let err = engine.execute(&json!({"from": "users"})).unwrap_err();
        assert!(matches!(err, EngineError::Malformed(_)));
    }
}
