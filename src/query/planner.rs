//! Query planning: rollup routing and scan pruning.
//!
//! The planner first matches the query against a fixed catalogue of
//! shapes that pre-computed rollups can answer. A shape match demands
//! that every select member and every filter be servable from the rollup,
//! so a routed query always returns exactly what a scan would. Anything
//! else becomes a scan plan with partition and column pruning.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::query::document::{Query, SelectItem};
use crate::storage::column::{Op, Predicate, Value};
use crate::storage::model::EventType;
use crate::storage::table::AggFunc;

/// A recognized query shape and the rollup that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupRoute {
    DailyRevenue,
    PublisherRevenue,
    CountryPurchases,
    AdvertiserType,
    MinuteRevenue,
}

impl RollupRoute {
    /// File stem of the backing rollup.
    pub fn source(&self) -> &'static str {
        match self {
            RollupRoute::DailyRevenue => "daily_revenue",
            RollupRoute::PublisherRevenue => "publisher_day_country_revenue",
            RollupRoute::CountryPurchases => "country_purchases",
            RollupRoute::AdvertiserType => "advertiser_type_counts",
            RollupRoute::MinuteRevenue => "minute_revenue",
        }
    }
}

/// Matches the query against the rollup catalogue.
pub fn route(q: &Query) -> Option<RollupRoute> {
    if matches_daily_revenue(q) {
        return Some(RollupRoute::DailyRevenue);
    }
    if matches_publisher_revenue(q) {
        return Some(RollupRoute::PublisherRevenue);
    }
    if matches_country_purchases(q) {
        return Some(RollupRoute::CountryPurchases);
    }
    if matches_advertiser_type(q) {
        return Some(RollupRoute::AdvertiserType);
    }
    if matches_minute_revenue(q) {
        return Some(RollupRoute::MinuteRevenue);
    }
    None
}

fn filter_is_type_eq(p: &Predicate, event_type: &str) -> bool {
    p.col == "type"
        && p.op == Op::Eq
        && p.values.first() == Some(&Value::Str(event_type.to_string()))
}

/// SELECT day, SUM(bid_price) WHERE type = impression GROUP BY day
fn matches_daily_revenue(q: &Query) -> bool {
    q.group_by == ["day"]
        && q.select.len() == 2
        && q.has_column("day")
        && q.has_aggregate(AggFunc::Sum, "bid_price")
        && q.filters.len() == 1
        && filter_is_type_eq(&q.filters[0], "impression")
}

/// SELECT publisher_id, SUM(bid_price) over impressions, grouped by
/// publisher_id and optionally day/country, filtered by country eq,
/// day eq or day between. Served at the (publisher_id, day, country)
/// grain and re-grouped.
fn matches_publisher_revenue(q: &Query) -> bool {
    let grain = ["publisher_id", "day", "country"];
    if !q.group_by.iter().any(|c| c == "publisher_id")
        || !q.group_by.iter().all(|c| grain.contains(&c.as_str()))
    {
        return false;
    }
    if !q.has_column("publisher_id") || !q.has_aggregate(AggFunc::Sum, "bid_price") {
        return false;
    }
    // Every select member must survive the regroup.
    if !q.select.iter().all(|item| match item {
        SelectItem::Column(c) => q.group_by.contains(c),
        SelectItem::Aggregate { func, col } => *func == AggFunc::Sum && col == "bid_price",
    }) {
        return false;
    }
    let mut saw_type = false;
    for p in &q.filters {
        if filter_is_type_eq(p, "impression") {
            saw_type = true;
        } else if p.col == "country" && p.op == Op::Eq {
        } else if p.col == "day" && (p.op == Op::Eq || p.op == Op::Between) {
        } else {
            return false;
        }
    }
    saw_type
}

/// SELECT country, AVG(total_price) WHERE type = purchase GROUP BY country
fn matches_country_purchases(q: &Query) -> bool {
    q.group_by == ["country"]
        && q.has_column("country")
        && q.has_aggregate(AggFunc::Avg, "total_price")
        && q.select.iter().all(|item| match item {
            SelectItem::Column(c) => c == "country",
            SelectItem::Aggregate { func, col } => *func == AggFunc::Avg && col == "total_price",
        })
        && q.filters.len() == 1
        && filter_is_type_eq(&q.filters[0], "purchase")
}

/// SELECT advertiser_id, type, COUNT(*) GROUP BY advertiser_id, type
/// with no filters. Group-by order does not matter.
fn matches_advertiser_type(q: &Query) -> bool {
    let group: BTreeSet<&str> = q.group_by.iter().map(String::as_str).collect();
    group == BTreeSet::from(["advertiser_id", "type"])
        && q.has_column("advertiser_id")
        && q.has_column("type")
        && q.has_aggregate(AggFunc::Count, "*")
        && q.select.iter().all(|item| match item {
            SelectItem::Column(c) => c == "advertiser_id" || c == "type",
            SelectItem::Aggregate { func, col } => *func == AggFunc::Count && col == "*",
        })
        && q.filters.is_empty()
}

/// SELECT minute, SUM(bid_price) over impressions GROUP BY minute, with
/// an optional day eq filter.
fn matches_minute_revenue(q: &Query) -> bool {
    if q.group_by != ["minute"]
        || !q.has_column("minute")
        || !q.has_aggregate(AggFunc::Sum, "bid_price")
    {
        return false;
    }
    if !q.select.iter().all(|item| match item {
        SelectItem::Column(c) => c == "minute",
        SelectItem::Aggregate { func, col } => *func == AggFunc::Sum && col == "bid_price",
    }) {
        return false;
    }
    let mut saw_type = false;
    for p in &q.filters {
        if filter_is_type_eq(p, "impression") {
            saw_type = true;
        } else if p.col == "day" && p.op == Op::Eq {
        } else {
            return false;
        }
    }
    saw_type
}

/// Derives the partitions a scan must touch. `type eq`/`type in` restrict
/// the type axis; `day eq` restricts the day axis. A `day between` filter
/// leaves the day axis unrestricted; the filter still applies after the
/// load, so results are correct but unpruned.
pub fn partitions_to_scan(filters: &[Predicate]) -> (Vec<EventType>, Option<Vec<NaiveDate>>) {
    let mut types: Vec<EventType> = EventType::ALL.to_vec();
    let mut days: Option<Vec<NaiveDate>> = None;

    for p in filters {
        match (p.col.as_str(), p.op) {
            ("type", Op::Eq) => {
                types = p.values.first().and_then(as_event_type).into_iter().collect();
            }
            ("type", Op::In) => {
                types = p.values.iter().filter_map(as_event_type).collect();
            }
            ("day", Op::Eq) => {
                if let Some(day) = p.values.first().and_then(as_day) {
                    days = Some(vec![day]);
                }
            }
            _ => {}
        }
    }
    (types, days)
}

fn as_event_type(v: &Value) -> Option<EventType> {
    match v {
        Value::Str(s) => EventType::parse(s),
        _ => None,
    }
}

fn as_day(v: &Value) -> Option<NaiveDate> {
    match v {
        Value::Str(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
        Value::Date(d) => Some(*d),
        _ => None,
    }
}

/// Column pruning: the union of columns referenced by select (aggregate
/// arguments except `*`), where, group_by and order_by. Order-by names
/// containing `(` denote computed aggregates, not stored columns.
pub fn columns_to_load(q: &Query) -> Vec<String> {
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for item in &q.select {
        match item {
            SelectItem::Column(c) => {
                columns.insert(c.clone());
            }
            SelectItem::Aggregate { col, .. } if col != "*" => {
                columns.insert(col.clone());
            }
            SelectItem::Aggregate { .. } => {}
        }
    }
    for p in &q.filters {
        columns.insert(p.col.clone());
    }
    for c in &q.group_by {
        columns.insert(c.clone());
    }
    for key in &q.order_by {
        if !key.col.contains('(') {
            columns.insert(key.col.clone());
        }
    }
    columns.into_iter().collect()
}
