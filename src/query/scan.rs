//! Scan execution: the fallback path when no rollup shape matches.

use crate::error::{EngineError, Result};
use crate::query::document::{OrderKey, Query, SelectItem};
use crate::query::planner;
use crate::storage::column::Predicate;
use crate::storage::table::AggExpr;
use crate::storage::{StoreLayout, Table};

/// Executes the query over the partitioned store: prune partitions and
/// columns, load lazily, filter, group or project, then order.
pub fn execute_scan(layout: &StoreLayout, q: &Query) -> Result<Table> {
    let (types, days) = planner::partitions_to_scan(&q.filters);
    let columns = planner::columns_to_load(q);

    let table = layout.scan_partitions(&types, days.as_deref(), &columns, &q.filters)?;
    let table = apply_filters(table, &q.filters);
    let table = apply_select(table, q)?;
    Ok(apply_order_by(table, &q.order_by))
}

/// Applies AND-joined predicates in order. Predicates over columns the
/// table does not carry are ignored.
pub fn apply_filters(table: Table, filters: &[Predicate]) -> Table {
    let mut table = table;
    for p in filters {
        let Some(col) = table.column_index(&p.col) else {
            continue;
        };
        let mask: Vec<bool> = (0..table.len())
            .map(|row| p.matches(&table.value(row, col)))
            .collect();
        table = table.filter(&mask);
    }
    table
}

fn apply_select(table: Table, q: &Query) -> Result<Table> {
    if q.group_by.is_empty() {
        if q.select
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { .. }))
        {
            return Err(EngineError::Malformed(
                "aggregates require a group_by clause".to_string(),
            ));
        }
        let names: Vec<String> = q
            .select
            .iter()
            .filter_map(|item| match item {
                SelectItem::Column(c) => Some(c.clone()),
                SelectItem::Aggregate { .. } => None,
            })
            .collect();
        if names.is_empty() {
            return Ok(table);
        }
        return table.select(&names);
    }

    let aggs: Vec<AggExpr> = q
        .select
        .iter()
        .filter_map(|item| match item {
            SelectItem::Aggregate { func, col } => Some(AggExpr::new(*func, col)),
            SelectItem::Column(_) => None,
        })
        .collect();
    let grouped = table.group_by_agg(&q.group_by, &aggs)?;

    // Final projection follows the select order.
    let names: Vec<String> = q.select.iter().map(SelectItem::output_name).collect();
    grouped.select(&names)
}

/// Applies order keys in list order, each as a stable sort. Keys resolve
/// case-insensitively against output columns; unknown keys are skipped.
pub fn apply_order_by(table: Table, order_by: &[OrderKey]) -> Table {
    let mut table = table;
    for key in order_by {
        let idx = table.column_index(&key.col).or_else(|| {
            table
                .names()
                .iter()
                .position(|n| n.eq_ignore_ascii_case(&key.col))
        });
        if let Some(idx) = idx {
            table = table.sort_by_index(idx, key.descending);
        }
    }
    table
}
