//! In-memory batch of named columns with the relational operations the
//! executor needs: projection, filtering, grouping, sorting, concatenation
//! and CSV serialization.

use std::collections::HashMap;
use std::io;

use crate::error::{EngineError, Result};
use crate::storage::column::{ColumnData, DataType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Aggregate function of a select entry or rollup definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Avg,
    Count,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Count => "count",
        }
    }
}

/// One aggregation to compute per group. `col` of `"*"` with Count is a
/// plain row count.
#[derive(Debug, Clone)]
pub struct AggExpr {
    pub func: AggFunc,
    pub col: String,
    pub alias: String,
}

impl AggExpr {
    pub fn new(func: AggFunc, col: &str) -> Self {
        let alias = if func == AggFunc::Count && col == "*" {
            "count(*)".to_string()
        } else {
            format!("{}({})", func.as_str(), col)
        };
        Self {
            func,
            col: col.to_string(),
            alias,
        }
    }

    /// Same aggregate, published under a different output name.
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
}

#[derive(Clone, Default)]
struct AggState {
    sum_i: i64,
    sum_f: f64,
    non_null: u64,
    rows: u64,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        debug_assert!(
            columns.windows(2).all(|w| w[0].data.len() == w[1].data.len()),
            "column lengths diverge"
        );
        Self { columns }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn value(&self, row: usize, col: usize) -> Value {
        self.columns[col].data.value(row)
    }

    /// Projects the named columns, in the given order.
    pub fn select(&self, names: &[String]) -> Result<Table> {
        let columns = names
            .iter()
            .map(|n| {
                self.column(n).cloned().ok_or_else(|| {
                    EngineError::QueryExecution(format!("unknown column '{}'", n))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Table::new(columns))
    }

    /// Renames a column in place. Returns false when absent.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.columns.iter_mut().find(|c| c.name == from) {
            Some(col) => {
                col.name = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Keeps rows whose mask entry is true.
    pub fn filter(&self, mask: &[bool]) -> Table {
        Table::new(
            self.columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.filter(mask),
                })
                .collect(),
        )
    }

    /// Vertical concatenation. Schemas are aligned by name: columns missing
    /// on either side are padded with nulls, so partitions with divergent
    /// schemas can still be stacked.
    pub fn append(&mut self, other: Table) {
        let prior = self.len();
        let added = other.len();
        for col in other.columns {
            match self.column_index(&col.name) {
                Some(i) => self.columns[i].data.append(col.data),
                None => {
                    let mut data = ColumnData::nulls(col.data.dtype(), prior);
                    data.append(col.data);
                    self.columns.push(Column {
                        name: col.name,
                        data,
                    });
                }
            }
        }
        let total = prior + added;
        for col in &mut self.columns {
            col.data.pad_nulls(total);
        }
    }

    /// Stable sort by one column. Nulls order first ascending.
    pub fn sort_by_index(&self, col: usize, descending: bool) -> Table {
        let data = &self.columns[col].data;
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.sort_by(|&a, &b| {
            let ord = data.value(a).cmp(&data.value(b));
            if descending { ord.reverse() } else { ord }
        });
        Table::new(
            self.columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.take(&indices),
                })
                .collect(),
        )
    }

    pub fn sort_by(&self, name: &str, descending: bool) -> Result<Table> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| EngineError::QueryExecution(format!("unknown sort column '{}'", name)))?;
        Ok(self.sort_by_index(idx, descending))
    }

    /// Hash aggregation. Group keys preserve the source column types;
    /// output columns are the keys followed by the aggregates, groups in
    /// first-seen order.
    pub fn group_by_agg(&self, keys: &[String], aggs: &[AggExpr]) -> Result<Table> {
        let key_idx = keys
            .iter()
            .map(|k| {
                self.column_index(k).ok_or_else(|| {
                    EngineError::QueryExecution(format!("unknown group column '{}'", k))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Resolve aggregate inputs up front; sums over non-numeric columns
        // are rejected before any row is touched.
        let mut agg_idx: Vec<Option<usize>> = Vec::with_capacity(aggs.len());
        let mut agg_int: Vec<bool> = Vec::with_capacity(aggs.len());
        for agg in aggs {
            if agg.func == AggFunc::Count && agg.col == "*" {
                agg_idx.push(None);
                agg_int.push(true);
                continue;
            }
            let idx = self.column_index(&agg.col).ok_or_else(|| {
                EngineError::QueryExecution(format!("unknown aggregate column '{}'", agg.col))
            })?;
            let dtype = self.columns[idx].data.dtype();
            match (agg.func, dtype) {
                (AggFunc::Count, _) => {}
                (_, DataType::Int32 | DataType::Int64 | DataType::Float64) => {}
                (func, _) => {
                    return Err(EngineError::QueryExecution(format!(
                        "cannot {} column '{}'",
                        func.as_str(),
                        agg.col
                    )));
                }
            }
            agg_int.push(matches!(dtype, DataType::Int32 | DataType::Int64));
            agg_idx.push(Some(idx));
        }

        let mut group_of: HashMap<Vec<Value>, usize> = HashMap::new();
        let mut group_keys: Vec<Vec<Value>> = Vec::new();
        let mut states: Vec<Vec<AggState>> = Vec::new();

        for row in 0..self.len() {
            let key: Vec<Value> = key_idx.iter().map(|&i| self.value(row, i)).collect();
            let gi = match group_of.get(&key) {
                Some(&gi) => gi,
                None => {
                    let gi = group_keys.len();
                    group_of.insert(key.clone(), gi);
                    group_keys.push(key);
                    states.push(vec![AggState::default(); aggs.len()]);
                    gi
                }
            };
            for (j, agg) in aggs.iter().enumerate() {
                let state = &mut states[gi][j];
                state.rows += 1;
                let Some(idx) = agg_idx[j] else { continue };
                match self.value(row, idx) {
                    Value::Null => {}
                    Value::Int(i) => {
                        state.sum_i += i;
                        state.sum_f += i as f64;
                        state.non_null += 1;
                    }
                    Value::Float(f) => {
                        state.sum_f += f;
                        state.non_null += 1;
                    }
                    _ => {
                        // Count of non-numeric columns only tracks presence.
                        state.non_null += 1;
                    }
                }
            }
        }

        let mut columns = Vec::with_capacity(keys.len() + aggs.len());
        for (pos, name) in keys.iter().enumerate() {
            let dtype = self.columns[key_idx[pos]].data.dtype();
            let values = group_keys.iter().map(|k| k[pos].clone()).collect();
            columns.push(Column {
                name: name.clone(),
                data: ColumnData::from_values(dtype, values),
            });
        }
        for (j, agg) in aggs.iter().enumerate() {
            let data = match agg.func {
                AggFunc::Count => {
                    let counts = states
                        .iter()
                        .map(|s| {
                            if agg.col == "*" {
                                Some(s[j].rows as i64)
                            } else {
                                Some(s[j].non_null as i64)
                            }
                        })
                        .collect();
                    ColumnData::Int64(counts)
                }
                AggFunc::Sum if agg_int[j] => {
                    ColumnData::Int64(states.iter().map(|s| Some(s[j].sum_i)).collect())
                }
                AggFunc::Sum => {
                    ColumnData::Float64(states.iter().map(|s| Some(s[j].sum_f)).collect())
                }
                AggFunc::Avg => ColumnData::Float64(
                    states
                        .iter()
                        .map(|s| {
                            let st = &s[j];
                            if st.non_null == 0 {
                                None
                            } else {
                                Some(st.sum_f / st.non_null as f64)
                            }
                        })
                        .collect(),
                ),
            };
            columns.push(Column {
                name: agg.alias.clone(),
                data,
            });
        }
        Ok(Table::new(columns))
    }

    /// Writes the table as RFC-4180 CSV with a header row.
    pub fn to_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        w.write_record(self.names())?;
        for row in 0..self.len() {
            let record: Vec<String> = (0..self.width())
                .map(|col| self.value(row, col).to_string())
                .collect();
            w.write_record(&record)?;
        }
        w.flush()?;
        Ok(())
    }

    /// Materializes one row as scalars; test and debugging helper.
    pub fn row(&self, row: usize) -> Vec<Value> {
        (0..self.width()).map(|col| self.value(row, col)).collect()
    }
}
