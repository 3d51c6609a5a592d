//! Typed nullable columns, scalar values and filter predicates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Physical type of a stored column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Int64,
    Float64,
    Utf8,
    Date,
}

/// A nullable column of a single physical type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
}

impl ColumnData {
    pub fn empty(dtype: DataType) -> Self {
        match dtype {
            DataType::Int32 => ColumnData::Int32(Vec::new()),
            DataType::Int64 => ColumnData::Int64(Vec::new()),
            DataType::Float64 => ColumnData::Float64(Vec::new()),
            DataType::Utf8 => ColumnData::Utf8(Vec::new()),
            DataType::Date => ColumnData::Date(Vec::new()),
        }
    }

    /// A column of `len` nulls.
    pub fn nulls(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Int32 => ColumnData::Int32(vec![None; len]),
            DataType::Int64 => ColumnData::Int64(vec![None; len]),
            DataType::Float64 => ColumnData::Float64(vec![None; len]),
            DataType::Utf8 => ColumnData::Utf8(vec![None; len]),
            DataType::Date => ColumnData::Date(vec![None; len]),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            ColumnData::Int32(_) => DataType::Int32,
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::Float64(_) => DataType::Float64,
            ColumnData::Utf8(_) => DataType::Utf8,
            ColumnData::Date(_) => DataType::Date,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Date(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, row: usize) -> Value {
        match self {
            ColumnData::Int32(v) => v[row].map(|x| Value::Int(x as i64)).unwrap_or(Value::Null),
            ColumnData::Int64(v) => v[row].map(Value::Int).unwrap_or(Value::Null),
            ColumnData::Float64(v) => v[row].map(Value::Float).unwrap_or(Value::Null),
            ColumnData::Utf8(v) => v[row]
                .as_ref()
                .map(|s| Value::Str(s.clone()))
                .unwrap_or(Value::Null),
            ColumnData::Date(v) => v[row].map(Value::Date).unwrap_or(Value::Null),
        }
    }

    /// Keeps the rows whose mask entry is true.
    pub fn filter(&self, mask: &[bool]) -> Self {
        fn keep<T: Clone>(values: &[Option<T>], mask: &[bool]) -> Vec<Option<T>> {
            values
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| v.clone())
                .collect()
        }
        match self {
            ColumnData::Int32(v) => ColumnData::Int32(keep(v, mask)),
            ColumnData::Int64(v) => ColumnData::Int64(keep(v, mask)),
            ColumnData::Float64(v) => ColumnData::Float64(keep(v, mask)),
            ColumnData::Utf8(v) => ColumnData::Utf8(keep(v, mask)),
            ColumnData::Date(v) => ColumnData::Date(keep(v, mask)),
        }
    }

    /// Reorders rows by the given index permutation.
    pub fn take(&self, indices: &[usize]) -> Self {
        fn gather<T: Clone>(values: &[Option<T>], indices: &[usize]) -> Vec<Option<T>> {
            indices.iter().map(|&i| values[i].clone()).collect()
        }
        match self {
            ColumnData::Int32(v) => ColumnData::Int32(gather(v, indices)),
            ColumnData::Int64(v) => ColumnData::Int64(gather(v, indices)),
            ColumnData::Float64(v) => ColumnData::Float64(gather(v, indices)),
            ColumnData::Utf8(v) => ColumnData::Utf8(gather(v, indices)),
            ColumnData::Date(v) => ColumnData::Date(gather(v, indices)),
        }
    }

    /// Appends another column of the same type. Mismatched types append nulls.
    pub fn append(&mut self, other: ColumnData) {
        match (self, other) {
            (ColumnData::Int32(a), ColumnData::Int32(b)) => a.extend(b),
            (ColumnData::Int64(a), ColumnData::Int64(b)) => a.extend(b),
            (ColumnData::Float64(a), ColumnData::Float64(b)) => a.extend(b),
            (ColumnData::Utf8(a), ColumnData::Utf8(b)) => a.extend(b),
            (ColumnData::Date(a), ColumnData::Date(b)) => a.extend(b),
            (this, other) => {
                let grown = this.len() + other.len();
                this.pad_nulls(grown);
            }
        }
    }

    /// Grows the column to `len` rows by appending nulls.
    pub fn pad_nulls(&mut self, len: usize) {
        fn pad<T: Clone>(values: &mut Vec<Option<T>>, len: usize) {
            while values.len() < len {
                values.push(None);
            }
        }
        match self {
            ColumnData::Int32(v) => pad(v, len),
            ColumnData::Int64(v) => pad(v, len),
            ColumnData::Float64(v) => pad(v, len),
            ColumnData::Utf8(v) => pad(v, len),
            ColumnData::Date(v) => pad(v, len),
        }
    }

    /// Min/max over the non-null values.
    pub fn stats(&self) -> ColumnStats {
        let mut min: Option<Value> = None;
        let mut max: Option<Value> = None;
        for row in 0..self.len() {
            let v = self.value(row);
            if v == Value::Null {
                continue;
            }
            match &min {
                Some(m) if v >= *m => {}
                _ => min = Some(v.clone()),
            }
            match &max {
                Some(m) if v <= *m => {}
                _ => max = Some(v),
            }
        }
        ColumnStats { min, max }
    }

    /// Rebuilds a column of the given type from scalar values.
    /// Values of a foreign type become nulls.
    pub fn from_values(dtype: DataType, values: Vec<Value>) -> Self {
        match dtype {
            DataType::Int32 => ColumnData::Int32(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Int(i) => Some(i as i32),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Int64 => ColumnData::Int64(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Int(i) => Some(i),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Float64 => ColumnData::Float64(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Float(f) => Some(f),
                        Value::Int(i) => Some(i as f64),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Utf8 => ColumnData::Utf8(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Str(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Date => ColumnData::Date(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Date(d) => Some(d),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }
}

/// A scalar value drawn from a column or a query literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::Date(_) => 4,
        }
    }

    /// Comparison with type coercion, used by predicate evaluation:
    /// integers compare against floats numerically, and date columns
    /// compare against ISO `YYYY-MM-DD` string literals.
    /// Returns None for null or incomparable operands.
    pub fn compare_coerced(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => Some((*a as f64).total_cmp(b)),
            (Value::Float(a), Value::Int(b)) => Some(a.total_cmp(&(*b as f64))),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Str(b)) => parse_iso_date(b).map(|d| a.cmp(&d)),
            (Value::Str(a), Value::Date(b)) => parse_iso_date(a).map(|d| d.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Min/max statistics stored per column in the file header.
/// Both are None when every value in the column is null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
}

/// Comparison operator of a filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    In,
    Between,
}

/// A single filter condition. Predicates in a query are AND-joined.
///
/// `values` holds one literal for Eq/Neq, any number for In, and
/// exactly `[low, high]` (inclusive) for Between.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub col: String,
    pub op: Op,
    pub values: Vec<Value>,
}

impl Predicate {
    /// Evaluates the predicate against one scalar. Nulls never match.
    pub fn matches(&self, v: &Value) -> bool {
        if *v == Value::Null {
            return false;
        }
        match self.op {
            Op::Eq => v.compare_coerced(&self.values[0]) == Some(Ordering::Equal),
            Op::Neq => matches!(
                v.compare_coerced(&self.values[0]),
                Some(Ordering::Less) | Some(Ordering::Greater)
            ),
            Op::In => self
                .values
                .iter()
                .any(|w| v.compare_coerced(w) == Some(Ordering::Equal)),
            Op::Between => {
                let low = v.compare_coerced(&self.values[0]);
                let high = v.compare_coerced(&self.values[1]);
                matches!(low, Some(Ordering::Greater) | Some(Ordering::Equal))
                    && matches!(high, Some(Ordering::Less) | Some(Ordering::Equal))
            }
        }
    }

    /// Block-skipping check against column min/max statistics.
    /// Returns false only when the predicate provably excludes every row.
    pub fn allowed_by(&self, stats: &ColumnStats) -> bool {
        let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
            // All-null column: Eq/In/Between cannot match, Neq keeps nothing either.
            return false;
        };
        let below = |v: &Value| v.compare_coerced(min) == Some(Ordering::Less);
        let above = |v: &Value| v.compare_coerced(max) == Some(Ordering::Greater);
        match self.op {
            Op::Neq => true,
            Op::Eq => !(below(&self.values[0]) || above(&self.values[0])),
            Op::In => self.values.iter().any(|v| !(below(v) || above(v))),
            Op::Between => {
                // Skip when the range lies entirely outside [min, max].
                !(self.values[1].compare_coerced(min) == Some(Ordering::Less)
                    || self.values[0].compare_coerced(max) == Some(Ordering::Greater))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_stats_skip_nulls() {
        let col = ColumnData::Float64(vec![Some(2.0), None, Some(0.5)]);
        let stats = col.stats();
        assert_eq!(stats.min, Some(Value::Float(0.5)));
        assert_eq!(stats.max, Some(Value::Float(2.0)));
    }

    #[test]
    fn test_stats_all_null() {
        let col = ColumnData::Int32(vec![None, None]);
        let stats = col.stats();
        assert_eq!(stats.min, None);
        assert_eq!(stats.max, None);
    }

    #[test]
    fn test_predicate_eq_coerces_date_strings() {
        let p = Predicate {
            col: "day".to_string(),
            op: Op::Eq,
            values: vec![Value::Str("2024-01-01".to_string())],
        };
        assert!(p.matches(&Value::Date(date("2024-01-01"))));
        assert!(!p.matches(&Value::Date(date("2024-01-02"))));
        assert!(!p.matches(&Value::Null));
    }

    #[test]
    fn test_predicate_between_inclusive() {
        let p = Predicate {
            col: "day".to_string(),
            op: Op::Between,
            values: vec![
                Value::Str("2024-01-01".to_string()),
                Value::Str("2024-01-02".to_string()),
            ],
        };
        assert!(p.matches(&Value::Date(date("2024-01-01"))));
        assert!(p.matches(&Value::Date(date("2024-01-02"))));
        assert!(!p.matches(&Value::Date(date("2024-01-03"))));
    }

    #[test]
    fn test_predicate_in_mixed_numeric() {
        let p = Predicate {
            col: "advertiser_id".to_string(),
            op: Op::In,
            values: vec![Value::Int(1), Value::Int(3)],
        };
        assert!(p.matches(&Value::Int(1)));
        assert!(!p.matches(&Value::Int(2)));
        assert!(p.matches(&Value::Float(3.0)));
    }

    #[test]
    fn test_stats_pruning() {
        let stats = ColumnStats {
            min: Some(Value::Date(date("2024-01-01"))),
            max: Some(Value::Date(date("2024-01-05"))),
        };
        let eq_out = Predicate {
            col: "day".to_string(),
            op: Op::Eq,
            values: vec![Value::Str("2024-02-01".to_string())],
        };
        assert!(!eq_out.allowed_by(&stats));

        let between_overlap = Predicate {
            col: "day".to_string(),
            op: Op::Between,
            values: vec![
                Value::Str("2024-01-04".to_string()),
                Value::Str("2024-01-10".to_string()),
            ],
        };
        assert!(between_overlap.allowed_by(&stats));

        let all_null = ColumnStats { min: None, max: None };
        assert!(!eq_out.allowed_by(&all_null));
    }

    #[test]
    fn test_append_and_pad() {
        let mut a = ColumnData::Int64(vec![Some(1)]);
        a.append(ColumnData::Int64(vec![Some(2), None]));
        assert_eq!(a.len(), 3);
        a.pad_nulls(5);
        assert_eq!(a.value(4), Value::Null);
    }

    #[test]
    fn test_float_display_keeps_decimal_point() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Int(2).to_string(), "2");
    }
}
