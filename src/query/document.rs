//! Query documents.
//!
//! Queries arrive as JSON-compatible dictionaries mixing bare column
//! names and single-entry aggregate maps. They are parsed once at engine
//! entry into a typed form; everything downstream works on [`Query`].

use serde_json::Value as Json;

use crate::error::{EngineError, Result};
use crate::storage::column::{Op, Predicate, Value};
use crate::storage::table::AggFunc;

/// One entry of the `select` list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column(String),
    /// `col` is `"*"` for `COUNT`-of-rows.
    Aggregate { func: AggFunc, col: String },
}

impl SelectItem {
    /// Output column name: the column itself, or `"<func>(<col>)"`.
    pub fn output_name(&self) -> String {
        match self {
            SelectItem::Column(name) => name.clone(),
            SelectItem::Aggregate { func, col } => {
                if *func == AggFunc::Count && col == "*" {
                    "count(*)".to_string()
                } else {
                    format!("{}({})", func.as_str(), col)
                }
            }
        }
    }
}

/// One `order_by` entry. Direction defaults to ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub col: String,
    pub descending: bool,
}

/// A parsed query document.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub select: Vec<SelectItem>,
    pub filters: Vec<Predicate>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderKey>,
}

impl Query {
    pub fn has_column(&self, name: &str) -> bool {
        self.select
            .iter()
            .any(|item| matches!(item, SelectItem::Column(c) if c == name))
    }

    pub fn has_aggregate(&self, func: AggFunc, col: &str) -> bool {
        self.select
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { func: f, col: c } if *f == func && c == col))
    }
}

/// Parses a query document. Unknown top-level keys are ignored; a `from`
/// other than the single logical table `events` is an error.
pub fn parse_query(doc: &Json) -> Result<Query> {
    let obj = doc
        .as_object()
        .ok_or_else(|| EngineError::Malformed("query must be an object".to_string()))?;

    if let Some(from) = obj.get("from") {
        match from.as_str() {
            Some("events") => {}
            _ => {
                return Err(EngineError::Malformed(format!(
                    "unknown table {}, only 'events' exists",
                    from
                )));
            }
        }
    }

    let select = match obj.get("select") {
        None => Vec::new(),
        Some(Json::Array(items)) => items.iter().map(parse_select_item).collect::<Result<_>>()?,
        Some(other) => {
            return Err(EngineError::Malformed(format!(
                "select must be a list, got {}",
                other
            )));
        }
    };

    let filters = match obj.get("where") {
        None => Vec::new(),
        Some(Json::Array(items)) => items.iter().map(parse_predicate).collect::<Result<_>>()?,
        Some(other) => {
            return Err(EngineError::Malformed(format!(
                "where must be a list, got {}",
                other
            )));
        }
    };

    let group_by = match obj.get("group_by") {
        None => Vec::new(),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    EngineError::Malformed(format!("group_by entries must be strings, got {}", item))
                })
            })
            .collect::<Result<_>>()?,
        Some(other) => {
            return Err(EngineError::Malformed(format!(
                "group_by must be a list, got {}",
                other
            )));
        }
    };

    let order_by = match obj.get("order_by") {
        None => Vec::new(),
        Some(Json::Array(items)) => items.iter().map(parse_order_key).collect::<Result<_>>()?,
        Some(other) => {
            return Err(EngineError::Malformed(format!(
                "order_by must be a list, got {}",
                other
            )));
        }
    };

    Ok(Query {
        select,
        filters,
        group_by,
        order_by,
    })
}

fn parse_select_item(item: &Json) -> Result<SelectItem> {
    match item {
        Json::String(name) => Ok(SelectItem::Column(name.clone())),
        Json::Object(map) if map.len() == 1 => {
            let (func, col) = map.iter().next().expect("len checked");
            let func = match func.as_str() {
                "SUM" => AggFunc::Sum,
                "AVG" => AggFunc::Avg,
                "COUNT" => AggFunc::Count,
                other => {
                    return Err(EngineError::Malformed(format!(
                        "unknown aggregate function '{}'",
                        other
                    )));
                }
            };
            let col = col.as_str().ok_or_else(|| {
                EngineError::Malformed(format!("aggregate argument must be a column name, got {}", col))
            })?;
            if col == "*" && func != AggFunc::Count {
                return Err(EngineError::Malformed(format!(
                    "{}(*) is not defined",
                    func.as_str()
                )));
            }
            Ok(SelectItem::Aggregate {
                func,
                col: col.to_string(),
            })
        }
        other => Err(EngineError::Malformed(format!(
            "select entries must be a column name or a single-entry aggregate map, got {}",
            other
        ))),
    }
}

fn parse_predicate(item: &Json) -> Result<Predicate> {
    let obj = item
        .as_object()
        .ok_or_else(|| EngineError::Malformed(format!("where entries must be objects, got {}", item)))?;
    let col = obj
        .get("col")
        .and_then(Json::as_str)
        .ok_or_else(|| EngineError::Malformed("where entry lacks 'col'".to_string()))?
        .to_string();
    let op = match obj.get("op").and_then(Json::as_str) {
        Some("eq") => Op::Eq,
        Some("neq") => Op::Neq,
        Some("in") => Op::In,
        Some("between") => Op::Between,
        other => {
            return Err(EngineError::Malformed(format!(
                "unknown predicate op {:?}",
                other
            )));
        }
    };
    let val = obj
        .get("val")
        .ok_or_else(|| EngineError::Malformed("where entry lacks 'val'".to_string()))?;

    let values = match op {
        Op::Eq | Op::Neq => vec![scalar(val)?],
        Op::In => val
            .as_array()
            .ok_or_else(|| EngineError::Malformed("'in' expects a list".to_string()))?
            .iter()
            .map(scalar)
            .collect::<Result<_>>()?,
        Op::Between => {
            let bounds = val
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| EngineError::Malformed("'between' expects [low, high]".to_string()))?;
            bounds.iter().map(scalar).collect::<Result<_>>()?
        }
    };
    Ok(Predicate { col, op, values })
}

fn parse_order_key(item: &Json) -> Result<OrderKey> {
    let obj = item.as_object().ok_or_else(|| {
        EngineError::Malformed(format!("order_by entries must be objects, got {}", item))
    })?;
    let col = obj
        .get("col")
        .and_then(Json::as_str)
        .ok_or_else(|| EngineError::Malformed("order_by entry lacks 'col'".to_string()))?
        .to_string();
    let descending = obj
        .get("dir")
        .and_then(Json::as_str)
        .map(|d| d.eq_ignore_ascii_case("desc"))
        .unwrap_or(false);
    Ok(OrderKey { col, descending })
}

fn scalar(val: &Json) -> Result<Value> {
    match val {
        Json::Null => Ok(Value::Null),
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(EngineError::Malformed(format!("unrepresentable number {}", n)))
            }
        }
        other => Err(EngineError::Malformed(format!(
            "unsupported literal {}",
            other
        ))),
    }
}
