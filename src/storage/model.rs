//! Event data model: types, stored schema and time-key derivation.

use chrono::{DateTime, Datelike, Duration, NaiveDate};

use crate::storage::column::DataType;

/// Categorical event type. Each type owns one partition directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Serve,
    Impression,
    Click,
    Purchase,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Serve,
        EventType::Impression,
        EventType::Click,
        EventType::Purchase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Serve => "serve",
            EventType::Impression => "impression",
            EventType::Click => "click",
            EventType::Purchase => "purchase",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        match s {
            "serve" => Some(EventType::Serve),
            "impression" => Some(EventType::Impression),
            "click" => Some(EventType::Click),
            "purchase" => Some(EventType::Purchase),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header of the input CSV shards, in order.
pub const CSV_HEADER: [&str; 9] = [
    "ts",
    "type",
    "auction_id",
    "advertiser_id",
    "publisher_id",
    "bid_price",
    "user_id",
    "total_price",
    "country",
];

/// Stored partition schema: the nine CSV columns plus four derived keys.
pub const SCHEMA: [(&str, DataType); 13] = [
    ("ts", DataType::Int64),
    ("type", DataType::Utf8),
    ("auction_id", DataType::Utf8),
    ("advertiser_id", DataType::Int32),
    ("publisher_id", DataType::Int32),
    ("bid_price", DataType::Float64),
    ("user_id", DataType::Int64),
    ("total_price", DataType::Float64),
    ("country", DataType::Utf8),
    ("day", DataType::Date),
    ("week", DataType::Date),
    ("hour", DataType::Int64),
    ("minute", DataType::Utf8),
];

/// Looks up the stored type of a schema column.
pub fn column_dtype(name: &str) -> Option<DataType> {
    SCHEMA
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, dtype)| *dtype)
}

/// Time keys derived from an event timestamp (UTC).
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedKeys {
    /// Calendar date.
    pub day: NaiveDate,
    /// Monday of the week containing `day`.
    pub week: NaiveDate,
    /// Timestamp truncated to the hour, epoch milliseconds.
    pub hour: i64,
    /// `YYYY-MM-DD HH:MM`.
    pub minute: String,
}

/// Derives all time keys from epoch milliseconds.
/// Returns None for timestamps chrono cannot represent.
pub fn derive_keys(ts_ms: i64) -> Option<DerivedKeys> {
    let dt = DateTime::from_timestamp_millis(ts_ms)?;
    let day = dt.date_naive();
    let week = day - Duration::days(day.weekday().num_days_from_monday() as i64);
    let hour = ts_ms - ts_ms.rem_euclid(3_600_000);
    let minute = dt.format("%Y-%m-%d %H:%M").to_string();
    Some(DerivedKeys {
        day,
        week,
        hour,
        minute,
    })
}
