//! Decoded reply records.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column holding the scalar value of a point reference record.
pub const VALUE_COLUMN: &str = "value";

/// One decoded unit of a reply.
///
/// Reference replies set `field` (and `position` for array elements);
/// series, bar and tick replies set `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl Record {
    /// Scalar reference value for (ticker, field).
    pub fn reference(ticker: impl Into<String>, field: impl Into<String>, value: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(VALUE_COLUMN.to_string(), value);
        Self {
            ticker: ticker.into(),
            field: Some(field.into()),
            timestamp: None,
            position: None,
            values,
        }
    }

    /// One element of an array-valued reference field.
    pub fn block(
        ticker: impl Into<String>,
        field: impl Into<String>,
        position: usize,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            field: Some(field.into()),
            timestamp: None,
            position: Some(position),
            values,
        }
    }

    /// A time-stamped row (series, bar or tick).
    pub fn timed(ticker: impl Into<String>, timestamp: NaiveDateTime, values: BTreeMap<String, Value>) -> Self {
        Self {
            ticker: ticker.into(),
            field: None,
            timestamp: Some(timestamp),
            position: None,
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Scalar value of a point reference record.
    pub fn value(&self) -> Option<&Value> {
        self.get(VALUE_COLUMN)
    }

    /// True when no column carries a non-null value.
    pub fn is_blank(&self) -> bool {
        self.values.values().all(Value::is_null)
    }
}

/// Parse the timestamp formats the provider emits: `YYYY-MM-DD`,
/// `YYYY-MM-DDTHH:MM:SS[.fff]` with optional offset or `Z`.
///
/// Offsets are normalised to UTC.
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_formats() {
        let date = parse_timestamp(&json!("2024-01-02")).unwrap();
        assert_eq!(date.to_string(), "2024-01-02 00:00:00");

        let naive = parse_timestamp(&json!("2024-01-02T14:30:00.000")).unwrap();
        assert_eq!(naive.to_string(), "2024-01-02 14:30:00");

        let offset = parse_timestamp(&json!("2024-01-02T09:30:00-05:00")).unwrap();
        assert_eq!(offset.to_string(), "2024-01-02 14:30:00");

        assert!(parse_timestamp(&json!(20240102)).is_none());
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn blank_record_detection() {
        let mut values = BTreeMap::new();
        values.insert("open".to_string(), Value::Null);
        let rec = Record::timed("X", parse_timestamp(&json!("2024-01-02")).unwrap(), values);
        assert!(rec.is_blank());

        let rec = Record::reference("X", "PX_LAST", json!(101.5));
        assert!(!rec.is_blank());
        assert_eq!(rec.value(), Some(&json!(101.5)));
    }
}
