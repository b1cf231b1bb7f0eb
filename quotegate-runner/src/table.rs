//! Result tables returned by the dispatcher.

use polars::prelude::*;
use quotegate_core::query::QueryKind;
use quotegate_core::record::Record;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Ordered records of one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    kind: QueryKind,
    records: Vec<Record>,
}

impl ResultTable {
    pub fn new(kind: QueryKind, records: Vec<Record>) -> Self {
        Self { kind, records }
    }

    pub fn empty(kind: QueryKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Records sorted by the query's ticker order, then field order.
    ///
    /// Tickers or fields the query did not name sort last. The sort is
    /// stable, so rows within one (ticker, field) keep reply order.
    pub fn ordered(kind: QueryKind, mut records: Vec<Record>, tickers: &[String], fields: &[String]) -> Self {
        let ticker_rank: HashMap<&str, usize> = tickers
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        let field_rank: HashMap<&str, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.as_str(), i))
            .collect();
        records.sort_by_key(|r| {
            let t = ticker_rank.get(r.ticker.as_str()).copied().unwrap_or(usize::MAX);
            let f = r
                .field
                .as_deref()
                .map_or(0, |f| field_rank.get(f).copied().unwrap_or(usize::MAX));
            (t, f)
        });
        Self::new(kind, records)
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Scalar value of a point reference cell.
    pub fn cell(&self, ticker: &str, field: &str) -> Option<&Value> {
        self.records
            .iter()
            .find(|r| r.ticker == ticker && r.field.as_deref() == Some(field) && r.position.is_none())
            .and_then(Record::value)
    }

    /// Rows belonging to (ticker, field), in order.
    pub fn rows<'a>(&'a self, ticker: &'a str, field: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .iter()
            .filter(move |r| r.ticker == ticker && r.field.as_deref() == Some(field))
    }

    /// Distinct tickers in record order.
    pub fn tickers(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.records
            .iter()
            .map(|r| r.ticker.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Union of value columns, sorted.
    pub fn value_columns(&self) -> Vec<String> {
        self.records
            .iter()
            .flat_map(|r| r.values.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Long-format frame: `ticker`, then `field`, `position` or `timestamp`
    /// when any record carries them, then one column per value key.
    ///
    /// A value column is Float64 when every non-null entry is numeric,
    /// String otherwise.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let mut columns = vec![Column::new(
            "ticker".into(),
            self.records.iter().map(|r| r.ticker.as_str()).collect::<Vec<_>>(),
        )];

        if self.records.iter().any(|r| r.field.is_some()) {
            let fields: Vec<Option<&str>> = self.records.iter().map(|r| r.field.as_deref()).collect();
            columns.push(Column::new("field".into(), fields));
        }
        if self.records.iter().any(|r| r.position.is_some()) {
            let positions: Vec<Option<u32>> = self
                .records
                .iter()
                .map(|r| r.position.and_then(|p| u32::try_from(p).ok()))
                .collect();
            columns.push(Column::new("position".into(), positions));
        }
        if self.records.iter().any(|r| r.timestamp.is_some()) {
            let times: Vec<Option<i64>> = self
                .records
                .iter()
                .map(|r| r.timestamp.map(|t| t.and_utc().timestamp_millis()))
                .collect();
            columns.push(
                Column::new("timestamp".into(), times)
                    .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?,
            );
        }

        for name in self.value_columns() {
            let cells: Vec<Option<&Value>> = self
                .records
                .iter()
                .map(|r| r.get(&name).filter(|v| !v.is_null()))
                .collect();
            if cells.iter().flatten().all(|v| v.is_number()) {
                let values: Vec<Option<f64>> = cells.iter().map(|c| c.and_then(Value::as_f64)).collect();
                columns.push(Column::new(name.as_str().into(), values));
            } else {
                let values: Vec<Option<String>> = cells.iter().map(|c| c.map(text)).collect();
                columns.push(Column::new(name.as_str().into(), values));
            }
        }
        DataFrame::new(columns)
    }
}

/// Display text of a JSON value: strings unquoted, everything else as JSON.
pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ordered_follows_query_order() {
        let records = vec![
            Record::reference("T2", "B", json!(4)),
            Record::reference("T1", "B", json!(2)),
            Record::reference("X", "A", json!(9)),
            Record::reference("T2", "A", json!(3)),
            Record::reference("T1", "A", json!(1)),
        ];
        let table = ResultTable::ordered(QueryKind::PointRef, records, &names(&["T1", "T2"]), &names(&["A", "B"]));
        let order: Vec<_> = table
            .records()
            .iter()
            .map(|r| format!("{}.{}", r.ticker, r.field.as_deref().unwrap_or("")))
            .collect();
        assert_eq!(order, vec!["T1.A", "T1.B", "T2.A", "T2.B", "X.A"]);
        assert_eq!(table.tickers(), vec!["T1", "T2", "X"]);
    }

    #[test]
    fn cell_lookup() {
        let table = ResultTable::new(
            QueryKind::PointRef,
            vec![Record::reference("T1", "PX_LAST", json!(101.5))],
        );
        assert_eq!(table.cell("T1", "PX_LAST"), Some(&json!(101.5)));
        assert_eq!(table.cell("T1", "VOLUME"), None);
        assert_eq!(table.cell("T2", "PX_LAST"), None);
    }

    #[test]
    fn block_rows_keep_positions() {
        let mut a = BTreeMap::new();
        a.insert("Ex-Date".to_string(), json!("2024-01-02"));
        let mut b = BTreeMap::new();
        b.insert("Ex-Date".to_string(), json!("2024-04-02"));
        let table = ResultTable::new(
            QueryKind::BlockRef,
            vec![Record::block("T1", "DVD_Hist", 0, a), Record::block("T1", "DVD_Hist", 1, b)],
        );
        let positions: Vec<_> = table.rows("T1", "DVD_Hist").map(|r| r.position).collect();
        assert_eq!(positions, vec![Some(0), Some(1)]);
        assert_eq!(table.cell("T1", "DVD_Hist"), None);
    }

    #[test]
    fn dataframe_types_follow_values() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut row = BTreeMap::new();
        row.insert("PX_LAST".to_string(), json!(10.5));
        row.insert("note".to_string(), json!("x"));
        let mut sparse = BTreeMap::new();
        sparse.insert("PX_LAST".to_string(), Value::Null);
        sparse.insert("note".to_string(), json!(3));
        let table = ResultTable::new(
            QueryKind::TimeSeries,
            vec![Record::timed("T1", day, row), Record::timed("T1", day, sparse)],
        );
        let df = table.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["ticker", "timestamp", "PX_LAST", "note"]);
        assert_eq!(df.column("PX_LAST").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("note").unwrap().dtype(), &DataType::String);
    }
}
