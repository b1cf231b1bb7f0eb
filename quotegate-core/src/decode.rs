//! Reply decoders: provider message trees → `Record`s.
//!
//! One decoder per query kind:
//! - reference (point, block, screen): `securityData` or `data.securityData`
//! - historical: `securityData.fieldData[]`, one record per date
//! - bar: `barData.barTickData[]`
//! - tick: `tickData.tickData[]`, with column renames
//!
//! Malformed or missing sections decode to nothing; only `responseError`
//! is treated as a failure, and that is the pump's job.

use crate::protocol::Message;
use crate::query::{Query, QueryKind};
use crate::record::{parse_timestamp, Record};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Turns one reply message into zero or more records.
pub trait Decode {
    fn decode(&mut self, message: &Message, out: &mut Vec<Record>);
}

impl<F> Decode for F
where
    F: FnMut(&Message, &mut Vec<Record>),
{
    fn decode(&mut self, message: &Message, out: &mut Vec<Record>) {
        self(message, out)
    }
}

/// Built-in decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoder {
    Reference,
    Historical,
    Bars { ticker: String },
    Ticks { ticker: String },
}

impl Decoder {
    /// Decoder matching the query's reply shape.
    pub fn for_query(query: &Query) -> Self {
        let ticker = query.tickers().first().cloned().unwrap_or_default();
        match query.kind() {
            QueryKind::PointRef | QueryKind::BlockRef | QueryKind::Screen => Decoder::Reference,
            QueryKind::TimeSeries => Decoder::Historical,
            QueryKind::Bar => Decoder::Bars { ticker },
            QueryKind::Tick => Decoder::Ticks { ticker },
        }
    }
}

impl Decode for Decoder {
    fn decode(&mut self, message: &Message, out: &mut Vec<Record>) {
        match self {
            Decoder::Reference => decode_reference(message, out),
            Decoder::Historical => decode_historical(message, out),
            Decoder::Bars { ticker } => decode_bars(ticker, message, out),
            Decoder::Ticks { ticker } => decode_ticks(ticker, message, out),
        }
    }
}

// ── Reference ───────────────────────────────────────────────────────

fn security_data(message: &Message) -> Option<&Value> {
    message
        .element("securityData")
        .or_else(|| message.path(&["data", "securityData"]))
}

/// A single object or an array of objects, viewed as a slice.
fn items(node: &Value) -> &[Value] {
    match node {
        Value::Array(items) => items,
        other => std::slice::from_ref(other),
    }
}

fn ticker_of(node: &Value) -> Option<&str> {
    node.get("security").and_then(Value::as_str)
}

fn decode_reference(message: &Message, out: &mut Vec<Record>) {
    let Some(data) = security_data(message) else {
        return;
    };
    for security in items(data) {
        let Some(ticker) = ticker_of(security) else {
            continue;
        };
        let Some(Value::Object(fields)) = security.get("fieldData") else {
            continue;
        };
        for (field, value) in fields {
            match value {
                Value::Array(elements) => {
                    for (position, element) in elements.iter().enumerate() {
                        out.push(Record::block(ticker, field, position, columns(element)));
                    }
                }
                scalar => out.push(Record::reference(ticker, field, scalar.clone())),
            }
        }
    }
}

fn columns(element: &Value) -> BTreeMap<String, Value> {
    match element {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Null => BTreeMap::new(),
        other => BTreeMap::from([(crate::record::VALUE_COLUMN.to_string(), other.clone())]),
    }
}

// ── Historical ──────────────────────────────────────────────────────

fn decode_historical(message: &Message, out: &mut Vec<Record>) {
    let Some(data) = security_data(message) else {
        return;
    };
    for security in items(data) {
        let Some(ticker) = ticker_of(security) else {
            continue;
        };
        let Some(Value::Array(rows)) = security.get("fieldData") else {
            continue;
        };
        for row in rows {
            let Some(obj) = row.as_object() else { continue };
            let Some(date) = obj.get("date").and_then(parse_timestamp) else {
                continue;
            };
            let values = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "date")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            out.push(Record::timed(ticker, date, values));
        }
    }
}

// ── Bars ────────────────────────────────────────────────────────────

/// Bar columns as reported → as emitted.
const BAR_COLUMNS: [(&str, &str); 6] = [
    ("open", "open"),
    ("high", "high"),
    ("low", "low"),
    ("close", "close"),
    ("volume", "volume"),
    ("numEvents", "num_trds"),
];

fn decode_bars(ticker: &str, message: &Message, out: &mut Vec<Record>) {
    let Some(Value::Array(bars)) = message.path(&["barData", "barTickData"]) else {
        return;
    };
    for bar in bars {
        let Some(obj) = bar.as_object() else { continue };
        let Some(time) = obj.get("time").and_then(parse_timestamp) else {
            continue;
        };
        let values = BAR_COLUMNS
            .iter()
            .map(|(from, to)| (to.to_string(), obj.get(*from).cloned().unwrap_or(Value::Null)))
            .collect();
        out.push(Record::timed(ticker, time, values));
    }
}

// ── Ticks ───────────────────────────────────────────────────────────

fn tick_column(name: &str) -> &str {
    match name {
        "size" => "volume",
        "type" => "typ",
        "conditionCodes" => "cond",
        "exchangeCode" => "exch",
        "tradeTime" => "trd_time",
        other => other,
    }
}

fn decode_ticks(ticker: &str, message: &Message, out: &mut Vec<Record>) {
    let Some(Value::Array(ticks)) = message.path(&["tickData", "tickData"]) else {
        return;
    };
    for tick in ticks {
        let Some(obj) = tick.as_object() else { continue };
        let Some(time) = obj.get("time").and_then(parse_timestamp) else {
            continue;
        };
        out.push(Record::timed(ticker, time, renamed(obj)));
    }
}

fn renamed(obj: &Map<String, Value>) -> BTreeMap<String, Value> {
    obj.iter()
        .filter(|(k, _)| k.as_str() != "time")
        .map(|(k, v)| (tick_column(k).to_string(), v.clone()))
        .collect()
}
