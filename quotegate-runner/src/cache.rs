//! On-disk result cache.
//!
//! Layout:
//! - reference units: `{root}/{asset}/{ticker}/{field}/{suffix}.json`
//! - date-stamped units: `{root}/{asset}/{ticker}/{field}/asof={date}, {suffix}.json`
//! - intraday bar sessions: `{root}/{asset}/{ticker}/{event_type}/{date}.parq`
//!   plus a `{date}.meta.json` sidecar
//!
//! Features:
//! - Deterministic keys: options are canonicalized (aliases translated,
//!   sorted) before the suffix is formed
//! - Staleness for date-stamped entries (`age >= window` is stale)
//! - Atomic writes (write to .tmp, rename into place)
//! - BLAKE3 hash verified on read; corrupt files are quarantined
//!   (`{filename}.quarantined`) and treated as a miss
//! - No root, no cache: every lookup misses, nothing is written

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use quotegate_core::options::RequestOptions;
use quotegate_core::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_STALENESS_DAYS: u32 = 10;

/// Suffix used when a query carries no options or overrides.
pub const NO_OVERRIDES: &str = "ovrd=None";

const ASOF_PREFIX: &str = "asof=";
const BAR_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];
const BAR_COUNT_COLUMNS: [&str; 2] = ["volume", "num_trds"];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cache entry {0} failed its integrity check")]
    HashMismatch(PathBuf),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("cache validation error: {0}")]
    Validation(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ── Keys ────────────────────────────────────────────────────────────

/// `k=v, k=v` over the canonical option pairs, or `ovrd=None`.
pub fn cache_suffix(options: &RequestOptions) -> String {
    let pairs = options.canonical_pairs();
    if pairs.is_empty() {
        return NO_OVERRIDES.to_string();
    }
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", path_component(k), path_component(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Asset class: the last whitespace-separated token of the ticker.
pub fn asset_class(ticker: &str) -> &str {
    ticker.split_whitespace().last().unwrap_or(ticker)
}

/// Tickers may contain `/`; it never becomes a path separator.
pub fn ticker_dir_name(ticker: &str) -> String {
    path_component(ticker)
}

/// One path component: separators and `..` are replaced with `_`.
fn path_component(raw: &str) -> String {
    raw.replace(['/', '\\'], "_").replace("..", "__")
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    /// Entry to read on a hit; equals `target` on a miss.
    pub path: PathBuf,
    /// Where fresh results for this key are written.
    pub target: PathBuf,
    pub hit: bool,
}

/// Envelope persisted for every reference unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub ticker: String,
    pub field: String,
    pub stored_at: NaiveDate,
    pub data_hash: String,
    pub records: Vec<Record>,
}

/// Metadata sidecar for a cached bar session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSessionMeta {
    pub ticker: String,
    pub event_type: String,
    pub date: NaiveDate,
    /// UTC window the session file covers.
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub bar_count: usize,
    /// BLAKE3 of the parquet file bytes.
    pub data_hash: String,
    pub cached_at: NaiveDateTime,
}

fn records_hash(records: &[Record]) -> Result<String, CacheError> {
    Ok(blake3::hash(&serde_json::to_vec(records)?).to_hex().to_string())
}

// ── Store ───────────────────────────────────────────────────────────

/// The file-backed cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Option<PathBuf>,
    staleness_days: u32,
}

impl CacheStore {
    pub fn new(root: Option<PathBuf>, staleness_days: u32) -> Self {
        Self {
            root,
            staleness_days: staleness_days.max(1),
        }
    }

    /// A store that never hits and never writes.
    pub fn disabled() -> Self {
        Self::new(None, DEFAULT_STALENESS_DAYS)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn staleness_days(&self) -> u32 {
        self.staleness_days
    }

    /// `{root}/{asset}/{ticker}/{field}`
    pub fn field_dir(&self, ticker: &str, field: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        Some(
            root.join(path_component(asset_class(ticker)))
                .join(ticker_dir_name(ticker))
                .join(path_component(field)),
        )
    }

    /// Locate the entry for (ticker, field, options) as of today.
    pub fn locate(
        &self,
        ticker: &str,
        field: &str,
        options: &RequestOptions,
        has_date: bool,
    ) -> Option<CacheLocation> {
        let today = chrono::Local::now().date_naive();
        self.locate_at(ticker, field, options, has_date, self.staleness_days, today)
    }

    /// Locate with an explicit staleness window and reference date.
    pub fn locate_at(
        &self,
        ticker: &str,
        field: &str,
        options: &RequestOptions,
        has_date: bool,
        window_days: u32,
        today: NaiveDate,
    ) -> Option<CacheLocation> {
        let dir = self.field_dir(ticker, field)?;
        let suffix = cache_suffix(options);

        if !has_date {
            let path = dir.join(format!("{suffix}.json"));
            let hit = path.is_file();
            return Some(CacheLocation {
                target: path.clone(),
                path,
                hit,
            });
        }

        let target = dir.join(dated_name(today, &suffix));
        let newest = newest_dated_entry(&dir, &suffix, today);
        let location = match newest {
            Some(date) if (today - date).num_days() < i64::from(window_days.max(1)) => {
                CacheLocation {
                    path: dir.join(dated_name(date, &suffix)),
                    target,
                    hit: true,
                }
            }
            _ => CacheLocation {
                path: target.clone(),
                target,
                hit: false,
            },
        };
        debug!(path = %location.path.display(), hit = location.hit, "cache lookup");
        Some(location)
    }

    /// Records stored at `path`, or `None` on a miss. Corrupt entries are
    /// quarantined.
    pub fn read(&self, path: &Path) -> Option<Vec<Record>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache unavailable");
                return None;
            }
        };
        match decode_envelope(path, &bytes) {
            Ok(envelope) => Some(envelope.records),
            Err(e) => {
                quarantine(path, &e);
                None
            }
        }
    }

    /// Write `records` for (ticker, field) to `path` atomically.
    pub fn write(
        &self,
        path: &Path,
        ticker: &str,
        field: &str,
        records: &[Record],
    ) -> Result<(), CacheError> {
        let today = chrono::Local::now().date_naive();
        self.write_at(path, ticker, field, records, today)
    }

    /// Write with an explicit storage date.
    pub fn write_at(
        &self,
        path: &Path,
        ticker: &str,
        field: &str,
        records: &[Record],
        today: NaiveDate,
    ) -> Result<(), CacheError> {
        if records.is_empty() {
            return Err(CacheError::Validation("no records to cache".into()));
        }
        let envelope = CacheEnvelope {
            ticker: ticker.to_string(),
            field: field.to_string(),
            stored_at: today,
            data_hash: records_hash(records)?,
            records: records.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(path, &json)?;
        debug!(path = %path.display(), records = records.len(), "cache entry written");
        Ok(())
    }

    // ── Intraday bar sessions ──

    /// `{root}/{asset}/{ticker}/{event_type}/{date}.parq`
    pub fn bar_path(&self, ticker: &str, event_type: &str, date: NaiveDate) -> Option<PathBuf> {
        Some(self.field_dir(ticker, event_type)?.join(format!("{date}.parq")))
    }

    fn bar_meta_path(&self, ticker: &str, event_type: &str, date: NaiveDate) -> Option<PathBuf> {
        Some(self.field_dir(ticker, event_type)?.join(format!("{date}.meta.json")))
    }

    /// Cached bars covering `[start, end]`, filtered to that window.
    pub fn read_bars(
        &self,
        ticker: &str,
        event_type: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Option<Vec<Record>> {
        let date = start.date();
        let path = self.bar_path(ticker, event_type, date)?;
        let meta_path = self.bar_meta_path(ticker, event_type, date)?;
        if !path.is_file() {
            return None;
        }
        let meta: BarSessionMeta = match fs::read(&meta_path)
            .map_err(io_err(&meta_path))
            .and_then(|b| serde_json::from_slice(&b).map_err(CacheError::from))
        {
            Ok(meta) => meta,
            Err(e) => {
                quarantine(&path, &e);
                return None;
            }
        };
        if meta.start > start || meta.end < end {
            debug!(path = %path.display(), "cached session does not cover the window");
            return None;
        }
        match load_bar_session(&path, ticker, &meta.data_hash) {
            Ok(records) => Some(
                records
                    .into_iter()
                    .filter(|r| r.timestamp.is_some_and(|t| t >= start && t <= end))
                    .collect(),
            ),
            Err(e) => {
                quarantine(&path, &e);
                None
            }
        }
    }

    /// Persist a bar session for `[start, end]`. Sessions on or after
    /// `today` are still moving and are never written. Returns whether a
    /// file was written.
    pub fn write_bars(
        &self,
        ticker: &str,
        event_type: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        records: &[Record],
        today: NaiveDate,
    ) -> Result<bool, CacheError> {
        let date = start.date();
        let (Some(path), Some(meta_path)) = (
            self.bar_path(ticker, event_type, date),
            self.bar_meta_path(ticker, event_type, date),
        ) else {
            return Ok(false);
        };
        if records.is_empty() || date >= today {
            return Ok(false);
        }

        let mut df = bars_to_dataframe(records)?;
        let tmp_path = path.with_extension("parq.tmp");
        ensure_parent(&path)?;
        let file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        ParquetWriter::new(file)
            .finish(&mut df)
            .map_err(|e| CacheError::Parquet(format!("write parquet: {e}")))?;
        let bytes = fs::read(&tmp_path).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CacheError::Io {
                path: path.clone(),
                source: e,
            }
        })?;

        let meta = BarSessionMeta {
            ticker: ticker.to_string(),
            event_type: event_type.to_string(),
            date,
            start,
            end,
            bar_count: records.len(),
            data_hash: blake3::hash(&bytes).to_hex().to_string(),
            cached_at: chrono::Local::now().naive_local(),
        };
        write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;
        debug!(path = %path.display(), bars = records.len(), "bar session cached");
        Ok(true)
    }
}

fn dated_name(date: NaiveDate, suffix: &str) -> String {
    format!("{ASOF_PREFIX}{}, {suffix}.json", date.format("%Y-%m-%d"))
}

/// Most recent `asof=` date for `suffix` in `dir`, ignoring future dates.
fn newest_dated_entry(dir: &Path, suffix: &str, today: NaiveDate) -> Option<NaiveDate> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cache unavailable");
            return None;
        }
    };
    let tail = format!(", {suffix}.json");
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let date = name.strip_prefix(ASOF_PREFIX)?.strip_suffix(tail.as_str())?;
            NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
        })
        .filter(|date| *date <= today)
        .max()
}

fn decode_envelope(path: &Path, bytes: &[u8]) -> Result<CacheEnvelope, CacheError> {
    let envelope: CacheEnvelope = serde_json::from_slice(bytes)?;
    if records_hash(&envelope.records)? != envelope.data_hash {
        return Err(CacheError::HashMismatch(path.to_path_buf()));
    }
    Ok(envelope)
}

fn quarantine(path: &Path, reason: &CacheError) {
    let mut name = path.as_os_str().to_owned();
    name.push(".quarantined");
    let target = PathBuf::from(name);
    warn!(
        path = %path.display(),
        error = %reason,
        "quarantining corrupt cache file"
    );
    if let Err(e) = fs::rename(path, &target) {
        warn!(path = %path.display(), error = %e, "quarantine failed");
    }
}

fn ensure_parent(path: &Path) -> Result<(), CacheError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(io_err(parent)),
        None => Ok(()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    ensure_parent(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    fs::write(&tmp_path, bytes).map_err(io_err(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn bars_to_dataframe(records: &[Record]) -> Result<DataFrame, CacheError> {
    let times: Vec<Option<i64>> = records
        .iter()
        .map(|r| r.timestamp.map(|t| t.and_utc().timestamp_millis()))
        .collect();
    let mut columns = vec![Column::new("time".into(), times)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
        .map_err(|e| CacheError::Parquet(format!("time cast: {e}")))?];
    for name in BAR_COLUMNS {
        let values: Vec<Option<f64>> = records
            .iter()
            .map(|r| r.get(name).and_then(Value::as_f64))
            .collect();
        columns.push(Column::new(name.into(), values));
    }
    for name in BAR_COUNT_COLUMNS {
        let values: Vec<Option<i64>> = records
            .iter()
            .map(|r| r.get(name).and_then(Value::as_i64))
            .collect();
        columns.push(Column::new(name.into(), values));
    }
    DataFrame::new(columns).map_err(|e| CacheError::Parquet(format!("dataframe creation: {e}")))
}

fn load_bar_session(path: &Path, ticker: &str, expected_hash: &str) -> Result<Vec<Record>, CacheError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    if blake3::hash(&bytes).to_hex().as_str() != expected_hash {
        return Err(CacheError::HashMismatch(path.to_path_buf()));
    }
    let df = ParquetReader::new(io::Cursor::new(bytes))
        .finish()
        .map_err(|e| CacheError::Parquet(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(CacheError::Validation("empty parquet file".into()));
    }
    let parquet_err = |e: PolarsError| CacheError::Parquet(format!("column read: {e}"));

    let time = df
        .column("time")
        .and_then(|c| c.cast(&DataType::Int64))
        .map_err(parquet_err)?;
    let time_ca = time.i64().map_err(parquet_err)?;

    let mut float_cols = Vec::with_capacity(BAR_COLUMNS.len());
    for name in BAR_COLUMNS {
        float_cols.push((name, df.column(name).map_err(parquet_err)?.f64().map_err(parquet_err)?));
    }
    let mut int_cols = Vec::with_capacity(BAR_COUNT_COLUMNS.len());
    for name in BAR_COUNT_COLUMNS {
        int_cols.push((name, df.column(name).map_err(parquet_err)?.i64().map_err(parquet_err)?));
    }

    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ms = time_ca
            .get(i)
            .ok_or_else(|| CacheError::Validation(format!("null time at row {i}")))?;
        let timestamp = DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| CacheError::Validation(format!("time out of range at row {i}")))?
            .naive_utc();
        let mut values = BTreeMap::new();
        for (name, ca) in &float_cols {
            values.insert(name.to_string(), ca.get(i).map_or(Value::Null, Value::from));
        }
        for (name, ca) in &int_cols {
            values.insert(name.to_string(), ca.get(i).map_or(Value::Null, Value::from));
        }
        records.push(Record::timed(ticker, timestamp, values));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_cache_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("quotegate_cache_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn bar(ts: &str, close: f64) -> Record {
        let mut values = BTreeMap::new();
        values.insert("open".into(), json!(close - 1.0));
        values.insert("high".into(), json!(close + 1.0));
        values.insert("low".into(), json!(close - 2.0));
        values.insert("close".into(), json!(close));
        values.insert("volume".into(), json!(1000));
        values.insert("num_trds".into(), json!(12));
        Record::timed("AAPL US Equity", at(ts), values)
    }

    #[test]
    fn path_layout() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let loc = store
            .locate_at("ES1 Index/X", "PX_LAST", &RequestOptions::new(), false, 10, day("2024-03-01"))
            .unwrap();
        assert_eq!(loc.path, dir.join("Index").join("ES1 Index_X").join("PX_LAST").join("ovrd=None.json"));
        assert!(!loc.hit);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn suffix_uses_canonical_sorted_pairs() {
        let opts = RequestOptions::from_keywords([("Z_OVRD", "1"), ("Curr", "EUR"), ("A_OVRD", "x")]);
        assert_eq!(cache_suffix(&opts), "A_OVRD=x, Z_OVRD=1, currency=EUR");
        assert_eq!(cache_suffix(&RequestOptions::new()), "ovrd=None");
    }

    #[test]
    fn disabled_store_never_locates() {
        let store = CacheStore::disabled();
        assert!(store.locate("A US Equity", "PX_LAST", &RequestOptions::new(), true).is_none());
        assert!(store.bar_path("A US Equity", "TRADE", day("2024-01-02")).is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let loc = store
            .locate("AAPL US Equity", "PX_LAST", &RequestOptions::new(), false)
            .unwrap();
        let records = vec![Record::reference("AAPL US Equity", "PX_LAST", json!(190.5))];
        store.write(&loc.target, "AAPL US Equity", "PX_LAST", &records).unwrap();

        let again = store
            .locate("AAPL US Equity", "PX_LAST", &RequestOptions::new(), false)
            .unwrap();
        assert!(again.hit);
        assert_eq!(store.read(&again.path), Some(records));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn staleness_boundary() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let opts = RequestOptions::new();
        let today = day("2024-03-20");
        let records = vec![Record::reference("C US Equity", "DVD_Hist", json!(1))];

        for (age, expect_hit) in [(9, true), (10, false), (11, false)] {
            let field = format!("DVD_{age}");
            let stored = today - chrono::Duration::days(age);
            let path = store.field_dir("C US Equity", &field).unwrap().join(dated_name(stored, "ovrd=None"));
            store.write(&path, "C US Equity", &field, &records).unwrap();

            let loc = store.locate_at("C US Equity", &field, &opts, true, 10, today).unwrap();
            assert_eq!(loc.hit, expect_hit, "age {age}");
            if !expect_hit {
                assert!(loc.path.ends_with("asof=2024-03-20, ovrd=None.json"));
            }
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn newest_entry_wins_and_future_entries_are_ignored() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let records = vec![Record::reference("C US Equity", "F", json!(1))];
        let field_dir = store.field_dir("C US Equity", "F").unwrap();
        for d in ["2024-03-10", "2024-03-15", "2024-04-01"] {
            store
                .write(&field_dir.join(dated_name(day(d), "ovrd=None")), "C US Equity", "F", &records)
                .unwrap();
        }
        let loc = store
            .locate_at("C US Equity", "F", &RequestOptions::new(), true, 10, day("2024-03-20"))
            .unwrap();
        assert!(loc.hit);
        assert!(loc.path.ends_with("asof=2024-03-15, ovrd=None.json"));
        assert!(loc.target.ends_with("asof=2024-03-20, ovrd=None.json"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn override_values_never_leave_the_field_dir() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let field_dir = store.field_dir("C US Equity", "DVD_Hist_All").unwrap();
        let opts = RequestOptions::from_keywords([("X_OVRD", "a/../../../../.."), ("Y/../OVRD", "1")]);

        let loc = store
            .locate_at("C US Equity", "DVD_Hist_All", &opts, false, 10, day("2024-03-20"))
            .unwrap();
        assert_eq!(loc.target.parent(), Some(field_dir.as_path()));
        let records = vec![Record::reference("C US Equity", "DVD_Hist_All", json!(1))];
        store.write(&loc.target, "C US Equity", "DVD_Hist_All", &records).unwrap();
        assert!(loc.target.is_file());
        assert_eq!(fs::read_dir(&field_dir).unwrap().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn dated_entry_with_slash_in_value_hits() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let opts = RequestOptions::from_keywords([("DVD_Start_Dt", "2024/01/01")]);
        let today = day("2024-03-20");

        let first = store
            .locate_at("C US Equity", "DVD_Hist_All", &opts, true, 10, today)
            .unwrap();
        assert!(!first.hit);
        let records = vec![Record::reference("C US Equity", "DVD_Hist_All", json!(1))];
        store
            .write_at(&first.target, "C US Equity", "DVD_Hist_All", &records, today)
            .unwrap();

        let second = store
            .locate_at("C US Equity", "DVD_Hist_All", &opts, true, 10, day("2024-03-22"))
            .unwrap();
        assert!(second.hit);
        assert_eq!(second.path, first.target);
        assert_eq!(store.read(&second.path), Some(records));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_at_stamps_the_given_date() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let loc = store.locate("X Index", "F", &RequestOptions::new(), false).unwrap();
        store
            .write_at(&loc.target, "X Index", "F", &[Record::reference("X Index", "F", json!(1))], day("2020-05-04"))
            .unwrap();
        let envelope: CacheEnvelope = serde_json::from_slice(&fs::read(&loc.target).unwrap()).unwrap();
        assert_eq!(envelope.stored_at, day("2020-05-04"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tampered_entry_is_quarantined() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let loc = store.locate("X Index", "F", &RequestOptions::new(), false).unwrap();
        store
            .write(&loc.target, "X Index", "F", &[Record::reference("X Index", "F", json!(1))])
            .unwrap();

        let text = fs::read_to_string(&loc.target).unwrap().replace("\"value\": 1", "\"value\": 2");
        fs::write(&loc.target, text).unwrap();

        assert!(store.read(&loc.target).is_none());
        assert!(!loc.target.exists());
        let quarantined = PathBuf::from(format!("{}.quarantined", loc.target.display()));
        assert!(quarantined.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn garbage_entry_is_quarantined() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let loc = store.locate("X Index", "F", &RequestOptions::new(), false).unwrap();
        fs::create_dir_all(loc.target.parent().unwrap()).unwrap();
        fs::write(&loc.target, b"not json").unwrap();
        assert!(store.read(&loc.target).is_none());
        assert!(!loc.target.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn bar_session_roundtrip() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let bars = vec![bar("2024-01-02 14:30", 100.0), bar("2024-01-02 14:31", 101.0)];
        let written = store
            .write_bars("AAPL US Equity", "TRADE", at("2024-01-02 14:30"), at("2024-01-02 21:00"), &bars, day("2024-01-05"))
            .unwrap();
        assert!(written);
        assert!(store.bar_path("AAPL US Equity", "TRADE", day("2024-01-02")).unwrap().is_file());

        let loaded = store
            .read_bars("AAPL US Equity", "TRADE", at("2024-01-02 14:30"), at("2024-01-02 14:30"))
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].get("close"), Some(&json!(100.0)));
        assert_eq!(loaded[0].get("num_trds"), Some(&json!(12)));

        // Window outside what the session covers
        assert!(store
            .read_bars("AAPL US Equity", "TRADE", at("2024-01-02 13:00"), at("2024-01-02 14:31"))
            .is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn todays_bars_are_not_written() {
        let dir = temp_cache_dir();
        let store = CacheStore::new(Some(dir.clone()), 10);
        let bars = vec![bar("2024-01-05 14:30", 100.0)];
        let written = store
            .write_bars("AAPL US Equity", "TRADE", at("2024-01-05 14:30"), at("2024-01-05 21:00"), &bars, day("2024-01-05"))
            .unwrap();
        assert!(!written);
        let _ = fs::remove_dir_all(&dir);
    }
}
