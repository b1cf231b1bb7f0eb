//! Logical queries: what the caller wants, before any request is built.
//!
//! A `Query` is immutable once constructed. Each kind has its own
//! constructor that fills in the verb-specific settings, so callers never
//! assemble provider element names by hand.

use crate::options::RequestOptions;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Reference / historical / intraday request service.
pub const REFDATA_SERVICE: &str = "//blp/refdata";

/// Live market-data subscription service.
pub const MKTDATA_SERVICE: &str = "//blp/mktdata";

/// Field used for time-series queries with no explicit fields.
pub const DEFAULT_SERIES_FIELD: &str = "Last_Price";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// One scalar per (ticker, field).
    PointRef,
    /// Array-valued reference field, one record per element.
    BlockRef,
    /// Daily (or coarser) history per (ticker, date).
    TimeSeries,
    /// Intraday bars for a single ticker.
    Bar,
    /// Intraday ticks for a single ticker.
    Tick,
    /// Equity screen.
    Screen,
}

impl QueryKind {
    /// Short operation name used in logs and trial keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            QueryKind::PointRef => "point_ref",
            QueryKind::BlockRef => "block_ref",
            QueryKind::TimeSeries => "time_series",
            QueryKind::Bar => "bar",
            QueryKind::Tick => "tick",
            QueryKind::Screen => "screen",
        }
    }

    /// Default provider verb for this kind.
    pub const fn verb(self) -> &'static str {
        match self {
            QueryKind::PointRef | QueryKind::BlockRef => "ReferenceDataRequest",
            QueryKind::TimeSeries => "HistoricalDataRequest",
            QueryKind::Bar => "IntradayBarRequest",
            QueryKind::Tick => "IntradayTickRequest",
            QueryKind::Screen => "BeqsRequest",
        }
    }

    /// Kinds whose repeated empty results are throttled.
    pub const fn is_trial_limited(self) -> bool {
        matches!(self, QueryKind::Bar | QueryKind::Tick)
    }

    /// Kinds checked against the per-unit result cache.
    pub const fn is_unit_cached(self) -> bool {
        matches!(self, QueryKind::PointRef | QueryKind::BlockRef)
    }

    /// Kinds that carry securities as repeated request entries.
    pub const fn repeats_securities(self) -> bool {
        matches!(
            self,
            QueryKind::PointRef | QueryKind::BlockRef | QueryKind::TimeSeries
        )
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time window of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Window {
    /// Inclusive calendar date range.
    Dates { start: NaiveDate, end: NaiveDate },
    /// Intraday range, already expressed in UTC.
    Intraday {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Point-in-time date.
    AsOf(NaiveDate),
}

impl Window {
    /// The calendar date the window is anchored on.
    pub fn anchor_date(&self) -> NaiveDate {
        match self {
            Window::Dates { start, .. } => *start,
            Window::Intraday { start, .. } => start.date(),
            Window::AsOf(date) => *date,
        }
    }
}

/// Per-query cache behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Consult and populate the cache at all.
    pub enabled: bool,
    /// Entries are date-stamped and age out.
    pub has_date: bool,
    /// Per-query staleness window; `None` uses the store default.
    pub staleness_days: Option<u32>,
    /// Skip the lookup but still write fresh results.
    pub reload: bool,
    /// Batch mode: throttled queries are skipped silently.
    pub batch: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            has_date: false,
            staleness_days: None,
            reload: false,
            batch: false,
        }
    }
}

/// Screen type for equity screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScreenType {
    Global,
    Private,
}

impl ScreenType {
    /// `G...` is global, anything else private.
    pub fn parse(s: &str) -> Self {
        if s.trim_start().starts_with(['G', 'g']) {
            ScreenType::Global
        } else {
            ScreenType::Private
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ScreenType::Global => "GLOBAL",
            ScreenType::Private => "PRIVATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("{kind} query has no tickers")]
    NoTickers { kind: QueryKind },

    #[error("{kind} query has no fields")]
    NoFields { kind: QueryKind },

    #[error("{kind} query window ends before it starts")]
    InvertedWindow { kind: QueryKind },

    #[error("{kind} query takes exactly one ticker, got {count}")]
    SingleTicker { kind: QueryKind, count: usize },
}

// ── Query ───────────────────────────────────────────────────────────

/// An immutable logical query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: QueryKind,
    verb: &'static str,
    tickers: Vec<String>,
    fields: Vec<String>,
    window: Option<Window>,
    settings: Vec<(String, Value)>,
    options: RequestOptions,
    cache: CachePolicy,
}

impl Query {
    fn base(kind: QueryKind, tickers: Vec<String>, fields: Vec<String>) -> Self {
        Self {
            kind,
            verb: kind.verb(),
            tickers,
            fields,
            window: None,
            settings: Vec::new(),
            options: RequestOptions::new(),
            cache: CachePolicy::default(),
        }
    }

    /// Scalar reference values for tickers × fields.
    pub fn point_ref<T, F>(tickers: T, fields: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self::base(QueryKind::PointRef, collect(tickers), collect(fields))
    }

    /// Array-valued reference fields. Entries are date-stamped by default.
    pub fn block_ref<T, F>(tickers: T, fields: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut q = Self::base(QueryKind::BlockRef, collect(tickers), collect(fields));
        q.cache.has_date = true;
        q
    }

    /// Block query issued through the portfolio-data verb.
    pub fn portfolio<T, F>(tickers: T, fields: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut q = Self::block_ref(tickers, fields);
        q.verb = "PortfolioDataRequest";
        q
    }

    /// Historical series between two dates. Empty fields fall back to the
    /// last price.
    pub fn time_series<T, F>(tickers: T, fields: F, start: NaiveDate, end: NaiveDate) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let mut fields = collect(fields);
        if fields.is_empty() {
            fields.push(DEFAULT_SERIES_FIELD.to_string());
        }
        let mut q = Self::base(QueryKind::TimeSeries, collect(tickers), fields);
        q.window = Some(Window::Dates { start, end });
        q
    }

    /// Intraday bars of `interval` minutes for one event type, UTC window.
    pub fn bars(
        ticker: impl Into<String>,
        event_type: impl Into<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        interval: u32,
    ) -> Self {
        let ticker = ticker.into();
        let event_type = event_type.into();
        let mut q = Self::base(QueryKind::Bar, vec![ticker.clone()], vec![event_type.clone()]);
        q.window = Some(Window::Intraday { start, end });
        q.settings = vec![
            ("security".into(), Value::String(ticker)),
            ("eventType".into(), Value::String(event_type)),
            ("interval".into(), json!(interval)),
        ];
        q
    }

    /// Intraday ticks for one ticker across the given event types, UTC window.
    pub fn ticks<E>(ticker: impl Into<String>, event_types: E, start: NaiveDateTime, end: NaiveDateTime) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let ticker = ticker.into();
        let mut types = collect(event_types);
        if types.is_empty() {
            types.push("TRADE".to_string());
        }
        let mut q = Self::base(QueryKind::Tick, vec![ticker.clone()], types);
        q.window = Some(Window::Intraday { start, end });
        q.settings = vec![
            ("security".into(), Value::String(ticker)),
            ("includeConditionCodes".into(), Value::Bool(true)),
            ("includeExchangeCodes".into(), Value::Bool(true)),
            ("includeNonPlottableEvents".into(), Value::Bool(true)),
        ];
        q
    }

    /// Equity screen by name. `as_of` becomes the `PiTDate` override.
    pub fn screen(
        name: impl Into<String>,
        screen_type: ScreenType,
        group: impl Into<String>,
        as_of: Option<NaiveDate>,
    ) -> Self {
        let name = name.into();
        let mut q = Self::base(QueryKind::Screen, vec![name.clone()], Vec::new());
        q.settings = vec![
            ("screenName".into(), Value::String(name)),
            ("screenType".into(), Value::String(screen_type.as_str().into())),
            ("Group".into(), Value::String(group.into())),
        ];
        if let Some(date) = as_of {
            q.window = Some(Window::AsOf(date));
            q.options = q
                .options
                .with_override("PiTDate", date.format("%Y%m%d").to_string());
        }
        q.cache.enabled = false;
        q
    }

    /// Dividend / split history shortcut over a block field.
    ///
    /// Only equity tickers without `=` are queried; others are dropped. A
    /// type outside the shorthand table is used as the field name itself.
    pub fn dividend<T>(
        tickers: T,
        dividend_type: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let field = dividend_field(dividend_type).unwrap_or(dividend_type);
        let tickers: Vec<String> = collect(tickers)
            .into_iter()
            .filter(|t| t.contains("Equity") && !t.contains('='))
            .collect();
        let mut q = Self::block_ref(tickers, [field]);
        if let Some(start) = start {
            q.options = q
                .options
                .with_override("DVD_Start_Dt", start.format("%Y%m%d").to_string());
        }
        if let Some(end) = end {
            q.options = q
                .options
                .with_override("DVD_End_Dt", end.format("%Y%m%d").to_string());
        }
        if field == "Eqy_DVD_Adjust_Fact" {
            q.options = q
                .options
                .with_override("Corporate_Actions_Filter", "NORMAL_CASH|ABNORMAL_CASH|CAPITAL_CHANGE");
        }
        q
    }

    // ── Builder-style refinements ──

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        // Overrides set by the constructor (PiTDate, DVD dates) are kept
        let mut merged = options;
        for (k, v) in self.options.overrides() {
            if merged.override_value(k).is_none() {
                merged = merged.with_override(k, v);
            }
        }
        self.options = merged;
        self
    }

    pub fn with_cache_policy(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.cache.batch = batch;
        self
    }

    // ── Accessors ──

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_ref()
    }

    pub fn settings(&self) -> &[(String, Value)] {
        &self.settings
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache
    }

    /// Check the shape rules of the query kind.
    pub fn validate(&self) -> Result<(), QueryError> {
        let kind = self.kind;
        if self.tickers.is_empty() {
            return Err(QueryError::NoTickers { kind });
        }
        if self.fields.is_empty() && kind != QueryKind::Screen {
            return Err(QueryError::NoFields { kind });
        }
        if matches!(kind, QueryKind::Bar | QueryKind::Tick) && self.tickers.len() != 1 {
            return Err(QueryError::SingleTicker {
                kind,
                count: self.tickers.len(),
            });
        }
        let inverted = match self.window {
            Some(Window::Dates { start, end }) => end < start,
            Some(Window::Intraday { start, end }) => end < start,
            _ => false,
        };
        if inverted {
            return Err(QueryError::InvertedWindow { kind });
        }
        Ok(())
    }
}

fn collect<I>(items: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.into();
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Block field behind a dividend type shorthand.
pub fn dividend_field(dividend_type: &str) -> Option<&'static str> {
    Some(match dividend_type {
        "all" => "DVD_Hist_All",
        "dvd" => "DVD_Hist",
        "split" => "Eqy_DVD_Hist_Splits",
        "gross" => "Eqy_DVD_Hist_Gross",
        "adjust" => "Eqy_DVD_Adjust_Fact",
        "adj_fund" => "Eqy_DVD_Adj_Fund",
        "with_amt" => "DVD_Hist_All_with_Amt_Status",
        "dvd_amt" => "DVD_Hist_with_Amt_Status",
        "gross_amt" => "DVD_Hist_Gross_with_Amt_Stat",
        "projected" => "BDVD_Pr_Ex_Dts_DVD_Amts_w_Ann",
        _ => return None,
    })
}
