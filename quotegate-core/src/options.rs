//! Typed request options and override partitioning.
//!
//! Caller keywords fall into three buckets:
//! - named options with a canonical element name and an alias table
//!   (`Per=W` → `periodicitySelection=WEEKLY`)
//! - the `adjust` shorthand, expanded into the three adjustment flags
//! - everything else, forwarded as a raw `(fieldId, value)` override
//!
//! Gateway-level keywords (`cache`, `batch`, ...) are never forwarded.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Keywords consumed by the gateway itself.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "cache",
    "cache_days",
    "has_date",
    "batch",
    "reload",
    "raw",
    "port",
    "interval",
    "log",
    "timeout",
];

/// Keyword carrying the adjustment shorthand.
pub const ADJUST_KEYWORD: &str = "adjust";

/// Named request elements, declared in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionKey {
    PeriodicityAdjustment,
    PeriodicitySelection,
    Currency,
    NonTradingDayFillOption,
    NonTradingDayFillMethod,
    MaxDataPoints,
    ReturnEids,
    ReturnRelativeDate,
    OverrideOption,
    PricingOption,
    AdjustmentNormal,
    AdjustmentAbnormal,
    AdjustmentSplit,
    AdjustmentFollowDpdf,
    CalendarCodeOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Int,
    Bool,
}

impl OptionKey {
    pub const ALL: [OptionKey; 15] = [
        OptionKey::PeriodicityAdjustment,
        OptionKey::PeriodicitySelection,
        OptionKey::Currency,
        OptionKey::NonTradingDayFillOption,
        OptionKey::NonTradingDayFillMethod,
        OptionKey::MaxDataPoints,
        OptionKey::ReturnEids,
        OptionKey::ReturnRelativeDate,
        OptionKey::OverrideOption,
        OptionKey::PricingOption,
        OptionKey::AdjustmentNormal,
        OptionKey::AdjustmentAbnormal,
        OptionKey::AdjustmentSplit,
        OptionKey::AdjustmentFollowDpdf,
        OptionKey::CalendarCodeOverride,
    ];

    /// Element name as the provider expects it.
    pub const fn canonical_name(self) -> &'static str {
        match self {
            OptionKey::PeriodicityAdjustment => "periodicityAdjustment",
            OptionKey::PeriodicitySelection => "periodicitySelection",
            OptionKey::Currency => "currency",
            OptionKey::NonTradingDayFillOption => "nonTradingDayFillOption",
            OptionKey::NonTradingDayFillMethod => "nonTradingDayFillMethod",
            OptionKey::MaxDataPoints => "maxDataPoints",
            OptionKey::ReturnEids => "returnEids",
            OptionKey::ReturnRelativeDate => "returnRelativeDate",
            OptionKey::OverrideOption => "overrideOption",
            OptionKey::PricingOption => "pricingOption",
            OptionKey::AdjustmentNormal => "adjustmentNormal",
            OptionKey::AdjustmentAbnormal => "adjustmentAbnormal",
            OptionKey::AdjustmentSplit => "adjustmentSplit",
            OptionKey::AdjustmentFollowDpdf => "adjustmentFollowDPDF",
            OptionKey::CalendarCodeOverride => "calendarCodeOverride",
        }
    }

    const fn aliases(self) -> &'static [&'static str] {
        match self {
            OptionKey::PeriodicityAdjustment => &["PeriodAdj", "PerAdj"],
            OptionKey::PeriodicitySelection => &["Period", "Per"],
            OptionKey::Currency => &["Currency", "Curr", "FX"],
            OptionKey::NonTradingDayFillOption => &["Days"],
            OptionKey::NonTradingDayFillMethod => &["Fill"],
            OptionKey::MaxDataPoints => &["Points"],
            OptionKey::ReturnEids => &["returnEIDs"],
            OptionKey::ReturnRelativeDate => &[],
            OptionKey::OverrideOption => &["Quote"],
            OptionKey::PricingOption => &["QuoteType", "QtTyp"],
            OptionKey::AdjustmentNormal => &["CshAdjNormal"],
            OptionKey::AdjustmentAbnormal => &["CshAdjAbnormal"],
            OptionKey::AdjustmentSplit => &["CapChg"],
            OptionKey::AdjustmentFollowDpdf => &["UseDPDF"],
            OptionKey::CalendarCodeOverride => &["Calendar"],
        }
    }

    const fn kind(self) -> ValueKind {
        match self {
            OptionKey::MaxDataPoints => ValueKind::Int,
            OptionKey::ReturnEids
            | OptionKey::ReturnRelativeDate
            | OptionKey::AdjustmentNormal
            | OptionKey::AdjustmentAbnormal
            | OptionKey::AdjustmentSplit
            | OptionKey::AdjustmentFollowDpdf => ValueKind::Bool,
            _ => ValueKind::Text,
        }
    }

    /// Resolve a caller keyword (canonical name or alias) to a key.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| {
            key.canonical_name() == keyword || key.aliases().contains(&keyword)
        })
    }

    /// Translate a raw caller value into the provider's enumerated value.
    ///
    /// Unknown shorthands pass through unchanged; the provider decides.
    pub fn translate(self, raw: &str) -> OptionValue {
        match self.kind() {
            ValueKind::Bool => OptionValue::Bool(parse_bool(raw)),
            ValueKind::Int => match raw.trim().parse::<i64>() {
                Ok(n) => OptionValue::Int(n),
                Err(_) => OptionValue::Text(raw.to_string()),
            },
            ValueKind::Text => OptionValue::Text(self.enumerated(raw).to_string()),
        }
    }

    fn enumerated(self, raw: &str) -> &str {
        match self {
            OptionKey::PeriodicityAdjustment => match raw {
                "A" => "ACTUAL",
                "C" => "CALENDAR",
                "F" => "FISCAL",
                _ => raw,
            },
            OptionKey::PeriodicitySelection => match raw {
                "D" => "DAILY",
                "W" => "WEEKLY",
                "M" => "MONTHLY",
                "Q" => "QUARTERLY",
                "S" => "SEMI_ANNUALLY",
                "Y" => "YEARLY",
                _ => raw,
            },
            OptionKey::NonTradingDayFillOption => match raw {
                "N" | "W" | "Weekdays" => "NON_TRADING_WEEKDAYS",
                "C" | "A" | "All" => "ALL_CALENDAR_DAYS",
                "T" | "Trading" => "ACTIVE_DAYS_ONLY",
                _ => raw,
            },
            OptionKey::NonTradingDayFillMethod => match raw {
                "C" | "P" | "Previous" => "PREVIOUS_VALUE",
                "B" | "Blank" | "NA" => "NIL_VALUE",
                _ => raw,
            },
            OptionKey::OverrideOption => match raw {
                "A" | "G" | "Average" => "OVERRIDE_OPTION_GPA",
                "C" | "Close" => "OVERRIDE_OPTION_CLOSE",
                _ => raw,
            },
            OptionKey::PricingOption => match raw {
                "P" | "Price" => "PRICING_OPTION_PRICE",
                "Y" | "Yield" => "PRICING_OPTION_YIELD",
                _ => raw,
            },
            _ => raw,
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "t" | "1" | "yes" | "y"
    )
}

/// A translated option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl OptionValue {
    pub fn to_json(&self) -> Value {
        match self {
            OptionValue::Bool(b) => Value::Bool(*b),
            OptionValue::Int(n) => Value::from(*n),
            OptionValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(n) => write!(f, "{n}"),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

// ── Adjustment shorthand ────────────────────────────────────────────

/// Expanded form of the `adjust` shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub normal: bool,
    pub abnormal: bool,
    pub split: bool,
}

impl Adjustment {
    /// `all` → everything on, `-` → everything off, otherwise substring
    /// matching (`dvd` turns on both cash adjustments). Blank → `None`.
    pub fn parse(shorthand: &str) -> Option<Self> {
        let s = shorthand.trim();
        if s.is_empty() {
            return None;
        }
        Some(match s {
            "all" => Self {
                normal: true,
                abnormal: true,
                split: true,
            },
            "-" => Self {
                normal: false,
                abnormal: false,
                split: false,
            },
            _ => Self {
                normal: s.contains("normal") || s.contains("dvd"),
                abnormal: s.contains("abn") || s.contains("dvd"),
                split: s.contains("split"),
            },
        })
    }

    fn elements(self) -> [(OptionKey, OptionValue); 3] {
        [
            (OptionKey::AdjustmentNormal, OptionValue::Bool(self.normal)),
            (OptionKey::AdjustmentAbnormal, OptionValue::Bool(self.abnormal)),
            (OptionKey::AdjustmentSplit, OptionValue::Bool(self.split)),
        ]
    }
}

// ── RequestOptions ──────────────────────────────────────────────────

/// Partitioned caller options: typed elements plus raw overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    adjustment: Option<Adjustment>,
    elements: BTreeMap<OptionKey, OptionValue>,
    overrides: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route caller keywords into elements and overrides.
    ///
    /// Pure: the result depends only on the set of keywords, not on their
    /// order (a repeated keyword keeps its last value).
    pub fn from_keywords<I, K, V>(keywords: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        keywords
            .into_iter()
            .fold(Self::new(), |opts, (k, v)| opts.with_keyword(k.as_ref(), v.as_ref()))
    }

    /// Route a single keyword.
    pub fn with_keyword(self, keyword: &str, value: &str) -> Self {
        if RESERVED_KEYWORDS.contains(&keyword) {
            return self;
        }
        if keyword == ADJUST_KEYWORD {
            return match Adjustment::parse(value) {
                Some(adj) => self.with_adjustment(adj),
                None => self,
            };
        }
        match OptionKey::from_keyword(keyword) {
            Some(key) => self.with_option(key, value),
            None => self.with_override(keyword, value),
        }
    }

    pub fn with_option(mut self, key: OptionKey, raw: &str) -> Self {
        self.elements.insert(key, key.translate(raw));
        self
    }

    pub fn with_override(mut self, field_id: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(field_id.into(), value.into());
        self
    }

    pub fn with_adjustment(mut self, adjustment: Adjustment) -> Self {
        self.adjustment = Some(adjustment);
        self
    }

    pub fn adjustment(&self) -> Option<Adjustment> {
        self.adjustment
    }

    /// Effective elements in canonical order. Adjustment-derived flags come
    /// first so an explicit flag of the same name wins when both are given.
    pub fn elements(&self) -> Vec<(OptionKey, OptionValue)> {
        let mut out: Vec<(OptionKey, OptionValue)> = self
            .adjustment
            .map(|a| a.elements().to_vec())
            .unwrap_or_default();
        out.extend(self.elements.iter().map(|(k, v)| (*k, v.clone())));
        out
    }

    /// Raw overrides, sorted by field id.
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &str)> {
        self.overrides.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn override_value(&self, field_id: &str) -> Option<&str> {
        self.overrides.get(field_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.adjustment.is_none() && self.elements.is_empty() && self.overrides.is_empty()
    }

    /// Canonical `name=value` pairs sorted by name, after alias translation
    /// and adjustment expansion. This is what cache keys are built from.
    pub fn canonical_pairs(&self) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in self.elements() {
            merged.insert(key.canonical_name().to_string(), value.to_string());
        }
        for (k, v) in &self.overrides {
            merged.insert(k.clone(), v.clone());
        }
        merged.into_iter().collect()
    }
}
