//! Query orchestration.
//!
//! Every query walks the same phases:
//! - `CacheCheck`: per (ticker, field) for reference queries, per session
//!   day for bars; an all-hit query ends here
//! - `TrialCheck`: bar and tick queries whose unit has failed
//!   `trial_limit` times end here with an empty table
//! - `Dispatch`: one request covering the missing rectangle (tickers with
//!   any miss × fields with any miss)
//! - `Pump`: drain the reply; a provider error aborts the query
//! - `Merge`: cached and fresh records, fresh wins, query order
//! - `Persist`: non-empty fresh units are cached, empty ones are counted
//!   in the trial store
//!
//! Nothing is written to the cache when the reply carried an error.

use crate::cache::CacheStore;
use crate::config::GatewayConfig;
use crate::table::ResultTable;
use crate::trials::{TrialKey, TrialTracker};
use chrono::NaiveDate;
use quotegate_core::connection::{ConnectionError, ConnectionManager};
use quotegate_core::decode::Decoder;
use quotegate_core::protocol::{Connector, ProviderError, TransportError};
use quotegate_core::pump::{Drained, EventPump, PumpError, PumpState};
use quotegate_core::query::{Query, QueryError, QueryKind, Window};
use quotegate_core::record::Record;
use quotegate_core::request::RequestBuilder;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("transport failure while draining replies: {0}")]
    Transport(TransportError),
}

impl From<PumpError> for DispatchError {
    fn from(e: PumpError) -> Self {
        match e {
            PumpError::Provider(e) => DispatchError::Provider(e),
            PumpError::Transport(e) => DispatchError::Transport(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    CacheCheck,
    TrialCheck,
    Dispatch,
    Pump,
    Merge,
    Persist,
    Done,
}

/// What one `execute` did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchReport {
    pub phases: Vec<Phase>,
    /// Units served from the cache.
    pub cached_units: usize,
    pub requested_tickers: Vec<String>,
    pub requested_fields: Vec<String>,
    pub requests_sent: usize,
    /// Units written to the cache.
    pub persisted: usize,
    /// Units that came back empty.
    pub empty_units: usize,
    pub throttled: bool,
    pub pump_state: Option<PumpState>,
}

impl DispatchReport {
    fn enter(&mut self, phase: Phase) {
        debug!(?phase, "dispatch phase");
        self.phases.push(phase);
    }
}

type Unit = (String, String);

pub struct QueryDispatcher {
    connections: Arc<ConnectionManager>,
    cache: CacheStore,
    trials: TrialTracker,
    config: GatewayConfig,
    today: Option<NaiveDate>,
}

impl QueryDispatcher {
    pub fn new(connections: Arc<ConnectionManager>, config: GatewayConfig) -> Self {
        Self {
            cache: CacheStore::new(config.cache_root.clone(), config.staleness_days),
            trials: TrialTracker::new(config.cache_root.as_deref()),
            connections,
            config,
            today: None,
        }
    }

    /// Dispatcher with its own connection manager on `connector`.
    pub fn connect(connector: Arc<dyn Connector>, config: GatewayConfig) -> Self {
        let manager = ConnectionManager::new(connector, config.host.clone());
        Self::new(Arc::new(manager), config)
    }

    /// Pin the reference date used for staleness and bar-cache cutoffs.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn trials(&self) -> &TrialTracker {
        &self.trials
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| chrono::Local::now().date_naive())
    }

    pub fn execute(&self, query: &Query) -> Result<ResultTable, DispatchError> {
        self.execute_with_report(query).map(|(table, _)| table)
    }

    pub fn execute_with_report(&self, query: &Query) -> Result<(ResultTable, DispatchReport), DispatchError> {
        let mut report = DispatchReport::default();
        report.enter(Phase::Init);
        query.validate()?;

        let table = match query.kind() {
            QueryKind::PointRef | QueryKind::BlockRef => self.run_reference(query, &mut report)?,
            QueryKind::Bar => self.run_bars(query, &mut report)?,
            QueryKind::Tick => self.run_ticks(query, &mut report)?,
            QueryKind::TimeSeries => self.run_series(query, &mut report)?,
            QueryKind::Screen => self.run_screen(query, &mut report)?,
        };

        report.enter(Phase::Done);
        debug!(
            kind = %query.kind(),
            records = table.len(),
            cached = report.cached_units,
            sent = report.requests_sent,
            "query finished"
        );
        Ok((table, report))
    }

    // ── Per-kind flows ──

    fn run_reference(&self, query: &Query, report: &mut DispatchReport) -> Result<ResultTable, DispatchError> {
        report.enter(Phase::CacheCheck);
        let policy = query.cache_policy();
        let today = self.today();
        let window = policy.staleness_days.unwrap_or(self.cache.staleness_days());
        let use_cache = policy.enabled && self.cache.is_enabled();

        let mut cached: HashMap<Unit, Vec<Record>> = HashMap::new();
        let mut targets: HashMap<Unit, PathBuf> = HashMap::new();
        if use_cache {
            for ticker in query.tickers() {
                for field in query.fields() {
                    let Some(loc) =
                        self.cache
                            .locate_at(ticker, field, query.options(), policy.has_date, window, today)
                    else {
                        continue;
                    };
                    let unit = (ticker.clone(), field.clone());
                    if loc.hit && !policy.reload {
                        if let Some(records) = self.cache.read(&loc.path) {
                            cached.insert(unit.clone(), records);
                        }
                    }
                    targets.insert(unit, loc.target);
                }
            }
        }
        report.cached_units = cached.len();

        let is_missing = |t: &String, f: &String| !cached.contains_key(&(t.clone(), f.clone()));
        let tickers: Vec<String> = query
            .tickers()
            .iter()
            .filter(|t| query.fields().iter().any(|f| is_missing(t, f)))
            .cloned()
            .collect();
        let fields: Vec<String> = query
            .fields()
            .iter()
            .filter(|f| query.tickers().iter().any(|t| is_missing(t, f)))
            .cloned()
            .collect();

        if tickers.is_empty() {
            debug!(units = cached.len(), "all units served from cache");
            report.enter(Phase::Merge);
            let records = cached.into_values().flatten().collect();
            return Ok(ResultTable::ordered(query.kind(), records, query.tickers(), query.fields()));
        }

        let drained = self.fetch(query, &tickers, &fields, report)?;

        report.enter(Phase::Merge);
        let mut fresh: HashMap<Unit, Vec<Record>> = HashMap::new();
        for record in drained.records {
            let unit = (record.ticker.clone(), record.field.clone().unwrap_or_default());
            fresh.entry(unit).or_default().push(record);
        }

        report.enter(Phase::Persist);
        let requested: HashSet<Unit> = tickers
            .iter()
            .flat_map(|t| fields.iter().map(move |f| (t.clone(), f.clone())))
            .collect();
        for unit in &requested {
            let populated = fresh
                .get(unit)
                .filter(|records| records.iter().any(|r| !r.is_blank()));
            match (populated, targets.get(unit)) {
                (Some(records), Some(target)) => {
                    match self.cache.write_at(target, &unit.0, &unit.1, records, today) {
                        Ok(()) => report.persisted += 1,
                        Err(e) => warn!(path = %target.display(), error = %e, "cache unavailable"),
                    }
                }
                (Some(_), None) => {}
                (None, _) if cached.contains_key(unit) => {}
                (None, _) => {
                    report.empty_units += 1;
                    self.trials.record_failure(&self.trial_key(query, &unit.0, &unit.1));
                }
            }
        }

        let mut records: Vec<Record> = Vec::new();
        for (unit, rows) in cached {
            if !fresh.contains_key(&unit) {
                records.extend(rows);
            }
        }
        records.extend(fresh.into_values().flatten());
        Ok(ResultTable::ordered(query.kind(), records, query.tickers(), query.fields()))
    }

    fn run_bars(&self, query: &Query, report: &mut DispatchReport) -> Result<ResultTable, DispatchError> {
        let (ticker, event_type) = single_unit(query)?;
        let policy = query.cache_policy();
        let intraday = match query.window() {
            Some(Window::Intraday { start, end }) => Some((*start, *end)),
            _ => None,
        };

        report.enter(Phase::CacheCheck);
        if let (Some((start, end)), true) = (intraday, policy.enabled && !policy.reload) {
            if let Some(records) = self.cache.read_bars(ticker, event_type, start, end) {
                debug!(ticker, event_type, "bars served from session cache");
                report.cached_units = 1;
                report.enter(Phase::Merge);
                return Ok(ResultTable::new(query.kind(), records));
            }
        }

        let key = self.trial_key(query, ticker, event_type);
        if self.throttled(query, &key, report) {
            return Ok(ResultTable::empty(query.kind()));
        }

        let drained = self.fetch(query, query.tickers(), query.fields(), report)?;
        report.enter(Phase::Merge);
        report.enter(Phase::Persist);
        if drained.records.is_empty() {
            report.empty_units = 1;
            self.trials.record_failure(&key);
        } else if drained.state != PumpState::Completed {
            debug!(ticker, event_type, state = ?drained.state, "incomplete bar session not cached");
        } else if let (Some((start, end)), true) = (intraday, policy.enabled) {
            match self
                .cache
                .write_bars(ticker, event_type, start, end, &drained.records, self.today())
            {
                Ok(true) => report.persisted = 1,
                Ok(false) => {}
                Err(e) => warn!(ticker, error = %e, "bar cache unavailable"),
            }
        }
        Ok(ResultTable::new(query.kind(), drained.records))
    }

    fn run_ticks(&self, query: &Query, report: &mut DispatchReport) -> Result<ResultTable, DispatchError> {
        let (ticker, _) = single_unit(query)?;
        report.enter(Phase::CacheCheck);
        let key = self.trial_key(query, ticker, &query.fields().join(","));
        if self.throttled(query, &key, report) {
            return Ok(ResultTable::empty(query.kind()));
        }

        let drained = self.fetch(query, query.tickers(), query.fields(), report)?;
        report.enter(Phase::Merge);
        report.enter(Phase::Persist);
        if drained.records.is_empty() {
            report.empty_units = 1;
            self.trials.record_failure(&key);
        }
        Ok(ResultTable::new(query.kind(), drained.records))
    }

    fn run_series(&self, query: &Query, report: &mut DispatchReport) -> Result<ResultTable, DispatchError> {
        let drained = self.fetch(query, query.tickers(), query.fields(), report)?;
        report.enter(Phase::Merge);
        Ok(ResultTable::ordered(
            query.kind(),
            drained.records,
            query.tickers(),
            query.fields(),
        ))
    }

    fn run_screen(&self, query: &Query, report: &mut DispatchReport) -> Result<ResultTable, DispatchError> {
        let mut drained = self.fetch(query, query.tickers(), query.fields(), report)?;
        if drained.records.is_empty() {
            debug!(screen = %query.tickers().join(","), "empty screen, retrying once");
            drained = self.fetch(query, query.tickers(), query.fields(), report)?;
        }
        report.enter(Phase::Merge);
        Ok(ResultTable::new(query.kind(), drained.records))
    }

    // ── Shared steps ──

    /// Send one request for `tickers` × `fields` and drain its reply.
    fn fetch(
        &self,
        query: &Query,
        tickers: &[String],
        fields: &[String],
        report: &mut DispatchReport,
    ) -> Result<Drained, DispatchError> {
        report.enter(Phase::Dispatch);
        report.requested_tickers = tickers.to_vec();
        report.requested_fields = fields.to_vec();

        let port = self.config.port;
        let service = self.connections.service(port, &self.config.refdata_service)?;
        let request = RequestBuilder::for_query(&service, query, tickers, fields);
        let handle = self.connections.dispatch(port, &request)?;
        report.requests_sent += 1;

        report.enter(Phase::Pump);
        let pump = EventPump::new(
            handle.session(),
            Decoder::for_query(query),
            self.config.pump_settings(),
        );
        let drained = pump.drain()?;
        report.pump_state = Some(drained.state);
        Ok(drained)
    }

    fn trial_key(&self, query: &Query, ticker: &str, kind: &str) -> TrialKey {
        let date = query
            .window()
            .map(Window::anchor_date)
            .unwrap_or_else(|| self.today());
        TrialKey::new(query.kind().as_str(), ticker, date, kind)
    }

    fn throttled(&self, query: &Query, key: &TrialKey, report: &mut DispatchReport) -> bool {
        report.enter(Phase::TrialCheck);
        let limit = self.config.trial_limit;
        let count = self.trials.count(key);
        if limit == 0 || count < limit {
            return false;
        }
        report.throttled = true;
        if !query.cache_policy().batch {
            info!(
                key = %key.storage_key(),
                attempts = count,
                "skipping query known to return nothing"
            );
        }
        true
    }
}

fn single_unit(query: &Query) -> Result<(&str, &str), QueryError> {
    let kind = query.kind();
    let ticker = query.tickers().first().ok_or(QueryError::NoTickers { kind })?;
    let field = query.fields().first().ok_or(QueryError::NoFields { kind })?;
    Ok((ticker, field))
}
