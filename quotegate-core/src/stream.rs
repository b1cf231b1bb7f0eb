//! Live subscriptions.
//!
//! `StreamSubscriber::subscribe` subscribes one topic per ticker and returns a
//! `LiveStream`, an iterator over decoded updates. Unsubscribing happens
//! when the stream is dropped, whether iteration finished, hit
//! `max_records`, or stopped on an error.

use crate::connection::{ConnectionError, ConnectionManager, SessionHandle};
use crate::protocol::{Event, EventKind, Subscription, TransportError};
use crate::query::MKTDATA_SERVICE;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_LIVE_FIELDS: [&str; 3] = ["LAST_PRICE", "BID", "ASK"];

/// Info columns kept when the caller does not choose any.
pub const DEFAULT_LIVE_INFO: [&str; 11] = [
    "MKTDATA_EVENT_TYPE",
    "EVT_TRADE_DATE_RT",
    "TIME",
    "TRADE_UPDATE_STAMP_RT",
    "BID_UPDATE_STAMP_RT",
    "ASK_UPDATE_STAMP_RT",
    "LAST_PRICE",
    "RT_PX_CHG_PCT_1D",
    "IS_DELAYED_STREAM",
    "VOLUME",
    "EQY_TURNOVER_REALTIME",
];

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("subscription rejected: {0}")]
    Subscribe(#[source] TransportError),

    #[error("live stream interrupted: {0}")]
    Transport(#[source] TransportError),
}

/// Which columns survive in an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoFilter {
    /// The default live info columns.
    Default,
    /// Exactly these columns.
    Only(BTreeSet<String>),
    /// Every column the provider sent.
    All,
}

impl InfoFilter {
    fn keeps(&self, column: &str) -> bool {
        match self {
            InfoFilter::Default => DEFAULT_LIVE_INFO.contains(&column),
            InfoFilter::Only(columns) => columns.contains(column),
            InfoFilter::All => true,
        }
    }
}

/// What to subscribe to and how to consume it.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub tickers: Vec<String>,
    pub fields: Vec<String>,
    pub info: InfoFilter,
    pub options: Vec<String>,
    pub service: String,
    pub poll_interval: Duration,
    pub max_records: Option<usize>,
}

impl StreamRequest {
    pub fn new<T>(tickers: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            tickers: tickers.into_iter().map(Into::into).collect(),
            fields: DEFAULT_LIVE_FIELDS.iter().map(|f| f.to_string()).collect(),
            info: InfoFilter::Default,
            options: Vec::new(),
            service: MKTDATA_SERVICE.to_string(),
            poll_interval: Duration::from_millis(500),
            max_records: None,
        }
    }

    /// Fields are matched upper-case; empty input keeps the defaults.
    pub fn fields<F>(mut self, fields: F) -> Self
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| f.as_ref().to_ascii_uppercase())
            .collect();
        if !fields.is_empty() {
            self.fields = fields;
        }
        self
    }

    pub fn info(mut self, info: InfoFilter) -> Self {
        self.info = info;
        self
    }

    pub fn options<O>(mut self, options: O) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.tickers
            .iter()
            .map(|ticker| Subscription {
                topic: format!("{}/{}", self.service, ticker),
                fields: self.fields.clone(),
                correlation_id: ticker.clone(),
                options: self.options.clone(),
            })
            .collect()
    }
}

/// One live update for (ticker, field).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub ticker: String,
    pub field: String,
    pub values: BTreeMap<String, Value>,
}

pub struct StreamSubscriber;

impl StreamSubscriber {
    pub fn subscribe(
        manager: &ConnectionManager,
        port: u16,
        request: StreamRequest,
    ) -> Result<LiveStream, StreamError> {
        manager.service(port, &request.service)?;
        let handle = manager.acquire(port)?;
        manager.flush(&handle);

        let subscriptions = request.subscriptions();
        handle
            .session()
            .subscribe(&subscriptions)
            .map_err(StreamError::Subscribe)?;
        debug!(port, topics = subscriptions.len(), "subscribed");

        Ok(LiveStream {
            handle,
            subscriptions,
            fields: request.fields,
            info: request.info,
            poll_interval: request.poll_interval,
            max_records: request.max_records,
            emitted: 0,
            pending: VecDeque::new(),
            finished: false,
            subscribed: true,
        })
    }
}

/// Iterator over live updates. Unsubscribes on drop.
pub struct LiveStream {
    handle: SessionHandle,
    subscriptions: Vec<Subscription>,
    fields: Vec<String>,
    info: InfoFilter,
    poll_interval: Duration,
    max_records: Option<usize>,
    emitted: usize,
    pending: VecDeque<LiveUpdate>,
    finished: bool,
    subscribed: bool,
}

impl LiveStream {
    /// Updates yielded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Unsubscribe now and report any failure.
    pub fn close(mut self) -> Result<(), StreamError> {
        self.finished = true;
        self.subscribed = false;
        self.handle
            .session()
            .unsubscribe(&self.subscriptions)
            .map_err(StreamError::Transport)
    }

    fn decode(&mut self, event: &Event) {
        for message in &event.messages {
            let Some(ticker) = message.correlation_ids.first() else {
                continue;
            };
            for field in &self.fields {
                match message.element(field) {
                    None | Some(Value::Null) => continue,
                    Some(_) => {}
                }
                let Some(body) = message.body.as_object() else {
                    continue;
                };
                let values: BTreeMap<String, Value> = body
                    .iter()
                    .filter(|(k, _)| self.info.keeps(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if values.is_empty() {
                    continue;
                }
                self.pending.push_back(LiveUpdate {
                    ticker: ticker.clone(),
                    field: field.clone(),
                    values,
                });
            }
        }
    }

    fn teardown(&mut self) {
        self.finished = true;
        if !self.subscribed {
            return;
        }
        self.subscribed = false;
        if let Err(e) = self.handle.session().unsubscribe(&self.subscriptions) {
            warn!(error = %e, "unsubscribe failed");
        } else {
            debug!(topics = self.subscriptions.len(), "unsubscribed");
        }
    }
}

impl Iterator for LiveStream {
    type Item = Result<LiveUpdate, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.max_records.is_some_and(|max| self.emitted >= max) {
                self.teardown();
                return None;
            }
            if let Some(update) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(update));
            }
            match self.handle.session().next_event(self.poll_interval) {
                Ok(event) if event.kind == EventKind::SubscriptionData => self.decode(&event),
                Ok(event) if event.terminates_session() => {
                    warn!("session terminated during live stream");
                    self.teardown();
                }
                Ok(_) => {}
                Err(e) => {
                    self.teardown();
                    return Some(Err(StreamError::Transport(e)));
                }
            }
        }
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::transport::scripted::ScriptedProvider;
    use serde_json::json;

    fn tick(ticker: &str, body: Value) -> Event {
        Event::new(
            EventKind::SubscriptionData,
            vec![Message::new("MarketDataEvents", body).with_correlation(ticker)],
        )
    }

    fn open(provider: &ScriptedProvider, request: StreamRequest) -> LiveStream {
        let mgr = ConnectionManager::new(provider.connector(), "localhost");
        StreamSubscriber::subscribe(&mgr, 8194, request.poll_interval(Duration::ZERO)).unwrap()
    }

    #[test]
    fn subscribes_one_topic_per_ticker() {
        let provider = ScriptedProvider::new();
        let stream = open(&provider, StreamRequest::new(["AAPL US Equity", "MSFT US Equity"]));
        let subs = provider.subscribed();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].topic, "//blp/mktdata/AAPL US Equity");
        assert_eq!(subs[1].correlation_id, "MSFT US Equity");
        assert_eq!(subs[0].fields, vec!["LAST_PRICE", "BID", "ASK"]);
        drop(stream);
        assert_eq!(provider.unsubscribed().len(), 2);
    }

    #[test]
    fn updates_filtered_by_info_and_capped_by_max_records() {
        let provider = ScriptedProvider::new();
        provider.stream([
            tick("AAPL US Equity", json!({"LAST_PRICE": 190.1, "VOLUME": 10, "NOISE": 1})),
            tick("AAPL US Equity", json!({"BID": null})),
            tick("AAPL US Equity", json!({"LAST_PRICE": 190.2})),
            tick("AAPL US Equity", json!({"LAST_PRICE": 190.3})),
        ]);
        let request = StreamRequest::new(["AAPL US Equity"])
            .fields(["last_price"])
            .max_records(2);
        let updates: Vec<LiveUpdate> = open(&provider, request).map(Result::unwrap).collect();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].field, "LAST_PRICE");
        assert_eq!(updates[0].values.get("VOLUME"), Some(&json!(10)));
        assert!(updates[0].values.get("NOISE").is_none());
        assert_eq!(updates[1].values.get("LAST_PRICE"), Some(&json!(190.2)));
        assert_eq!(provider.unsubscribed().len(), 1);
    }

    #[test]
    fn update_with_no_surviving_info_is_dropped() {
        let provider = ScriptedProvider::new();
        provider.stream([
            tick("X", json!({"BID": 1.0})),
            tick("X", json!({"BID": 2.0, "TIME": "14:30:00"})),
        ]);
        let request = StreamRequest::new(["X"]).fields(["BID"]).max_records(1);
        let updates: Vec<LiveUpdate> = open(&provider, request).map(Result::unwrap).collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].values.get("TIME"), Some(&json!("14:30:00")));
    }

    #[test]
    fn explicit_info_filter() {
        let provider = ScriptedProvider::new();
        provider.stream([tick("X", json!({"BID": 1.0, "ASK": 1.1}))]);
        let request = StreamRequest::new(["X"])
            .fields(["BID"])
            .info(InfoFilter::Only(BTreeSet::from(["ASK".to_string()])))
            .max_records(1);
        let updates: Vec<LiveUpdate> = open(&provider, request).map(Result::unwrap).collect();
        assert_eq!(updates[0].values.len(), 1);
        assert_eq!(updates[0].values.get("ASK"), Some(&json!(1.1)));
    }

    #[test]
    fn transport_error_ends_stream_and_unsubscribes() {
        let provider = ScriptedProvider::new();
        let mut stream = open(&provider, StreamRequest::new(["X"]));
        provider.kill_sessions();
        assert!(matches!(stream.next(), Some(Err(StreamError::Transport(_)))));
        assert!(stream.next().is_none());
        assert_eq!(provider.unsubscribed().len(), 1);
        drop(stream);
        assert_eq!(provider.unsubscribed().len(), 1, "unsubscribe runs once");
    }

    #[test]
    fn session_termination_ends_stream() {
        let provider = ScriptedProvider::from_script(crate::transport::scripted::Script {
            stream: vec![tick("X", json!({"LAST_PRICE": 1.0}))],
            end_stream: true,
            ..Default::default()
        });
        let updates: Vec<_> = open(&provider, StreamRequest::new(["X"])).collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(provider.unsubscribed().len(), 1);
    }
}
