//! Event pump: drains a session's reply stream into records.
//!
//! The pump is a lazy, finite, non-restartable iterator. It polls the
//! session with a bounded wait and ends in exactly one terminal state:
//! - `Completed`: the final reply event was seen
//! - `TimedOut`: consecutive empty polls exceeded the budget (soft fail)
//! - `Terminated`: the provider announced the session is gone
//! - `Failed`: a provider error or transport failure was yielded
//!
//! After a terminal state the session is never polled again.

use crate::decode::Decode;
use crate::protocol::{Event, EventKind, ProviderError, Session, TransportError};
use crate::record::Record;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Poll wait and timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub poll_interval: Duration,
    /// Consecutive timeouts tolerated; the pump stops once this is exceeded.
    pub timeout_budget: u32,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout_budget: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Polling,
    Completed,
    TimedOut,
    Terminated,
    Failed,
}

impl PumpState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PumpState::Polling)
    }
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("transport failure while draining replies: {0}")]
    Transport(#[from] TransportError),
}

/// Everything a drained pump produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Drained {
    pub records: Vec<Record>,
    pub state: PumpState,
    pub polls: usize,
}

/// Iterator over decoded records of one reply.
pub struct EventPump<'s, D> {
    session: &'s dyn Session,
    decoder: D,
    settings: PumpSettings,
    state: PumpState,
    consecutive_timeouts: u32,
    polls: usize,
    buffered: VecDeque<Record>,
    scratch: Vec<Record>,
}

impl<'s, D: Decode> EventPump<'s, D> {
    pub fn new(session: &'s dyn Session, decoder: D, settings: PumpSettings) -> Self {
        Self {
            session,
            decoder,
            settings,
            state: PumpState::Polling,
            consecutive_timeouts: 0,
            polls: 0,
            buffered: VecDeque::new(),
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Number of times the session was polled.
    pub fn polls(&self) -> usize {
        self.polls
    }

    /// Drain to the end. Errors abort; soft endings return what was collected.
    pub fn drain(mut self) -> Result<Drained, PumpError> {
        let mut records = Vec::new();
        for item in self.by_ref() {
            records.push(item?);
        }
        Ok(Drained {
            records,
            state: self.state,
            polls: self.polls,
        })
    }

    fn poll_once(&mut self) -> Result<(), PumpError> {
        self.polls += 1;
        let event = self.session.next_event(self.settings.poll_interval)?;
        match event.kind {
            EventKind::PartialResponse | EventKind::Response => self.absorb(&event)?,
            EventKind::Timeout => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts > self.settings.timeout_budget {
                    warn!(
                        timeouts = self.consecutive_timeouts,
                        collected = self.buffered.len(),
                        "reply timed out; returning partial results"
                    );
                    self.state = PumpState::TimedOut;
                }
            }
            _ => {
                if event.terminates_session() {
                    warn!("session terminated while waiting for a reply");
                    self.state = PumpState::Terminated;
                } else {
                    debug!(kind = ?event.kind, "discarding non-reply event");
                }
            }
        }
        Ok(())
    }

    fn absorb(&mut self, event: &Event) -> Result<(), PumpError> {
        self.consecutive_timeouts = 0;
        for message in &event.messages {
            if let Some(err) = message.error() {
                return Err(err.into());
            }
            self.decoder.decode(message, &mut self.scratch);
        }
        self.buffered.extend(self.scratch.drain(..));
        if event.kind == EventKind::Response {
            self.state = PumpState::Completed;
        }
        Ok(())
    }
}

impl<D: Decode> Iterator for EventPump<'_, D> {
    type Item = Result<Record, PumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(Ok(record));
            }
            if self.state.is_terminal() {
                return None;
            }
            if let Err(e) = self.poll_once() {
                self.state = PumpState::Failed;
                self.buffered.clear();
                self.scratch.clear();
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::protocol::{Message, SESSION_TERMINATED};
    use crate::transport::scripted::ScriptedProvider;
    use serde_json::{json, Value};

    fn px(ticker: &str, value: f64) -> Message {
        Message::new(
            "ReferenceDataResponse",
            json!({"securityData": [{"security": ticker, "fieldData": {"PX_LAST": value}}]}),
        )
    }

    fn quick() -> PumpSettings {
        PumpSettings {
            poll_interval: Duration::from_millis(1),
            timeout_budget: 3,
        }
    }

    #[test]
    fn partial_partial_final_collects_everything_and_stops() {
        let provider = ScriptedProvider::new();
        provider.push_events([
            Event::new(EventKind::PartialResponse, vec![px("A", 1.0)]),
            Event::new(EventKind::PartialResponse, vec![px("B", 2.0)]),
            Event::new(EventKind::Response, vec![px("C", 3.0)]),
            Event::new(EventKind::Response, vec![px("D", 4.0)]),
        ]);
        let session = provider.session();
        let drained = EventPump::new(session.as_ref(), Decoder::Reference, quick())
            .drain()
            .unwrap();
        let tickers: Vec<_> = drained.records.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "C"]);
        assert_eq!(drained.state, PumpState::Completed);
        assert_eq!(drained.polls, 3);
        assert_eq!(provider.pending_events(), 1, "no poll after the final reply");
    }

    #[test]
    fn timeout_budget_ends_pump_empty() {
        let provider = ScriptedProvider::new();
        let session = provider.session();
        let drained = EventPump::new(session.as_ref(), Decoder::Reference, quick())
            .drain()
            .unwrap();
        assert!(drained.records.is_empty());
        assert_eq!(drained.state, PumpState::TimedOut);
        assert_eq!(drained.polls, 4);
    }

    #[test]
    fn reply_resets_timeout_counter() {
        let provider = ScriptedProvider::new();
        provider.push_events([
            Event::timeout(),
            Event::timeout(),
            Event::timeout(),
            Event::new(EventKind::PartialResponse, vec![px("A", 1.0)]),
            Event::timeout(),
            Event::timeout(),
            Event::timeout(),
            Event::new(EventKind::Response, vec![px("B", 2.0)]),
        ]);
        let session = provider.session();
        let drained = EventPump::new(session.as_ref(), Decoder::Reference, quick())
            .drain()
            .unwrap();
        assert_eq!(drained.records.len(), 2);
        assert_eq!(drained.state, PumpState::Completed);
    }

    #[test]
    fn provider_error_fails_pump() {
        let provider = ScriptedProvider::new();
        provider.push_events([Event::new(
            EventKind::Response,
            vec![Message::new(
                "ReferenceDataResponse",
                json!({"responseError": {"category": "BAD_ARGS", "message": "bad field"}}),
            )],
        )]);
        let session = provider.session();
        let mut pump = EventPump::new(session.as_ref(), Decoder::Reference, quick());
        match pump.next() {
            Some(Err(PumpError::Provider(err))) => {
                assert_eq!(err.category, "BAD_ARGS");
                assert_eq!(err.message, "bad field");
            }
            other => panic!("expected provider error, got {other:?}"),
        }
        assert_eq!(pump.state(), PumpState::Failed);
        assert!(pump.next().is_none());
    }

    #[test]
    fn session_terminated_ends_pump() {
        let provider = ScriptedProvider::new();
        provider.push_events([
            Event::new(EventKind::PartialResponse, vec![px("A", 1.0)]),
            Event::new(
                EventKind::SessionStatus,
                vec![Message::new(SESSION_TERMINATED, Value::Null)],
            ),
        ]);
        let session = provider.session();
        let drained = EventPump::new(session.as_ref(), Decoder::Reference, quick())
            .drain()
            .unwrap();
        assert_eq!(drained.records.len(), 1);
        assert_eq!(drained.state, PumpState::Terminated);
    }

    #[test]
    fn other_events_are_discarded() {
        let provider = ScriptedProvider::new();
        provider.push_events([
            Event::new(EventKind::ServiceStatus, vec![Message::new("ServiceOpened", Value::Null)]),
            Event::new(EventKind::Response, vec![px("A", 1.0)]),
        ]);
        let session = provider.session();
        let drained = EventPump::new(session.as_ref(), Decoder::Reference, quick())
            .drain()
            .unwrap();
        assert_eq!(drained.records.len(), 1);
    }
}
