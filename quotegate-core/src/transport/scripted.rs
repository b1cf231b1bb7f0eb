//! In-memory scripted provider.
//!
//! Replies are queued up front; each `send` releases the next queued reply
//! into the session's event queue. Polling an empty queue yields a timeout
//! immediately, so tests never sleep. Everything the gateway does to the
//! provider (opens, requests, polls, subscriptions) is recorded for
//! inspection.
//!
//! A `Script` (JSON) drives the same provider from the command line.

use crate::protocol::{
    Connector, Event, EventKind, Message, Request, Session, Subscription, TransportError,
    SESSION_TERMINATED,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Serialized form of a scripted session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// One entry per request, in send order.
    #[serde(default)]
    pub replies: Vec<Vec<Event>>,
    /// Events delivered once a subscription is made.
    #[serde(default)]
    pub stream: Vec<Event>,
    /// Announce session termination once the stream events run out.
    #[serde(default)]
    pub end_stream: bool,
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<Vec<Event>>,
    pending: VecDeque<Event>,
    stream: Vec<Event>,
    end_stream: bool,
    streaming: bool,
    sent: Vec<Request>,
    subscribed: Vec<Subscription>,
    unsubscribed: Vec<Subscription>,
    rejected_sends: u32,
    refuse_opens: bool,
    unavailable: HashSet<String>,
    opens: u64,
    killed_below: u64,
    polls: usize,
}

/// Shared handle to the scripted provider's state.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: Script) -> Self {
        let provider = Self::new();
        {
            let mut state = provider.state.lock();
            state.replies = script.replies.into();
            state.stream = script.stream;
            state.end_stream = script.end_stream;
        }
        provider
    }

    /// Queue the events released by the next `send`.
    pub fn reply<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.state.lock().replies.push_back(events.into_iter().collect());
    }

    /// Deliver events directly, without waiting for a request.
    pub fn push_events<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.state.lock().pending.extend(events);
    }

    /// Events released by the next subscription.
    pub fn stream<I: IntoIterator<Item = Event>>(&self, events: I) {
        self.state.lock().stream.extend(events);
    }

    /// The next `count` sends fail with an invalid-state error and close
    /// the session they were attempted on.
    pub fn reject_sends(&self, count: u32) {
        self.state.lock().rejected_sends = count;
    }

    pub fn refuse_opens(&self, refuse: bool) {
        self.state.lock().refuse_opens = refuse;
    }

    pub fn make_unavailable(&self, service: &str) {
        self.state.lock().unavailable.insert(service.to_string());
    }

    /// Every session opened so far stops reporting alive.
    pub fn kill_sessions(&self) {
        let mut state = self.state.lock();
        state.killed_below = state.opens;
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ScriptedConnector {
            provider: self.clone(),
        })
    }

    /// Open a session directly, bypassing any connector.
    pub fn session(&self) -> Arc<ScriptedSession> {
        let mut state = self.state.lock();
        let id = state.opens;
        state.opens += 1;
        Arc::new(ScriptedSession {
            id,
            provider: self.clone(),
            closed: AtomicBool::new(false),
            services: Mutex::new(HashSet::new()),
        })
    }

    // ── Inspection ──

    pub fn sent(&self) -> Vec<Request> {
        self.state.lock().sent.clone()
    }

    pub fn opens(&self) -> u64 {
        self.state.lock().opens
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn queued_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    pub fn subscribed(&self) -> Vec<Subscription> {
        self.state.lock().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<Subscription> {
        self.state.lock().unsubscribed.clone()
    }
}

/// `Connector` over a `ScriptedProvider`.
pub struct ScriptedConnector {
    provider: ScriptedProvider,
}

impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, host: &str, port: u16) -> Result<Arc<dyn Session>, TransportError> {
        if self.provider.state.lock().refuse_opens {
            return Err(TransportError::Unreachable {
                host: host.to_string(),
                port,
                reason: "scripted refusal".into(),
            });
        }
        Ok(self.provider.session())
    }
}

/// One scripted session.
pub struct ScriptedSession {
    id: u64,
    provider: ScriptedProvider,
    closed: AtomicBool,
    services: Mutex<HashSet<String>>,
}

impl ScriptedSession {
    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(TransportError::InvalidState(format!(
                "scripted session {} is closed",
                self.id
            )))
        }
    }
}

impl Session for ScriptedSession {
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.id >= self.provider.state.lock().killed_below
    }

    fn open_service(&self, name: &str) -> Result<(), TransportError> {
        self.ensure_alive()?;
        if self.provider.state.lock().unavailable.contains(name) {
            return Err(TransportError::ServiceUnavailable {
                service: name.to_string(),
                reason: "scripted refusal".into(),
            });
        }
        self.services.lock().insert(name.to_string());
        Ok(())
    }

    fn has_service(&self, name: &str) -> bool {
        self.is_alive() && self.services.lock().contains(name)
    }

    fn send(&self, request: &Request) -> Result<(), TransportError> {
        self.ensure_alive()?;
        let mut state = self.provider.state.lock();
        if state.rejected_sends > 0 {
            state.rejected_sends -= 1;
            self.closed.store(true, Ordering::Release);
            return Err(TransportError::InvalidState("scripted stale session".into()));
        }
        state.sent.push(request.clone());
        if let Some(events) = state.replies.pop_front() {
            state.pending.extend(events);
        }
        Ok(())
    }

    fn next_event(&self, _timeout: Duration) -> Result<Event, TransportError> {
        self.ensure_alive()?;
        let mut state = self.provider.state.lock();
        state.polls += 1;
        if let Some(event) = state.pending.pop_front() {
            return Ok(event);
        }
        if state.streaming && state.end_stream {
            return Ok(Event::new(
                EventKind::SessionStatus,
                vec![Message::new(SESSION_TERMINATED, Value::Null)],
            ));
        }
        Ok(Event::timeout())
    }

    fn try_next_event(&self) -> Option<Event> {
        self.provider.state.lock().pending.pop_front()
    }

    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.ensure_alive()?;
        let mut state = self.provider.state.lock();
        state.subscribed.extend_from_slice(subscriptions);
        state.streaming = true;
        let stream = std::mem::take(&mut state.stream);
        state.pending.extend(stream);
        Ok(())
    }

    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        let mut state = self.provider.state.lock();
        state.unsubscribed.extend_from_slice(subscriptions);
        state.streaming = false;
        Ok(())
    }
}
