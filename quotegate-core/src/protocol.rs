//! Provider protocol surface and structured error types.
//!
//! Everything the gateway needs from a session-oriented market-data provider:
//! - `Connector` opens a `Session` for a (host, port) pair
//! - `Session` opens named services, sends requests, yields events
//! - `Event` / `Message` model the asynchronous reply stream
//! - `Request` and `Subscription` are the provider-native request objects
//!
//! Transports implement `Connector` + `Session`; nothing above this module
//! knows how bytes move.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Element carrying a protocol-level error inside a reply message.
pub const RESPONSE_ERROR: &str = "responseError";

/// Message type announcing that the provider closed the session.
pub const SESSION_TERMINATED: &str = "SessionTerminated";

/// Message types acknowledging a service open.
pub const SERVICE_OPENED: &str = "ServiceOpened";
pub const SERVICE_OPEN_FAILURE: &str = "ServiceOpenFailure";

// ── Events ──────────────────────────────────────────────────────────

/// Classification of an event delivered by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Part of a multi-event reply; more events follow.
    PartialResponse,
    /// Final event of a reply.
    Response,
    /// No event arrived within the poll timeout.
    Timeout,
    SessionStatus,
    ServiceStatus,
    SubscriptionData,
    SubscriptionStatus,
    #[serde(other)]
    Other,
}

impl EventKind {
    /// True for the two event kinds that carry reply payloads.
    pub fn is_reply(self) -> bool {
        matches!(self, EventKind::PartialResponse | EventKind::Response)
    }
}

/// One message inside an event: a type name, correlation tokens and a
/// nested element tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub body: Value,
}

impl Message {
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_ids: Vec::new(),
            body,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_ids.push(id.into());
        self
    }

    /// Top-level element by name.
    pub fn element(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Nested element by path, e.g. `["data", "securityData"]`.
    pub fn path(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.body, |node, name| node.get(*name))
    }

    /// The protocol-level error carried by this message, if any.
    pub fn error(&self) -> Option<ProviderError> {
        let err = self.element(RESPONSE_ERROR)?;
        Some(ProviderError {
            category: text_of(err, "category"),
            message: text_of(err, "message"),
        })
    }
}

fn text_of(node: &Value, name: &str) -> String {
    match node.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// One event from the session's reply stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Event {
    pub fn new(kind: EventKind, messages: Vec<Message>) -> Self {
        Self { kind, messages }
    }

    pub fn timeout() -> Self {
        Self::new(EventKind::Timeout, Vec::new())
    }

    /// True if any message announces the session is gone.
    pub fn terminates_session(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.message_type == SESSION_TERMINATED)
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// An override pair forwarded verbatim to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub field_id: String,
    pub value: String,
}

/// A provider request of a named verb, bound to a service.
///
/// Repeated entries keep insertion order; scalar elements are unique by name
/// (setting one twice keeps the last value in the first position).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub securities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<(String, Value)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<Override>,
}

impl Request {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            securities: Vec::new(),
            fields: Vec::new(),
            elements: Vec::new(),
            overrides: Vec::new(),
        }
    }

    pub fn append_security(&mut self, ticker: impl Into<String>) {
        self.securities.push(ticker.into());
    }

    pub fn append_field(&mut self, field: impl Into<String>) {
        self.fields.push(field.into());
    }

    /// Set a scalar or array element, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.elements.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.elements.push((name, value)),
        }
    }

    /// Append one value to an array element, creating it if absent.
    pub fn append_to(&mut self, name: &str, value: Value) {
        match self.elements.iter_mut().find(|(n, _)| n == name) {
            Some((_, Value::Array(items))) => items.push(value),
            Some(slot) => slot.1 = Value::Array(vec![slot.1.take(), value]),
            None => self
                .elements
                .push((name.to_string(), Value::Array(vec![value]))),
        }
    }

    pub fn append_override(&mut self, field_id: impl Into<String>, value: impl Into<String>) {
        self.overrides.push(Override {
            field_id: field_id.into(),
            value: value.into(),
        });
    }

    pub fn element(&self, name: &str) -> Option<&Value> {
        self.elements
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn override_value(&self, field_id: &str) -> Option<&str> {
        self.overrides
            .iter()
            .find(|o| o.field_id == field_id)
            .map(|o| o.value.as_str())
    }
}

/// One live subscription: topic, fields, correlation token, options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub fields: Vec<String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

// ── Errors ──────────────────────────────────────────────────────────

/// Protocol-level error reported inside a reply. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("provider rejected request [{category}]: {message}")]
pub struct ProviderError {
    pub category: String,
    pub message: String,
}

/// Failures raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The session is closed or stale; a reopen may succeed.
    #[error("session is in an invalid state: {0}")]
    InvalidState(String),

    #[error("cannot reach provider at {host}:{port}: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("transport I/O failure: {0}")]
    Io(String),

    #[error("malformed frame from provider: {0}")]
    Malformed(String),
}

// ── Traits ──────────────────────────────────────────────────────────

/// A live connection to the provider.
///
/// Calls on one session are not expected to interleave requests; the
/// dispatcher issues one request at a time per session.
pub trait Session: Send + Sync {
    /// Cheap liveness check used before reusing a cached session.
    fn is_alive(&self) -> bool;

    /// Open a named service, blocking until the provider acknowledges it.
    fn open_service(&self, name: &str) -> Result<(), TransportError>;

    /// True if the service was opened on this session and is still usable.
    fn has_service(&self, name: &str) -> bool;

    fn send(&self, request: &Request) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next event. An elapsed wait yields an
    /// event of kind `Timeout`, not an error.
    fn next_event(&self, timeout: Duration) -> Result<Event, TransportError>;

    /// Next already-delivered event, without blocking.
    fn try_next_event(&self) -> Option<Event>;

    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;
}

/// Factory for sessions.
pub trait Connector: Send + Sync {
    /// Human-readable name of this transport.
    fn name(&self) -> &str;

    fn open(&self, host: &str, port: u16) -> Result<Arc<dyn Session>, TransportError>;
}
