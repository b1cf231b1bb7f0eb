//! Logical query → provider request.
//!
//! Element order in the built request:
//! 1. securities (repeated entries, for multi-security verbs)
//! 2. fields, or event types for tick requests
//! 3. window bounds
//! 4. verb-specific settings (`security`, `eventType`, `screenName`, ...)
//! 5. adjustment flags, then named options in canonical order
//! 6. raw overrides

use crate::connection::ServiceHandle;
use crate::options::RequestOptions;
use crate::protocol::Request;
use crate::query::{Query, QueryKind, Window};
use serde_json::Value;
use tracing::debug;

const DATE_FORMAT: &str = "%Y%m%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Where a request carries its field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    /// Repeated `fields` entries.
    Repeated,
    /// Appended to the named array element.
    Array(&'static str),
    /// Not sent; the settings already name what is wanted.
    Omitted,
}

/// Verb-level shape of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings<'a> {
    pub repeat_securities: bool,
    pub field_slot: FieldSlot,
    pub window: Option<&'a Window>,
    pub elements: &'a [(String, Value)],
}

impl<'a> RequestSettings<'a> {
    /// Settings implied by the query's kind.
    pub fn for_query(query: &'a Query) -> Self {
        let field_slot = match query.kind() {
            QueryKind::Tick => FieldSlot::Array("eventTypes"),
            QueryKind::Bar | QueryKind::Screen => FieldSlot::Omitted,
            _ => FieldSlot::Repeated,
        };
        Self {
            repeat_securities: query.kind().repeats_securities(),
            field_slot,
            window: query.window(),
            elements: query.settings(),
        }
    }
}

pub struct RequestBuilder;

impl RequestBuilder {
    /// Build a request of `verb` on `service`.
    pub fn build(
        service: &ServiceHandle,
        verb: &str,
        tickers: &[String],
        fields: &[String],
        settings: &RequestSettings<'_>,
        options: &RequestOptions,
    ) -> Request {
        let mut request = Request::new(service.name(), verb);

        if settings.repeat_securities {
            for ticker in tickers {
                request.append_security(ticker.as_str());
            }
        }

        match settings.field_slot {
            FieldSlot::Repeated => {
                for field in fields {
                    request.append_field(field.as_str());
                }
            }
            FieldSlot::Array(name) => {
                for field in fields {
                    request.append_to(name, Value::String(field.clone()));
                }
            }
            FieldSlot::Omitted => {}
        }

        match settings.window {
            Some(Window::Dates { start, end }) => {
                request.set("startDate", Value::String(start.format(DATE_FORMAT).to_string()));
                request.set("endDate", Value::String(end.format(DATE_FORMAT).to_string()));
            }
            Some(Window::Intraday { start, end }) => {
                request.set(
                    "startDateTime",
                    Value::String(start.format(DATETIME_FORMAT).to_string()),
                );
                request.set(
                    "endDateTime",
                    Value::String(end.format(DATETIME_FORMAT).to_string()),
                );
            }
            Some(Window::AsOf(_)) | None => {}
        }

        for (name, value) in settings.elements {
            request.set(name.as_str(), value.clone());
        }

        for (key, value) in options.elements() {
            request.set(key.canonical_name(), value.to_json());
        }

        for (field_id, value) in options.overrides() {
            request.append_override(field_id, value);
        }

        debug!(
            verb,
            securities = request.securities.len(),
            fields = request.fields.len(),
            overrides = request.overrides.len(),
            "built request"
        );
        request
    }

    /// Build the request for `query`, restricted to a subset of its
    /// tickers and fields.
    pub fn for_query(
        service: &ServiceHandle,
        query: &Query,
        tickers: &[String],
        fields: &[String],
    ) -> Request {
        Self::build(
            service,
            query.verb(),
            tickers,
            fields,
            &RequestSettings::for_query(query),
            query.options(),
        )
    }
}
