//! Quotegate Core — provider protocol, sessions, requests, reply decoding, live streams.
//!
//! This crate contains everything that talks to the market-data provider:
//! - Protocol surface (`Connector`, `Session`, events, requests) and transports
//! - Session / service lifecycle with a single reconnect-and-resend
//! - Typed request options with alias and value translation
//! - Logical queries and the request builder
//! - Event pump with bounded timeouts and per-kind decoders
//! - Live subscription streams

pub mod connection;
pub mod decode;
pub mod options;
pub mod protocol;
pub mod pump;
pub mod query;
pub mod record;
pub mod request;
pub mod stream;
pub mod transport;

pub use connection::{ConnectionError, ConnectionManager, ServiceHandle, SessionHandle};
pub use decode::{Decode, Decoder};
pub use options::{Adjustment, OptionKey, OptionValue, RequestOptions};
pub use protocol::{
    Connector, Event, EventKind, Message, ProviderError, Request, Session, Subscription,
    TransportError,
};
pub use pump::{Drained, EventPump, PumpError, PumpSettings, PumpState};
pub use query::{CachePolicy, Query, QueryError, QueryKind, ScreenType, Window};
pub use record::Record;
pub use request::RequestBuilder;
pub use stream::{InfoFilter, LiveStream, LiveUpdate, StreamError, StreamRequest, StreamSubscriber};
