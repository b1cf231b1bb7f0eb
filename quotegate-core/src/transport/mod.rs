//! Transports implementing the provider protocol surface.
//!
//! - `tcp`: line-delimited JSON over a TCP socket
//! - `scripted`: in-memory replies for tests and replay

pub mod scripted;
pub mod tcp;

pub use scripted::{Script, ScriptedConnector, ScriptedProvider, ScriptedSession};
pub use tcp::{TcpConnector, TcpSession};
