//! Session and service handle lifecycle.
//!
//! `ConnectionManager` owns at most one live session per port and at most
//! one service handle per (port, service name). Handles are created lazily,
//! validated before reuse and recreated when validation fails. A send that
//! hits a stale session is retried exactly once on a fresh session.

use crate::protocol::{Connector, Request, Session, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8194;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot open session on port {port}: {source}")]
    Open {
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("cannot open service {service} on port {port}: {reason}")]
    Service {
        port: u16,
        service: String,
        reason: String,
    },

    #[error("request send failed on port {port}: {source}")]
    Send {
        port: u16,
        #[source]
        source: TransportError,
    },
}

/// A live session together with the generation it was opened in.
#[derive(Clone)]
pub struct SessionHandle {
    port: u16,
    generation: u64,
    session: Arc<dyn Session>,
}

impl SessionHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Increases every time the manager opens a new session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("port", &self.port)
            .field("generation", &self.generation)
            .field("alive", &self.session.is_alive())
            .finish()
    }
}

/// A service opened on a specific session generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    port: u16,
    generation: u64,
    name: String,
}

impl ServiceHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns provider sessions; share it behind an `Arc`.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    host: String,
    sessions: Mutex<HashMap<u16, SessionHandle>>,
    services: Mutex<HashMap<(u16, String), ServiceHandle>>,
    generations: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, host: impl Into<String>) -> Self {
        Self {
            connector,
            host: host.into(),
            sessions: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The cached session for `port` if it is still alive, else a new one.
    pub fn acquire(&self, port: u16) -> Result<SessionHandle, ConnectionError> {
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(&port) {
            if handle.session.is_alive() {
                return Ok(handle.clone());
            }
            debug!(port, generation = handle.generation, "cached session is dead, reopening");
            sessions.remove(&port);
        }

        let session = self
            .connector
            .open(&self.host, port)
            .map_err(|source| ConnectionError::Open { port, source })?;
        let handle = SessionHandle {
            port,
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
            session,
        };
        debug!(
            port,
            generation = handle.generation,
            transport = self.connector.name(),
            "session opened"
        );
        sessions.insert(port, handle.clone());
        Ok(handle)
    }

    /// The service handle for (`port`, `name`), opening the service if the
    /// cached handle belongs to an older session or is no longer reported.
    pub fn service(&self, port: u16, name: &str) -> Result<ServiceHandle, ConnectionError> {
        let session = self.acquire(port)?;
        let key = (port, name.to_string());

        let cached = self.services.lock().get(&key).cloned();
        if let Some(handle) = cached {
            if handle.generation == session.generation && session.session().has_service(name) {
                return Ok(handle);
            }
            self.services.lock().remove(&key);
        }

        let service_error = |reason: String| ConnectionError::Service {
            port,
            service: name.to_string(),
            reason,
        };
        debug!(port, service = name, "opening service");
        session
            .session()
            .open_service(name)
            .map_err(|e| service_error(e.to_string()))?;
        if !session.session().has_service(name) {
            return Err(service_error("service not reported after open".into()));
        }

        let handle = ServiceHandle {
            port,
            generation: session.generation,
            name: name.to_string(),
        };
        self.services.lock().insert(key, handle.clone());
        Ok(handle)
    }

    /// Drop the cached session for `port` and every service derived from it.
    pub fn invalidate(&self, port: u16) {
        self.sessions.lock().remove(&port);
        self.services.lock().retain(|(p, _), _| *p != port);
    }

    /// Discard events left over from earlier requests. Returns how many.
    pub fn flush(&self, handle: &SessionHandle) -> usize {
        let mut discarded = 0;
        while handle.session().try_next_event().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(port = handle.port, discarded, "flushed stale events");
        }
        discarded
    }

    /// Send `request` on `port`, reopening once if the session is stale.
    pub fn dispatch(&self, port: u16, request: &Request) -> Result<SessionHandle, ConnectionError> {
        let handle = self.prepare(port, &request.service)?;
        match handle.session().send(request) {
            Ok(()) => Ok(handle),
            Err(TransportError::InvalidState(reason)) => {
                warn!(port, %reason, "session rejected request, reopening once");
                self.invalidate(port);
                let handle = self.prepare(port, &request.service)?;
                handle
                    .session()
                    .send(request)
                    .map_err(|source| ConnectionError::Send { port, source })?;
                Ok(handle)
            }
            Err(source) => Err(ConnectionError::Send { port, source }),
        }
    }

    fn prepare(&self, port: u16, service: &str) -> Result<SessionHandle, ConnectionError> {
        self.service(port, service)?;
        let handle = self.acquire(port)?;
        self.flush(&handle);
        Ok(handle)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.connector.name())
            .field("host", &self.host)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::REFDATA_SERVICE;
    use crate::transport::scripted::ScriptedProvider;

    fn manager(provider: &ScriptedProvider) -> ConnectionManager {
        ConnectionManager::new(provider.connector(), DEFAULT_HOST)
    }

    fn request() -> Request {
        Request::new(REFDATA_SERVICE, "ReferenceDataRequest")
    }

    #[test]
    fn acquire_reuses_live_session() {
        let provider = ScriptedProvider::new();
        let mgr = manager(&provider);
        let a = mgr.acquire(DEFAULT_PORT).unwrap();
        let b = mgr.acquire(DEFAULT_PORT).unwrap();
        assert_eq!(a.generation(), b.generation());
        assert_eq!(provider.opens(), 1);
    }

    #[test]
    fn acquire_reopens_dead_session() {
        let provider = ScriptedProvider::new();
        let mgr = manager(&provider);
        let a = mgr.acquire(DEFAULT_PORT).unwrap();
        provider.kill_sessions();
        let b = mgr.acquire(DEFAULT_PORT).unwrap();
        assert!(b.generation() > a.generation());
        assert_eq!(provider.opens(), 2);
    }

    #[test]
    fn sessions_are_per_port() {
        let provider = ScriptedProvider::new();
        let mgr = manager(&provider);
        mgr.acquire(8194).unwrap();
        mgr.acquire(8195).unwrap();
        assert_eq!(provider.opens(), 2);
    }

    #[test]
    fn service_handle_is_reused_then_recreated_after_reopen() {
        let provider = ScriptedProvider::new();
        let mgr = manager(&provider);
        let a = mgr.service(DEFAULT_PORT, REFDATA_SERVICE).unwrap();
        let b = mgr.service(DEFAULT_PORT, REFDATA_SERVICE).unwrap();
        assert_eq!(a, b);

        provider.kill_sessions();
        let c = mgr.service(DEFAULT_PORT, REFDATA_SERVICE).unwrap();
        assert!(c.generation() > a.generation());
        assert_eq!(c.name(), REFDATA_SERVICE);
    }

    #[test]
    fn open_failure_is_reported() {
        let provider = ScriptedProvider::new();
        provider.refuse_opens(true);
        let err = manager(&provider).acquire(DEFAULT_PORT).unwrap_err();
        assert!(matches!(err, ConnectionError::Open { port: DEFAULT_PORT, .. }));
    }

    #[test]
    fn unavailable_service_is_reported() {
        let provider = ScriptedProvider::new();
        provider.make_unavailable(REFDATA_SERVICE);
        let err = manager(&provider)
            .service(DEFAULT_PORT, REFDATA_SERVICE)
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Service { .. }));
    }

    #[test]
    fn dispatch_retries_once_on_invalid_state() {
        let provider = ScriptedProvider::new();
        provider.reject_sends(1);
        let mgr = manager(&provider);
        let handle = mgr.dispatch(DEFAULT_PORT, &request()).unwrap();
        assert_eq!(provider.sent().len(), 1);
        assert_eq!(provider.opens(), 2);
        assert!(handle.session().is_alive());
    }

    #[test]
    fn dispatch_gives_up_after_second_failure() {
        let provider = ScriptedProvider::new();
        provider.reject_sends(2);
        let mgr = manager(&provider);
        let err = mgr.dispatch(DEFAULT_PORT, &request()).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Send {
                source: TransportError::InvalidState(_),
                ..
            }
        ));
        assert!(provider.sent().is_empty());
        assert_eq!(provider.opens(), 2, "exactly one reopen");
    }

    #[test]
    fn dispatch_flushes_stale_events_first() {
        let provider = ScriptedProvider::new();
        let mgr = manager(&provider);
        mgr.acquire(DEFAULT_PORT).unwrap();
        provider.push_events([crate::protocol::Event::timeout(), crate::protocol::Event::timeout()]);
        mgr.dispatch(DEFAULT_PORT, &request()).unwrap();
        assert_eq!(provider.pending_events(), 0);
    }
}
