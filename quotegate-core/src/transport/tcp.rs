//! Line-delimited JSON transport over TCP.
//!
//! Framing is one JSON object per line in each direction:
//! - client → server: `{"op": "open_service" | "request" | "subscribe" | "unsubscribe", ...}`
//! - server → client: serialized `Event`s
//!
//! Reads keep a partial-line buffer across polls, so a read timeout in the
//! middle of a frame never loses bytes.

use crate::protocol::{
    Connector, Event, EventKind, Request, Session, Subscription, TransportError, SERVICE_OPENED,
    SERVICE_OPEN_FAILURE,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shortest read timeout handed to the socket; zero is rejected by the OS.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Outbound<'a> {
    OpenService { service: &'a str },
    Request { request: &'a Request },
    Subscribe { subscriptions: &'a [Subscription] },
    Unsubscribe { subscriptions: &'a [Subscription] },
}

/// Opens `TcpSession`s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    service_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            service_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, service_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            service_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn name(&self) -> &str {
        "tcp"
    }

    fn open(&self, host: &str, port: u16) -> Result<Arc<dyn Session>, TransportError> {
        let unreachable = |reason: String| TransportError::Unreachable {
            host: host.to_string(),
            port,
            reason,
        };
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| unreachable(format!("resolve: {e}")))?;

        let mut last_err = String::from("no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    debug!(%addr, "provider session opened");
                    let session = TcpSession::from_stream(stream, self.service_timeout)
                        .map_err(|e| unreachable(format!("socket setup: {e}")))?;
                    return Ok(Arc::new(session));
                }
                Err(e) => last_err = format!("{addr}: {e}"),
            }
        }
        Err(unreachable(last_err))
    }
}

struct FrameReader {
    reader: BufReader<TcpStream>,
    partial: Vec<u8>,
}

/// One TCP session.
pub struct TcpSession {
    writer: Mutex<TcpStream>,
    reader: Mutex<FrameReader>,
    alive: AtomicBool,
    services: Mutex<HashSet<String>>,
    backlog: Mutex<VecDeque<Event>>,
    service_timeout: Duration,
}

impl TcpSession {
    pub fn from_stream(stream: TcpStream, service_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;
        Ok(Self {
            writer: Mutex::new(stream),
            reader: Mutex::new(FrameReader {
                reader: BufReader::new(read_half),
                partial: Vec::new(),
            }),
            alive: AtomicBool::new(true),
            services: Mutex::new(HashSet::new()),
            backlog: Mutex::new(VecDeque::new()),
            service_timeout,
        })
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.services.lock().clear();
    }

    fn write_frame(&self, frame: &Outbound<'_>) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::InvalidState("session closed".into()));
        }
        let mut line =
            serde_json::to_vec(frame).map_err(|e| TransportError::Malformed(e.to_string()))?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        let result = writer.write_all(&line).and_then(|()| writer.flush());
        result.map_err(|e| {
            self.mark_dead();
            match e.kind() {
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                    TransportError::InvalidState(format!("connection lost: {e}"))
                }
                _ => TransportError::Io(e.to_string()),
            }
        })
    }

    /// Read one event. `None` wait means non-blocking; `Ok(None)` means
    /// nothing arrived in time.
    fn read_event(&self, wait: Option<Duration>) -> Result<Option<Event>, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::InvalidState("session closed".into()));
        }
        let mut guard = self.reader.lock();
        let frames = &mut *guard;
        let socket = frames.reader.get_ref();
        let configured = match wait {
            Some(d) => socket.set_read_timeout(Some(d.max(MIN_READ_TIMEOUT))),
            None => socket.set_nonblocking(true),
        };
        configured.map_err(|e| TransportError::Io(e.to_string()))?;

        let outcome = frames.reader.read_until(b'\n', &mut frames.partial);

        if wait.is_none() {
            let _ = frames.reader.get_ref().set_nonblocking(false);
        }

        match outcome {
            Ok(0) => {
                self.mark_dead();
                Err(TransportError::InvalidState("connection closed by provider".into()))
            }
            Ok(_) if frames.partial.ends_with(b"\n") => {
                let line = std::mem::take(&mut frames.partial);
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                serde_json::from_str(trimmed)
                    .map(Some)
                    .map_err(|e| TransportError::Malformed(e.to_string()))
            }
            // EOF in the middle of a frame
            Ok(_) => {
                self.mark_dead();
                Err(TransportError::InvalidState("connection closed mid-frame".into()))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => {
                self.mark_dead();
                Err(TransportError::Io(e.to_string()))
            }
        }
    }
}

impl Session for TcpSession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn open_service(&self, name: &str) -> Result<(), TransportError> {
        self.write_frame(&Outbound::OpenService { service: name })?;
        let deadline = Instant::now() + self.service_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::ServiceUnavailable {
                    service: name.to_string(),
                    reason: "no acknowledgement before timeout".into(),
                });
            }
            let Some(event) = self.read_event(Some(remaining))? else {
                continue;
            };
            if event.kind == EventKind::ServiceStatus {
                for msg in &event.messages {
                    let about = msg
                        .element("serviceName")
                        .and_then(|v| v.as_str())
                        .map_or(true, |s| s == name);
                    if !about {
                        continue;
                    }
                    if msg.message_type == SERVICE_OPENED {
                        self.services.lock().insert(name.to_string());
                        return Ok(());
                    }
                    if msg.message_type == SERVICE_OPEN_FAILURE {
                        let reason = msg
                            .element("reason")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "refused".into());
                        return Err(TransportError::ServiceUnavailable {
                            service: name.to_string(),
                            reason,
                        });
                    }
                }
            }
            debug!(kind = ?event.kind, "buffering event received while opening service");
            self.backlog.lock().push_back(event);
        }
    }

    fn has_service(&self, name: &str) -> bool {
        self.is_alive() && self.services.lock().contains(name)
    }

    fn send(&self, request: &Request) -> Result<(), TransportError> {
        self.write_frame(&Outbound::Request { request })
    }

    fn next_event(&self, timeout: Duration) -> Result<Event, TransportError> {
        if let Some(event) = self.backlog.lock().pop_front() {
            return Ok(event);
        }
        Ok(self.read_event(Some(timeout))?.unwrap_or_else(Event::timeout))
    }

    fn try_next_event(&self) -> Option<Event> {
        if let Some(event) = self.backlog.lock().pop_front() {
            return Some(event);
        }
        match self.read_event(None) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "non-blocking read failed");
                None
            }
        }
    }

    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.write_frame(&Outbound::Subscribe { subscriptions })
    }

    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.write_frame(&Outbound::Unsubscribe { subscriptions })
    }
}
