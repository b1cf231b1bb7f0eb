//! TCP transport against an in-process line-delimited JSON server.

use quotegate_core::connection::ConnectionManager;
use quotegate_core::decode::Decoder;
use quotegate_core::protocol::{Connector, Request, Session, TransportError};
use quotegate_core::pump::{EventPump, PumpSettings, PumpState};
use quotegate_core::query::REFDATA_SERVICE;
use quotegate_core::transport::TcpConnector;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn write_line(stream: &mut TcpStream, value: &Value) {
    let mut line = serde_json::to_vec(value).unwrap();
    line.push(b'\n');
    stream.write_all(&line).unwrap();
    stream.flush().unwrap();
}

fn reply_for(ticker: &str, value: f64) -> Value {
    json!({"message_type": "ReferenceDataResponse",
           "body": {"securityData": [{"security": ticker, "fieldData": {"PX_LAST": value}}]}})
}

/// Serves one connection: acknowledges service opens and answers every
/// request with a partial + final reply, the final one split across writes.
fn spawn_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let frame: Value = serde_json::from_str(&line).unwrap();
            match frame["op"].as_str() {
                Some("open_service") => {
                    // Unrelated event first; the session must buffer it
                    write_line(&mut writer, &json!({"kind": "SESSION_STATUS", "messages": [
                        {"message_type": "SessionConnectionUp", "body": null}]}));
                    write_line(&mut writer, &json!({"kind": "SERVICE_STATUS", "messages": [
                        {"message_type": "ServiceOpened",
                         "body": {"serviceName": frame["service"].clone()}}]}));
                }
                Some("request") => {
                    write_line(&mut writer, &json!({"kind": "PARTIAL_RESPONSE",
                        "messages": [reply_for("A", 1.0)]}));
                    let last = serde_json::to_vec(&json!({"kind": "RESPONSE",
                        "messages": [reply_for("B", 2.0)]})).unwrap();
                    let (head, tail) = last.split_at(last.len() / 2);
                    writer.write_all(head).unwrap();
                    writer.flush().unwrap();
                    thread::sleep(Duration::from_millis(60));
                    writer.write_all(tail).unwrap();
                    writer.write_all(b"\n").unwrap();
                    writer.flush().unwrap();
                }
                _ => {}
            }
        }
    });
    port
}

#[test]
fn request_round_trip_over_tcp() {
    let port = spawn_server();
    let manager = ConnectionManager::new(Arc::new(TcpConnector::default()), "127.0.0.1");

    let mut request = Request::new(REFDATA_SERVICE, "ReferenceDataRequest");
    request.append_security("A");
    request.append_security("B");
    request.append_field("PX_LAST");
    let handle = manager.dispatch(port, &request).unwrap();

    let settings = PumpSettings {
        poll_interval: Duration::from_millis(20),
        timeout_budget: 50,
    };
    let pump = EventPump::new(handle.session(), Decoder::Reference, settings);
    let drained = pump.drain().unwrap();

    // The session-status event buffered during the service open is flushed before the send
    let tickers: Vec<_> = drained.records.iter().map(|r| r.ticker.as_str()).collect();
    assert_eq!(tickers, vec!["A", "B"]);
    assert_eq!(drained.state, PumpState::Completed);
}

#[test]
fn closed_port_is_unreachable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = TcpConnector::default()
        .open("127.0.0.1", port)
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::Unreachable { .. }));
}

#[test]
fn server_hangup_makes_session_invalid() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let session = TcpConnector::default().open("127.0.0.1", port).unwrap();
    server.join().unwrap();

    let err = session.next_event(Duration::from_millis(200)).unwrap_err();
    assert!(matches!(err, TransportError::InvalidState(_)));
    assert!(!session.is_alive());
    let send = session.send(&Request::new(REFDATA_SERVICE, "ReferenceDataRequest"));
    assert!(matches!(send, Err(TransportError::InvalidState(_))));
}
