//! HTTP CONNECT adapter
//!
//! Tunnels through an upstream HTTP proxy. The proxy connection may be
//! wrapped in TLS (`secured`) and authenticated with Basic credentials.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;

use super::{AdapterFactory, Outbound};
use crate::session::ConnectSession;
use crate::socket::{AdapterSocket, SocketCore, SocketEvent, SocketStatus, TunnelSocket};
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportEvent, TransportId};

/// Largest accepted upstream response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    AwaitingResponse,
    Forwarding,
}

/// Adapter speaking HTTP CONNECT to an upstream proxy
#[derive(Debug)]
pub struct HttpAdapter {
    core: SocketCore,
    server: (String, u16),
    authorization: Option<String>,
    request: Option<Bytes>,
    phase: Phase,
    /// The CONNECT request's `Wrote` is still outstanding
    request_in_flight: bool,
}

impl HttpAdapter {
    #[must_use]
    pub fn new(transport: BoxedTransport, server: (String, u16), authorization: Option<String>) -> Self {
        Self {
            core: SocketCore::new(transport),
            server,
            authorization,
            request: None,
            phase: Phase::Connecting,
            request_in_flight: false,
        }
    }

    fn connect_request(&self, host: &str, port: u16) -> Bytes {
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(credentials) = &self.authorization {
            request.push_str("Proxy-Authorization: Basic ");
            request.push_str(credentials);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        Bytes::from(request)
    }
}

impl TunnelSocket for HttpAdapter {
    fn status(&self) -> SocketStatus {
        self.core.status()
    }

    fn owns(&self, id: TransportId) -> bool {
        self.core.owns(id)
    }

    fn on_transport_event(&mut self, _id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        match event {
            TransportEvent::Connected => {
                if let Some(request) = self.request.take() {
                    self.phase = Phase::AwaitingResponse;
                    self.request_in_flight = true;
                    self.core.write(request);
                    self.core.read(ReadKind::until(b"\r\n\r\n", MAX_RESPONSE_HEAD));
                }
            }
            TransportEvent::Read(data) => match self.phase {
                Phase::AwaitingResponse => match response_status(&data) {
                    Some(code) if (200..300).contains(&code) => {
                        self.phase = Phase::Forwarding;
                        self.core.advance(SocketStatus::Established);
                        out.push(SocketEvent::ReadyForForward);
                    }
                    Some(code) => self.core.fail(format!("upstream proxy answered {code}"), out),
                    None => self.core.fail("malformed upstream proxy response", out),
                },
                Phase::Forwarding => out.push(SocketEvent::DidRead(data)),
                Phase::Connecting => {}
            },
            TransportEvent::Wrote => {
                if self.request_in_flight {
                    self.request_in_flight = false;
                } else if self.phase == Phase::Forwarding {
                    out.push(SocketEvent::DidWrite);
                }
            }
            TransportEvent::Disconnected { error } => self.core.closed(error, out),
            TransportEvent::Elapsed => {}
        }
    }

    fn read_data(&mut self) {
        if self.phase == Phase::Forwarding {
            self.core.read(ReadKind::Any);
        }
    }

    fn write_data(&mut self, data: Bytes) {
        self.core.write(data);
    }

    fn disconnect(&mut self) {
        self.core.disconnect();
    }

    fn force_disconnect(&mut self) {
        self.core.force_disconnect();
    }
}

impl AdapterSocket for HttpAdapter {
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        self.request = Some(self.connect_request(session.host(), session.port()));
        debug!(proxy = %self.server.0, target = %session, "HTTP CONNECT via upstream");
        let (host, port) = self.server.clone();
        if let Err(e) = self.core.connect(&host, port, sink) {
            out.push(SocketEvent::DidDisconnect {
                error: Some(e.to_string()),
            });
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Status code of an HTTP response head
fn response_status(head: &[u8]) -> Option<u16> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Produces [`HttpAdapter`]s for one upstream proxy
#[derive(Debug, Clone)]
pub struct HttpAdapterFactory {
    id: String,
    outbound: Outbound,
    server: (String, u16),
    authorization: Option<String>,
}

impl HttpAdapterFactory {
    /// `outbound` reaches the proxy itself (plain TCP or TLS)
    #[must_use]
    pub fn new(id: impl Into<String>, outbound: Outbound, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            outbound,
            server: (host.into(), port),
            authorization: None,
        }
    }

    /// Authenticate with Basic credentials
    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.authorization = Some(STANDARD.encode(format!("{username}:{password}")));
        self
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(HttpAdapter::new(
            self.outbound.transport(),
            self.server.clone(),
            self.authorization.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock::{Call, MockTransport};

    fn opened(authorization: Option<String>) -> (HttpAdapter, crate::socket::mock::CallLog, u32) {
        let (transport, log) = MockTransport::new();
        let mut adapter = HttpAdapter::new(Box::new(transport), ("proxy.local".into(), 3128), authorization);
        let (sink, _rx) = EventSink::channel();
        adapter.open(&ConnectSession::new("example.com", 443), &sink, &mut Vec::new());
        let id = log.id().unwrap();
        (adapter, log, id)
    }

    #[test]
    fn test_connect_through_proxy() {
        let (mut adapter, log, id) = opened(None);
        assert_eq!(
            log.take(),
            vec![Call::Connect {
                host: "proxy.local".into(),
                port: 3128
            }]
        );

        let mut out = Vec::new();
        adapter.on_transport_event(id, TransportEvent::Connected, &mut out);
        assert!(out.is_empty());
        assert_eq!(
            log.writes(),
            vec![Bytes::from_static(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")]
        );

        adapter.on_transport_event(id, TransportEvent::Wrote, &mut out);
        assert!(out.is_empty());

        let response = Bytes::from_static(b"HTTP/1.1 200 Connection established\r\n\r\n");
        adapter.on_transport_event(id, TransportEvent::Read(response), &mut out);
        assert!(matches!(out.as_slice(), [SocketEvent::ReadyForForward]));
        assert_eq!(adapter.status(), SocketStatus::Established);
    }

    #[test]
    fn test_late_request_write_not_taken_as_relay_write() {
        let (mut adapter, _log, id) = opened(None);
        let mut out = Vec::new();
        adapter.on_transport_event(id, TransportEvent::Connected, &mut out);
        let response = Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n");
        adapter.on_transport_event(id, TransportEvent::Read(response), &mut out);
        assert!(matches!(out.as_slice(), [SocketEvent::ReadyForForward]));

        let mut out = Vec::new();
        adapter.on_transport_event(id, TransportEvent::Wrote, &mut out);
        assert!(out.is_empty());

        adapter.write_data(Bytes::from_static(b"data"));
        adapter.on_transport_event(id, TransportEvent::Wrote, &mut out);
        assert!(matches!(out.as_slice(), [SocketEvent::DidWrite]));
    }

    #[test]
    fn test_basic_auth_header() {
        let factory = HttpAdapterFactory::new("corp", Outbound::default(), "proxy.local", 3128)
            .with_credentials("user", "pass");
        let (mut adapter, log, id) = opened(factory.authorization.clone());
        adapter.on_transport_event(id, TransportEvent::Connected, &mut Vec::new());
        let request = log.writes().pop().unwrap();
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn test_non_2xx_fails() {
        let (mut adapter, log, id) = opened(None);
        adapter.on_transport_event(id, TransportEvent::Connected, &mut Vec::new());

        let mut out = Vec::new();
        let response = Bytes::from_static(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        adapter.on_transport_event(id, TransportEvent::Read(response), &mut out);
        assert!(matches!(
            out.as_slice(),
            [SocketEvent::DidDisconnect { error: Some(e) }] if e.contains("407")
        ));
        assert_eq!(log.last(), Some(Call::ForceDisconnect));
    }

    #[test]
    fn test_response_status_parsing() {
        assert_eq!(response_status(b"HTTP/1.0 200 OK\r\n\r\n"), Some(200));
        assert_eq!(response_status(b"SSH-2.0\r\n\r\n"), None);
        assert_eq!(response_status(b"HTTP/1.1 abc\r\n\r\n"), None);
    }
}
