//! HTTP proxy socket
//!
//! Two request forms are accepted:
//!
//! - `CONNECT host:port HTTP/1.1` opens a raw tunnel; `200 Connection
//!   established` is written once the adapter is ready.
//! - Absolute-form requests (`GET http://host/path HTTP/1.1`) are rewritten
//!   to origin-form with `Proxy-*` headers removed. The rewritten head is
//!   relayed to the adapter as the first chunk of client data. The head
//!   carries `Connection: close`, so one request is served per connection.
//!
//! Anything else closes the connection.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::socket::{ProxySocket, SocketCore, SocketEvent, SocketStatus, TunnelSocket};
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportEvent, TransportId};

/// Largest accepted request head
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RequestHead,
    AwaitingAdapter,
    Replying,
    Forwarding,
}

/// Parsed request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub host: String,
    pub port: u16,
    /// Origin-form head to send upstream; `None` for CONNECT
    pub forward_head: Option<Bytes>,
}

/// Local HTTP proxy socket
#[derive(Debug)]
pub struct HttpProxySocket {
    core: SocketCore,
    phase: Phase,
    forward_head: Option<Bytes>,
}

impl HttpProxySocket {
    #[must_use]
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            core: SocketCore::new(transport),
            phase: Phase::Idle,
            forward_head: None,
        }
    }

    fn on_read(&mut self, data: Bytes, out: &mut Vec<SocketEvent>) {
        match self.phase {
            Phase::RequestHead => match parse_request(&data) {
                Ok(request) => {
                    debug!(
                        host = %request.host,
                        port = request.port,
                        connect = request.forward_head.is_none(),
                        "HTTP proxy request"
                    );
                    self.phase = Phase::AwaitingAdapter;
                    self.forward_head = request.forward_head;
                    out.push(SocketEvent::ConnectRequested {
                        host: request.host,
                        port: request.port,
                    });
                }
                Err(reason) => self.core.fail(format!("malformed HTTP request: {reason}"), out),
            },
            Phase::Forwarding => out.push(SocketEvent::DidRead(data)),
            phase => trace!(?phase, len = data.len(), "Unexpected HTTP read ignored"),
        }
    }
}

impl TunnelSocket for HttpProxySocket {
    fn status(&self) -> SocketStatus {
        self.core.status()
    }

    fn owns(&self, id: TransportId) -> bool {
        self.core.owns(id)
    }

    fn on_transport_event(&mut self, _id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        match event {
            TransportEvent::Connected => {
                if self.phase == Phase::Idle {
                    self.phase = Phase::RequestHead;
                    self.core.read(ReadKind::until(b"\r\n\r\n", MAX_REQUEST_HEAD));
                }
            }
            TransportEvent::Read(data) => self.on_read(data, out),
            TransportEvent::Wrote => match self.phase {
                Phase::Replying => {
                    self.phase = Phase::Forwarding;
                    self.core.advance(SocketStatus::Established);
                    out.push(SocketEvent::ReadyForForward);
                }
                Phase::Forwarding => out.push(SocketEvent::DidWrite),
                _ => {}
            },
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

impl ProxySocket for HttpProxySocket {
    fn open(&mut self, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        if let Err(e) = self.core.attach(sink) {
            out.push(SocketEvent::DidDisconnect {
                error: Some(e.to_string()),
            });
        }
    }

    fn respond_to_ready(&mut self, out: &mut Vec<SocketEvent>) {
        if self.phase != Phase::AwaitingAdapter {
            return;
        }
        match self.forward_head.take() {
            Some(head) => {
                self.phase = Phase::Forwarding;
                self.core.advance(SocketStatus::Established);
                out.push(SocketEvent::DidRead(head));
                out.push(SocketEvent::ReadyForForward);
            }
            None => {
                self.phase = Phase::Replying;
                self.core.write(Bytes::from_static(CONNECT_ESTABLISHED));
            }
        }
    }
}

/// Parse a proxy request head ending in an empty line
///
/// # Errors
///
/// Returns a description of the first problem found.
pub fn parse_request(head: &[u8]) -> Result<ProxyRequest, String> {
    let text = std::str::from_utf8(head).map_err(|_| "request head is not UTF-8".to_string())?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("bad request line '{request_line}'"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(format!("unsupported version '{version}'"));
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, None)?;
        return Ok(ProxyRequest {
            host,
            port,
            forward_head: None,
        });
    }

    let rest = strip_prefix_ignore_case(target, "http://")
        .ok_or_else(|| format!("target '{target}' is not an absolute http URL"))?;
    let (authority, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, "/"),
    };
    let (host, port) = split_host_port(authority, Some(80))?;

    let mut rewritten = format!("{method} {path} {version}\r\n");
    let mut has_host = false;
    for line in lines.take_while(|l| !l.is_empty()) {
        let Some((name, _)) = line.split_once(':') else {
            return Err(format!("bad header line '{line}'"));
        };
        let name = name.trim();
        if strip_prefix_ignore_case(name, "proxy-").is_some()
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
        {
            continue;
        }
        has_host |= name.eq_ignore_ascii_case("host");
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    if !has_host {
        rewritten.push_str(&format!("Host: {authority}\r\n"));
    }
    rewritten.push_str("Connection: close\r\n\r\n");

    Ok(ProxyRequest {
        host,
        port,
        forward_head: Some(Bytes::from(rewritten)),
    })
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Split `host:port` or `[v6]:port`, using `default_port` when none is given
fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16), String> {
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| format!("unterminated IPv6 literal in '{authority}'"))?;
        (host, rest.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in '{authority}'"));
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| format!("bad port in '{authority}'"))?,
        None => default_port.ok_or_else(|| format!("missing port in '{authority}'"))?,
    };
    Ok((host.to_string(), port))
}
