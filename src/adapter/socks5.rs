//! SOCKS5 adapter (RFC 1928, RFC 1929)
//!
//! CONNECT through an upstream SOCKS5 proxy, with no authentication or
//! username/password. The destination host name is sent as-is so the proxy
//! resolves it.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{AdapterFactory, Outbound};
use crate::error::AdapterError;
use crate::session::ConnectSession;
use crate::socket::{AdapterSocket, SocketCore, SocketEvent, SocketStatus, TunnelSocket};
use crate::socks5_common::{
    encode_address, fixed_address_len, reply_message, ATYP_DOMAIN, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD,
    AUTH_PASSWORD_VERSION, CMD_CONNECT, PORT_SIZE, REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportEvent, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    MethodReply,
    AuthReply,
    ReplyHeader,
    ReplyDomainLength,
    ReplyAddress,
    Forwarding,
}

/// Username/password pair, validated to fit RFC 1929 length fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// # Errors
    ///
    /// Returns `AdapterError::InvalidConfig` if either field is empty or
    /// longer than 255 bytes.
    pub fn new(id: &str, username: impl Into<String>, password: impl Into<String>) -> Result<Self, AdapterError> {
        let (username, password) = (username.into(), password.into());
        for (field, value) in [("username", &username), ("password", &password)] {
            if value.is_empty() || value.len() > usize::from(u8::MAX) {
                return Err(AdapterError::invalid_config(id, format!("{field} must be 1-255 bytes")));
            }
        }
        Ok(Self { username, password })
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.username.len() + self.password.len());
        buf.put_u8(AUTH_PASSWORD_VERSION);
        // Lengths were checked in `new`
        buf.put_u8(u8::try_from(self.username.len()).unwrap_or(u8::MAX));
        buf.put_slice(self.username.as_bytes());
        buf.put_u8(u8::try_from(self.password.len()).unwrap_or(u8::MAX));
        buf.put_slice(self.password.as_bytes());
        buf.freeze()
    }
}

/// Adapter speaking SOCKS5 to an upstream proxy
#[derive(Debug)]
pub struct Socks5Adapter {
    core: SocketCore,
    server: (String, u16),
    credentials: Option<Credentials>,
    target: Option<(String, u16)>,
    phase: Phase,
    /// Handshake writes whose `Wrote` has not arrived yet
    handshake_writes: usize,
}

impl Socks5Adapter {
    #[must_use]
    pub fn new(transport: BoxedTransport, server: (String, u16), credentials: Option<Credentials>) -> Self {
        Self {
            core: SocketCore::new(transport),
            server,
            credentials,
            target: None,
            phase: Phase::Connecting,
            handshake_writes: 0,
        }
    }

    fn expect(&mut self, phase: Phase, kind: ReadKind) {
        self.phase = phase;
        self.core.read(kind);
    }

    fn write_handshake(&mut self, data: Bytes) {
        self.handshake_writes += 1;
        self.core.write(data);
    }

    fn send_request(&mut self, out: &mut Vec<SocketEvent>) {
        let Some((host, port)) = self.target.clone() else {
            self.core.fail("no destination", out);
            return;
        };
        let Some(address) = encode_address(&host, port) else {
            self.core.fail(format!("destination name too long: {host}"), out);
            return;
        };
        let mut request = BytesMut::with_capacity(3 + address.len());
        request.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
        request.put_slice(&address);
        self.write_handshake(request.freeze());
        self.expect(Phase::ReplyHeader, ReadKind::Exactly(4));
    }

    fn on_read(&mut self, data: Bytes, out: &mut Vec<SocketEvent>) {
        match self.phase {
            Phase::MethodReply => {
                if data[0] != SOCKS5_VERSION {
                    self.core.fail(format!("upstream speaks SOCKS version {}", data[0]), out);
                    return;
                }
                let method = data[1];
                let auth = match method {
                    AUTH_METHOD_PASSWORD => self.credentials.as_ref().map(Credentials::encode),
                    _ => None,
                };
                if method == AUTH_METHOD_NONE {
                    self.send_request(out);
                } else if let Some(auth) = auth {
                    self.write_handshake(auth);
                    self.expect(Phase::AuthReply, ReadKind::Exactly(2));
                } else {
                    self.core.fail(format!("upstream selected method {method:#04x}"), out);
                }
            }
            Phase::AuthReply => {
                if data[1] == 0x00 {
                    self.send_request(out);
                } else {
                    self.core.fail("upstream rejected credentials", out);
                }
            }
            Phase::ReplyHeader => {
                if data[1] != REPLY_SUCCEEDED {
                    self.core.fail(format!("upstream CONNECT failed: {}", reply_message(data[1])), out);
                } else if data[3] == ATYP_DOMAIN {
                    self.expect(Phase::ReplyDomainLength, ReadKind::Exactly(1));
                } else if let Some(len) = fixed_address_len(data[3]) {
                    self.expect(Phase::ReplyAddress, ReadKind::Exactly(len));
                } else {
                    self.core.fail(format!("upstream bound address type {:#04x}", data[3]), out);
                }
            }
            Phase::ReplyDomainLength => {
                let len = usize::from(data[0]);
                self.expect(Phase::ReplyAddress, ReadKind::Exactly(len + PORT_SIZE));
            }
            Phase::ReplyAddress => {
                self.phase = Phase::Forwarding;
                self.core.advance(SocketStatus::Established);
                out.push(SocketEvent::ReadyForForward);
            }
            Phase::Forwarding => out.push(SocketEvent::DidRead(data)),
            Phase::Connecting => {}
        }
    }
}

impl TunnelSocket for Socks5Adapter {
    fn status(&self) -> SocketStatus {
        self.core.status()
    }

    fn owns(&self, id: TransportId) -> bool {
        self.core.owns(id)
    }

    fn on_transport_event(&mut self, _id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        match event {
            TransportEvent::Connected => {
                if self.phase != Phase::Connecting {
                    return;
                }
                let greeting: &'static [u8] = if self.credentials.is_some() {
                    &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
                } else {
                    &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
                };
                self.write_handshake(Bytes::from_static(greeting));
                self.expect(Phase::MethodReply, ReadKind::Exactly(2));
            }
            TransportEvent::Read(data) => self.on_read(data, out),
            TransportEvent::Wrote => {
                if self.handshake_writes > 0 {
                    self.handshake_writes -= 1;
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

impl AdapterSocket for Socks5Adapter {
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        self.target = Some((session.host().to_string(), session.port()));
        debug!(proxy = %self.server.0, target = %session, "SOCKS5 CONNECT via upstream");
        let (host, port) = self.server.clone();
        if let Err(e) = self.core.connect(&host, port, sink) {
            out.push(SocketEvent::DidDisconnect {
                error: Some(e.to_string()),
            });
        }
    }

    fn kind(&self) -> &'static str {
        "socks5"
    }
}

/// Produces [`Socks5Adapter`]s for one upstream proxy
#[derive(Debug, Clone)]
pub struct Socks5AdapterFactory {
    id: String,
    outbound: Outbound,
    server: (String, u16),
    credentials: Option<Credentials>,
}

impl Socks5AdapterFactory {
    #[must_use]
    pub fn new(id: impl Into<String>, outbound: Outbound, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            outbound,
            server: (host.into(), port),
            credentials: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

impl AdapterFactory for Socks5AdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(Socks5Adapter::new(
            self.outbound.transport(),
            self.server.clone(),
            self.credentials.clone(),
        ))
    }
}
