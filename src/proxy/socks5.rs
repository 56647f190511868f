//! SOCKS5 proxy socket (RFC 1928)
//!
//! Accepts no-auth CONNECT requests with IPv4, IPv6 or domain destinations.
//! The success reply is only written once the tunnel's adapter is ready.
//!
//! # Handshake
//!
//! ```text
//! client                         proxy socket
//!   | VER NMETHODS METHODS ---------> |  method 0x00 offered?
//!   | <------------------ VER 0x00    |  (else 0xFF and close)
//!   | VER CMD RSV ATYP ADDR PORT ---> |  CMD must be CONNECT
//!   |                                 |  ConnectRequested -> tunnel
//!   |                                 |  ... adapter ready ...
//!   | <------ VER 0x00 RSV 1 0.0.0.0:0|  ReadyForForward -> tunnel
//! ```

use bytes::Bytes;
use tracing::{debug, trace};

use crate::socket::{ProxySocket, SocketCore, SocketEvent, SocketStatus, TunnelSocket};
use crate::socks5_common::{
    decode_address, fixed_address_len, reply, reply_message, ATYP_DOMAIN, AUTH_METHOD_NONE,
    AUTH_METHOD_NO_ACCEPTABLE, CMD_CONNECT, PORT_SIZE, REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
    REPLY_COMMAND_NOT_SUPPORTED, REPLY_GENERAL_FAILURE, REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportEvent, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Greeting,
    Methods,
    RequestHeader,
    DomainLength,
    Address { atyp: u8 },
    AwaitingAdapter,
    Replying,
    Forwarding,
    /// Error reply queued; close once it is written
    Rejecting,
}

/// Local SOCKS5 socket
#[derive(Debug)]
pub struct Socks5ProxySocket {
    core: SocketCore,
    phase: Phase,
    reject_reason: Option<String>,
    /// Method-selection writes whose `Wrote` has not arrived yet
    handshake_writes: usize,
}

impl Socks5ProxySocket {
    #[must_use]
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            core: SocketCore::new(transport),
            phase: Phase::Idle,
            reject_reason: None,
            handshake_writes: 0,
        }
    }

    fn expect(&mut self, phase: Phase, kind: ReadKind) {
        self.phase = phase;
        self.core.read(kind);
    }

    fn reject(&mut self, response: Bytes, reason: String) {
        debug!(reason = %reason, "Rejecting SOCKS5 client");
        self.phase = Phase::Rejecting;
        self.reject_reason = Some(reason);
        self.core.write(response);
    }

    fn on_read(&mut self, data: &Bytes, out: &mut Vec<SocketEvent>) {
        match self.phase {
            Phase::Greeting => {
                if data[0] != SOCKS5_VERSION {
                    self.core.fail(format!("unsupported SOCKS version {}", data[0]), out);
                    return;
                }
                let methods = usize::from(data[1]);
                if methods == 0 {
                    self.reject(
                        Bytes::from_static(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE]),
                        "no authentication methods offered".into(),
                    );
                } else {
                    self.expect(Phase::Methods, ReadKind::Exactly(methods));
                }
            }
            Phase::Methods => {
                if data.contains(&AUTH_METHOD_NONE) {
                    self.handshake_writes += 1;
                    self.core.write(Bytes::from_static(&[SOCKS5_VERSION, AUTH_METHOD_NONE]));
                    self.expect(Phase::RequestHeader, ReadKind::Exactly(4));
                } else {
                    self.reject(
                        Bytes::from_static(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE]),
                        "client requires authentication".into(),
                    );
                }
            }
            Phase::RequestHeader => {
                let (version, command, atyp) = (data[0], data[1], data[3]);
                if version != SOCKS5_VERSION {
                    self.core.fail(format!("unsupported SOCKS version {version}"), out);
                } else if command != CMD_CONNECT {
                    self.reject(
                        reply(REPLY_COMMAND_NOT_SUPPORTED),
                        format!("command {command:#04x} {}", reply_message(REPLY_COMMAND_NOT_SUPPORTED)),
                    );
                } else if atyp == ATYP_DOMAIN {
                    self.expect(Phase::DomainLength, ReadKind::Exactly(1));
                } else if let Some(len) = fixed_address_len(atyp) {
                    self.expect(Phase::Address { atyp }, ReadKind::Exactly(len));
                } else {
                    self.reject(
                        reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED),
                        format!("address type {atyp:#04x} not supported"),
                    );
                }
            }
            Phase::DomainLength => {
                let len = usize::from(data[0]);
                if len == 0 {
                    self.reject(reply(REPLY_GENERAL_FAILURE), "empty domain name".into());
                } else {
                    self.expect(Phase::Address { atyp: ATYP_DOMAIN }, ReadKind::Exactly(len + PORT_SIZE));
                }
            }
            Phase::Address { atyp } => match decode_address(atyp, data) {
                Some((host, port)) => {
                    trace!(host = %host, port, "SOCKS5 CONNECT request");
                    self.phase = Phase::AwaitingAdapter;
                    out.push(SocketEvent::ConnectRequested { host, port });
                }
                None => self.reject(reply(REPLY_GENERAL_FAILURE), "invalid destination address".into()),
            },
            Phase::Forwarding => out.push(SocketEvent::DidRead(data.clone())),
            phase => trace!(?phase, len = data.len(), "Unexpected SOCKS5 read ignored"),
        }
    }

    fn on_wrote(&mut self, out: &mut Vec<SocketEvent>) {
        // Writes complete in order, so the first completions belong to the handshake
        if self.handshake_writes > 0 {
            self.handshake_writes -= 1;
            return;
        }
        match self.phase {
            Phase::Replying => {
                self.phase = Phase::Forwarding;
                self.core.advance(SocketStatus::Established);
                out.push(SocketEvent::ReadyForForward);
            }
            Phase::Forwarding => out.push(SocketEvent::DidWrite),
            Phase::Rejecting => self.core.disconnect(),
            _ => {}
        }
    }
}

impl TunnelSocket for Socks5ProxySocket {
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
                    self.expect(Phase::Greeting, ReadKind::Exactly(2));
                }
            }
            TransportEvent::Read(data) => self.on_read(&data, out),
            TransportEvent::Wrote => self.on_wrote(out),
            TransportEvent::Disconnected { error } => {
                let error = error.or_else(|| self.reject_reason.take());
                self.core.closed(error, out);
            }
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
        if self.phase == Phase::AwaitingAdapter {
            // Adapter failed before the success reply went out
            self.phase = Phase::Rejecting;
            self.core.write(reply(REPLY_GENERAL_FAILURE));
        }
        self.core.disconnect();
    }

    fn force_disconnect(&mut self) {
        self.core.force_disconnect();
    }
}

impl ProxySocket for Socks5ProxySocket {
    fn open(&mut self, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        if let Err(e) = self.core.attach(sink) {
            out.push(SocketEvent::DidDisconnect {
                error: Some(e.to_string()),
            });
        }
    }

    fn respond_to_ready(&mut self, _out: &mut Vec<SocketEvent>) {
        if self.phase == Phase::AwaitingAdapter {
            self.phase = Phase::Replying;
            self.core.write(reply(REPLY_SUCCEEDED));
        }
    }
}
