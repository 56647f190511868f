//! Socket roles
//!
//! A tunnel pairs two sockets:
//!
//! - a [`ProxySocket`] facing the local client, which decodes the client's
//!   handshake and emits a connect request
//! - an [`AdapterSocket`] facing the remote side, which runs the upstream
//!   handshake (if any) for the session chosen by the rule engine
//!
//! Sockets never call back into the tunnel. Transport completions are fed in
//! through [`TunnelSocket::on_transport_event`], and the socket answers with
//! zero or more [`SocketEvent`]s pushed onto the caller's buffer.

mod status;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use bytes::Bytes;
use tracing::trace;

use crate::session::ConnectSession;
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportError, TransportEvent, TransportId};

pub use status::SocketStatus;

/// What a socket reports to its tunnel
pub enum SocketEvent {
    /// Proxy handshake decoded the client's destination
    ConnectRequested { host: String, port: u16 },
    /// Handshake done; the socket relays from now on
    ReadyForForward,
    /// Relay data read from the socket
    DidRead(Bytes),
    /// Relay data written to the socket
    DidWrite,
    /// The socket is closed; `error` is `None` for a clean close
    DidDisconnect { error: Option<String> },
    /// An adapter hands its role over to another, already established one
    Replace(Box<dyn AdapterSocket>),
}

impl fmt::Debug for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRequested { host, port } => write!(f, "ConnectRequested({host}:{port})"),
            Self::ReadyForForward => f.write_str("ReadyForForward"),
            Self::DidRead(data) => write!(f, "DidRead({} bytes)", data.len()),
            Self::DidWrite => f.write_str("DidWrite"),
            Self::DidDisconnect { error } => write!(f, "DidDisconnect({error:?})"),
            Self::Replace(socket) => write!(f, "Replace({})", socket.kind()),
        }
    }
}

/// Operations shared by both socket roles
///
/// Relay reads and writes must not be pipelined: the tunnel issues the next
/// `read_data` only after `DidRead` was handled, and the next `write_data`
/// only after `DidWrite`.
pub trait TunnelSocket: Send + fmt::Debug {
    /// Current lifecycle status
    fn status(&self) -> SocketStatus;

    /// Whether events tagged `id` belong to this socket
    fn owns(&self, id: TransportId) -> bool;

    /// Handle a completion of one of this socket's transports or timers
    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>);

    /// Request the next chunk of relay data
    fn read_data(&mut self);

    /// Send relay data
    fn write_data(&mut self, data: Bytes);

    /// Close once pending writes are flushed
    fn disconnect(&mut self);

    /// Close now
    fn force_disconnect(&mut self);
}

/// Local-facing socket
pub trait ProxySocket: TunnelSocket {
    /// Start reading the client's handshake
    fn open(&mut self, sink: &EventSink, out: &mut Vec<SocketEvent>);

    /// The adapter is ready; send the protocol's success reply
    ///
    /// `ReadyForForward` follows once the reply is written.
    fn respond_to_ready(&mut self, out: &mut Vec<SocketEvent>);
}

/// Remote-facing socket
pub trait AdapterSocket: TunnelSocket {
    /// Connect for `session`
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, out: &mut Vec<SocketEvent>);

    /// Short adapter type name for logs
    fn kind(&self) -> &'static str;
}

/// Transport ownership and status bookkeeping shared by socket implementations
#[derive(Debug)]
pub struct SocketCore {
    transport: BoxedTransport,
    id: Option<TransportId>,
    status: SocketStatus,
}

impl SocketCore {
    #[must_use]
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            transport,
            id: None,
            status: SocketStatus::Invalid,
        }
    }

    #[must_use]
    pub fn status(&self) -> SocketStatus {
        self.status
    }

    /// Move the status forward
    pub fn advance(&mut self, next: SocketStatus) -> bool {
        self.status.advance(next)
    }

    #[must_use]
    pub fn id(&self) -> Option<TransportId> {
        self.id
    }

    #[must_use]
    pub fn owns(&self, id: TransportId) -> bool {
        self.id == Some(id)
    }

    /// Dial `host:port` on a fresh id of `sink`
    ///
    /// # Errors
    ///
    /// Returns the transport's precondition error; the socket is then
    /// closed.
    pub fn connect(&mut self, host: &str, port: u16, sink: &EventSink) -> Result<(), TransportError> {
        let bound = sink.bind();
        self.id = Some(bound.id());
        self.status.advance(SocketStatus::Connecting);
        self.transport.connect(host, port, bound).inspect_err(|_| {
            self.status.advance(SocketStatus::Closed);
        })
    }

    /// Start an accepted stream on a fresh id of `sink`
    ///
    /// # Errors
    ///
    /// Returns the transport's precondition error; the socket is then
    /// closed.
    pub fn attach(&mut self, sink: &EventSink) -> Result<(), TransportError> {
        let bound = sink.bind();
        self.id = Some(bound.id());
        self.status.advance(SocketStatus::Connecting);
        self.transport.attach(bound).inspect_err(|_| {
            self.status.advance(SocketStatus::Closed);
        })
    }

    pub fn read(&mut self, kind: ReadKind) {
        if self.status.is_terminating() {
            trace!(status = %self.status, "Read on closing socket ignored");
            return;
        }
        self.transport.read(kind);
    }

    pub fn write(&mut self, data: Bytes) {
        if self.status == SocketStatus::Closed {
            trace!(len = data.len(), "Write on closed socket dropped");
            return;
        }
        self.transport.write(data);
    }

    /// Graceful close; a never started transport closes at once
    pub fn disconnect(&mut self) {
        if self.status.is_terminating() {
            return;
        }
        if self.transport.is_started() {
            self.status.advance(SocketStatus::Disconnecting);
            self.transport.disconnect();
        } else {
            self.status.advance(SocketStatus::Closed);
        }
    }

    pub fn force_disconnect(&mut self) {
        if self.status == SocketStatus::Closed {
            return;
        }
        self.transport.force_disconnect();
        self.status.advance(SocketStatus::Closed);
    }

    /// The transport reported `Disconnected`
    pub fn closed(&mut self, error: Option<String>, out: &mut Vec<SocketEvent>) {
        if self.status.advance(SocketStatus::Closed) {
            out.push(SocketEvent::DidDisconnect { error });
        } else {
            trace!("Disconnect of closed socket ignored");
        }
    }

    /// Abort with a protocol error
    pub fn fail(&mut self, reason: impl Into<String>, out: &mut Vec<SocketEvent>) {
        if self.status == SocketStatus::Closed {
            return;
        }
        self.force_disconnect();
        out.push(SocketEvent::DidDisconnect {
            error: Some(reason.into()),
        });
    }
}
