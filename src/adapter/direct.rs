//! Stream adapters
//!
//! [`StreamAdapter`] is ready as soon as its transport connects. It backs
//! the direct adapter and any adapter whose protocol handshake lives inside
//! the dialer (Shadowsocks).

use bytes::Bytes;
use tracing::debug;

use super::{AdapterFactory, Outbound};
use crate::session::ConnectSession;
use crate::socket::{AdapterSocket, SocketCore, SocketEvent, SocketStatus, TunnelSocket};
use crate::transport::{BoxedTransport, EventSink, ReadKind, TransportEvent, TransportId};

/// Id of the built-in direct adapter
pub const DIRECT_ADAPTER_ID: &str = "direct";

/// Which address a stream adapter dials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialTarget {
    /// The resolved IP when known, else the host
    Resolved,
    /// Always the host name; the far end resolves it
    HostName,
}

/// Adapter that relays over a connected transport
#[derive(Debug)]
pub struct StreamAdapter {
    core: SocketCore,
    kind: &'static str,
    target: DialTarget,
}

impl StreamAdapter {
    #[must_use]
    pub fn new(kind: &'static str, transport: BoxedTransport, target: DialTarget) -> Self {
        Self {
            core: SocketCore::new(transport),
            kind,
            target,
        }
    }
}

impl TunnelSocket for StreamAdapter {
    fn status(&self) -> SocketStatus {
        self.core.status()
    }

    fn owns(&self, id: TransportId) -> bool {
        self.core.owns(id)
    }

    fn on_transport_event(&mut self, _id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        match event {
            TransportEvent::Connected => {
                if self.core.advance(SocketStatus::Established) {
                    out.push(SocketEvent::ReadyForForward);
                }
            }
            TransportEvent::Read(data) => out.push(SocketEvent::DidRead(data)),
            TransportEvent::Wrote => out.push(SocketEvent::DidWrite),
            TransportEvent::Disconnected { error } => self.core.closed(error, out),
            TransportEvent::Elapsed => {}
        }
    }

    fn read_data(&mut self) {
        if self.core.status() == SocketStatus::Established {
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

impl AdapterSocket for StreamAdapter {
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        let host = match self.target {
            DialTarget::Resolved => session.dial_host(),
            DialTarget::HostName => session.host().to_string(),
        };
        debug!(kind = self.kind, host = %host, port = session.port(), "Adapter connecting");
        if let Err(e) = self.core.connect(&host, session.port(), sink) {
            out.push(SocketEvent::DidDisconnect {
                error: Some(e.to_string()),
            });
        }
    }

    fn kind(&self) -> &'static str {
        self.kind
    }
}

/// Connects straight to the destination
#[derive(Debug, Clone)]
pub struct DirectAdapterFactory {
    id: String,
    outbound: Outbound,
}

impl DirectAdapterFactory {
    #[must_use]
    pub fn new(id: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }
}

impl Default for DirectAdapterFactory {
    fn default() -> Self {
        Self::new(DIRECT_ADAPTER_ID, Outbound::default())
    }
}

impl AdapterFactory for DirectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(StreamAdapter::new("direct", self.outbound.transport(), DialTarget::Resolved))
    }

    fn is_direct(&self) -> bool {
        true
    }
}
