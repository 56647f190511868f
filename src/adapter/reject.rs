//! Reject adapter
//!
//! Closes the tunnel after a configurable delay without touching the
//! network. The delay slows down clients that retry in a tight loop.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::AdapterFactory;
use crate::session::ConnectSession;
use crate::socket::{AdapterSocket, SocketEvent, SocketStatus, TunnelSocket};
use crate::transport::{EventSink, TransportEvent, TransportId};

/// Adapter that never connects
#[derive(Debug)]
pub struct RejectAdapter {
    delay: Duration,
    timer: Option<TransportId>,
    status: SocketStatus,
}

impl RejectAdapter {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timer: None,
            status: SocketStatus::Invalid,
        }
    }
}

impl TunnelSocket for RejectAdapter {
    fn status(&self) -> SocketStatus {
        self.status
    }

    fn owns(&self, id: TransportId) -> bool {
        self.timer == Some(id)
    }

    fn on_transport_event(&mut self, _id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        if matches!(event, TransportEvent::Elapsed) && self.status.advance(SocketStatus::Closed) {
            out.push(SocketEvent::DidDisconnect {
                error: Some("rejected by rule".to_string()),
            });
        }
    }

    fn read_data(&mut self) {
        trace!("Read on reject adapter ignored");
    }

    fn write_data(&mut self, data: Bytes) {
        trace!(len = data.len(), "Write on reject adapter dropped");
    }

    fn disconnect(&mut self) {
        self.status.advance(SocketStatus::Closed);
    }

    fn force_disconnect(&mut self) {
        self.status.advance(SocketStatus::Closed);
    }
}

impl AdapterSocket for RejectAdapter {
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, _out: &mut Vec<SocketEvent>) {
        debug!(session = %session, delay_ms = self.delay.as_millis(), "Rejecting connection");
        self.status.advance(SocketStatus::Connecting);
        let timer = sink.bind();
        self.timer = Some(timer.id());
        timer.schedule(self.delay);
    }

    fn kind(&self) -> &'static str {
        "reject"
    }
}

/// Produces [`RejectAdapter`]s
#[derive(Debug, Clone)]
pub struct RejectAdapterFactory {
    id: String,
    delay: Duration,
}

impl RejectAdapterFactory {
    /// Reject immediately
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
        }
    }

    /// Reject after `delay`
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl AdapterFactory for RejectAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(RejectAdapter::new(self.delay))
    }
}
