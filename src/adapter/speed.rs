//! Speed adapter
//!
//! Races several candidate adapters for the same session. Each candidate may
//! start after its own delay. The first candidate to finish its handshake
//! wins: it replaces the speed adapter in the tunnel and every other
//! candidate is force-disconnected. The speed adapter fails only once every
//! candidate has failed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::AdapterFactory;
use crate::session::ConnectSession;
use crate::socket::{AdapterSocket, SocketEvent, SocketStatus, TunnelSocket};
use crate::transport::{EventSink, TransportEvent, TransportId};

/// One entry of the race
#[derive(Debug, Clone)]
pub struct SpeedCandidate {
    pub factory: Arc<dyn AdapterFactory>,
    pub delay: Duration,
}

#[derive(Debug)]
struct Racer {
    factory: Arc<dyn AdapterFactory>,
    timer: Option<TransportId>,
    socket: Option<Box<dyn AdapterSocket>>,
}

impl Racer {
    fn is_pending(&self) -> bool {
        self.timer.is_some() || self.socket.as_ref().is_some_and(|s| s.status() != SocketStatus::Closed)
    }
}

/// Adapter racing its candidates
#[derive(Debug)]
pub struct SpeedAdapter {
    racers: Vec<Racer>,
    delays: Vec<Duration>,
    session: Option<ConnectSession>,
    sink: Option<EventSink>,
    status: SocketStatus,
    last_error: Option<String>,
}

impl SpeedAdapter {
    #[must_use]
    pub fn new(candidates: &[SpeedCandidate]) -> Self {
        Self {
            racers: candidates
                .iter()
                .map(|c| Racer {
                    factory: Arc::clone(&c.factory),
                    timer: None,
                    socket: None,
                })
                .collect(),
            delays: candidates.iter().map(|c| c.delay).collect(),
            session: None,
            sink: None,
            status: SocketStatus::Invalid,
            last_error: None,
        }
    }

    fn start(&mut self, index: usize, out: &mut Vec<SocketEvent>) {
        let (Some(session), Some(sink)) = (self.session.as_ref(), self.sink.as_ref()) else {
            return;
        };
        let racer = &mut self.racers[index];
        racer.timer = None;
        trace!(candidate = racer.factory.id(), "Speed candidate starting");

        let mut socket = racer.factory.make_adapter(session);
        let mut child = Vec::new();
        socket.open(session, sink, &mut child);
        racer.socket = Some(socket);
        self.on_child_events(index, child, out);
    }

    fn on_child_events(&mut self, index: usize, events: Vec<SocketEvent>, out: &mut Vec<SocketEvent>) {
        for event in events {
            if self.status != SocketStatus::Connecting {
                break;
            }
            match event {
                SocketEvent::ReadyForForward => self.declare_winner(index, out),
                SocketEvent::DidDisconnect { error } => {
                    debug!(
                        candidate = self.racers[index].factory.id(),
                        error = error.as_deref().unwrap_or("closed"),
                        "Speed candidate failed"
                    );
                    self.last_error = error;
                    self.check_exhausted(out);
                }
                other => trace!(event = ?other, "Speed candidate event ignored"),
            }
        }
    }

    fn declare_winner(&mut self, index: usize, out: &mut Vec<SocketEvent>) {
        let Some(winner) = self.racers[index].socket.take() else {
            return;
        };
        debug!(candidate = self.racers[index].factory.id(), "Speed candidate won");
        self.close_all();
        out.push(SocketEvent::Replace(winner));
        out.push(SocketEvent::ReadyForForward);
    }

    fn check_exhausted(&mut self, out: &mut Vec<SocketEvent>) {
        if self.racers.iter().any(Racer::is_pending) {
            return;
        }
        self.status.advance(SocketStatus::Closed);
        let reason = self.last_error.take().unwrap_or_else(|| "closed".to_string());
        out.push(SocketEvent::DidDisconnect {
            error: Some(format!("all speed candidates failed, last: {reason}")),
        });
    }

    fn close_all(&mut self) {
        for racer in &mut self.racers {
            racer.timer = None;
            if let Some(socket) = racer.socket.as_mut() {
                socket.force_disconnect();
            }
        }
        self.status.advance(SocketStatus::Closed);
    }
}

impl TunnelSocket for SpeedAdapter {
    fn status(&self) -> SocketStatus {
        self.status
    }

    fn owns(&self, id: TransportId) -> bool {
        self.racers
            .iter()
            .any(|r| r.timer == Some(id) || r.socket.as_ref().is_some_and(|s| s.owns(id)))
    }

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent, out: &mut Vec<SocketEvent>) {
        if self.status != SocketStatus::Connecting {
            return;
        }
        if let Some(index) = self.racers.iter().position(|r| r.timer == Some(id)) {
            self.start(index, out);
            return;
        }
        let Some(index) = self
            .racers
            .iter()
            .position(|r| r.socket.as_ref().is_some_and(|s| s.owns(id)))
        else {
            return;
        };
        let mut child = Vec::new();
        if let Some(socket) = self.racers[index].socket.as_mut() {
            socket.on_transport_event(id, event, &mut child);
        }
        self.on_child_events(index, child, out);
    }

    fn read_data(&mut self) {
        trace!("Read on speed adapter ignored");
    }

    fn write_data(&mut self, data: Bytes) {
        trace!(len = data.len(), "Write on speed adapter dropped");
    }

    fn disconnect(&mut self) {
        self.close_all();
    }

    fn force_disconnect(&mut self) {
        self.close_all();
    }
}

impl AdapterSocket for SpeedAdapter {
    fn open(&mut self, session: &ConnectSession, sink: &EventSink, out: &mut Vec<SocketEvent>) {
        self.status.advance(SocketStatus::Connecting);
        self.session = Some(session.clone());
        self.sink = Some(sink.clone());

        for index in 0..self.racers.len() {
            let delay = self.delays[index];
            if delay.is_zero() {
                self.start(index, out);
            } else {
                let timer = sink.bind();
                self.racers[index].timer = Some(timer.id());
                timer.schedule(delay);
            }
            if self.status != SocketStatus::Connecting {
                return;
            }
        }
        if self.racers.is_empty() {
            self.check_exhausted(out);
        }
    }

    fn kind(&self) -> &'static str {
        "speed"
    }
}

/// Produces [`SpeedAdapter`]s
#[derive(Debug, Clone)]
pub struct SpeedAdapterFactory {
    id: String,
    candidates: Vec<SpeedCandidate>,
}

impl SpeedAdapterFactory {
    #[must_use]
    pub fn new(id: impl Into<String>, candidates: Vec<SpeedCandidate>) -> Self {
        Self {
            id: id.into(),
            candidates,
        }
    }

    #[must_use]
    pub fn candidates(&self) -> &[SpeedCandidate] {
        &self.candidates
    }
}

impl AdapterFactory for SpeedAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(SpeedAdapter::new(&self.candidates))
    }
}
