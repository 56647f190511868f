//! Recording transport for socket and tunnel tests

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::transport::{RawTransport, ReadKind, TransportError, TransportEvent, TransportSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect { host: String, port: u16 },
    Attach,
    Read(ReadKind),
    Write(Bytes),
    Disconnect,
    ForceDisconnect,
}

#[derive(Debug, Default)]
struct Shared {
    calls: Vec<Call>,
    sink: Option<TransportSink>,
}

/// Handle for inspecting a [`MockTransport`] after it moved into a socket
#[derive(Debug, Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Shared>>);

impl CallLog {
    /// Drain recorded calls
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut self.0.lock().calls)
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.0.lock().calls.contains(call)
    }

    pub fn last(&self) -> Option<Call> {
        self.0.lock().calls.last().cloned()
    }

    /// Writes in order
    pub fn writes(&self) -> Vec<Bytes> {
        self.0
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Id the socket bound this transport to
    pub fn id(&self) -> Option<u32> {
        self.0.lock().sink.as_ref().map(TransportSink::id)
    }

    /// Deliver an event as if the transport produced it
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.0.lock().sink.clone();
        sink.is_some_and(|s| s.send(event))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    log: CallLog,
    started: bool,
    refuse_start: bool,
}

impl MockTransport {
    pub fn new() -> (Self, CallLog) {
        let transport = Self::default();
        let log = transport.log.clone();
        (transport, log)
    }

    /// A transport whose `connect`/`attach` fails
    pub fn refusing() -> (Self, CallLog) {
        let (mut transport, log) = Self::new();
        transport.refuse_start = true;
        (transport, log)
    }

    fn record(&self, call: Call) {
        self.log.0.lock().calls.push(call);
    }

    fn start(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        if self.refuse_start {
            return Err(TransportError::WrongMode("start"));
        }
        self.started = true;
        self.log.0.lock().sink = Some(sink);
        Ok(())
    }
}

impl RawTransport for MockTransport {
    fn connect(&mut self, host: &str, port: u16, sink: TransportSink) -> Result<(), TransportError> {
        self.record(Call::Connect {
            host: host.to_string(),
            port,
        });
        self.start(sink)
    }

    fn attach(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        self.record(Call::Attach);
        self.start(sink)
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn read(&mut self, kind: ReadKind) {
        self.record(Call::Read(kind));
    }

    fn write(&mut self, data: Bytes) {
        self.record(Call::Write(data));
    }

    fn disconnect(&mut self) {
        self.record(Call::Disconnect);
    }

    fn force_disconnect(&mut self) {
        self.record(Call::ForceDisconnect);
    }
}
