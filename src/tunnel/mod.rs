//! Tunnel
//!
//! A [`Tunnel`] owns one [`ProxySocket`] and, once the client's destination
//! is known, one [`AdapterSocket`]. Both sockets report through a single
//! event channel owned by the tunnel, so the whole connection runs on one
//! task without locks.
//!
//! # Lifecycle
//!
//! ```text
//!   proxy.open ──> ConnectRequested ──> SessionContext::create ──> match_connect
//!                                                                      │
//!   relay <── ready == 2 <── proxy ReadyForForward <── respond_to_ready <── adapter ReadyForForward
//! ```
//!
//! Relaying moves one buffer per direction at a time: a read completed on
//! one side is written to the other, and the next read on that side is
//! issued once the write completed. Data read before both sides are ready
//! is held and flushed first.
//!
//! A disconnect on either side closes the other one. The tunnel finishes
//! once both sockets are closed and returns a [`TunnelReport`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::rules::RuleManager;
use crate::session::{ConnectSession, EventSource, SessionContext, TerminationCause};
use crate::socket::{AdapterSocket, ProxySocket, SocketEvent, SocketStatus};
use crate::transport::{EventSink, TransportEvent, TunnelEvent};

/// Shared, read-only state every tunnel needs
#[derive(Debug)]
pub struct TunnelContext {
    pub rules: Arc<RuleManager>,
    pub sessions: SessionContext,
}

impl TunnelContext {
    #[must_use]
    pub fn new(rules: Arc<RuleManager>, sessions: SessionContext) -> Self {
        Self { rules, sessions }
    }
}

/// Close notification of a finished tunnel
#[derive(Debug, Clone)]
pub struct TunnelReport {
    pub id: u64,
    pub client: Option<SocketAddr>,
    /// Session built from the connect request, with its termination cause
    pub session: Option<ConnectSession>,
    /// Id of the adapter the session was routed to
    pub adapter: Option<String>,
    /// Index of the deciding rule; `None` for the direct fallback
    pub rule: Option<usize>,
    /// Bytes relayed client to remote
    pub bytes_up: u64,
    /// Bytes relayed remote to client
    pub bytes_down: u64,
    pub cause: TerminationCause,
    pub duration: Duration,
}

impl TunnelReport {
    /// Whether the tunnel ended on an error
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.cause.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Proxy,
    Adapter,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Self::Proxy => Self::Adapter,
            Self::Adapter => Self::Proxy,
        }
    }

    fn source(self) -> EventSource {
        match self {
            Self::Proxy => EventSource::Proxy,
            Self::Adapter => EventSource::Adapter,
        }
    }
}

enum Next {
    Event(Option<TunnelEvent>),
    Shutdown,
    Detach,
}

type WorkQueue = VecDeque<(Side, SocketEvent)>;

fn enqueue(queue: &mut WorkQueue, side: Side, events: Vec<SocketEvent>) {
    queue.extend(events.into_iter().map(|event| (side, event)));
}

/// One proxied connection
#[derive(Debug)]
pub struct Tunnel {
    id: u64,
    client: Option<SocketAddr>,
    ctx: Arc<TunnelContext>,
    proxy: Box<dyn ProxySocket>,
    adapter: Option<Box<dyn AdapterSocket>>,
    session: Option<ConnectSession>,
    adapter_id: Option<String>,
    rule: Option<usize>,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
    /// Events received while the session was being built
    deferred: VecDeque<TunnelEvent>,
    proxy_ready: bool,
    adapter_ready: bool,
    ready: u8,
    relaying: bool,
    held_up: BytesMut,
    held_down: BytesMut,
    bytes_up: u64,
    bytes_down: u64,
    cause: Option<TerminationCause>,
    shutdown: Option<broadcast::Receiver<()>>,
    opened_at: Instant,
}

impl Tunnel {
    /// Tunnel around an unopened proxy socket
    #[must_use]
    pub fn new(id: u64, client: Option<SocketAddr>, proxy: Box<dyn ProxySocket>, ctx: Arc<TunnelContext>) -> Self {
        let (sink, events) = EventSink::channel();
        Self {
            id,
            client,
            ctx,
            proxy,
            adapter: None,
            session: None,
            adapter_id: None,
            rule: None,
            sink,
            events,
            deferred: VecDeque::new(),
            proxy_ready: false,
            adapter_ready: false,
            ready: 0,
            relaying: false,
            held_up: BytesMut::new(),
            held_down: BytesMut::new(),
            bytes_up: 0,
            bytes_down: 0,
            cause: None,
            shutdown: None,
            opened_at: Instant::now(),
        }
    }

    /// Force both sides closed when `shutdown` fires
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Open the proxy socket and drive the tunnel until both sides closed
    pub async fn run(mut self) -> TunnelReport {
        let span = info_span!("tunnel", id = self.id, client = ?self.client);
        async move {
            self.drive().await;
            self.into_report()
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) {
        let mut out = Vec::new();
        self.proxy.open(&self.sink, &mut out);
        self.process(Side::Proxy, out).await;

        while !self.finished() {
            if let Some(event) = self.deferred.pop_front() {
                self.dispatch(event).await;
                continue;
            }
            let next = match self.shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    event = self.events.recv() => Next::Event(event),
                    signal = shutdown.recv() => match signal {
                        Err(RecvError::Closed) => Next::Detach,
                        _ => Next::Shutdown,
                    },
                },
                None => Next::Event(self.events.recv().await),
            };

            match next {
                Next::Event(Some(event)) => self.dispatch(event).await,
                Next::Event(None) => break,
                Next::Shutdown => self.shut_down(),
                Next::Detach => self.shutdown = None,
            }
        }
    }

    fn shut_down(&mut self) {
        self.shutdown = None;
        debug!("Shutdown requested");
        self.record(TerminationCause::failed(EventSource::Tunnel, "shutting down"));
        self.proxy.force_disconnect();
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.force_disconnect();
        }
    }

    fn finished(&self) -> bool {
        self.proxy.status() == SocketStatus::Closed
            && self.adapter.as_ref().map_or(true, |a| a.status() == SocketStatus::Closed)
    }

    async fn dispatch(&mut self, event: TunnelEvent) {
        let TunnelEvent { source, event } = event;
        let mut out = Vec::new();

        let side = if self.proxy.owns(source) {
            self.proxy.on_transport_event(source, event, &mut out);
            Side::Proxy
        } else if let Some(adapter) = self.adapter.as_mut().filter(|a| a.owns(source)) {
            adapter.on_transport_event(source, event, &mut out);
            Side::Adapter
        } else {
            trace!(source, ?event, "Event for unknown transport ignored");
            return;
        };

        self.process(side, out).await;
    }

    async fn process(&mut self, side: Side, events: Vec<SocketEvent>) {
        let mut queue = WorkQueue::new();
        enqueue(&mut queue, side, events);

        while let Some((side, event)) = queue.pop_front() {
            trace!(?side, ?event, "Socket event");
            match event {
                SocketEvent::ConnectRequested { host, port } => {
                    if side == Side::Proxy {
                        self.on_connect_request(&host, port, &mut queue).await;
                    } else {
                        warn!(host, port, "Connect request from adapter ignored");
                    }
                }
                SocketEvent::ReadyForForward => self.on_ready(side, &mut queue),
                SocketEvent::DidRead(data) => self.on_read(side, data),
                SocketEvent::DidWrite => {
                    if self.relaying {
                        self.read_side(side.other());
                    }
                }
                SocketEvent::DidDisconnect { error } => self.on_disconnect(side, error),
                SocketEvent::Replace(socket) => self.on_replace(side, socket),
            }
        }
    }

    async fn on_connect_request(&mut self, host: &str, port: u16, queue: &mut WorkQueue) {
        if self.session.is_some() || self.proxy.status().is_terminating() {
            debug!(host, port, "Connect request ignored");
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let create = ctx.sessions.create(host, port);
        tokio::pin!(create);

        // Resolution may take a while; keep watching for shutdown and the client leaving
        let result = loop {
            tokio::select! {
                result = &mut create => break result,
                Some(event) = self.events.recv() => {
                    let client_left = self.proxy.owns(event.source)
                        && matches!(event.event, TransportEvent::Disconnected { .. });
                    self.deferred.push_back(event);
                    if client_left {
                        debug!(host, port, "Client left while the session was being built");
                        return;
                    }
                }
                signal = shutdown_signal(self.shutdown.as_mut()) => {
                    if signal {
                        self.shut_down();
                        return;
                    }
                    self.shutdown = None;
                }
            }
        };

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                info!(host, port, error = %e, "Cannot build session, closing");
                self.record(TerminationCause::failed(EventSource::Tunnel, e.to_string()));
                self.proxy.force_disconnect();
                return;
            }
        };

        let matched = self.ctx.rules.match_connect(&session);
        let mut adapter = matched.factory.make_adapter(&session);
        info!(
            session = %session,
            adapter = matched.factory.id(),
            kind = adapter.kind(),
            rule = ?matched.rule,
            "Routing connection"
        );

        let mut out = Vec::new();
        adapter.open(&session, &self.sink, &mut out);

        self.adapter_id = Some(matched.factory.id().to_string());
        self.rule = matched.rule;
        self.session = Some(session);
        self.adapter = Some(adapter);
        enqueue(queue, Side::Adapter, out);
    }

    fn on_ready(&mut self, side: Side, queue: &mut WorkQueue) {
        let flag = match side {
            Side::Proxy => &mut self.proxy_ready,
            Side::Adapter => &mut self.adapter_ready,
        };
        if *flag {
            trace!(?side, "Duplicate ready ignored");
            return;
        }
        *flag = true;
        self.ready += 1;

        if side == Side::Adapter && !self.proxy.status().is_terminating() {
            let mut out = Vec::new();
            self.proxy.respond_to_ready(&mut out);
            enqueue(queue, Side::Proxy, out);
        }

        if self.ready == 2 && !self.relaying {
            self.start_relay();
        }
    }

    fn start_relay(&mut self) {
        debug!(
            held_up = self.held_up.len(),
            held_down = self.held_down.len(),
            "Relay started"
        );
        self.relaying = true;
        for side in [Side::Proxy, Side::Adapter] {
            let held = match side {
                Side::Proxy => &mut self.held_up,
                Side::Adapter => &mut self.held_down,
            };
            if held.is_empty() {
                self.read_side(side);
            } else {
                let data = held.split().freeze();
                self.forward(side, data);
            }
        }
    }

    fn on_read(&mut self, side: Side, data: Bytes) {
        if self.relaying {
            self.forward(side, data);
            return;
        }
        trace!(?side, len = data.len(), "Holding early data");
        match side {
            Side::Proxy => self.held_up.extend_from_slice(&data),
            Side::Adapter => self.held_down.extend_from_slice(&data),
        }
    }

    /// Write data read on `from` to the other side
    fn forward(&mut self, from: Side, data: Bytes) {
        let len = data.len() as u64;
        match from {
            Side::Proxy => self.bytes_up += len,
            Side::Adapter => self.bytes_down += len,
        }
        self.write_side(from.other(), data);
    }

    fn on_disconnect(&mut self, side: Side, error: Option<String>) {
        let source = side.source();
        match error {
            Some(error) => {
                debug!(side = %source, error, "Socket failed");
                self.record(TerminationCause::failed(source, error));
            }
            None => {
                debug!(side = %source, "Socket closed");
                self.record(TerminationCause::closed_by(source));
            }
        }

        match side.other() {
            Side::Proxy => self.proxy.disconnect(),
            Side::Adapter => {
                if let Some(adapter) = self.adapter.as_mut() {
                    if adapter.status() == SocketStatus::Established {
                        adapter.disconnect();
                    } else {
                        adapter.force_disconnect();
                    }
                }
            }
        }
    }

    fn on_replace(&mut self, side: Side, mut socket: Box<dyn AdapterSocket>) {
        if side != Side::Adapter {
            warn!(kind = socket.kind(), "Replacement from proxy side dropped");
            socket.force_disconnect();
            return;
        }
        if socket.status() != SocketStatus::Established {
            debug!(kind = socket.kind(), status = %socket.status(), "Replacement not established");
            socket.force_disconnect();
            self.record(TerminationCause::failed(
                EventSource::Adapter,
                "replacement adapter not established",
            ));
            self.proxy.disconnect();
            return;
        }
        debug!(kind = socket.kind(), "Adapter replaced");
        self.adapter = Some(socket);
    }

    fn read_side(&mut self, side: Side) {
        match side {
            Side::Proxy => self.proxy.read_data(),
            Side::Adapter => {
                if let Some(adapter) = self.adapter.as_mut() {
                    adapter.read_data();
                }
            }
        }
    }

    fn write_side(&mut self, side: Side, data: Bytes) {
        match side {
            Side::Proxy => self.proxy.write_data(data),
            Side::Adapter => match self.adapter.as_mut() {
                Some(adapter) => adapter.write_data(data),
                None => trace!(len = data.len(), "No adapter, data dropped"),
            },
        }
    }

    /// Keep the first cause
    fn record(&mut self, cause: TerminationCause) {
        if self.cause.is_none() {
            self.cause = Some(cause);
        }
    }

    fn into_report(mut self) -> TunnelReport {
        let cause = self
            .cause
            .take()
            .unwrap_or_else(|| TerminationCause::closed_by(EventSource::Tunnel));
        if let Some(session) = self.session.as_mut() {
            session.record_termination(cause.clone());
        }

        let duration = self.opened_at.elapsed();
        info!(
            up = self.bytes_up,
            down = self.bytes_down,
            source = %cause.source,
            error = cause.error.as_deref().unwrap_or("-"),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Tunnel closed"
        );

        TunnelReport {
            id: self.id,
            client: self.client,
            session: self.session,
            adapter: self.adapter_id,
            rule: self.rule,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            cause,
            duration,
        }
    }
}

/// Resolves `true` once shutdown is requested, `false` if the sender is gone
async fn shutdown_signal(shutdown: Option<&mut broadcast::Receiver<()>>) -> bool {
    match shutdown {
        Some(rx) => !matches!(rx.recv().await, Err(RecvError::Closed)),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::adapter::{AdapterFactory, DialTarget, StreamAdapter};
    use crate::fakedns::{DnsServer, DnsServerConfig};
    use crate::proxy::HttpProxySocket;
    use crate::rules::NoGeoIp;
    use crate::session::HostResolver;
    use crate::socket::mock::{Call, CallLog, MockTransport};
    use crate::transport::{ReadKind, TransportEvent};

    // ==========================================================================
    // Helpers
    // ==========================================================================

    const CONNECT: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
    const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

    #[derive(Debug, Default)]
    struct MockFactory {
        logs: Mutex<Vec<CallLog>>,
    }

    impl MockFactory {
        fn adapter_log(&self) -> Option<CallLog> {
            self.logs.lock().first().cloned()
        }
    }

    impl AdapterFactory for MockFactory {
        fn id(&self) -> &str {
            "mock"
        }

        fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
            let (transport, log) = MockTransport::new();
            self.logs.lock().push(log);
            Box::new(StreamAdapter::new("mock", Box::new(transport), DialTarget::Resolved))
        }
    }

    /// Resolver that never answers
    #[derive(Debug)]
    struct StalledResolver;

    #[async_trait::async_trait]
    impl HostResolver for StalledResolver {
        async fn resolve(&self, _host: &str) -> Option<std::net::IpAddr> {
            std::future::pending().await
        }
    }

    fn context(factory: &Arc<MockFactory>, sessions: SessionContext) -> Arc<TunnelContext> {
        let fallback: Arc<dyn AdapterFactory> = Arc::clone(factory) as Arc<dyn AdapterFactory>;
        let rules = Arc::new(RuleManager::with_fallback(Vec::new(), false, fallback));
        Arc::new(TunnelContext::new(rules, sessions))
    }

    struct Harness {
        proxy: CallLog,
        factory: Arc<MockFactory>,
        handle: JoinHandle<TunnelReport>,
    }

    fn start(sessions: SessionContext, shutdown: Option<broadcast::Receiver<()>>) -> Harness {
        let factory = Arc::new(MockFactory::default());
        let ctx = context(&factory, sessions);
        let (transport, proxy) = MockTransport::new();
        let socket = Box::new(HttpProxySocket::new(Box::new(transport)));
        let mut tunnel = Tunnel::new(7, Some("127.0.0.1:50000".parse().unwrap()), socket, ctx);
        if let Some(rx) = shutdown {
            tunnel = tunnel.with_shutdown(rx);
        }
        let handle = tokio::spawn(tunnel.run());
        Harness { proxy, factory, handle }
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    /// Drive the HTTP handshake until the adapter was opened
    async fn connect(h: &Harness) -> CallLog {
        wait_for("proxy attach", || h.proxy.contains(&Call::Attach)).await;
        assert!(h.proxy.emit(TransportEvent::Connected));
        assert!(h.proxy.emit(TransportEvent::Read(Bytes::from_static(CONNECT))));
        wait_for("adapter", || h.factory.adapter_log().is_some()).await;
        let adapter = h.factory.adapter_log().unwrap();
        wait_for("adapter connect", || adapter.id().is_some()).await;
        adapter
    }

    // ==========================================================================
    // Relay
    // ==========================================================================

    #[tokio::test]
    async fn test_relay_waits_for_both_sides() {
        let h = start(SessionContext::new(Arc::new(NoGeoIp)), None);
        let adapter = connect(&h).await;
        assert!(adapter.contains(&Call::Connect {
            host: "example.com".into(),
            port: 443
        }));

        // Early adapter data is held while neither side is ready
        assert!(adapter.emit(TransportEvent::Read(Bytes::from_static(b"early"))));
        settle().await;
        assert!(h.proxy.writes().is_empty());

        // Adapter ready: proxy replies, relay still waits for the proxy
        assert!(adapter.emit(TransportEvent::Connected));
        wait_for("reply", || !h.proxy.writes().is_empty()).await;
        assert_eq!(h.proxy.writes(), vec![Bytes::from_static(ESTABLISHED)]);
        assert!(!adapter.contains(&Call::Read(ReadKind::Any)));
        assert!(!h.proxy.contains(&Call::Read(ReadKind::Any)));

        // Reply written: relay starts and flushes the held data first
        assert!(h.proxy.emit(TransportEvent::Wrote));
        wait_for("flush", || h.proxy.writes().len() == 2).await;
        assert_eq!(h.proxy.writes()[1], Bytes::from_static(b"early"));
        assert!(h.proxy.contains(&Call::Read(ReadKind::Any)));
        assert!(!adapter.contains(&Call::Read(ReadKind::Any)));

        // Steady state
        assert!(h.proxy.emit(TransportEvent::Read(Bytes::from_static(b"ping"))));
        wait_for("upstream write", || !adapter.writes().is_empty()).await;
        assert_eq!(adapter.writes(), vec![Bytes::from_static(b"ping")]);

        assert!(h.proxy.emit(TransportEvent::Wrote));
        wait_for("adapter read", || adapter.contains(&Call::Read(ReadKind::Any))).await;

        // Teardown from the client side
        assert!(h.proxy.emit(TransportEvent::Disconnected { error: None }));
        wait_for("adapter disconnect", || adapter.contains(&Call::Disconnect)).await;
        assert!(!adapter.contains(&Call::ForceDisconnect));
        settle().await;
        assert!(!h.handle.is_finished());

        assert!(adapter.emit(TransportEvent::Disconnected { error: None }));
        let report = h.handle.await.unwrap();
        assert_eq!(report.id, 7);
        assert_eq!(report.adapter.as_deref(), Some("mock"));
        assert_eq!(report.rule, None);
        assert_eq!(report.bytes_up, 4);
        assert_eq!(report.bytes_down, 5);
        assert_eq!(report.cause, TerminationCause::closed_by(EventSource::Proxy));
        assert!(!report.is_error());

        let session = report.session.unwrap();
        assert_eq!(session.host(), "example.com");
        assert_eq!(session.termination(), Some(&report.cause));
    }

    // ==========================================================================
    // Failures
    // ==========================================================================

    #[tokio::test]
    async fn test_adapter_failure_closes_proxy() {
        let h = start(SessionContext::new(Arc::new(NoGeoIp)), None);
        let adapter = connect(&h).await;

        assert!(adapter.emit(TransportEvent::Disconnected {
            error: Some("connection refused".into())
        }));
        wait_for("proxy disconnect", || h.proxy.contains(&Call::Disconnect)).await;
        assert!(h.proxy.writes().is_empty());

        assert!(h.proxy.emit(TransportEvent::Disconnected { error: None }));
        let report = h.handle.await.unwrap();
        assert!(report.is_error());
        assert_eq!(
            report.cause,
            TerminationCause::failed(EventSource::Adapter, "connection refused")
        );
        assert_eq!(report.bytes_up + report.bytes_down, 0);
    }

    #[tokio::test]
    async fn test_stale_fake_ip_closes_proxy() {
        let rules = Arc::new(RuleManager::new(Vec::new(), true));
        let (server, dns) = DnsServer::new(DnsServerConfig::default(), rules, Arc::new(NoGeoIp)).unwrap();
        tokio::spawn(server.run());

        let h = start(SessionContext::new(Arc::new(NoGeoIp)).with_dns(dns.clone()), None);
        wait_for("proxy attach", || h.proxy.contains(&Call::Attach)).await;
        assert!(h.proxy.emit(TransportEvent::Connected));
        assert!(h.proxy.emit(TransportEvent::Read(Bytes::from_static(
            b"CONNECT 198.18.0.9:443 HTTP/1.1\r\n\r\n"
        ))));

        let report = h.handle.await.unwrap();
        assert!(h.proxy.contains(&Call::ForceDisconnect));
        assert!(h.factory.adapter_log().is_none());
        assert!(report.session.is_none());
        assert_eq!(report.cause.source, EventSource::Tunnel);
        assert!(report.cause.error.unwrap().contains("198.18.0.9"));
        dns.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_forces_both_sides() {
        let (tx, rx) = broadcast::channel(1);
        let h = start(SessionContext::new(Arc::new(NoGeoIp)), Some(rx));
        let adapter = connect(&h).await;

        tx.send(()).unwrap();
        let report = h.handle.await.unwrap();
        assert!(h.proxy.contains(&Call::ForceDisconnect));
        assert!(adapter.contains(&Call::ForceDisconnect));
        assert_eq!(
            report.cause,
            TerminationCause::failed(EventSource::Tunnel, "shutting down")
        );
    }

    /// Send the CONNECT head while the resolver is stalled
    async fn request_unresolvable(h: &Harness) {
        wait_for("proxy attach", || h.proxy.contains(&Call::Attach)).await;
        assert!(h.proxy.emit(TransportEvent::Connected));
        assert!(h.proxy.emit(TransportEvent::Read(Bytes::from_static(CONNECT))));
        settle().await;
        assert!(h.factory.adapter_log().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_during_resolution() {
        let (tx, rx) = broadcast::channel(1);
        let sessions = SessionContext::new(Arc::new(NoGeoIp)).with_resolver(Arc::new(StalledResolver));
        let h = start(sessions, Some(rx));
        request_unresolvable(&h).await;

        tx.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), h.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(h.proxy.contains(&Call::ForceDisconnect));
        assert!(h.factory.adapter_log().is_none());
        assert!(report.session.is_none());
        assert_eq!(
            report.cause,
            TerminationCause::failed(EventSource::Tunnel, "shutting down")
        );
    }

    #[tokio::test]
    async fn test_client_leaving_during_resolution() {
        let sessions = SessionContext::new(Arc::new(NoGeoIp)).with_resolver(Arc::new(StalledResolver));
        let h = start(sessions, None);
        request_unresolvable(&h).await;

        assert!(h.proxy.emit(TransportEvent::Disconnected { error: None }));
        let report = tokio::time::timeout(Duration::from_secs(2), h.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(h.factory.adapter_log().is_none());
        assert!(report.session.is_none());
        assert_eq!(report.cause, TerminationCause::closed_by(EventSource::Proxy));
    }
}
