//! Direct UDP forwarding for the virtual interface
//!
//! Every (source, destination) flow gets its own connected UDP socket. A
//! destination inside the fake range is rewritten to the address of the
//! domain it was handed out for. Replies are wrapped into packets from the
//! original destination back to the source, so the client never sees the
//! rewrite. Idle flows are closed by a periodic sweep.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace};

use super::packet::{build_udp_packet, UdpDatagram};
use crate::fakedns::DnsServerHandle;
use crate::session::HostResolver;

/// Default idle lifetime of a flow
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const RECV_BUFFER_SIZE: usize = 65_535;

/// Flow key: client address and the destination it addressed
type FlowKey = (SocketAddrV4, SocketAddrV4);

#[derive(Debug)]
struct Flow {
    socket: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    reader: AbortHandle,
}

impl Flow {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// UDP forwarder keyed by flow
#[derive(Debug)]
pub struct UdpDirectStack {
    flows: DashMap<FlowKey, Flow>,
    output: mpsc::Sender<bytes::Bytes>,
    dns: Option<DnsServerHandle>,
    resolver: Option<Arc<dyn HostResolver>>,
    idle_timeout: Duration,
}

impl UdpDirectStack {
    /// Forwarder writing reply packets to `output`
    #[must_use]
    pub fn new(output: mpsc::Sender<bytes::Bytes>) -> Self {
        Self {
            flows: DashMap::new(),
            output,
            dns: None,
            resolver: None,
            idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    /// Rewrite fake destinations through `dns`
    #[must_use]
    pub fn with_dns(mut self, dns: DnsServerHandle) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Resolve domains of fake destinations without a known real address
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of open flows
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Forward one datagram, opening its flow if needed
    ///
    /// Datagrams whose destination cannot be resolved are dropped.
    pub async fn send(&self, datagram: UdpDatagram) {
        let key = (datagram.source, datagram.destination);

        if let Some(flow) = self.flows.get(&key) {
            flow.touch();
            let socket = Arc::clone(&flow.socket);
            // Never hold a map guard across an await
            drop(flow);
            if let Err(e) = socket.send(&datagram.payload).await {
                debug!(src = %key.0, dst = %key.1, error = %e, "UDP send failed");
            }
            return;
        }

        let Some(remote) = self.resolve_destination(datagram.destination).await else {
            return;
        };

        let socket = match open_socket(remote).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                debug!(%remote, error = %e, "Failed to open UDP flow");
                return;
            }
        };
        if let Err(e) = socket.send(&datagram.payload).await {
            debug!(%remote, error = %e, "UDP send failed");
            return;
        }

        let last_active = Arc::new(Mutex::new(Instant::now()));
        let reader = tokio::spawn(relay_replies(
            Arc::clone(&socket),
            key,
            Arc::clone(&last_active),
            self.output.clone(),
        ))
        .abort_handle();

        debug!(src = %key.0, dst = %key.1, %remote, "UDP flow opened");
        self.flows.insert(
            key,
            Flow {
                socket,
                last_active,
                reader,
            },
        );
    }

    async fn resolve_destination(&self, destination: SocketAddrV4) -> Option<SocketAddr> {
        let port = destination.port();
        let Some(dns) = self.dns.as_ref().filter(|dns| dns.is_fake_ip(*destination.ip())) else {
            return Some(SocketAddr::V4(destination));
        };

        let binding = match dns.lookup_fake_ip(*destination.ip()).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                debug!(%destination, "Stale fake destination, dropping datagram");
                return None;
            }
            Err(e) => {
                debug!(%destination, error = %e, "Fake lookup failed");
                return None;
            }
        };

        if let Some(ip) = binding.real_ip {
            return Some(SocketAddr::new(IpAddr::V4(ip), port));
        }
        let Some(resolver) = self.resolver.as_ref() else {
            debug!(domain = %binding.domain, "No resolver for fake destination");
            return None;
        };
        match resolver.resolve(&binding.domain).await {
            Some(ip) => Some(SocketAddr::new(ip, port)),
            None => {
                debug!(domain = %binding.domain, "Fake destination did not resolve");
                None
            }
        }
    }

    /// Close flows idle longer than the idle timeout; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.idle_for(now) < self.idle_timeout);
        let removed = before.saturating_sub(self.flows.len());
        if removed > 0 {
            debug!(removed, remaining = self.flows.len(), "Swept idle UDP flows");
        }
        removed
    }

    /// Sweep every `interval` until `shutdown` fires, then close all flows
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => break,
            }
        }
        info!(flows = self.flows.len(), "UDP direct stack stopped");
        self.flows.clear();
    }
}

async fn open_socket(remote: SocketAddr) -> std::io::Result<UdpSocket> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

/// Wrap every reply into a packet from the original destination
async fn relay_replies(
    socket: Arc<UdpSocket>,
    (client, destination): FlowKey,
    last_active: Arc<Mutex<Instant>>,
    output: mpsc::Sender<bytes::Bytes>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                debug!(%client, %destination, error = %e, "UDP flow receive failed");
                return;
            }
        };
        *last_active.lock() = Instant::now();
        let packet = build_udp_packet(destination, client, &buf[..len]);
        if output.send(packet).await.is_err() {
            trace!("Packet output closed, stopping UDP flow");
            return;
        }
    }
}
