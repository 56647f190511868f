//! Inbound packet dispatch
//!
//! Routes IPv4 packets read from the virtual interface:
//!
//! - UDP addressed to the DNS intercept address goes to the DNS server
//! - any other UDP goes to the [`UdpDirectStack`]
//! - everything else is dropped (TCP belongs to an external stack)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::packet::{PacketParser, IPPROTO_UDP};
use super::udp_direct::UdpDirectStack;
use crate::fakedns::{DnsClient, DnsServerHandle};

/// Where a packet went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Dns,
    Udp,
    Dropped,
}

/// Dispatch counters
#[derive(Debug, Default)]
struct Counters {
    dns: AtomicU64,
    udp: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dns: u64,
    pub udp: u64,
    pub dropped: u64,
}

/// Routes virtual-interface packets to their handlers
#[derive(Debug, Default)]
pub struct PacketDispatcher {
    dns: Option<DnsServerHandle>,
    udp: Option<Arc<UdpDirectStack>>,
    counters: Counters,
}

impl PacketDispatcher {
    /// Dispatcher dropping everything until handlers are attached
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand UDP packets addressed to the server's intercept address to it
    ///
    /// A server configured without an intercept address receives nothing.
    #[must_use]
    pub fn with_dns(mut self, dns: DnsServerHandle) -> Self {
        if dns.intercept_addr().is_none() {
            warn!("DNS server has no intercept address, packet queries will not be intercepted");
        }
        self.dns = Some(dns);
        self
    }

    /// Forward other UDP packets through `stack`
    #[must_use]
    pub fn with_udp(mut self, stack: Arc<UdpDirectStack>) -> Self {
        self.udp = Some(stack);
        self
    }

    /// Route one packet
    pub async fn dispatch(&self, packet: &[u8]) -> Dispatch {
        let outcome = self.route(packet).await;
        let counter = match outcome {
            Dispatch::Dns => &self.counters.dns,
            Dispatch::Udp => &self.counters.udp,
            Dispatch::Dropped => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn route(&self, packet: &[u8]) -> Dispatch {
        let protocol = PacketParser::peek_transport_protocol(packet);
        if protocol != Some(IPPROTO_UDP) {
            trace!(?protocol, len = packet.len(), "Non-UDP packet dropped");
            return Dispatch::Dropped;
        }

        let datagram = match PacketParser::parse_udp(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                trace!(error = %e, "Unparseable UDP packet dropped");
                return Dispatch::Dropped;
            }
        };

        if let Some(dns) = &self.dns {
            if dns.intercept_addr() == Some(datagram.destination) {
                let client = DnsClient::Packet {
                    client: datagram.source,
                    server: datagram.destination,
                };
                if let Err(e) = dns.submit_query(datagram.payload, client).await {
                    debug!(error = %e, "DNS server unavailable, query dropped");
                    return Dispatch::Dropped;
                }
                return Dispatch::Dns;
            }
        }

        match &self.udp {
            Some(stack) => {
                stack.send(datagram).await;
                Dispatch::Udp
            }
            None => {
                trace!(dst = %datagram.destination, "No UDP handler, packet dropped");
                Dispatch::Dropped
            }
        }
    }

    /// Dispatch packets from `input` until it closes
    pub async fn run(self, mut input: mpsc::Receiver<Bytes>) {
        info!(dns = self.dns.is_some(), udp = self.udp.is_some(), "Packet dispatcher started");
        while let Some(packet) = input.recv().await {
            self.dispatch(&packet).await;
        }
        let stats = self.stats();
        info!(
            dns = stats.dns,
            udp = stats.udp,
            dropped = stats.dropped,
            "Packet dispatcher stopped"
        );
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dns: self.counters.dns.load(Ordering::Relaxed),
            udp: self.counters.udp.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
