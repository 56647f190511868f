//! Upstream DNS resolvers
//!
//! Forwarded queries are sent to every registered resolver. Answers flow back
//! into the server task through a channel, so racing resolvers need no
//! coordination: the interceptor keeps the first answer per transaction id
//! and ignores the rest.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::error::{DnsError, DnsResult};

/// Maximum DNS message size accepted over UDP
pub const MAX_UDP_MESSAGE: usize = 65535;

/// A resolver queries can be forwarded to
#[async_trait]
pub trait UpstreamResolver: Send + Sync + fmt::Debug {
    /// Human-readable name for logs
    fn tag(&self) -> &str;

    /// Send a query in wire format
    ///
    /// Answers are delivered asynchronously through the channel given at
    /// construction.
    async fn send(&self, query: &[u8]) -> DnsResult<()>;
}

/// Plain UDP upstream
///
/// Owns a connected socket and a receive task that feeds every datagram
/// into the answer channel. The task stops when the resolver is dropped.
#[derive(Debug)]
pub struct UdpResolver {
    tag: String,
    socket: std::sync::Arc<UdpSocket>,
    shutdown_tx: broadcast::Sender<()>,
}

impl UdpResolver {
    /// Connect to `upstream`, delivering answers into `answers`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Io` if the socket cannot be bound or connected.
    pub async fn connect(upstream: SocketAddr, answers: mpsc::Sender<Bytes>) -> DnsResult<Self> {
        let bind: SocketAddr = if upstream.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(upstream).await?;
        let socket = std::sync::Arc::new(socket);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let tag = format!("udp://{upstream}");
        tokio::spawn(recv_loop(
            tag.clone(),
            std::sync::Arc::clone(&socket),
            answers,
            shutdown_rx,
        ));

        debug!(upstream = %tag, "Upstream resolver ready");
        Ok(Self {
            tag,
            socket,
            shutdown_tx,
        })
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for UdpResolver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[async_trait]
impl UpstreamResolver for UdpResolver {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn send(&self, query: &[u8]) -> DnsResult<()> {
        self.socket
            .send(query)
            .await
            .map(|_| ())
            .map_err(|e| DnsError::upstream(&self.tag, e.to_string()))
    }
}

async fn recv_loop(
    tag: String,
    socket: std::sync::Arc<UdpSocket>,
    answers: mpsc::Sender<Bytes>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => {
                    trace!(upstream = %tag, len = n, "Upstream answer received");
                    if answers.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                // ICMP port unreachable surfaces here on connected sockets
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!(upstream = %tag, "Upstream refused query");
                }
                Err(e) => {
                    warn!(upstream = %tag, error = %e, "Upstream receive failed");
                    break;
                }
            }
        }
    }
    trace!(upstream = %tag, "Upstream receive loop stopped");
}
