//! DNS UDP listener
//!
//! Receives client queries on a UDP socket and submits them to the server
//! task. Replies go out through the same socket, sent by the server task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, info, trace};

use super::resolver::MAX_UDP_MESSAGE;
use super::server::{DnsServer, DnsServerHandle};
use super::session::DnsClient;

/// UDP front end of the DNS server
#[derive(Debug)]
pub struct DnsUdpListener {
    socket: Arc<UdpSocket>,
    handle: DnsServerHandle,
}

impl DnsUdpListener {
    /// Bind `addr` and attach the socket to `server` for replies
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, server: &mut DnsServer, handle: DnsServerHandle) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        server.set_udp_socket(Arc::clone(&socket));
        Ok(Self { socket, handle })
    }

    /// Local address of the listener
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive queries until the server stops
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("DNS UDP listener on {}", addr);
        }
        let mut buffer = vec![0u8; MAX_UDP_MESSAGE];

        loop {
            let (n, peer) = match self.socket.recv_from(&mut buffer).await {
                Ok(r) => r,
                Err(err) => {
                    error!("DNS UDP recv error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            trace!(len = n, %peer, "DNS query datagram");

            let bytes = Bytes::copy_from_slice(&buffer[..n]);
            if self.handle.submit_query(bytes, DnsClient::Udp(peer)).await.is_err() {
                debug!("DNS server stopped, closing UDP listener");
                break;
            }
        }
    }
}
