//! Proxy TCP Listener
//!
//! Accepts local client connections and hands each one, wrapped in the
//! proxy socket of the listener's protocol, to the tunnel manager.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use super::{HttpProxySocket, Socks5ProxySocket};
use crate::connection::TunnelManager;
use crate::error::ConnectionError;
use crate::socket::ProxySocket;
use crate::transport::StreamTransport;

/// Listen backlog of proxy sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Protocol spoken on a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl ProxyKind {
    /// Proxy socket driving an accepted stream
    #[must_use]
    pub fn socket(self, stream: TcpStream) -> Box<dyn ProxySocket> {
        let transport = Box::new(StreamTransport::accepted(stream));
        match self {
            Self::Socks5 => Box::new(Socks5ProxySocket::new(transport)),
            Self::Http => Box::new(HttpProxySocket::new(transport)),
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => f.write_str("socks5"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// A bound proxy listener
#[derive(Debug)]
pub struct ProxyListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
    kind: ProxyKind,
    manager: Arc<TunnelManager>,
}

impl ProxyListener {
    /// Create and bind a listener on `addr`
    ///
    /// Port 0 picks a free port; see [`listen_addr`](Self::listen_addr).
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io` if the socket cannot be created or bound.
    pub fn bind(addr: SocketAddr, kind: ProxyKind, manager: Arc<TunnelManager>) -> Result<Self, ConnectionError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        let listen_addr = listener.local_addr()?;
        info!("{} proxy listener ready on {}", kind, listen_addr);

        Ok(Self {
            listener,
            listen_addr,
            kind,
            manager,
        })
    }

    /// The bound address
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    #[must_use]
    pub const fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Accept connections until `shutdown` fires or the manager shuts down
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Io` on an accept error that is not
    /// recoverable.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ConnectionError> {
        info!("Starting {} accept loop on {}", self.kind, self.listen_addr);

        loop {
            if self.manager.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, client)) => self.admit(stream, client),
                    Err(e) => {
                        let e = ConnectionError::from(e);
                        if !e.is_recoverable() {
                            return Err(e);
                        }
                        debug!("Recoverable accept error: {}", e);
                    }
                },
            }
        }

        info!("{} accept loop on {} stopped", self.kind, self.listen_addr);
        Ok(())
    }

    fn admit(&self, stream: TcpStream, client: SocketAddr) {
        trace!("Accepted {} connection from {}", self.kind, client);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", client, e);
        }
        if let Err(e) = self.manager.spawn_tunnel(self.kind.socket(stream), Some(client)) {
            debug!("Connection from {} not admitted: {}", client, e);
        }
    }
}
