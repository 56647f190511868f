//! Outbound stream dialers
//!
//! A [`Dialer`] opens a ready-to-use byte stream to `host:port`. Plain TCP is
//! the base; TLS and Shadowsocks dialers wrap or replace it.

use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxedStream, TransportError};

/// Opens outbound streams
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Connect to `host:port`
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if resolution, connection or any protocol
    /// setup fails.
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError>;
}

/// TCP socket options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// Enable TCP keepalive probes
    pub keepalive: bool,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Routing mark (`SO_MARK`, Linux only)
    pub routing_mark: Option<u32>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            nodelay: true,
            routing_mark: None,
        }
    }
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer {
    options: TcpOptions,
}

impl TcpDialer {
    /// Create a dialer with `options`
    #[must_use]
    pub fn new(options: TcpOptions) -> Self {
        Self { options }
    }

    /// Socket options in use
    #[must_use]
    pub fn options(&self) -> TcpOptions {
        self.options
    }

    /// Connect a raw TCP stream, trying each resolved address in order
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Resolve` if `host` has no address, or the
    /// error of the last failed attempt.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| TransportError::Resolve { host: host.to_string() })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve { host: host.to_string() });
        }

        let mut last_error = None;
        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    debug!(%addr, keepalive = self.options.keepalive, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connection attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Resolve { host: host.to_string() }))
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let socket = self.create_socket(addr)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(TransportError::Io(e)),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        // Wait for the connection to complete, then check SO_ERROR
        stream.writable().await?;
        if let Some(e) = stream.take_error()? {
            return Err(TransportError::Io(e));
        }

        if self.options.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::socket_option("TCP_NODELAY", e.to_string()))?;
        }
        Ok(stream)
    }

    fn create_socket(&self, addr: SocketAddr) -> Result<Socket, TransportError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        if let Some(mark) = self.options.routing_mark {
            set_routing_mark(&socket, mark)?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::socket_option("O_NONBLOCK", e.to_string()))?;

        if self.options.keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(60))
                .with_interval(Duration::from_secs(15));

            #[cfg(target_os = "linux")]
            let keepalive = keepalive.with_retries(3);

            socket
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| TransportError::socket_option("TCP_KEEPALIVE", e.to_string()))?;
        }
        Ok(socket)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        let stream = self.connect_tcp(host, port).await?;
        Ok(Box::new(stream))
    }
}

/// Set `SO_MARK` for policy routing
fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), TransportError> {
    let fd = socket.as_raw_fd();

    // SAFETY: fd is a valid socket owned by `socket`, and the option value
    // points to a live u32 of the advertised length.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(TransportError::socket_option(
            "SO_MARK",
            format!("Failed to set routing mark {mark}: {err}"),
        ));
    }
    debug!("Set routing mark: {}", mark);
    Ok(())
}
