//! Shadowsocks adapter
//!
//! The Shadowsocks handshake is carried by the first encrypted write, so the
//! adapter is ready as soon as the proxy connection is up. The destination
//! host name is forwarded unresolved.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use shadowsocks::config::{ServerConfig, ServerType};
use shadowsocks::context::{Context as SsContext, SharedContext};
use shadowsocks::crypto::CipherKind;
use shadowsocks::relay::socks5::Address as SsAddress;
use shadowsocks::relay::tcprelay::ProxyClientStream;
use shadowsocks::ServerAddr;
use tracing::debug;

use super::direct::{DialTarget, StreamAdapter};
use super::{AdapterFactory, Outbound};
use crate::error::AdapterError;
use crate::session::ConnectSession;
use crate::socket::AdapterSocket;
use crate::transport::{BoxedStream, Dialer, TransportError};

/// Dials destinations through a Shadowsocks server
pub struct ShadowsocksDialer {
    context: SharedContext,
    server: ServerConfig,
}

impl ShadowsocksDialer {
    /// # Errors
    ///
    /// Returns `AdapterError::InvalidConfig` for an unknown cipher or a key
    /// the cipher rejects.
    pub fn new(id: &str, host: &str, port: u16, method: &str, password: &str) -> Result<Self, AdapterError> {
        let cipher = CipherKind::from_str(method)
            .map_err(|_| AdapterError::invalid_config(id, format!("unknown cipher '{method}'")))?;

        let address = match host.parse::<IpAddr>() {
            Ok(ip) => ServerAddr::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => ServerAddr::DomainName(host.to_string(), port),
        };
        let server = ServerConfig::new(address, password.to_string(), cipher)
            .map_err(|e| AdapterError::invalid_config(id, format!("invalid password: {e}")))?;

        Ok(Self {
            context: SsContext::new_shared(ServerType::Local),
            server,
        })
    }
}

impl fmt::Debug for ShadowsocksDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowsocksDialer")
            .field("server", &self.server.addr().to_string())
            .field("method", &self.server.method())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for ShadowsocksDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        let target = match host.parse::<IpAddr>() {
            Ok(ip) => SsAddress::SocketAddress(SocketAddr::new(ip, port)),
            Err(_) => SsAddress::DomainNameAddress(host.to_string(), port),
        };
        let stream = ProxyClientStream::connect(self.context.clone(), &self.server, target).await?;
        debug!(server = %self.server.addr(), host, port, "Shadowsocks stream connected");
        Ok(Box::new(stream))
    }
}

/// Produces Shadowsocks adapters for one server
#[derive(Debug, Clone)]
pub struct ShadowsocksAdapterFactory {
    id: String,
    outbound: Outbound,
}

impl ShadowsocksAdapterFactory {
    /// `outbound` must dial through a [`ShadowsocksDialer`]
    #[must_use]
    pub fn new(id: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    /// Build the dialer and factory from server settings
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::InvalidConfig` if the cipher or key is invalid.
    pub fn from_server(
        id: &str,
        host: &str,
        port: u16,
        method: &str,
        password: &str,
        connect_timeout: std::time::Duration,
    ) -> Result<Self, AdapterError> {
        let dialer = ShadowsocksDialer::new(id, host, port, method, password)?;
        Ok(Self::new(id, Outbound::new(Arc::new(dialer), connect_timeout)))
    }
}

impl AdapterFactory for ShadowsocksAdapterFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(StreamAdapter::new(
            "shadowsocks",
            self.outbound.transport(),
            DialTarget::HostName,
        ))
    }
}
