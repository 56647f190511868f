//! Adapter module
//!
//! Adapters are the remote-facing half of a tunnel. A factory is built once
//! from configuration and produces a fresh [`AdapterSocket`] for every
//! session routed to it.
//!
//! # Adapter Types
//!
//! - `direct`: connect straight to the destination
//! - `http`: CONNECT through an upstream HTTP proxy, optionally over TLS
//! - `socks5`: CONNECT through an upstream SOCKS5 proxy
//! - `shadowsocks`: stream through a Shadowsocks server (feature `shadowsocks`)
//! - `speed`: race several adapters, keep the first one ready
//! - `reject`: close after a delay
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use policy_router::adapter::{AdapterFactory, DirectAdapterFactory, RejectAdapterFactory};
//! use policy_router::session::ConnectSession;
//!
//! let direct: Arc<dyn AdapterFactory> = Arc::new(DirectAdapterFactory::default());
//! let block: Arc<dyn AdapterFactory> = Arc::new(RejectAdapterFactory::new("block"));
//!
//! let session = ConnectSession::new("example.com", 443);
//! assert_eq!(direct.make_adapter(&session).kind(), "direct");
//! assert_eq!(block.make_adapter(&session).kind(), "reject");
//! ```

mod direct;
mod http;
mod registry;
mod reject;
#[cfg(feature = "shadowsocks")]
mod shadowsocks;
mod socks5;
mod speed;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::session::ConnectSession;
use crate::socket::AdapterSocket;
use crate::transport::{BoxedTransport, Dialer, StreamTransport, TcpDialer};

pub use direct::{DialTarget, DirectAdapterFactory, StreamAdapter, DIRECT_ADAPTER_ID};
pub use http::{HttpAdapter, HttpAdapterFactory};
pub use registry::{AdapterRegistry, REJECT_ADAPTER_ID};
pub use reject::{RejectAdapter, RejectAdapterFactory};
#[cfg(feature = "shadowsocks")]
pub use shadowsocks::{ShadowsocksAdapterFactory, ShadowsocksDialer};
pub use socks5::{Credentials, Socks5Adapter, Socks5AdapterFactory};
pub use speed::{SpeedAdapter, SpeedAdapterFactory, SpeedCandidate};

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces adapter sockets for sessions routed to one configured adapter
pub trait AdapterFactory: Send + Sync + fmt::Debug {
    /// Configured id
    fn id(&self) -> &str;

    /// Fresh, unopened adapter for `session`
    fn make_adapter(&self, session: &ConnectSession) -> Box<dyn AdapterSocket>;

    /// Whether sessions routed here connect without a proxy
    ///
    /// Rules answer DNS queries with the real address for direct adapters
    /// and with a fake one otherwise.
    fn is_direct(&self) -> bool {
        false
    }
}

/// How an adapter reaches its next hop
#[derive(Clone)]
pub struct Outbound {
    dialer: Arc<dyn Dialer>,
    connect_timeout: Duration,
}

impl Outbound {
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, connect_timeout: Duration) -> Self {
        Self {
            dialer,
            connect_timeout,
        }
    }

    /// Connect timeout applied to every dial
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// A fresh, unstarted transport dialing through this outbound
    #[must_use]
    pub fn transport(&self) -> BoxedTransport {
        Box::new(StreamTransport::dialing(Arc::clone(&self.dialer), self.connect_timeout))
    }
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new(Arc::new(TcpDialer::default()), DEFAULT_CONNECT_TIMEOUT)
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("dialer", &self.dialer)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
