//! Fake-IP DNS
//!
//! Answers DNS queries with synthetic IPv4 addresses when the rules route a
//! domain through a proxy, so the domain can be recovered later from the
//! destination address of a connection.
//!
//! - [`AddressPool`]: allocation of fake addresses
//! - [`DnsInterceptor`]: the synchronous query/answer state machine
//! - [`DnsServer`] / [`DnsServerHandle`]: the task owning the interceptor
//! - [`DnsUdpListener`]: UDP front end; the packet front end lives in
//!   [`crate::ipstack`]
//! - [`UdpResolver`]: upstream forwarding
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use policy_router::fakedns::{DnsServer, DnsServerConfig, DnsUdpListener, UdpResolver};
//! use policy_router::rules::{NoGeoIp, RuleManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let rules = Arc::new(RuleManager::new(Vec::new(), true));
//! let (mut server, handle) = DnsServer::new(DnsServerConfig::default(), rules, Arc::new(NoGeoIp))?;
//!
//! let upstream = UdpResolver::connect("1.1.1.1:53".parse()?, server.answer_sender()).await?;
//! server.add_resolver(Arc::new(upstream));
//!
//! let listener = DnsUdpListener::bind("127.0.0.1:5353".parse()?, &mut server, handle.clone()).await?;
//! tokio::spawn(server.run());
//! tokio::spawn(listener.run());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod processor;
pub mod resolver;
pub mod server;
pub mod session;
mod udp_server;

pub use config::DnsServerConfig;
pub use error::{DnsError, DnsResult};
pub use interceptor::{DnsAction, DnsInterceptor, DnsStats, FakeBinding};
pub use pool::{AddressPool, PoolError, PoolRange};
pub use resolver::{UdpResolver, UpstreamResolver};
pub use server::{DnsServer, DnsServerHandle};
pub use session::{DnsClient, DnsSession, SessionReject};
pub use udp_server::DnsUdpListener;
