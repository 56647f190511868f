//! Local proxy front ends
//!
//! Each accepted client connection is wrapped in a proxy socket for its
//! protocol and handed to the [`TunnelManager`](crate::connection::TunnelManager).
//!
//! - [`Socks5ProxySocket`]: SOCKS5 CONNECT without authentication
//! - [`HttpProxySocket`]: HTTP CONNECT and plain forwarding requests
//! - [`ProxyListener`]: TCP accept loop for either protocol

mod http;
mod listener;
mod socks5;

pub use http::{parse_request, HttpProxySocket, ProxyRequest};
pub use listener::{ProxyKind, ProxyListener};
pub use socks5::Socks5ProxySocket;
