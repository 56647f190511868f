//! Virtual-interface UDP path
//!
//! Packets read from a TUN device enter through the [`PacketDispatcher`].
//! DNS queries to the intercept address are answered by the fake-IP DNS
//! server; other UDP is forwarded by the [`UdpDirectStack`]. Both write
//! synthesized reply packets to the same output channel.
//!
//! ```text
//!   TUN ──> PacketDispatcher ──┬──> DnsServerHandle::submit_query ──┐
//!                              └──> UdpDirectStack::send ───────────┤
//!   TUN <───────────────────────── reply packets (mpsc<Bytes>) <────┘
//! ```

mod dispatcher;
pub mod packet;
mod udp_direct;

pub use dispatcher::{Dispatch, DispatchStats, PacketDispatcher};
pub use packet::{build_udp_packet, PacketError, PacketParser, UdpDatagram};
pub use udp_direct::{UdpDirectStack, DEFAULT_UDP_IDLE_TIMEOUT};
