//! Raw transport layer
//!
//! A transport is one byte stream owned by one socket. Its operations are
//! fire-and-forget: every completion comes back later as a [`TransportEvent`]
//! tagged with the transport's id, delivered into the channel of the tunnel
//! that owns it. A tunnel therefore processes all of its I/O completions on a
//! single task, in order.
//!
//! # Architecture
//!
//! ```text
//!   Tunnel task  <── TunnelEvent{source, event} ──  EventSink (mpsc)
//!       │                                               ▲
//!       │ read(kind) / write(bytes) / disconnect()      │ TransportSink::send
//!       ▼                                               │
//!   StreamTransport ── commands ──> driver task ────────┘
//!                                      │
//!                                  BoxedStream (TCP, TLS, Shadowsocks, accepted)
//! ```
//!
//! # Rules
//!
//! - At most one outstanding read and one outstanding write.
//! - `disconnect()` is honored after queued writes drain.
//! - `force_disconnect()` is immediate and may discard data.
//! - Exactly one `Disconnected` event per started transport.

mod dialer;
mod stream;
mod tls;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::trace;

pub use crate::error::TransportError;
pub use dialer::{Dialer, TcpDialer, TcpOptions};
pub use stream::StreamTransport;
pub use tls::TlsDialer;

/// Identifies a transport (or a timer) within its tunnel
pub type TransportId = u32;

/// What a read should wait for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadKind {
    /// Whatever is available, at least one byte
    Any,
    /// Exactly this many bytes
    Exactly(usize),
    /// Everything up to and including `pattern`, failing beyond `max` bytes
    Until { pattern: Bytes, max: usize },
}

impl ReadKind {
    /// Read up to and including `pattern`
    #[must_use]
    pub fn until(pattern: &'static [u8], max: usize) -> Self {
        Self::Until {
            pattern: Bytes::from_static(pattern),
            max,
        }
    }
}

/// Completion reported by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is ready for reads and writes
    Connected,
    /// A read completed
    Read(Bytes),
    /// A write completed
    Wrote,
    /// The stream is gone; `error` is `None` for a clean close
    Disconnected { error: Option<String> },
    /// A timer scheduled through [`TransportSink::schedule`] fired
    Elapsed,
}

/// An event as seen by the tunnel
#[derive(Debug)]
pub struct TunnelEvent {
    pub source: TransportId,
    pub event: TransportEvent,
}

/// Producer side of a tunnel's event channel
///
/// Each [`bind`](Self::bind) hands out a sink with a fresh id.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TunnelEvent>,
    next_id: Arc<AtomicU32>,
}

impl EventSink {
    /// Create a sink and the receiver the tunnel polls
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            next_id: Arc::new(AtomicU32::new(1)),
        };
        (sink, rx)
    }

    /// Allocate a new id and a sink reporting under it
    #[must_use]
    pub fn bind(&self) -> TransportSink {
        TransportSink {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
        }
    }
}

/// Event producer bound to one id
#[derive(Clone)]
pub struct TransportSink {
    id: TransportId,
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

impl TransportSink {
    /// The id events are tagged with
    #[must_use]
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Deliver an event; returns false once the tunnel is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TunnelEvent {
                source: self.id,
                event,
            })
            .is_ok()
    }

    /// Deliver [`TransportEvent::Elapsed`] after `delay`
    pub fn schedule(&self, delay: Duration) {
        let sink = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !sink.send(TransportEvent::Elapsed) {
                trace!(id = sink.id, "Timer fired after tunnel closed");
            }
        });
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink").field("id", &self.id).finish()
    }
}

/// Any bidirectional async byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Operations a socket performs on its transport
///
/// Implemented by [`StreamTransport`]; tests substitute recording mocks.
pub trait RawTransport: Send + fmt::Debug {
    /// Dial `host:port`; `Connected` or `Disconnected` follows
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport was already started or does
    /// not dial.
    fn connect(&mut self, host: &str, port: u16, sink: TransportSink) -> Result<(), TransportError>;

    /// Start driving an already connected stream; `Connected` follows
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport was already started or has
    /// no stream to attach.
    fn attach(&mut self, sink: TransportSink) -> Result<(), TransportError>;

    /// Whether `connect` or `attach` succeeded
    fn is_started(&self) -> bool;

    /// Request one read
    fn read(&mut self, kind: ReadKind);

    /// Request one write
    fn write(&mut self, data: Bytes);

    /// Close after pending writes drain
    fn disconnect(&mut self);

    /// Close now
    fn force_disconnect(&mut self);
}

/// Boxed transport owned by a socket
pub type BoxedTransport = Box<dyn RawTransport>;
