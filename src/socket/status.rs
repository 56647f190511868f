//! Socket lifecycle status

use std::fmt;

/// Lifecycle of a proxy or adapter socket
///
/// Variants are ordered; a socket only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SocketStatus {
    /// Created, not opened
    #[default]
    Invalid,
    /// Transport opening or handshake running
    Connecting,
    /// Handshake complete, relaying
    Established,
    /// Graceful close requested
    Disconnecting,
    /// Gone; all further input is ignored
    Closed,
}

impl SocketStatus {
    /// Move to `next` if it is later in the lifecycle
    ///
    /// Returns whether the status changed.
    pub fn advance(&mut self, next: Self) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// Whether the socket is closing or closed
    #[must_use]
    pub fn is_terminating(self) -> bool {
        self >= Self::Disconnecting
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
