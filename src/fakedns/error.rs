//! DNS interceptor error types

use std::io;

use thiserror::Error;

use super::pool::PoolError;

/// Errors raised by the DNS interceptor and its front ends
#[derive(Debug, Error)]
pub enum DnsError {
    /// Message bytes could not be decoded
    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    /// Message is well-formed but not a single-question query
    #[error("Unsupported DNS message: {0}")]
    Unsupported(&'static str),

    /// Response could not be encoded
    #[error("Failed to encode DNS message: {0}")]
    Encode(String),

    /// Fake address pool failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Upstream resolver send failure
    #[error("Upstream {upstream} send failed: {reason}")]
    Upstream { upstream: String, reason: String },

    /// Server task has stopped
    #[error("DNS server is not running")]
    ServerStopped,

    /// Socket I/O error
    #[error("DNS I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DnsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Malformed(_) | Self::Unsupported(_) | Self::Encode(_) => true,
            Self::Pool(PoolError::Exhausted) => true,
            Self::Pool(PoolError::EmptyRange { .. }) => false,
            Self::Upstream { .. } => true,
            Self::ServerStopped => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsError>;
