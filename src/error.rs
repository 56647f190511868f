//! Error types for policy-router
//!
//! This module defines the error hierarchy for the proxy. Errors are grouped by
//! subsystem and carry recovery hints. Transport errors never escape a tunnel:
//! they are turned into disconnect events and an orderly teardown.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::fakedns::DnsError;

/// Top-level error type for policy-router
#[derive(Debug, Error)]
pub enum PolicyRouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule construction errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Adapter construction errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Raw transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// DNS interception errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Listener and admission errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PolicyRouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Rule(_) | Self::Adapter(_) => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Connection(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// A rule or speed adapter references an adapter id that is not defined
    #[error("Unknown adapter id: {id}")]
    UnknownAdapter { id: String },

    /// Two adapters share the same id
    #[error("Duplicate adapter id: {id}")]
    DuplicateAdapter { id: String },

    /// A rule entry could not be compiled
    #[error("Invalid rule #{index}: {source}")]
    InvalidRule {
        index: usize,
        #[source]
        source: RuleError,
    },

    /// An adapter entry could not be built
    #[error("Invalid adapter: {0}")]
    Adapter(#[from] AdapterError),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create an unknown adapter error
    pub fn unknown_adapter(id: impl Into<String>) -> Self {
        Self::UnknownAdapter { id: id.into() }
    }
}

/// Errors raised while compiling rules and their matchers
#[derive(Debug, Error)]
pub enum RuleError {
    /// Regular expression failed to compile
    #[error("Invalid regex pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    /// CIDR string failed to parse
    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// Country code is not a two-letter ISO code
    #[error("Invalid country code '{0}'")]
    InvalidCountryCode(String),

    /// Aho-Corasick automaton build failure
    #[error("Failed to build matcher: {0}")]
    MatcherBuild(String),

    /// GeoIP data could not be loaded
    #[error("Failed to load GeoIP data from {path}: {reason}")]
    GeoIpLoad { path: String, reason: String },

    /// Rule has no criteria or ranges
    #[error("Rule has no entries")]
    Empty,
}

impl RuleError {
    /// Create an invalid regex error
    pub fn invalid_regex(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRegex {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Adapter construction errors
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter type compiled out or unknown
    #[error("Adapter type '{kind}' is not supported by this build")]
    Unsupported { kind: String },

    /// Adapter configuration rejected by its backend
    #[error("Invalid configuration for adapter '{id}': {reason}")]
    InvalidConfig { id: String, reason: String },

    /// Speed adapter candidates must be plain adapters
    #[error("Speed adapter '{id}' cannot race another speed adapter '{candidate}'")]
    NestedSpeed { id: String, candidate: String },
}

impl AdapterError {
    /// Create an invalid configuration error
    pub fn invalid_config(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Raw transport errors
///
/// These are reported through `Disconnected` events rather than returned to
/// the tunnel, except for precondition violations on `connect`/`attach`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `connect` or `attach` called twice
    #[error("Transport already started")]
    AlreadyStarted,

    /// `connect` called on a transport wrapping an accepted stream (or vice versa)
    #[error("Transport cannot {0}")]
    WrongMode(&'static str),

    /// Connect did not finish in time
    #[error("Connection to {target} timed out after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },

    /// Host name did not resolve to any address
    #[error("Failed to resolve {host}")]
    Resolve { host: String },

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Read-until pattern not found within the allowed length
    #[error("Delimiter not found within {max} bytes")]
    DelimiterNotFound { max: usize },

    /// Socket option failure (`SO_MARK`, keepalive)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AlreadyStarted | Self::WrongMode(_) | Self::SocketOption { .. } => false,
            Self::Timeout { .. } | Self::Resolve { .. } => true,
            Self::Tls(_) | Self::DelimiterNotFound { .. } => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Errors building a [`ConnectSession`](crate::session::ConnectSession)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Destination is inside the fake range but no binding exists
    #[error("No fake-IP binding for {0} (expired or never allocated)")]
    StaleFakeIp(Ipv4Addr),

    /// DNS server task is gone
    #[error("DNS server unavailable")]
    DnsUnavailable,
}

/// Listener and tunnel admission errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Admission cap reached
    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },

    /// Shutdown in progress
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Listener I/O error
    #[error("Listener I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LimitReached { .. } => true,
            Self::ShuttingDown => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a limit reached error
    #[must_use]
    pub const fn limit_reached(current: usize, max: usize) -> Self {
        Self::LimitReached { current, max }
    }
}

/// Type alias for Result with `PolicyRouterError`
pub type Result<T> = std::result::Result<T, PolicyRouterError>;
