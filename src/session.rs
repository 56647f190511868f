//! Connect sessions
//!
//! A [`ConnectSession`] describes one outbound attempt: where the client
//! asked to go, where we will actually dial, and what the rule engine needs
//! to know about it. Sessions are built by [`SessionContext::create`] once a
//! proxy handshake completes and are never changed afterwards, except for the
//! write-once termination cause recorded at teardown.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::SessionError;
use crate::fakedns::DnsServerHandle;
use crate::rules::GeoIpLookup;

/// Which party ended a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Proxy,
    Adapter,
    Tunnel,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxy => f.write_str("proxy"),
            Self::Adapter => f.write_str("adapter"),
            Self::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// Why a tunnel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCause {
    pub source: EventSource,
    /// Error text, `None` for a clean close
    pub error: Option<String>,
}

impl TerminationCause {
    /// Clean close initiated by `source`
    #[must_use]
    pub fn closed_by(source: EventSource) -> Self {
        Self { source, error: None }
    }

    /// Failure reported by `source`
    #[must_use]
    pub fn failed(source: EventSource, error: impl Into<String>) -> Self {
        Self {
            source,
            error: Some(error.into()),
        }
    }
}

/// One outbound attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSession {
    requested_host: String,
    host: String,
    port: u16,
    ip: Option<IpAddr>,
    fake_ip_rewritten: bool,
    matched_rule: Option<usize>,
    country: Option<String>,
    termination: Option<TerminationCause>,
}

impl ConnectSession {
    /// Session dialing `host:port` as requested
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            requested_host: host.clone(),
            host,
            port,
            ip: None,
            fake_ip_rewritten: false,
            matched_rule: None,
            country: None,
            termination: None,
        }
    }

    /// Set the resolved address
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the country code
    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Pin the rule chosen during the DNS phase
    #[must_use]
    pub fn with_matched_rule(mut self, index: usize) -> Self {
        self.matched_rule = Some(index);
        self
    }

    /// Replace the dial host after recovering it from a fake address
    #[must_use]
    pub fn with_rewritten_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self.fake_ip_rewritten = true;
        self
    }

    /// Host the client asked for (may be a fake address)
    #[must_use]
    pub fn requested_host(&self) -> &str {
        &self.requested_host
    }

    /// Host to dial
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolved destination address, if known
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Whether `host` was recovered from a fake address
    #[must_use]
    pub fn fake_ip_rewritten(&self) -> bool {
        self.fake_ip_rewritten
    }

    /// Rule pinned during the DNS phase
    #[must_use]
    pub fn matched_rule(&self) -> Option<usize> {
        self.matched_rule
    }

    /// Country code of the destination
    #[must_use]
    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    /// Address to dial: the resolved IP when known, else the host
    #[must_use]
    pub fn dial_host(&self) -> String {
        self.ip.map_or_else(|| self.host.clone(), |ip| ip.to_string())
    }

    /// Why the owning tunnel ended
    #[must_use]
    pub fn termination(&self) -> Option<&TerminationCause> {
        self.termination.as_ref()
    }

    /// Record the termination cause; later calls are ignored
    ///
    /// Returns whether the cause was recorded.
    pub fn record_termination(&mut self, cause: TerminationCause) -> bool {
        if self.termination.is_some() {
            return false;
        }
        self.termination = Some(cause);
        true
    }
}

impl fmt::Display for ConnectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fake_ip_rewritten {
            write!(f, "{}:{} (via {})", self.host, self.port, self.requested_host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolves a host name to an address
#[async_trait]
pub trait HostResolver: Send + Sync + fmt::Debug {
    /// First address for `host`, IPv4 preferred
    async fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    /// Create a resolver giving up after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Option<IpAddr> {
        let lookup = tokio::net::lookup_host((host, 0));
        match timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                addrs
                    .iter()
                    .copied()
                    .find(IpAddr::is_ipv4)
                    .or_else(|| addrs.first().copied())
            }
            Ok(Err(e)) => {
                debug!(host, error = %e, "Host resolution failed");
                None
            }
            Err(_) => {
                debug!(host, "Host resolution timed out");
                None
            }
        }
    }
}

/// Everything needed to turn a handshake request into a session
#[derive(Debug, Clone)]
pub struct SessionContext {
    dns: Option<DnsServerHandle>,
    geoip: Arc<dyn GeoIpLookup>,
    resolver: Option<Arc<dyn HostResolver>>,
}

impl SessionContext {
    /// Context without fake-IP recovery or host resolution
    #[must_use]
    pub fn new(geoip: Arc<dyn GeoIpLookup>) -> Self {
        Self {
            dns: None,
            geoip,
            resolver: None,
        }
    }

    /// Recover destinations of fake addresses through `dns`
    #[must_use]
    pub fn with_dns(mut self, dns: DnsServerHandle) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Resolve domain destinations through `resolver`
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build the session for a handshake request
    ///
    /// A destination inside the fake range is rewritten to the domain it was
    /// handed out for, inheriting the real address, country and pinned rule
    /// of its DNS session. A domain destination is resolved when a resolver is
    /// configured. Address destinations are tagged with their country.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::StaleFakeIp` if the destination is in the fake
    /// range but no longer bound, `SessionError::DnsUnavailable` if the DNS
    /// server has stopped.
    pub async fn create(&self, host: &str, port: u16) -> Result<ConnectSession, SessionError> {
        let parsed: Option<IpAddr> = host.parse().ok();

        if let (Some(IpAddr::V4(v4)), Some(dns)) = (parsed, self.dns.as_ref()) {
            if dns.is_fake_ip(v4) {
                let binding = dns
                    .lookup_fake_ip(v4)
                    .await
                    .map_err(|_| SessionError::DnsUnavailable)?
                    .ok_or(SessionError::StaleFakeIp(v4))?;

                trace!(fake = %v4, domain = %binding.domain, "Recovered fake destination");
                let mut session = ConnectSession::new(host, port).with_rewritten_host(binding.domain);
                session.ip = binding.real_ip.map(IpAddr::V4);
                session.matched_rule = binding.matched_rule;
                session.country = binding.country;
                return Ok(session);
            }
        }

        let mut session = ConnectSession::new(host, port);
        session.ip = match parsed {
            Some(ip) => Some(ip),
            None => match &self.resolver {
                Some(resolver) => resolver.resolve(host).await,
                None => None,
            },
        };
        session.country = session.ip.and_then(|ip| self.geoip.country_code(ip));
        Ok(session)
    }
}
