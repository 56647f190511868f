//! DNS interceptor configuration types

use std::net::SocketAddrV4;
use std::time::Duration;

use ipnet::Ipv4Net;

/// Configuration for the DNS interceptor
#[derive(Debug, Clone)]
pub struct DnsServerConfig {
    /// IPv4 range fake addresses are allocated from
    ///
    /// Default: 198.18.0.0/15 (RFC 2544 benchmarking range)
    pub fake_range: Ipv4Net,
    /// TTL written into synthesized answers
    ///
    /// Bindings are kept for twice this long so that a client honoring the
    /// TTL never connects to an already released address.
    /// Default: 300 seconds
    pub fake_ttl: Duration,
    /// Interval of the periodic sweep that releases expired bindings
    ///
    /// Default: 10 seconds
    pub sweep_interval: Duration,
    /// How long a forwarded query waits for an upstream answer
    ///
    /// Default: 5 seconds
    pub upstream_timeout: Duration,
    /// Address the TUN path sends DNS packets to
    ///
    /// Only packets addressed here are intercepted by the packet front end.
    /// An address inside the fake range is never handed out as a fake IP.
    pub intercept_addr: Option<SocketAddrV4>,
}

impl Default for DnsServerConfig {
    fn default() -> Self {
        Self {
            fake_range: Ipv4Net::new(std::net::Ipv4Addr::new(198, 18, 0, 0), 15)
                .unwrap_or_default(),
            fake_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(5),
            intercept_addr: None,
        }
    }
}

impl DnsServerConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fake address range
    #[must_use]
    pub fn with_fake_range(mut self, range: Ipv4Net) -> Self {
        self.fake_range = range;
        self
    }

    /// Set the fake answer TTL
    #[must_use]
    pub fn with_fake_ttl(mut self, ttl: Duration) -> Self {
        self.fake_ttl = ttl;
        self
    }

    /// Set the expiry sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the upstream answer timeout
    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Set the address intercepted on the packet path
    #[must_use]
    pub fn with_intercept_addr(mut self, addr: SocketAddrV4) -> Self {
        self.intercept_addr = Some(addr);
        self
    }

    /// How long a fake binding lives
    #[must_use]
    pub fn binding_lifetime(&self) -> Duration {
        self.fake_ttl * 2
    }

    /// TTL value for answer records, in seconds
    #[must_use]
    pub fn ttl_secs(&self) -> u32 {
        u32::try_from(self.fake_ttl.as_secs()).unwrap_or(u32::MAX)
    }
}
