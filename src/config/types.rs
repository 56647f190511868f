//! Configuration types for policy-router
//!
//! This module defines all configuration structures used by the router.
//! Configuration is loaded from JSON files and validated at startup, before
//! any adapter or rule is built.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fakedns::DnsServerConfig;
use crate::rules::{DomainCriteria, DomainCriterion};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Local proxy listeners
    #[serde(default)]
    pub listen: ListenConfig,

    /// Fake-IP DNS interceptor
    #[serde(default)]
    pub dns: DnsConfig,

    /// Adapter definitions, referenced by id from rules
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,

    /// Ordered routing rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Append a trailing direct catch-all rule
    #[serde(default = "default_true")]
    pub append_direct: bool,

    /// Country CIDR tables for country rules
    #[serde(default)]
    pub geoip: GeoIpConfig,

    /// Connection limits and outbound socket options
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first problem found: a missing
    /// listener, bad DNS settings, duplicate or unknown adapter ids, nested
    /// speed adapters, or a rule that does not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate(self.dns.enabled)?;
        self.dns.validate()?;
        self.connection.validate()?;

        let mut kinds: HashMap<&str, &AdapterConfig> = HashMap::new();
        for adapter in &self.adapters {
            adapter.validate()?;
            if kinds.insert(adapter.id(), adapter).is_some() {
                return Err(ConfigError::DuplicateAdapter {
                    id: adapter.id().to_string(),
                });
            }
        }

        let known = |id: &str| kinds.contains_key(id) || is_builtin_adapter(id);

        for adapter in &self.adapters {
            if let AdapterConfig::Speed { id, candidates } = adapter {
                for candidate in candidates {
                    if !known(&candidate.adapter) {
                        return Err(ConfigError::unknown_adapter(&candidate.adapter));
                    }
                    if matches!(kinds.get(candidate.adapter.as_str()), Some(AdapterConfig::Speed { .. })) {
                        return Err(ConfigError::validation(format!(
                            "Speed adapter '{id}' cannot race speed adapter '{}'",
                            candidate.adapter
                        )));
                    }
                }
            }
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(adapter) = rule.adapter() {
                if !known(adapter) {
                    return Err(ConfigError::unknown_adapter(adapter));
                }
            }
            rule.validate(index)?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            dns: DnsConfig::default(),
            adapters: Vec::new(),
            rules: Vec::new(),
            append_direct: true,
            geoip: GeoIpConfig::default(),
            connection: ConnectionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Local proxy listeners
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListenConfig {
    /// SOCKS5 listen address (e.g., "127.0.0.1:1080")
    #[serde(default)]
    pub socks5: Option<SocketAddr>,

    /// HTTP proxy listen address (e.g., "127.0.0.1:8080")
    #[serde(default)]
    pub http: Option<SocketAddr>,
}

impl ListenConfig {
    /// Validate listen configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if nothing would listen at all,
    /// or both proxies share an address.
    pub fn validate(&self, dns_enabled: bool) -> Result<(), ConfigError> {
        if self.socks5.is_none() && self.http.is_none() && !dns_enabled {
            return Err(ConfigError::validation(
                "At least one of listen.socks5, listen.http or dns must be enabled",
            ));
        }
        if self.socks5.is_some() && self.socks5 == self.http {
            return Err(ConfigError::validation(
                "listen.socks5 and listen.http must differ",
            ));
        }
        Ok(())
    }
}

/// Fake-IP DNS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Run the DNS interceptor
    #[serde(default)]
    pub enabled: bool,

    /// UDP listen address
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Upstream resolvers; every forwarded query is sent to all of them
    #[serde(default)]
    pub upstreams: Vec<SocketAddr>,

    /// IPv4 range fake addresses are allocated from
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: String,

    /// TTL of fake answers in seconds
    #[serde(default = "default_fake_ttl_secs")]
    pub fake_ttl_secs: u64,

    /// Expiry sweep interval in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long a forwarded query waits for upstream, in seconds
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// DNS address intercepted on the virtual-interface path
    #[serde(default)]
    pub intercept_addr: Option<SocketAddrV4>,
}

impl DnsConfig {
    /// Validate DNS configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unparsable or too small
    /// fake range, zero durations, or an enabled server without upstreams.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = self.fake_range()?;
        if range.prefix_len() > 30 {
            return Err(ConfigError::validation(format!(
                "dns.fake_ip_range {range} is too small"
            )));
        }
        if self.fake_ttl_secs == 0 || self.sweep_interval_secs == 0 || self.upstream_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "dns durations must be greater than 0",
            ));
        }
        if self.enabled && self.upstreams.is_empty() {
            return Err(ConfigError::validation(
                "dns.upstreams must not be empty when dns is enabled",
            ));
        }
        Ok(())
    }

    /// Parsed fake range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the range is not an IPv4 CIDR.
    pub fn fake_range(&self) -> Result<Ipv4Net, ConfigError> {
        self.fake_ip_range
            .parse()
            .map_err(|_| ConfigError::validation(format!("Invalid dns.fake_ip_range: {}", self.fake_ip_range)))
    }

    /// Interceptor settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the fake range is invalid.
    pub fn server_config(&self) -> Result<DnsServerConfig, ConfigError> {
        let mut config = DnsServerConfig::new()
            .with_fake_range(self.fake_range()?)
            .with_fake_ttl(Duration::from_secs(self.fake_ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
            .with_upstream_timeout(Duration::from_secs(self.upstream_timeout_secs));
        if let Some(addr) = self.intercept_addr {
            config = config.with_intercept_addr(addr);
        }
        Ok(config)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_dns_listen(),
            upstreams: Vec::new(),
            fake_ip_range: default_fake_ip_range(),
            fake_ttl_secs: default_fake_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            intercept_addr: None,
        }
    }
}

/// One configured adapter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum AdapterConfig {
    /// Connect straight to the destination
    Direct {
        id: String,
        /// Routing mark overriding `connection.routing_mark`
        #[serde(default)]
        routing_mark: Option<u32>,
    },
    /// Close every connection
    Reject {
        id: String,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Upstream HTTP proxy
    Http {
        id: String,
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        /// Wrap the proxy connection in TLS
        #[serde(default)]
        secured: bool,
        /// TLS server name, defaults to `host`
        #[serde(default)]
        sni: Option<String>,
        #[serde(default)]
        skip_verify: bool,
    },
    /// Upstream SOCKS5 proxy
    Socks5 {
        id: String,
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// Shadowsocks server
    Shadowsocks {
        id: String,
        host: String,
        port: u16,
        method: String,
        password: String,
    },
    /// Race of other adapters
    Speed {
        id: String,
        candidates: Vec<SpeedCandidateConfig>,
    },
}

impl AdapterConfig {
    /// Adapter id
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Direct { id, .. }
            | Self::Reject { id, .. }
            | Self::Http { id, .. }
            | Self::Socks5 { id, .. }
            | Self::Shadowsocks { id, .. }
            | Self::Speed { id, .. } => id,
        }
    }

    /// Type name as written in configuration
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Reject { .. } => "reject",
            Self::Http { .. } => "http",
            Self::Socks5 { .. } => "socks5",
            Self::Shadowsocks { .. } => "shadowsocks",
            Self::Speed { .. } => "speed",
        }
    }

    /// Validate a single adapter entry
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid id, a zero port,
    /// half-specified credentials or an empty race.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.id();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ConfigError::validation(format!("Invalid adapter id: '{id}'")));
        }

        match self {
            Self::Http {
                port,
                username,
                password,
                ..
            }
            | Self::Socks5 {
                port,
                username,
                password,
                ..
            } => {
                if *port == 0 {
                    return Err(ConfigError::validation(format!("Adapter '{id}' has port 0")));
                }
                if username.is_some() != password.is_some() {
                    return Err(ConfigError::validation(format!(
                        "Adapter '{id}' needs both username and password"
                    )));
                }
            }
            Self::Shadowsocks { port, .. } if *port == 0 => {
                return Err(ConfigError::validation(format!("Adapter '{id}' has port 0")));
            }
            Self::Speed { candidates, .. } if candidates.is_empty() => {
                return Err(ConfigError::validation(format!(
                    "Speed adapter '{id}' has no candidates"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

/// One candidate of a speed adapter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SpeedCandidateConfig {
    /// Id of the raced adapter
    pub adapter: String,

    /// Start delay in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

impl SpeedCandidateConfig {
    /// Start delay
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// One routing rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RuleConfig {
    /// Catch-all through the built-in direct adapter
    Direct,
    /// Catch-all through `adapter`
    All { adapter: String },
    /// Fires when `(country != code) != match`
    Country {
        country: String,
        #[serde(rename = "match", default = "default_true")]
        should_match: bool,
        adapter: String,
    },
    /// Fires on any matching domain criterion
    DomainList {
        criteria: Vec<DomainCriterion>,
        adapter: String,
    },
    /// Fires when the destination address is in a range
    IpRangeList { ranges: Vec<String>, adapter: String },
    /// Fires when the destination could not be resolved
    DnsFail { adapter: String },
}

impl RuleConfig {
    /// Adapter id the rule routes to
    #[must_use]
    pub fn adapter(&self) -> Option<&str> {
        match self {
            Self::Direct => None,
            Self::All { adapter }
            | Self::Country { adapter, .. }
            | Self::DomainList { adapter, .. }
            | Self::IpRangeList { adapter, .. }
            | Self::DnsFail { adapter } => Some(adapter),
        }
    }

    /// Check that the rule compiles
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidRule` for a bad country code, CIDR or
    /// regex, or an empty list.
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let invalid = |source| ConfigError::InvalidRule { index, source };
        match self {
            Self::Country { country, .. } => {
                if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(invalid(crate::error::RuleError::InvalidCountryCode(country.clone())));
                }
            }
            Self::DomainList { criteria, .. } => {
                DomainCriteria::from_criteria(criteria.iter().cloned()).map_err(invalid)?;
            }
            Self::IpRangeList { ranges, .. } => {
                parse_ranges(ranges).map_err(invalid)?;
            }
            Self::Direct | Self::All { .. } | Self::DnsFail { .. } => {}
        }
        Ok(())
    }
}

/// Parse a list of CIDRs
///
/// # Errors
///
/// Returns `RuleError::InvalidCidr` for the first unparsable entry and
/// `RuleError::Empty` for an empty list.
pub fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNet>, crate::error::RuleError> {
    if ranges.is_empty() {
        return Err(crate::error::RuleError::Empty);
    }
    ranges
        .iter()
        .map(|r| {
            r.parse::<IpNet>()
                .map(|net| net.trunc())
                .map_err(|_| crate::error::RuleError::InvalidCidr(r.clone()))
        })
        .collect()
}

/// Country CIDR tables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GeoIpConfig {
    /// Individual country files
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Directory whose `*.json` files are all loaded
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl GeoIpConfig {
    /// Whether any table is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dir.is_none()
    }
}

/// Connection limits and outbound socket options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent tunnels; unlimited when absent
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Enable TCP keepalive on outbound sockets
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    /// Routing mark (`SO_MARK`) for outbound sockets
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// Graceful shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Validate connection settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero cap or timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == Some(0) {
            return Err(ConfigError::validation(
                "connection.max_connections must be greater than 0",
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "connection.connect_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            tcp_keepalive: true,
            routing_mark: None,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Whether JSON output is selected
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Ids that resolve without an explicit adapter entry
#[must_use]
pub fn is_builtin_adapter(id: &str) -> bool {
    id == crate::adapter::DIRECT_ADAPTER_ID || id == crate::adapter::REJECT_ADAPTER_ID
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5353))
}

fn default_fake_ip_range() -> String {
    "198.18.0.0/15".into()
}

const fn default_fake_ttl_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    10
}

const fn default_upstream_timeout_secs() -> u64 {
    5
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
