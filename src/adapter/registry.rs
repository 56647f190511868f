//! Adapter registry
//!
//! Builds every configured adapter factory once, keyed by id, and compiles
//! rule entries against it. The built-in `direct` and `reject` adapters are
//! always present unless configuration overrides them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::direct::{DirectAdapterFactory, DIRECT_ADAPTER_ID};
use super::http::HttpAdapterFactory;
use super::reject::RejectAdapterFactory;
use super::socks5::{Credentials, Socks5AdapterFactory};
use super::speed::{SpeedAdapterFactory, SpeedCandidate};
use super::{AdapterFactory, Outbound};
use crate::config::{parse_ranges, AdapterConfig, ConnectionConfig, RuleConfig};
use crate::error::{AdapterError, ConfigError};
use crate::rules::{DomainCriteria, Rule, RuleManager};
use crate::transport::{TcpDialer, TcpOptions, TlsDialer};

/// Id of the built-in reject adapter
pub const REJECT_ADAPTER_ID: &str = "reject";

/// Adapter factories by id
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// Registry holding only the built-in adapters
    #[must_use]
    pub fn builtin(connection: &ConnectionConfig) -> Self {
        let outbound = Outbound::new(
            Arc::new(TcpDialer::new(tcp_options(connection, None))),
            connection.connect_timeout(),
        );
        let mut adapters: HashMap<String, Arc<dyn AdapterFactory>> = HashMap::new();
        adapters.insert(
            DIRECT_ADAPTER_ID.to_string(),
            Arc::new(DirectAdapterFactory::new(DIRECT_ADAPTER_ID, outbound)),
        );
        adapters.insert(
            REJECT_ADAPTER_ID.to_string(),
            Arc::new(RejectAdapterFactory::new(REJECT_ADAPTER_ID)),
        );
        Self { adapters }
    }

    /// Build every configured adapter
    ///
    /// Plain adapters are built first so speed adapters can reference them.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateAdapter` for a repeated id,
    /// `ConfigError::UnknownAdapter` for a speed candidate that does not
    /// exist, and `ConfigError::Adapter` when an adapter cannot be built
    /// (nested speed adapters, bad cipher, adapter type compiled out).
    pub fn from_config(configs: &[AdapterConfig], connection: &ConnectionConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin(connection);

        let mut seen = HashSet::new();
        for config in configs {
            if !seen.insert(config.id()) {
                return Err(ConfigError::DuplicateAdapter {
                    id: config.id().to_string(),
                });
            }
        }

        for config in configs.iter().filter(|c| !matches!(c, AdapterConfig::Speed { .. })) {
            let factory = build_plain(config, connection)?;
            debug!(id = config.id(), kind = config.kind(), "Built adapter");
            registry.adapters.insert(config.id().to_string(), factory);
        }

        for config in configs {
            let AdapterConfig::Speed { id, candidates } = config else {
                continue;
            };
            let mut raced = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                if configs
                    .iter()
                    .any(|c| c.id() == candidate.adapter && matches!(c, AdapterConfig::Speed { .. }))
                {
                    return Err(AdapterError::NestedSpeed {
                        id: id.clone(),
                        candidate: candidate.adapter.clone(),
                    }
                    .into());
                }
                raced.push(SpeedCandidate {
                    factory: registry.require(&candidate.adapter)?,
                    delay: candidate.delay(),
                });
            }
            debug!(id = %id, candidates = raced.len(), "Built speed adapter");
            registry
                .adapters
                .insert(id.clone(), Arc::new(SpeedAdapterFactory::new(id.clone(), raced)));
        }

        info!(adapters = registry.adapters.len(), "Adapter registry built");
        Ok(registry)
    }

    /// Factory registered under `id`
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.adapters.get(id).map(Arc::clone)
    }

    /// Factory registered under `id`, or `ConfigError::UnknownAdapter`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownAdapter` if no adapter has this id.
    pub fn require(&self, id: &str) -> Result<Arc<dyn AdapterFactory>, ConfigError> {
        self.get(id).ok_or_else(|| ConfigError::unknown_adapter(id))
    }

    /// The direct adapter
    #[must_use]
    pub fn direct(&self) -> Arc<dyn AdapterFactory> {
        self.get(DIRECT_ADAPTER_ID)
            .unwrap_or_else(|| Arc::new(DirectAdapterFactory::default()))
    }

    /// Number of registered adapters, built-ins included
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Compile one rule entry
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownAdapter` for a missing adapter and
    /// `ConfigError::InvalidRule` for a bad CIDR, regex or country code.
    pub fn build_rule(&self, index: usize, config: &RuleConfig) -> Result<Rule, ConfigError> {
        config.validate(index)?;
        let invalid = |source| ConfigError::InvalidRule { index, source };
        let rule = match config {
            RuleConfig::Direct => Rule::Direct(self.direct()),
            RuleConfig::All { adapter } => Rule::all(self.require(adapter)?),
            RuleConfig::Country {
                country,
                should_match,
                adapter,
            } => Rule::country(country, *should_match, self.require(adapter)?),
            RuleConfig::DomainList { criteria, adapter } => {
                let criteria = DomainCriteria::from_criteria(criteria.iter().cloned()).map_err(invalid)?;
                Rule::domain_list(criteria, self.require(adapter)?)
            }
            RuleConfig::IpRangeList { ranges, adapter } => {
                Rule::ip_range_list(parse_ranges(ranges).map_err(invalid)?, self.require(adapter)?)
            }
            RuleConfig::DnsFail { adapter } => Rule::dns_fail(self.require(adapter)?),
        };
        Ok(rule)
    }

    /// Compile the rule list into a manager
    ///
    /// # Errors
    ///
    /// Returns the first error of [`build_rule`](Self::build_rule).
    pub fn build_rules(&self, configs: &[RuleConfig], append_direct: bool) -> Result<RuleManager, ConfigError> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(index, config)| self.build_rule(index, config))
            .collect::<Result<Vec<_>, _>>()?;
        info!(rules = rules.len(), append_direct, "Rules compiled");
        Ok(RuleManager::with_fallback(rules, append_direct, self.direct()))
    }
}

fn tcp_options(connection: &ConnectionConfig, routing_mark: Option<u32>) -> TcpOptions {
    TcpOptions {
        keepalive: connection.tcp_keepalive,
        nodelay: true,
        routing_mark: routing_mark.or(connection.routing_mark),
    }
}

fn build_plain(config: &AdapterConfig, connection: &ConnectionConfig) -> Result<Arc<dyn AdapterFactory>, ConfigError> {
    let timeout = connection.connect_timeout();
    let tcp = TcpDialer::new(tcp_options(connection, None));

    let factory: Arc<dyn AdapterFactory> = match config {
        AdapterConfig::Direct { id, routing_mark } => {
            let dialer = TcpDialer::new(tcp_options(connection, *routing_mark));
            Arc::new(DirectAdapterFactory::new(id, Outbound::new(Arc::new(dialer), timeout)))
        }
        AdapterConfig::Reject { id, delay_ms } => {
            Arc::new(RejectAdapterFactory::new(id).with_delay(Duration::from_millis(*delay_ms)))
        }
        AdapterConfig::Http {
            id,
            host,
            port,
            username,
            password,
            secured,
            sni,
            skip_verify,
        } => {
            let outbound = if *secured {
                let server_name = sni.clone().or_else(|| Some(host.clone()));
                let tls = TlsDialer::new(tcp, server_name, *skip_verify)
                    .map_err(|e| AdapterError::invalid_config(id, e.to_string()))?;
                Outbound::new(Arc::new(tls), timeout)
            } else {
                Outbound::new(Arc::new(tcp), timeout)
            };
            let mut factory = HttpAdapterFactory::new(id, outbound, host, *port);
            if let Some((user, pass)) = username.as_deref().zip(password.as_deref()) {
                factory = factory.with_credentials(user, pass);
            }
            Arc::new(factory)
        }
        AdapterConfig::Socks5 {
            id,
            host,
            port,
            username,
            password,
        } => {
            let mut factory = Socks5AdapterFactory::new(id, Outbound::new(Arc::new(tcp), timeout), host, *port);
            if let Some((user, pass)) = username.as_deref().zip(password.as_deref()) {
                factory = factory.with_credentials(Credentials::new(id, user, pass)?);
            }
            Arc::new(factory)
        }
        AdapterConfig::Shadowsocks {
            id,
            host,
            port,
            method,
            password,
        } => build_shadowsocks(id, host, *port, method, password, timeout)?,
        AdapterConfig::Speed { id, .. } => {
            return Err(ConfigError::validation(format!("Speed adapter '{id}' built out of order")));
        }
    };
    Ok(factory)
}

#[cfg(feature = "shadowsocks")]
fn build_shadowsocks(
    id: &str,
    host: &str,
    port: u16,
    method: &str,
    password: &str,
    timeout: Duration,
) -> Result<Arc<dyn AdapterFactory>, ConfigError> {
    let factory = super::shadowsocks::ShadowsocksAdapterFactory::from_server(id, host, port, method, password, timeout)?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "shadowsocks"))]
fn build_shadowsocks(
    _id: &str,
    _host: &str,
    _port: u16,
    _method: &str,
    _password: &str,
    _timeout: Duration,
) -> Result<Arc<dyn AdapterFactory>, ConfigError> {
    Err(AdapterError::Unsupported {
        kind: "shadowsocks".into(),
    }
    .into())
}
