//! Rule type definitions
//!
//! A [`Rule`] is a pure matching strategy. It is asked twice per life of a
//! domain: once while answering the DNS query ([`Rule::match_dns`]) and once
//! when a connection for it arrives ([`Rule::match_connect`]).
//!
//! # DNS verdicts
//!
//! | Result    | Meaning                                                       |
//! |-----------|---------------------------------------------------------------|
//! | `Real`    | answer with the real upstream response                        |
//! | `Fake`    | answer with a fake address so the connection can be recovered |
//! | `Unknown` | cannot decide without the resolved IP; resume after upstream  |
//! | `Pass`    | not mine, ask the next rule                                   |

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;

use super::domain::DomainCriteria;
use crate::adapter::{AdapterFactory, DirectAdapterFactory};
use crate::session::ConnectSession;

/// Which half of the two-phase DNS match is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchPhase {
    /// Only the queried name is known
    DomainOnly,
    /// The upstream answer (if any) is known
    ResolvedIp,
}

/// Outcome of asking one rule about a DNS query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsMatchResult {
    Real,
    Fake,
    Unknown,
    Pass,
}

/// Terminal DNS decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsVerdict {
    Real,
    Fake,
}

impl fmt::Display for DnsVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => f.write_str("real"),
            Self::Fake => f.write_str("fake"),
        }
    }
}

/// Progress of the two-phase DNS match for one query
///
/// Resuming is a pure function of this state and the phase: see
/// [`RuleManager::match_dns`](super::RuleManager::match_dns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchState {
    /// No rule has been consulted yet
    #[default]
    NotStarted,
    /// Rule `index` answered `Unknown` in the domain-only phase
    Resumable { index: usize },
    /// Terminal. `rule` is the index of the rule that decided, if any
    Done {
        rule: Option<usize>,
        verdict: DnsVerdict,
    },
}

impl MatchState {
    /// Index of the rule pinned by this state
    ///
    /// A resumable state pins the rule that asked to wait for the answer.
    #[must_use]
    pub fn pinned_rule(&self) -> Option<usize> {
        match self {
            Self::NotStarted => None,
            Self::Resumable { index } => Some(*index),
            Self::Done { rule, .. } => *rule,
        }
    }

    /// The terminal verdict, if reached
    #[must_use]
    pub fn verdict(&self) -> Option<DnsVerdict> {
        match self {
            Self::Done { verdict, .. } => Some(*verdict),
            _ => None,
        }
    }

    /// Whether matching has finished
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Same decision, downgraded to `Real`
    ///
    /// Used when the fake path cannot be honored (pool exhaustion).
    #[must_use]
    pub fn degrade_to_real(self) -> Self {
        Self::Done {
            rule: self.pinned_rule(),
            verdict: DnsVerdict::Real,
        }
    }
}

/// What a rule may look at while matching a DNS query
#[derive(Debug, Clone, Copy)]
pub struct DnsQueryView<'a> {
    /// Queried name, lowercase, without the trailing dot
    pub domain: &'a str,
    /// First A record of the upstream answer
    pub real_ip: Option<Ipv4Addr>,
    /// Country of `real_ip`
    pub country: Option<&'a str>,
}

/// A routing rule
///
/// The variant set is closed. Rules never hold per-session state.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Catch-all that connects directly
    Direct(Arc<dyn AdapterFactory>),
    /// Catch-all with an arbitrary adapter
    All(Arc<dyn AdapterFactory>),
    /// Fires when `(country != code) != should_match`
    Country {
        code: String,
        should_match: bool,
        adapter: Arc<dyn AdapterFactory>,
    },
    /// Fires when the domain matches any criterion
    DomainList {
        criteria: Arc<DomainCriteria>,
        adapter: Arc<dyn AdapterFactory>,
    },
    /// Fires when the resolved IP is in any range
    IpRangeList {
        ranges: Arc<[IpNet]>,
        adapter: Arc<dyn AdapterFactory>,
    },
    /// Fires when the destination could not be resolved
    DnsFail(Arc<dyn AdapterFactory>),
}

impl Rule {
    /// Direct catch-all rule
    #[must_use]
    pub fn direct() -> Self {
        Self::Direct(Arc::new(DirectAdapterFactory::default()))
    }

    /// Catch-all rule routing everything to `adapter`
    #[must_use]
    pub fn all(adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::All(adapter)
    }

    /// Country rule
    ///
    /// `code` is compared case-insensitively.
    #[must_use]
    pub fn country(code: impl Into<String>, should_match: bool, adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::Country {
            code: code.into().to_ascii_uppercase(),
            should_match,
            adapter,
        }
    }

    /// Domain list rule
    #[must_use]
    pub fn domain_list(criteria: DomainCriteria, adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::DomainList {
            criteria: Arc::new(criteria),
            adapter,
        }
    }

    /// IP range rule
    #[must_use]
    pub fn ip_range_list(ranges: Vec<IpNet>, adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::IpRangeList {
            ranges: ranges.into(),
            adapter,
        }
    }

    /// DNS failure rule
    #[must_use]
    pub fn dns_fail(adapter: Arc<dyn AdapterFactory>) -> Self {
        Self::DnsFail(adapter)
    }

    /// The adapter this rule routes to
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn AdapterFactory> {
        match self {
            Self::Direct(adapter) | Self::All(adapter) | Self::DnsFail(adapter) => adapter,
            Self::Country { adapter, .. }
            | Self::DomainList { adapter, .. }
            | Self::IpRangeList { adapter, .. } => adapter,
        }
    }

    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::All(_) => "all",
            Self::Country { .. } => "country",
            Self::DomainList { .. } => "domain-list",
            Self::IpRangeList { .. } => "ip-range-list",
            Self::DnsFail(_) => "dns-fail",
        }
    }

    /// Decide a DNS query
    ///
    /// Rules that need the resolved address answer `Unknown` in the
    /// domain-only phase. No rule answers `Unknown` in the resolved phase.
    #[must_use]
    pub fn match_dns(&self, query: &DnsQueryView<'_>, phase: MatchPhase) -> DnsMatchResult {
        match self {
            Self::Direct(_) => DnsMatchResult::Real,
            Self::All(adapter) => fired(adapter),
            Self::Country {
                code,
                should_match,
                adapter,
            } => match phase {
                MatchPhase::DomainOnly => DnsMatchResult::Unknown,
                MatchPhase::ResolvedIp => {
                    if country_fires(query.country, code, *should_match) {
                        fired(adapter)
                    } else {
                        DnsMatchResult::Pass
                    }
                }
            },
            Self::DomainList { criteria, adapter } => {
                if criteria.matches(query.domain) {
                    fired(adapter)
                } else {
                    DnsMatchResult::Pass
                }
            }
            Self::IpRangeList { ranges, adapter } => match phase {
                MatchPhase::DomainOnly => DnsMatchResult::Unknown,
                MatchPhase::ResolvedIp => match query.real_ip {
                    Some(ip) if in_ranges(ranges, IpAddr::V4(ip)) => fired(adapter),
                    _ => DnsMatchResult::Pass,
                },
            },
            Self::DnsFail(adapter) => match phase {
                MatchPhase::DomainOnly => DnsMatchResult::Unknown,
                MatchPhase::ResolvedIp => {
                    if query.real_ip.is_none() {
                        fired(adapter)
                    } else {
                        DnsMatchResult::Pass
                    }
                }
            },
        }
    }

    /// Pick an adapter for a connection, or `None` to pass
    #[must_use]
    pub fn match_connect(&self, session: &ConnectSession) -> Option<&Arc<dyn AdapterFactory>> {
        let fires = match self {
            Self::Direct(_) | Self::All(_) => true,
            Self::Country {
                code, should_match, ..
            } => country_fires(session.country(), code, *should_match),
            Self::DomainList { criteria, .. } => criteria.matches(session.host()),
            Self::IpRangeList { ranges, .. } => session.ip().is_some_and(|ip| in_ranges(ranges, ip)),
            Self::DnsFail(_) => session.ip().is_none(),
        };
        fires.then(|| self.adapter())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Country {
                code,
                should_match,
                adapter,
            } => write!(f, "country({code}, match={should_match}) -> {}", adapter.id()),
            Self::DomainList { criteria, adapter } => {
                write!(f, "domain-list({} entries) -> {}", criteria.len(), adapter.id())
            }
            Self::IpRangeList { ranges, adapter } => {
                write!(f, "ip-range-list({} ranges) -> {}", ranges.len(), adapter.id())
            }
            other => write!(f, "{} -> {}", other.kind(), other.adapter().id()),
        }
    }
}

fn fired(adapter: &Arc<dyn AdapterFactory>) -> DnsMatchResult {
    if adapter.is_direct() {
        DnsMatchResult::Real
    } else {
        DnsMatchResult::Fake
    }
}

fn country_fires(country: Option<&str>, code: &str, should_match: bool) -> bool {
    let differs = !country.is_some_and(|c| c.eq_ignore_ascii_case(code));
    differs != should_match
}

fn in_ranges(ranges: &[IpNet], ip: IpAddr) -> bool {
    ranges.iter().any(|net| net.contains(&ip))
}
