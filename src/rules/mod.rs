//! Rule engine for routing decisions
//!
//! This module provides:
//! - The closed [`Rule`] variant set and the DNS match vocabulary
//! - Domain criteria matching (Aho-Corasick, regex)
//! - `GeoIP` country tagging
//! - [`RuleManager`], which runs the two-phase DNS match and the connect match
//!
//! # Two-phase DNS matching
//!
//! Every fresh query is first matched with only its name
//! ([`MatchPhase::DomainOnly`]). A rule that needs the address answers
//! `Unknown`; the query is forwarded upstream and, once the answer arrives,
//! matching resumes at that same rule with [`MatchPhase::ResolvedIp`].
//!
//! ```
//! use std::sync::Arc;
//! use policy_router::adapter::{AdapterFactory, RejectAdapterFactory};
//! use policy_router::rules::{DnsQueryView, DnsVerdict, MatchPhase, MatchState, Rule, RuleManager};
//!
//! let proxy: Arc<dyn AdapterFactory> = Arc::new(RejectAdapterFactory::new("proxy"));
//! let manager = RuleManager::new(vec![Rule::country("US", false, proxy)], true);
//!
//! let query = DnsQueryView { domain: "example.cn", real_ip: None, country: None };
//! let state = manager.match_dns(MatchState::NotStarted, &query, MatchPhase::DomainOnly);
//! assert_eq!(state, MatchState::Resumable { index: 0 });
//!
//! let answered = DnsQueryView { real_ip: Some("1.2.3.4".parse().unwrap()), country: Some("CN"), ..query };
//! let state = manager.match_dns(state, &answered, MatchPhase::ResolvedIp);
//! assert_eq!(state.verdict(), Some(DnsVerdict::Fake));
//! ```

pub mod domain;
pub mod engine;
pub mod geoip;
pub mod types;

pub use domain::{DomainCriteria, DomainCriteriaBuilder, DomainCriterion};
pub use engine::{ConnectMatch, RuleManager};
pub use geoip::{CountryTable, CountryTableBuilder, GeoIpLookup, NoGeoIp};
pub use types::{DnsMatchResult, DnsQueryView, DnsVerdict, MatchPhase, MatchState, Rule};
