//! Rule manager
//!
//! Runs the ordered rule list for DNS queries (two phases) and connections
//! (one phase). The manager is immutable once built and shared behind an
//! `Arc` by every tunnel and by the DNS interceptor.

use std::sync::Arc;

use tracing::{error, trace};

use super::types::{DnsMatchResult, DnsQueryView, DnsVerdict, MatchPhase, MatchState, Rule};
use crate::adapter::{AdapterFactory, DirectAdapterFactory};
use crate::session::ConnectSession;

/// Result of a connect match
#[derive(Debug, Clone)]
pub struct ConnectMatch {
    /// Adapter to open
    pub factory: Arc<dyn AdapterFactory>,
    /// Index of the rule that decided; `None` for the built-in fallback
    pub rule: Option<usize>,
}

/// Ordered rule list with a direct fallback
#[derive(Debug)]
pub struct RuleManager {
    rules: Vec<Rule>,
    fallback: Arc<dyn AdapterFactory>,
}

impl RuleManager {
    /// Create a manager over `rules`
    ///
    /// With `append_catch_all` a [`Rule::Direct`] is appended, so DNS
    /// matching always terminates on a rule. Connect matching falls back to
    /// a direct adapter either way.
    #[must_use]
    pub fn new(rules: Vec<Rule>, append_catch_all: bool) -> Self {
        Self::with_fallback(rules, append_catch_all, Arc::new(DirectAdapterFactory::default()))
    }

    /// Like [`new`](Self::new), with a configured direct adapter as the
    /// catch-all and fallback
    #[must_use]
    pub fn with_fallback(mut rules: Vec<Rule>, append_catch_all: bool, fallback: Arc<dyn AdapterFactory>) -> Self {
        if append_catch_all {
            rules.push(Rule::Direct(Arc::clone(&fallback)));
        }
        Self { rules, fallback }
    }

    /// The rule list, including an appended catch-all
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rule at `index`
    #[must_use]
    pub fn rule(&self, index: usize) -> Option<&Rule> {
        self.rules.get(index)
    }

    /// Advance the DNS match for one query
    ///
    /// - `NotStarted` scans from the first rule.
    /// - `Resumable { index }` scans from `index`, skipping rules that
    ///   already passed.
    /// - `Done` is returned unchanged.
    ///
    /// `Unknown` in the domain-only phase yields `Resumable`. Running off the
    /// end of the list (only possible without the catch-all) yields `Real`.
    #[must_use]
    pub fn match_dns(&self, state: MatchState, query: &DnsQueryView<'_>, phase: MatchPhase) -> MatchState {
        let start = match state {
            MatchState::NotStarted => 0,
            MatchState::Resumable { index } => index,
            MatchState::Done { .. } => return state,
        };

        for (index, rule) in self.rules.iter().enumerate().skip(start) {
            let result = rule.match_dns(query, phase);
            trace!(domain = query.domain, rule = index, kind = rule.kind(), ?phase, ?result, "DNS rule evaluated");
            match result {
                DnsMatchResult::Pass => continue,
                DnsMatchResult::Real => {
                    return MatchState::Done {
                        rule: Some(index),
                        verdict: DnsVerdict::Real,
                    }
                }
                DnsMatchResult::Fake => {
                    return MatchState::Done {
                        rule: Some(index),
                        verdict: DnsVerdict::Fake,
                    }
                }
                DnsMatchResult::Unknown => match phase {
                    MatchPhase::DomainOnly => return MatchState::Resumable { index },
                    MatchPhase::ResolvedIp => {
                        error!(domain = query.domain, rule = index, "Rule returned Unknown after resolution");
                        return MatchState::Done {
                            rule: Some(index),
                            verdict: DnsVerdict::Real,
                        };
                    }
                },
            }
        }

        MatchState::Done {
            rule: None,
            verdict: DnsVerdict::Real,
        }
    }

    /// Pick the adapter for a connection
    ///
    /// A rule pinned during the DNS phase is asked first. If it declines, or
    /// nothing was pinned, rules are scanned in order. The direct fallback
    /// guarantees a result.
    #[must_use]
    pub fn match_connect(&self, session: &ConnectSession) -> ConnectMatch {
        if let Some(index) = session.matched_rule() {
            if let Some(factory) = self.rules.get(index).and_then(|r| r.match_connect(session)) {
                return ConnectMatch {
                    factory: Arc::clone(factory),
                    rule: Some(index),
                };
            }
            trace!(host = session.host(), rule = index, "Pinned rule declined, scanning");
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(factory) = rule.match_connect(session) {
                return ConnectMatch {
                    factory: Arc::clone(factory),
                    rule: Some(index),
                };
            }
        }

        ConnectMatch {
            factory: Arc::clone(&self.fallback),
            rule: None,
        }
    }

    /// Number of rules, including an appended catch-all
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule looks at the destination address
    ///
    /// Tunnels only resolve domain destinations when this is true.
    #[must_use]
    pub fn needs_resolved_ip(&self) -> bool {
        self.rules.iter().any(|r| {
            matches!(
                r,
                Rule::Country { .. } | Rule::IpRangeList { .. } | Rule::DnsFail(_)
            )
        })
    }
}
