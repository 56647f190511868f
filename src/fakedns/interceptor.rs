//! Fake-IP DNS interceptor core
//!
//! [`DnsInterceptor`] is the synchronous state machine behind the DNS server.
//! It owns the [`AddressPool`] and both session maps and never performs I/O:
//! every call returns the action its caller must carry out. The server task
//! is the only owner, so no locking is involved.
//!
//! Query handling:
//!
//! 1. Run the domain-only rule match.
//! 2. `Fake` on an A question: allocate, bind, answer immediately.
//! 3. `Fake` on any other question: empty NOERROR so clients use IPv4.
//! 4. Anything else: remember the session by transaction id and forward.
//!
//! When the upstream answer arrives the match resumes with the real address,
//! and the client receives either a synthesized fake answer or the upstream
//! bytes verbatim.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::MessageType;
use tracing::{debug, trace, warn};

use super::config::DnsServerConfig;
use super::error::DnsResult;
use super::pool::{AddressPool, PoolError, PoolRange};
use super::processor::{
    build_empty_response, build_error_response, build_fake_response, encode_message, first_a_record,
    parse_message, same_question,
};
use super::session::{DnsClient, DnsSession};
use crate::rules::{DnsVerdict, GeoIpLookup, MatchPhase, MatchState, RuleManager};

/// What the caller must do after feeding a message in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAction {
    /// Send `response` to `client`
    Respond { client: DnsClient, response: Bytes },
    /// Send `query` to the upstream resolvers
    Forward { query: Bytes },
}

/// Reverse-lookup result for a bound fake address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeBinding {
    /// Domain the address was handed out for
    pub domain: String,
    /// Real address, when the upstream answer was seen before faking
    pub real_ip: Option<Ipv4Addr>,
    /// Rule that decided to fake
    pub matched_rule: Option<usize>,
    /// Country of `real_ip`
    pub country: Option<String>,
}

/// Interceptor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsStats {
    pub queries: u64,
    pub malformed: u64,
    pub rejected: u64,
    pub fake_answers: u64,
    pub empty_answers: u64,
    pub forwarded: u64,
    pub upstream_answers: u64,
    pub unmatched_answers: u64,
    pub degraded: u64,
    pub expired_bindings: u64,
    pub expired_pending: u64,
    /// Sessions currently waiting for upstream
    pub pending: u64,
    /// Fake addresses currently bound
    pub bound: u64,
}

/// Synchronous fake-IP DNS state machine
#[derive(Debug)]
pub struct DnsInterceptor {
    config: DnsServerConfig,
    pool: AddressPool,
    rules: Arc<RuleManager>,
    geoip: Arc<dyn GeoIpLookup>,
    /// Sessions waiting for an upstream answer, by transaction id
    pending: HashMap<u16, DnsSession>,
    /// Sessions holding a fake address
    fakes: HashMap<Ipv4Addr, DnsSession>,
    stats: DnsStats,
}

impl DnsInterceptor {
    /// Create an interceptor
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Pool` if the configured range has no usable host.
    pub fn new(config: DnsServerConfig, rules: Arc<RuleManager>, geoip: Arc<dyn GeoIpLookup>) -> DnsResult<Self> {
        let mut pool = AddressPool::from_network(config.fake_range)?;
        if let Some(intercept) = config.intercept_addr {
            if pool.reserve(*intercept.ip()) {
                debug!(%intercept, "Intercept address reserved in the fake range");
            }
        }
        Ok(Self {
            config,
            pool,
            rules,
            geoip,
            pending: HashMap::new(),
            fakes: HashMap::new(),
            stats: DnsStats::default(),
        })
    }

    /// The fake address range
    #[must_use]
    pub fn fake_range(&self) -> PoolRange {
        self.pool.range()
    }

    /// Handle a query from a client
    ///
    /// Undecodable messages and stray responses yield `None`.
    pub fn handle_query(&mut self, bytes: &[u8], client: DnsClient, now: Instant) -> Option<DnsAction> {
        self.stats.queries += 1;

        let request = match parse_message(bytes) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(%client, error = %e, "Dropping undecodable DNS query");
                return None;
            }
        };
        if request.message_type() == MessageType::Response {
            self.stats.malformed += 1;
            trace!(%client, id = request.id(), "Dropping DNS response sent as query");
            return None;
        }

        let mut session = match DnsSession::new(request.clone(), Bytes::copy_from_slice(bytes), client, now) {
            Ok(s) => s,
            Err(reject) => {
                self.stats.rejected += 1;
                debug!(%client, id = request.id(), ?reject, "Rejecting DNS query");
                let response = build_error_response(&request, reject.response_code());
                return self.respond(client, &response);
            }
        };

        if !session.is_routable() {
            session.state = MatchState::Done {
                rule: None,
                verdict: DnsVerdict::Real,
            };
            return Some(self.forward(session));
        }

        session.state = self
            .rules
            .match_dns(MatchState::NotStarted, &session.view(), MatchPhase::DomainOnly);
        debug!(
            %client,
            domain = session.domain(),
            qtype = %session.question().query_type(),
            state = ?session.state,
            "DNS query matched"
        );

        if session.state.verdict() != Some(DnsVerdict::Fake) {
            return Some(self.forward(session));
        }

        if !session.is_a_query() {
            self.stats.empty_answers += 1;
            let response = build_empty_response(session.request());
            return self.respond(client, &response);
        }

        match self.bind_fake(&mut session, now) {
            Ok(ip) => {
                let response = build_fake_response(session.request(), ip, self.config.fake_ttl);
                self.fakes.insert(ip, session);
                self.respond(client, &response)
            }
            Err(PoolError::Exhausted | PoolError::EmptyRange { .. }) => {
                self.stats.degraded += 1;
                warn!(domain = session.domain(), "Fake address pool exhausted, resolving for real");
                session.state = session.state.degrade_to_real();
                Some(self.forward(session))
            }
        }
    }

    /// Handle an answer from an upstream resolver
    ///
    /// Answers nobody is waiting for, including duplicates from racing
    /// resolvers, yield `None`.
    pub fn handle_answer(&mut self, bytes: &[u8], now: Instant) -> Option<DnsAction> {
        let answer = match parse_message(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "Dropping undecodable upstream answer");
                return None;
            }
        };
        if answer.message_type() != MessageType::Response {
            trace!(id = answer.id(), "Dropping upstream message that is not a response");
            return None;
        }

        let Some(mut session) = self.pending.remove(&answer.id()) else {
            self.stats.unmatched_answers += 1;
            debug!(id = answer.id(), "No pending DNS session for answer");
            return None;
        };

        let matches = answer
            .queries()
            .first()
            .is_some_and(|q| same_question(q, session.question()));
        if !matches {
            self.stats.unmatched_answers += 1;
            debug!(id = answer.id(), domain = session.domain(), "Upstream answer question mismatch");
            self.pending.insert(answer.id(), session);
            return None;
        }

        self.stats.upstream_answers += 1;
        let client = session.client();
        let verbatim = DnsAction::Respond {
            client,
            response: Bytes::copy_from_slice(bytes),
        };

        if !session.is_a_query() || !session.is_routable() {
            return Some(verbatim);
        }
        let Some(real_ip) = first_a_record(&answer) else {
            trace!(domain = session.domain(), "Upstream answer has no A record");
            return Some(verbatim);
        };

        session.real_ip = Some(real_ip);
        session.country = self.geoip.country_code(IpAddr::V4(real_ip));
        if !session.state.is_done() {
            session.state = self
                .rules
                .match_dns(session.state, &session.view(), MatchPhase::ResolvedIp);
        }
        debug!(
            domain = session.domain(),
            real = %real_ip,
            country = session.country.as_deref().unwrap_or("-"),
            state = ?session.state,
            "DNS answer matched"
        );

        if session.state.verdict() != Some(DnsVerdict::Fake) {
            return Some(verbatim);
        }

        match self.bind_fake(&mut session, now) {
            Ok(ip) => {
                let response = build_fake_response(session.request(), ip, self.config.fake_ttl);
                self.fakes.insert(ip, session);
                self.respond(client, &response)
            }
            Err(_) => {
                self.stats.degraded += 1;
                warn!(domain = session.domain(), "Fake address pool exhausted, returning real answer");
                Some(verbatim)
            }
        }
    }

    /// Reverse lookup of a bound fake address
    #[must_use]
    pub fn lookup_fake_ip(&self, ip: Ipv4Addr) -> Option<FakeBinding> {
        self.fakes.get(&ip).map(|session| FakeBinding {
            domain: session.domain().to_string(),
            real_ip: session.real_ip,
            matched_rule: session.state.pinned_rule(),
            country: session.country.clone(),
        })
    }

    /// Whether `ip` is inside the fake range, bound or not
    #[must_use]
    pub fn is_fake_ip(&self, ip: Ipv4Addr) -> bool {
        self.pool.contains(ip)
    }

    /// Release expired bindings and drop stale pending sessions
    ///
    /// Returns the number of fake addresses released.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Ipv4Addr> = self
            .fakes
            .iter()
            .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &expired {
            if let Some(session) = self.fakes.remove(ip) {
                trace!(ip = %ip, domain = session.domain(), "Fake binding expired");
            }
            self.pool.release(*ip);
        }

        let timeout = self.config.upstream_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, s| now.saturating_duration_since(s.created_at()) < timeout);
        let dropped = before - self.pending.len();

        self.stats.expired_bindings += expired.len() as u64;
        self.stats.expired_pending += dropped as u64;
        if !expired.is_empty() || dropped > 0 {
            debug!(released = expired.len(), timed_out = dropped, "DNS sweep");
        }
        expired.len()
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> DnsStats {
        DnsStats {
            pending: self.pending.len() as u64,
            bound: self.fakes.len() as u64,
            ..self.stats
        }
    }

    fn bind_fake(&mut self, session: &mut DnsSession, now: Instant) -> Result<Ipv4Addr, PoolError> {
        let ip = self.pool.acquire()?;
        session.fake_ip = Some(ip);
        session.expires_at = Some(now + self.config.binding_lifetime());
        self.stats.fake_answers += 1;
        debug!(domain = session.domain(), fake = %ip, "Bound fake address");
        Ok(ip)
    }

    fn forward(&mut self, session: DnsSession) -> DnsAction {
        self.stats.forwarded += 1;
        let query = session.raw().clone();
        if let Some(old) = self.pending.insert(session.id(), session) {
            debug!(id = old.id(), domain = old.domain(), "Pending DNS session replaced by id collision");
        }
        DnsAction::Forward { query }
    }

    fn respond(&self, client: DnsClient, response: &hickory_proto::op::Message) -> Option<DnsAction> {
        match encode_message(response) {
            Ok(bytes) => Some(DnsAction::Respond {
                client,
                response: Bytes::from(bytes),
            }),
            Err(e) => {
                warn!(%client, error = %e, "Failed to encode DNS response");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use hickory_proto::op::{Message, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

    use super::*;
    use crate::adapter::{AdapterFactory, RejectAdapterFactory};
    use crate::rules::{CountryTable, DomainCriteria, NoGeoIp, Rule};

    fn proxy() -> Arc<dyn AdapterFactory> {
        Arc::new(RejectAdapterFactory::new("proxy"))
    }

    fn client() -> DnsClient {
        DnsClient::Udp("127.0.0.1:40000".parse().unwrap())
    }

    fn config() -> DnsServerConfig {
        DnsServerConfig::new()
            .with_fake_range("198.18.0.0/29".parse().unwrap())
            .with_fake_ttl(Duration::from_secs(60))
            .with_upstream_timeout(Duration::from_secs(5))
    }

    fn interceptor(rules: Vec<Rule>) -> DnsInterceptor {
        DnsInterceptor::new(config(), Arc::new(RuleManager::new(rules, true)), Arc::new(NoGeoIp)).unwrap()
    }

    fn query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    fn answer(id: u16, name: &str, ip: Option<Ipv4Addr>) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        let name = Name::from_str(name).unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        if let Some(ip) = ip {
            msg.add_answer(Record::from_rdata(name, 30, RData::A(A(ip))));
        }
        msg.to_vec().unwrap()
    }

    fn respond_ip(action: Option<DnsAction>) -> Ipv4Addr {
        match action {
            Some(DnsAction::Respond { response, .. }) => {
                first_a_record(&Message::from_vec(&response).unwrap()).expect("A record")
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    // ==========================================================================
    // Fake Path
    // ==========================================================================

    #[test]
    fn test_intercept_address_never_handed_out() {
        let config = config().with_intercept_addr("198.18.0.1:53".parse().unwrap());
        let rules = Arc::new(RuleManager::new(vec![Rule::all(proxy())], true));
        let mut dns = DnsInterceptor::new(config, rules, Arc::new(NoGeoIp)).unwrap();
        let now = Instant::now();

        // 198.18.0.0/29 has six usable hosts, one of them reserved
        let mut handed = Vec::new();
        for id in 0..5u16 {
            let name = format!("host{id}.test.");
            handed.push(respond_ip(dns.handle_query(&query(100 + id, &name, RecordType::A), client(), now)));
        }
        assert!(!handed.contains(&Ipv4Addr::new(198, 18, 0, 1)));
        assert_eq!(dns.stats().bound, 5);

        // The pool is now exhausted and the query degrades to a real lookup
        let action = dns.handle_query(&query(110, "host5.test.", RecordType::A), client(), now);
        assert!(matches!(action, Some(DnsAction::Forward { .. })));
        assert!(dns.lookup_fake_ip(Ipv4Addr::new(198, 18, 0, 1)).is_none());
    }

    #[test]
    fn test_fake_round_trip_and_expiry() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let t0 = Instant::now();

        let ip = respond_ip(dns.handle_query(&query(1, "example.com.", RecordType::A), client(), t0));
        assert!(dns.is_fake_ip(ip));

        let binding = dns.lookup_fake_ip(ip).unwrap();
        assert_eq!(binding.domain, "example.com");
        assert_eq!(binding.matched_rule, Some(0));
        assert_eq!(binding.real_ip, None);

        // Still bound just before twice the TTL
        assert_eq!(dns.expire(t0 + Duration::from_secs(119)), 0);
        assert!(dns.lookup_fake_ip(ip).is_some());

        assert_eq!(dns.expire(t0 + Duration::from_secs(120)), 1);
        assert!(dns.is_fake_ip(ip));
        assert!(dns.lookup_fake_ip(ip).is_none());
        assert_eq!(dns.stats().bound, 0);
    }

    #[test]
    fn test_distinct_queries_get_distinct_addresses() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let now = Instant::now();
        let a = respond_ip(dns.handle_query(&query(1, "a.test.", RecordType::A), client(), now));
        let b = respond_ip(dns.handle_query(&query(2, "b.test.", RecordType::A), client(), now));
        assert_ne!(a, b);
        assert_eq!(dns.lookup_fake_ip(b).unwrap().domain, "b.test");
    }

    #[test]
    fn test_fake_ttl_in_answer() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let action = dns.handle_query(&query(1, "ttl.test.", RecordType::A), client(), Instant::now());
        let Some(DnsAction::Respond { response, .. }) = action else {
            panic!("expected response");
        };
        let msg = Message::from_vec(&response).unwrap();
        assert_eq!(msg.answers()[0].ttl(), 60);
        assert_eq!(msg.id(), 1);
    }

    #[test]
    fn test_aaaa_under_fake_is_empty() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let action = dns.handle_query(&query(3, "example.com.", RecordType::AAAA), client(), Instant::now());
        let Some(DnsAction::Respond { response, .. }) = action else {
            panic!("expected response");
        };
        let msg = Message::from_vec(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.answers().is_empty());
        assert_eq!(dns.stats().bound, 0);
    }

    #[test]
    fn test_exhaustion_degrades_to_real() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let now = Instant::now();
        // /29 has six usable hosts
        for id in 0..6 {
            let name = format!("h{id}.test.");
            respond_ip(dns.handle_query(&query(id, &name, RecordType::A), client(), now));
        }
        let bytes = query(99, "overflow.test.", RecordType::A);
        let action = dns.handle_query(&bytes, client(), now);
        assert_eq!(action, Some(DnsAction::Forward { query: Bytes::from(bytes) }));
        assert_eq!(dns.stats().degraded, 1);

        // The real answer is passed through untouched
        let upstream = answer(99, "overflow.test.", Some(Ipv4Addr::new(9, 9, 9, 9)));
        let action = dns.handle_answer(&upstream, now);
        assert_eq!(
            action,
            Some(DnsAction::Respond {
                client: client(),
                response: Bytes::from(upstream)
            })
        );
    }

    // ==========================================================================
    // Forward Path
    // ==========================================================================

    #[test]
    fn test_real_query_forwarded_verbatim() {
        let mut dns = interceptor(vec![]);
        let bytes = query(10, "plain.test.", RecordType::A);
        let action = dns.handle_query(&bytes, client(), Instant::now());
        assert_eq!(action, Some(DnsAction::Forward { query: Bytes::from(bytes) }));
        assert_eq!(dns.stats().pending, 1);

        let upstream = answer(10, "plain.test.", Some(Ipv4Addr::new(1, 1, 1, 1)));
        let action = dns.handle_answer(&upstream, Instant::now());
        assert!(matches!(action, Some(DnsAction::Respond { response, .. }) if response == upstream));
        assert_eq!(dns.stats().pending, 0);
    }

    #[test]
    fn test_non_internet_class_forwarded_as_real() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let now = Instant::now();
        let mut question = Query::query(Name::from_str("version.bind.").unwrap(), RecordType::A);
        question.set_query_class(DNSClass::CH);
        let mut msg = Message::new();
        msg.set_id(16);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(question);
        let bytes = msg.to_vec().unwrap();

        let action = dns.handle_query(&bytes, client(), now);
        assert_eq!(action, Some(DnsAction::Forward { query: Bytes::from(bytes) }));
        assert_eq!(dns.stats().pending, 1);
        assert_eq!(dns.stats().bound, 0);

        let mut reply = Message::new();
        reply.set_id(16);
        reply.set_message_type(MessageType::Response);
        reply.set_op_code(OpCode::Query);
        let mut echoed = Query::query(Name::from_str("version.bind.").unwrap(), RecordType::A);
        echoed.set_query_class(DNSClass::CH);
        reply.add_query(echoed);
        let upstream = reply.to_vec().unwrap();
        let action = dns.handle_answer(&upstream, now);
        assert!(matches!(action, Some(DnsAction::Respond { response, .. }) if response == upstream));
        assert_eq!(dns.stats().bound, 0);
    }

    #[test]
    fn test_duplicate_and_unknown_answers_ignored() {
        let mut dns = interceptor(vec![]);
        let now = Instant::now();
        dns.handle_query(&query(11, "dup.test.", RecordType::A), client(), now);

        let upstream = answer(11, "dup.test.", Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(dns.handle_answer(&upstream, now).is_some());
        assert!(dns.handle_answer(&upstream, now).is_none());
        assert!(dns.handle_answer(&answer(12, "x.test.", None), now).is_none());
        assert_eq!(dns.stats().unmatched_answers, 2);
    }

    #[test]
    fn test_question_mismatch_keeps_session() {
        let mut dns = interceptor(vec![]);
        let now = Instant::now();
        dns.handle_query(&query(13, "right.test.", RecordType::A), client(), now);
        assert!(dns.handle_answer(&answer(13, "wrong.test.", None), now).is_none());
        assert!(dns.handle_answer(&answer(13, "right.test.", None), now).is_some());
    }

    #[test]
    fn test_id_collision_replaces_pending() {
        let mut dns = interceptor(vec![]);
        let now = Instant::now();
        let other = DnsClient::Udp("127.0.0.1:40001".parse().unwrap());
        dns.handle_query(&query(14, "first.test.", RecordType::A), client(), now);
        dns.handle_query(&query(14, "second.test.", RecordType::A), other, now);
        assert_eq!(dns.stats().pending, 1);

        assert!(dns.handle_answer(&answer(14, "first.test.", None), now).is_none());
        let action = dns.handle_answer(&answer(14, "second.test.", None), now);
        assert!(matches!(action, Some(DnsAction::Respond { client, .. }) if client == other));
    }

    #[test]
    fn test_pending_timeout_swept() {
        let mut dns = interceptor(vec![]);
        let t0 = Instant::now();
        dns.handle_query(&query(15, "slow.test.", RecordType::A), client(), t0);
        dns.expire(t0 + Duration::from_secs(4));
        assert_eq!(dns.stats().pending, 1);
        dns.expire(t0 + Duration::from_secs(5));
        assert_eq!(dns.stats().pending, 0);
        assert_eq!(dns.stats().expired_pending, 1);
    }

    // ==========================================================================
    // Two-Phase Matching
    // ==========================================================================

    #[test]
    fn test_country_rule_fakes_after_answer() {
        let geoip = CountryTable::builder()
            .add_cidr("CN", "1.0.1.0/24")
            .unwrap()
            .add_cidr("US", "8.8.8.0/24")
            .unwrap()
            .build();
        let rules = RuleManager::new(vec![Rule::country("US", false, proxy())], true);
        let mut dns = DnsInterceptor::new(config(), Arc::new(rules), Arc::new(geoip)).unwrap();
        let now = Instant::now();

        let q = query(20, "site.cn.", RecordType::A);
        assert!(matches!(dns.handle_query(&q, client(), now), Some(DnsAction::Forward { .. })));
        let fake = respond_ip(dns.handle_answer(&answer(20, "site.cn.", Some(Ipv4Addr::new(1, 0, 1, 7))), now));
        let binding = dns.lookup_fake_ip(fake).unwrap();
        assert_eq!(binding.real_ip, Some(Ipv4Addr::new(1, 0, 1, 7)));
        assert_eq!(binding.country.as_deref(), Some("CN"));
        assert_eq!(binding.matched_rule, Some(0));

        let q = query(21, "site.us.", RecordType::A);
        dns.handle_query(&q, client(), now);
        let us = answer(21, "site.us.", Some(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(matches!(dns.handle_answer(&us, now), Some(DnsAction::Respond { response, .. }) if response == us));
    }

    #[test]
    fn test_no_a_record_passes_through() {
        let rules = RuleManager::new(vec![Rule::dns_fail(proxy())], true);
        let mut dns = DnsInterceptor::new(config(), Arc::new(rules), Arc::new(NoGeoIp)).unwrap();
        let now = Instant::now();
        dns.handle_query(&query(30, "nx.test.", RecordType::A), client(), now);
        let upstream = answer(30, "nx.test.", None);
        assert!(matches!(dns.handle_answer(&upstream, now), Some(DnsAction::Respond { response, .. }) if response == upstream));
        assert_eq!(dns.stats().bound, 0);
    }

    #[test]
    fn test_domain_list_decides_without_upstream() {
        let criteria = DomainCriteria::builder().add_suffix("blocked.test").build().unwrap();
        let mut dns = interceptor(vec![Rule::domain_list(criteria, proxy())]);
        let now = Instant::now();
        respond_ip(dns.handle_query(&query(40, "www.blocked.test.", RecordType::A), client(), now));
        assert!(matches!(
            dns.handle_query(&query(41, "open.test.", RecordType::A), client(), now),
            Some(DnsAction::Forward { .. })
        ));
    }

    // ==========================================================================
    // Malformed Input
    // ==========================================================================

    #[test]
    fn test_malformed_and_rejected_queries() {
        let mut dns = interceptor(vec![Rule::all(proxy())]);
        let now = Instant::now();
        assert!(dns.handle_query(&[0, 1, 2], client(), now).is_none());

        let mut msg = Message::new();
        msg.set_id(50);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        let action = dns.handle_query(&msg.to_vec().unwrap(), client(), now);
        let Some(DnsAction::Respond { response, .. }) = action else {
            panic!("expected FORMERR");
        };
        assert_eq!(Message::from_vec(&response).unwrap().response_code(), ResponseCode::FormErr);

        // A response masquerading as a query is dropped
        assert!(dns.handle_query(&answer(51, "x.test.", None), client(), now).is_none());
        assert_eq!(dns.stats().rejected, 1);
        assert_eq!(dns.stats().malformed, 2);
    }
}
