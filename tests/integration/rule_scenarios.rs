//! Configuration-driven routing scenarios
//!
//! Rules are written as JSON, compiled through the adapter registry and
//! evaluated against sessions built the way tunnels build them, with country
//! data loaded from a directory of per-country files.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tempfile::TempDir;

use policy_router::adapter::AdapterRegistry;
use policy_router::config::load_config_str;
use policy_router::rules::{
    CountryTable, DnsQueryView, DnsVerdict, GeoIpLookup, MatchPhase, MatchState, RuleManager,
};
use policy_router::session::SessionContext;

// ============================================================================
// Fixtures
// ============================================================================

/// Country table with 1.0.0.0/8 in CN and 5.0.0.0/8 in US
fn country_table() -> (TempDir, Arc<dyn GeoIpLookup>) {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("cn.json"),
        r#"{ "country_code": "cn", "ipv4_ranges": ["1.0.0.0/8"] }"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("us.json"),
        r#"{ "country_code": "US", "ipv4_ranges": ["5.0.0.0/8", "bogus"] }"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("README"), "ignored").unwrap();

    let table = CountryTable::builder().load_dir(dir.path()).unwrap().build();
    assert_eq!(table.country_count(), 2);
    assert_eq!(table.cidr_count(), 2);
    (dir, Arc::new(table))
}

/// Compile the adapters and rules of a configuration fragment
fn rules(adapters: &str, rules: &str, append_direct: bool) -> RuleManager {
    let json = format!(
        r#"{{
            "listen": {{ "socks5": "127.0.0.1:1080" }},
            "adapters": {adapters},
            "rules": {rules},
            "append_direct": {append_direct}
        }}"#
    );
    let config = load_config_str(&json).unwrap();
    let registry = AdapterRegistry::from_config(&config.adapters, &config.connection).unwrap();
    registry.build_rules(&config.rules, config.append_direct).unwrap()
}

const PROXY_A: &str = r#"[{ "type": "socks5", "id": "proxy-a", "host": "127.0.0.1", "port": 1081 }]"#;

/// Adapter id and rule index chosen for `host`
async fn route(manager: &RuleManager, sessions: &SessionContext, host: &str) -> (String, Option<usize>) {
    let session = sessions.create(host, 443).await.unwrap();
    let matched = manager.match_connect(&session);
    (matched.factory.id().to_string(), matched.rule)
}

// ============================================================================
// Country
// ============================================================================

#[tokio::test]
async fn test_country_rule_proxies_foreign_addresses() {
    let (_dir, geoip) = country_table();
    let sessions = SessionContext::new(geoip);
    let manager = rules(
        PROXY_A,
        r#"[{ "type": "country", "country": "us", "match": false, "adapter": "proxy-a" }]"#,
        true,
    );

    assert_eq!(route(&manager, &sessions, "1.2.3.4").await, ("proxy-a".to_string(), Some(0)));
    assert_eq!(route(&manager, &sessions, "5.6.7.8").await, ("direct".to_string(), Some(1)));
}

#[tokio::test]
async fn test_country_rule_inverted() {
    let (_dir, geoip) = country_table();
    let sessions = SessionContext::new(geoip);
    let manager = rules(
        PROXY_A,
        r#"[{ "type": "country", "country": "US", "adapter": "proxy-a" }]"#,
        true,
    );

    assert_eq!(route(&manager, &sessions, "5.6.7.8").await, ("proxy-a".to_string(), Some(0)));
    assert_eq!(route(&manager, &sessions, "1.2.3.4").await, ("direct".to_string(), Some(1)));
}

// ============================================================================
// Ordering and fallback
// ============================================================================

#[tokio::test]
async fn test_first_firing_rule_wins() {
    let (_dir, geoip) = country_table();
    let sessions = SessionContext::new(geoip);
    let manager = rules(
        r#"[
            { "type": "http", "id": "corp", "host": "proxy.corp.example", "port": 3128 },
            { "type": "reject", "id": "block" }
        ]"#,
        r#"[
            { "type": "domain_list", "criteria": [{ "suffix": "corp.example" }], "adapter": "corp" },
            { "type": "ip_range_list", "ranges": ["10.0.0.0/8"], "adapter": "block" },
            { "type": "all", "adapter": "block" }
        ]"#,
        false,
    );

    assert_eq!(route(&manager, &sessions, "git.corp.example").await, ("corp".to_string(), Some(0)));
    assert_eq!(route(&manager, &sessions, "corp.example").await, ("corp".to_string(), Some(0)));
    assert_eq!(route(&manager, &sessions, "10.1.2.3").await, ("block".to_string(), Some(1)));
    assert_eq!(route(&manager, &sessions, "example.org").await, ("block".to_string(), Some(2)));
}

#[tokio::test]
async fn test_empty_rules_fall_back_to_direct() {
    let (_dir, geoip) = country_table();
    let sessions = SessionContext::new(geoip);
    let manager = rules("[]", "[]", false);
    assert!(manager.is_empty());

    assert_eq!(route(&manager, &sessions, "example.org").await, ("direct".to_string(), None));
    assert_eq!(route(&manager, &sessions, "1.2.3.4").await, ("direct".to_string(), None));
}

#[tokio::test]
async fn test_unresolved_domain_hits_dns_fail() {
    let (_dir, geoip) = country_table();
    let sessions = SessionContext::new(geoip);
    let manager = rules(
        PROXY_A,
        r#"[
            { "type": "ip_range_list", "ranges": ["5.0.0.0/8"], "adapter": "proxy-a" },
            { "type": "dns_fail", "adapter": "reject" }
        ]"#,
        true,
    );
    assert!(manager.needs_resolved_ip());

    // No resolver configured, so domains stay unresolved
    assert_eq!(route(&manager, &sessions, "nowhere.test").await, ("reject".to_string(), Some(1)));
    assert_eq!(route(&manager, &sessions, "5.1.1.1").await, ("proxy-a".to_string(), Some(0)));
    assert_eq!(route(&manager, &sessions, "1.1.1.1").await, ("direct".to_string(), Some(2)));
}

// ============================================================================
// DNS phases
// ============================================================================

#[test]
fn test_dns_phases_from_config() {
    let manager = rules(
        PROXY_A,
        r#"[
            { "type": "domain_list", "criteria": [{ "keyword": "ads" }], "adapter": "reject" },
            { "type": "country", "country": "CN", "adapter": "proxy-a" }
        ]"#,
        true,
    );
    let view = |domain, real_ip, country| DnsQueryView {
        domain,
        real_ip,
        country,
    };

    // Non-direct adapter answers with a fake address
    let state = manager.match_dns(
        MatchState::NotStarted,
        &view("ads.example", None, None),
        MatchPhase::DomainOnly,
    );
    assert_eq!(
        state,
        MatchState::Done {
            rule: Some(0),
            verdict: DnsVerdict::Fake
        }
    );

    // Country needs the upstream answer
    let pending = manager.match_dns(
        MatchState::NotStarted,
        &view("site.test", None, None),
        MatchPhase::DomainOnly,
    );
    assert_eq!(pending, MatchState::Resumable { index: 1 });

    let cn = view("site.test", Some(Ipv4Addr::new(1, 2, 3, 4)), Some("CN"));
    assert_eq!(
        manager.match_dns(pending, &cn, MatchPhase::ResolvedIp),
        MatchState::Done {
            rule: Some(1),
            verdict: DnsVerdict::Fake
        }
    );

    let us = view("site.test", Some(Ipv4Addr::new(5, 6, 7, 8)), Some("US"));
    assert_eq!(
        manager.match_dns(pending, &us, MatchPhase::ResolvedIp),
        MatchState::Done {
            rule: Some(2),
            verdict: DnsVerdict::Real
        }
    );
}
