//! End-to-end tunnel tests
//!
//! A real [`ProxyListener`] accepts loopback clients and relays them to a
//! local echo server through adapters built from JSON configuration.
//!
//! # Test Categories
//!
//! 1. **Direct**: SOCKS5 and HTTP CONNECT straight to the destination
//! 2. **Chained**: one router used as the upstream SOCKS5/HTTP proxy of another
//! 3. **Policy**: reject and speed adapters
//! 4. **Plain HTTP**: absolute-form requests rewritten and forwarded

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use policy_router::adapter::AdapterRegistry;
use policy_router::config::load_config_str;
use policy_router::connection::TunnelManager;
use policy_router::proxy::{ProxyKind, ProxyListener};
use policy_router::rules::NoGeoIp;
use policy_router::session::SessionContext;
use policy_router::tunnel::{TunnelContext, TunnelReport};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fixtures
// ============================================================================

/// TCP server echoing every byte until the client half-closes
async fn echo_server() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
        unreachable!()
    };
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn manager(json: &str) -> Arc<TunnelManager> {
    let config = load_config_str(json).unwrap();
    let registry = AdapterRegistry::from_config(&config.adapters, &config.connection).unwrap();
    let rules = Arc::new(registry.build_rules(&config.rules, config.append_direct).unwrap());
    let ctx = TunnelContext::new(rules, SessionContext::new(Arc::new(NoGeoIp)));
    Arc::new(TunnelManager::new(&config.connection, Arc::new(ctx)))
}

/// Router that sends everything direct
fn direct_manager() -> Arc<TunnelManager> {
    manager(r#"{ "listen": { "socks5": "127.0.0.1:1080" } }"#)
}

/// Bind a listener on an ephemeral port and run it
fn start(kind: ProxyKind, manager: Arc<TunnelManager>) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), kind, manager).unwrap();
    let addr = listener.listen_addr();
    let (stop_tx, stop_rx) = broadcast::channel(1);
    tokio::spawn(listener.run(stop_rx));
    (addr, stop_tx)
}

/// SOCKS5 handshake for an IPv4 destination; returns the reply code
async fn socks5_connect(stream: &mut TcpStream, target: SocketAddrV4) -> Option<u8> {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    match tokio::time::timeout(TIMEOUT, stream.read_exact(&mut reply)).await {
        Ok(Ok(_)) => Some(reply[1]),
        _ => None,
    }
}

async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

async fn next_report(rx: &mut broadcast::Receiver<Arc<TunnelReport>>) -> Arc<TunnelReport> {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("no tunnel report")
        .unwrap()
}

// ============================================================================
// Direct
// ============================================================================

#[tokio::test]
async fn test_socks5_direct_relay() {
    let echo = echo_server().await;
    let manager = direct_manager();
    let mut reports = manager.subscribe();
    let (proxy, _stop) = start(ProxyKind::Socks5, Arc::clone(&manager));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
    assert_echo(&mut client, b"hello").await;
    assert_echo(&mut client, b"world!").await;
    drop(client);

    let report = next_report(&mut reports).await;
    assert_eq!(report.adapter.as_deref(), Some("direct"));
    assert_eq!(report.bytes_up, 11);
    assert_eq!(report.bytes_down, 11);
    assert!(!report.is_error());

    let stats = manager.stats_snapshot();
    assert_eq!(stats.total_accepted, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(manager.adapter_snapshot()["direct"].tunnels, 1);
}

#[tokio::test]
async fn test_http_connect_direct_relay() {
    let echo = echo_server().await;
    let (proxy, _stop) = start(ProxyKind::Http, direct_manager());

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut reply = vec![0u8; expected.len()];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, expected);

    assert_echo(&mut client, b"over http connect").await;
}

#[tokio::test]
async fn test_concurrent_tunnels() {
    let echo = echo_server().await;
    let manager = direct_manager();
    let (proxy, _stop) = start(ProxyKind::Socks5, Arc::clone(&manager));

    let clients = (0..8u8).map(|i| {
        tokio::spawn(async move {
            let mut client = TcpStream::connect(proxy).await.unwrap();
            assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
            assert_echo(&mut client, &[i; 64]).await;
        })
    });
    for client in futures::future::join_all(clients).await {
        client.unwrap();
    }
    assert_eq!(manager.stats_snapshot().total_accepted, 8);
}

// ============================================================================
// Chained
// ============================================================================

#[tokio::test]
async fn test_upstream_socks5_chain() {
    let echo = echo_server().await;
    let (upstream, _upstream_stop) = start(ProxyKind::Socks5, direct_manager());

    let edge = manager(&format!(
        r#"{{
            "listen": {{ "socks5": "127.0.0.1:1080" }},
            "adapters": [{{ "type": "socks5", "id": "up", "host": "127.0.0.1", "port": {} }}],
            "rules": [{{ "type": "all", "adapter": "up" }}]
        }}"#,
        upstream.port()
    ));
    let mut reports = edge.subscribe();
    let (proxy, _stop) = start(ProxyKind::Socks5, edge);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
    assert_echo(&mut client, b"two hops").await;
    drop(client);

    let report = next_report(&mut reports).await;
    assert_eq!(report.adapter.as_deref(), Some("up"));
    assert_eq!(report.rule, Some(0));
}

#[tokio::test]
async fn test_upstream_http_chain() {
    let echo = echo_server().await;
    let (upstream, _upstream_stop) = start(ProxyKind::Http, direct_manager());

    let edge = manager(&format!(
        r#"{{
            "listen": {{ "socks5": "127.0.0.1:1080" }},
            "adapters": [{{ "type": "http", "id": "corp", "host": "127.0.0.1", "port": {} }}],
            "rules": [{{ "type": "all", "adapter": "corp" }}]
        }}"#,
        upstream.port()
    ));
    let (proxy, _stop) = start(ProxyKind::Socks5, edge);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
    assert_echo(&mut client, b"through an http proxy").await;
}

// ============================================================================
// Policy
// ============================================================================

#[tokio::test]
async fn test_reject_closes_client() {
    let echo = echo_server().await;
    let manager = manager(
        r#"{
            "listen": { "socks5": "127.0.0.1:1080" },
            "adapters": [{ "type": "reject", "id": "block", "delay_ms": 0 }],
            "rules": [{ "type": "ip_range_list", "ranges": ["127.0.0.0/8"], "adapter": "block" }]
        }"#,
    );
    let mut reports = manager.subscribe();
    let (proxy, _stop) = start(ProxyKind::Socks5, Arc::clone(&manager));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_ne!(socks5_connect(&mut client, echo).await, Some(0x00));

    let report = next_report(&mut reports).await;
    assert_eq!(report.adapter.as_deref(), Some("block"));
    assert!(report.is_error());
    assert_eq!(manager.stats_snapshot().errored, 1);
}

#[tokio::test]
async fn test_speed_skips_failing_candidate() {
    let echo = echo_server().await;
    let dead = closed_port().await;
    let manager = manager(&format!(
        r#"{{
            "listen": {{ "socks5": "127.0.0.1:1080" }},
            "adapters": [
                {{ "type": "socks5", "id": "dead", "host": "127.0.0.1", "port": {dead} }},
                {{ "type": "speed", "id": "race", "candidates": [
                    {{ "adapter": "dead" }},
                    {{ "adapter": "direct", "delay_ms": 50 }}
                ] }}
            ],
            "rules": [{{ "type": "all", "adapter": "race" }}]
        }}"#
    ));
    let (proxy, _stop) = start(ProxyKind::Socks5, manager);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
    assert_echo(&mut client, b"raced").await;
}

// ============================================================================
// Plain HTTP
// ============================================================================

#[tokio::test]
async fn test_plain_http_request_forwarded() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = server.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let origin_form = head.starts_with(b"GET /hello HTTP/1.1\r\n");
        let closes = head.windows(19).any(|w| w == b"Connection: close\r\n");
        let status: &[u8] = if origin_form && closes {
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
        } else {
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 3\r\n\r\nbad"
        };
        stream.write_all(status).await.unwrap();
    });

    let (proxy, _stop) = start(ProxyKind::Http, direct_manager());
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET http://{server_addr}/hello HTTP/1.1\r\nHost: {server_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    while !response.ends_with(b"ok") && !response.ends_with(b"bad") {
        let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early");
        response.extend_from_slice(&buf[..n]);
    }
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_open_tunnels() {
    let echo = echo_server().await;
    let manager = direct_manager();
    let (proxy, stop) = start(ProxyKind::Socks5, Arc::clone(&manager));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(socks5_connect(&mut client, echo).await, Some(0x00));
    assert_eq!(manager.active_tunnels(), 1);

    let _ = stop.send(());
    manager.shutdown().await;
    assert_eq!(manager.active_tunnels(), 0);

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
