//! Fake-IP DNS round trips
//!
//! A client asks the DNS listener for a proxied domain, receives a fake
//! address, then connects to that address. The tunnel (TCP) or the direct
//! UDP stack (virtual interface) must recover the domain behind it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};

use policy_router::adapter::{AdapterFactory, DialTarget, Outbound, StreamAdapter};
use policy_router::config::ConnectionConfig;
use policy_router::connection::TunnelManager;
use policy_router::fakedns::processor::first_a_record;
use policy_router::fakedns::{DnsServer, DnsServerConfig, DnsServerHandle, DnsUdpListener};
use policy_router::ipstack::{build_udp_packet, Dispatch, PacketDispatcher, PacketParser, UdpDirectStack};
use policy_router::proxy::{ProxyKind, ProxyListener};
use policy_router::rules::{NoGeoIp, Rule, RuleManager};
use policy_router::session::{ConnectSession, HostResolver, SessionContext};
use policy_router::socket::AdapterSocket;
use policy_router::transport::{BoxedStream, Dialer, TransportError};
use policy_router::tunnel::TunnelContext;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fixtures
// ============================================================================

/// Dialer recording requested hosts and always connecting to `target`
#[derive(Debug)]
struct RecordingDialer {
    target: SocketAddr,
    dialed: Mutex<Vec<(String, u16)>>,
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        self.dialed.lock().push((host.to_string(), port));
        let stream = TcpStream::connect(self.target).await?;
        Ok(Box::new(stream))
    }
}

/// Non-direct adapter dialing host names through a [`RecordingDialer`]
#[derive(Debug)]
struct RecordingFactory {
    outbound: Outbound,
}

impl AdapterFactory for RecordingFactory {
    fn id(&self) -> &str {
        "recorded"
    }

    fn make_adapter(&self, _session: &ConnectSession) -> Box<dyn AdapterSocket> {
        Box::new(StreamAdapter::new("recorded", self.outbound.transport(), DialTarget::HostName))
    }
}

#[derive(Debug)]
struct FixedResolver(IpAddr);

#[async_trait]
impl HostResolver for FixedResolver {
    async fn resolve(&self, _host: &str) -> Option<IpAddr> {
        Some(self.0)
    }
}

async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
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

async fn udp_echo_server() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], peer).await;
        }
    });
    port
}

fn dns_config() -> DnsServerConfig {
    DnsServerConfig::new().with_fake_range("198.18.0.0/24".parse().unwrap())
}

fn query(id: u16, name: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
    message.to_vec().unwrap()
}

/// Start a DNS server with a UDP listener; returns the listener address
async fn start_dns(config: DnsServerConfig, rules: Arc<RuleManager>) -> (DnsServerHandle, SocketAddr) {
    let (mut server, handle) = DnsServer::new(config, rules, Arc::new(NoGeoIp)).unwrap();
    let listener = DnsUdpListener::bind("127.0.0.1:0".parse().unwrap(), &mut server, handle.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run());
    tokio::spawn(listener.run());
    (handle, addr)
}

/// Ask `dns` for the A record of `name` over UDP
async fn resolve_fake(dns: SocketAddr, id: u16, name: &str) -> Ipv4Addr {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query(id, name), dns).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no DNS answer")
        .unwrap();
    let answer = Message::from_vec(&buf[..len]).unwrap();
    assert_eq!(answer.id(), id);
    first_a_record(&answer).expect("answer without A record")
}

// ============================================================================
// TCP through the tunnel
// ============================================================================

#[tokio::test]
async fn test_fake_ip_connect_recovers_domain() {
    let echo = tcp_echo_server().await;
    let dialer = Arc::new(RecordingDialer {
        target: echo,
        dialed: Mutex::new(Vec::new()),
    });
    let factory: Arc<dyn AdapterFactory> = Arc::new(RecordingFactory {
        outbound: Outbound::new(dialer.clone(), TIMEOUT),
    });
    let rules = Arc::new(RuleManager::new(vec![Rule::all(factory)], true));
    let (dns, dns_addr) = start_dns(dns_config(), Arc::clone(&rules)).await;

    let fake = resolve_fake(dns_addr, 0x1234, "example.com.").await;
    assert!(dns.is_fake_ip(fake));

    let sessions = SessionContext::new(Arc::new(NoGeoIp)).with_dns(dns.clone());
    let ctx = Arc::new(TunnelContext::new(rules, sessions));
    let manager = Arc::new(TunnelManager::new(&ConnectionConfig::default(), ctx));
    let mut reports = manager.subscribe();
    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), ProxyKind::Socks5, manager).unwrap();
    let proxy = listener.listen_addr();
    let (_stop, stop_rx) = broadcast::channel(1);
    tokio::spawn(listener.run(stop_rx));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&fake.octets());
    request.extend_from_slice(&443u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    drop(client);

    assert_eq!(dialer.dialed.lock().as_slice(), &[("example.com".to_string(), 443)]);

    let report = tokio::time::timeout(TIMEOUT, reports.recv()).await.unwrap().unwrap();
    let session = report.session.as_ref().unwrap();
    assert_eq!(session.host(), "example.com");
    assert_eq!(session.requested_host(), fake.to_string());
    assert!(session.fake_ip_rewritten());
    dns.shutdown();
}

#[tokio::test]
async fn test_unallocated_fake_ip_closes_client() {
    let rules = Arc::new(RuleManager::new(Vec::new(), true));
    let (dns, _) = start_dns(dns_config(), Arc::clone(&rules)).await;

    let sessions = SessionContext::new(Arc::new(NoGeoIp)).with_dns(dns.clone());
    let ctx = Arc::new(TunnelContext::new(rules, sessions));
    let manager = Arc::new(TunnelManager::new(&ConnectionConfig::default(), ctx));
    let mut reports = manager.subscribe();
    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), ProxyKind::Http, manager).unwrap();
    let proxy = listener.listen_addr();
    let (_stop, stop_rx) = broadcast::channel(1);
    tokio::spawn(listener.run(stop_rx));

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT 198.18.0.200:443 HTTP/1.1\r\nHost: 198.18.0.200:443\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(TIMEOUT, client.read_to_end(&mut buf)).await.unwrap();
    assert!(read.is_err() || !buf.starts_with(b"HTTP/1.1 200"));

    let report = tokio::time::timeout(TIMEOUT, reports.recv()).await.unwrap().unwrap();
    assert!(report.is_error());
    assert!(report.adapter.is_none());
    dns.shutdown();
}

// ============================================================================
// Binding lifetime
// ============================================================================

#[tokio::test]
async fn test_binding_expires() {
    let proxy: Arc<dyn AdapterFactory> = Arc::new(policy_router::adapter::RejectAdapterFactory::new("proxy"));
    let rules = Arc::new(RuleManager::new(vec![Rule::all(proxy)], true));
    let config = dns_config()
        .with_fake_ttl(Duration::from_millis(100))
        .with_sweep_interval(Duration::from_millis(50));
    let (dns, dns_addr) = start_dns(config, rules).await;

    let fake = resolve_fake(dns_addr, 1, "short.example.").await;
    let binding = dns.lookup_fake_ip(fake).await.unwrap().unwrap();
    assert_eq!(binding.domain, "short.example");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(dns.is_fake_ip(fake));
    assert!(dns.lookup_fake_ip(fake).await.unwrap().is_none());

    let stats = dns.stats().await.unwrap();
    assert_eq!(stats.expired_bindings, 1);
    dns.shutdown();
}

// ============================================================================
// Virtual-interface UDP
// ============================================================================

#[tokio::test]
async fn test_udp_to_fake_destination_is_rewritten() {
    let echo_port = udp_echo_server().await;
    let proxy: Arc<dyn AdapterFactory> = Arc::new(policy_router::adapter::RejectAdapterFactory::new("proxy"));
    let rules = Arc::new(RuleManager::new(vec![Rule::all(proxy)], true));

    // Inside the fake range, so it must never be handed out as a fake address
    let intercept: SocketAddrV4 = "198.18.0.1:53".parse().unwrap();
    let client: SocketAddrV4 = "10.0.0.2:40000".parse().unwrap();
    let (mut server, dns) = DnsServer::new(
        dns_config().with_intercept_addr(intercept),
        rules,
        Arc::new(NoGeoIp),
    )
    .unwrap();
    let (packets_tx, mut packets_rx) = mpsc::channel::<Bytes>(16);
    server.set_packet_output(packets_tx.clone());
    tokio::spawn(server.run());

    let stack = UdpDirectStack::new(packets_tx)
        .with_dns(dns.clone())
        .with_resolver(Arc::new(FixedResolver(IpAddr::V4(Ipv4Addr::LOCALHOST))));
    let dispatcher = PacketDispatcher::new()
        .with_dns(dns.clone())
        .with_udp(Arc::new(stack));

    // DNS answer comes back as a packet from the intercept address
    let packet = build_udp_packet(client, intercept, &query(9, "game.example."));
    assert_eq!(dispatcher.dispatch(&packet).await, Dispatch::Dns);
    let answer = tokio::time::timeout(TIMEOUT, packets_rx.recv()).await.unwrap().unwrap();
    let answer = PacketParser::parse_udp(&answer).unwrap();
    assert_eq!(answer.source, intercept);
    let fake = first_a_record(&Message::from_vec(&answer.payload).unwrap()).unwrap();
    assert_ne!(fake, *intercept.ip());

    // Datagram to the fake address reaches the real one and returns from the fake
    let destination = SocketAddrV4::new(fake, echo_port);
    let packet = build_udp_packet(client, destination, b"udp payload");
    assert_eq!(dispatcher.dispatch(&packet).await, Dispatch::Udp);

    let reply = tokio::time::timeout(TIMEOUT, packets_rx.recv()).await.unwrap().unwrap();
    let reply = PacketParser::parse_udp(&reply).unwrap();
    assert_eq!(reply.source, destination);
    assert_eq!(reply.destination, client);
    assert_eq!(&reply.payload[..], b"udp payload");
    dns.shutdown();
}
