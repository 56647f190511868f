//! DNS server task
//!
//! [`DnsServer`] runs the [`DnsInterceptor`] on a private task. Everything
//! that touches the pool or the session maps (client queries, upstream
//! answers, reverse lookups, the expiry sweep) is serialized through that
//! task's channels. [`DnsServerHandle`] is the cheap, cloneable way in.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::config::DnsServerConfig;
use super::error::{DnsError, DnsResult};
use super::interceptor::{DnsAction, DnsInterceptor, DnsStats, FakeBinding};
use super::pool::PoolRange;
use super::resolver::UpstreamResolver;
use super::session::DnsClient;
use crate::ipstack::packet::build_udp_packet;
use crate::rules::{GeoIpLookup, RuleManager};

const COMMAND_QUEUE: usize = 1024;
const ANSWER_QUEUE: usize = 1024;

/// Requests to the server task
#[derive(Debug)]
enum DnsCommand {
    Query { bytes: Bytes, client: DnsClient },
    Lookup {
        ip: Ipv4Addr,
        reply: oneshot::Sender<Option<FakeBinding>>,
    },
    Stats { reply: oneshot::Sender<DnsStats> },
}

/// Handle to a running [`DnsServer`]
#[derive(Debug, Clone)]
pub struct DnsServerHandle {
    tx: mpsc::Sender<DnsCommand>,
    range: PoolRange,
    intercept: Option<SocketAddrV4>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DnsServerHandle {
    /// Whether `ip` lies in the fake range
    ///
    /// A pure range check: an address that was fake and has since expired
    /// still answers `true`.
    #[must_use]
    pub fn is_fake_ip(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(ip)
    }

    /// The fake address range
    #[must_use]
    pub fn fake_range(&self) -> PoolRange {
        self.range
    }

    /// Address the packet path delivers DNS queries to, if configured
    #[must_use]
    pub fn intercept_addr(&self) -> Option<SocketAddrV4> {
        self.intercept
    }

    /// Recover the domain behind a bound fake address
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ServerStopped` if the server task is gone.
    pub async fn lookup_fake_ip(&self, ip: Ipv4Addr) -> DnsResult<Option<FakeBinding>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DnsCommand::Lookup { ip, reply })
            .await
            .map_err(|_| DnsError::ServerStopped)?;
        rx.await.map_err(|_| DnsError::ServerStopped)
    }

    /// Submit a client query
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ServerStopped` if the server task is gone.
    pub async fn submit_query(&self, bytes: Bytes, client: DnsClient) -> DnsResult<()> {
        self.tx
            .send(DnsCommand::Query { bytes, client })
            .await
            .map_err(|_| DnsError::ServerStopped)
    }

    /// Interceptor counters
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ServerStopped` if the server task is gone.
    pub async fn stats(&self) -> DnsResult<DnsStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DnsCommand::Stats { reply })
            .await
            .map_err(|_| DnsError::ServerStopped)?;
        rx.await.map_err(|_| DnsError::ServerStopped)
    }

    /// Stop the server task
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// The DNS server task
pub struct DnsServer {
    interceptor: DnsInterceptor,
    sweep_interval: Duration,
    commands: mpsc::Receiver<DnsCommand>,
    answers_tx: mpsc::Sender<Bytes>,
    answers_rx: mpsc::Receiver<Bytes>,
    resolvers: Vec<Arc<dyn UpstreamResolver>>,
    udp_socket: Option<Arc<UdpSocket>>,
    packet_out: Option<mpsc::Sender<Bytes>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl DnsServer {
    /// Create a server and its handle
    ///
    /// The server does nothing until [`run`](Self::run) is spawned.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Pool` if the fake range is empty.
    pub fn new(
        config: DnsServerConfig,
        rules: Arc<RuleManager>,
        geoip: Arc<dyn GeoIpLookup>,
    ) -> DnsResult<(Self, DnsServerHandle)> {
        let sweep_interval = config.sweep_interval;
        let intercept = config.intercept_addr;
        let interceptor = DnsInterceptor::new(config, rules, geoip)?;
        let range = interceptor.fake_range();

        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (answers_tx, answers_rx) = mpsc::channel(ANSWER_QUEUE);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let server = Self {
            interceptor,
            sweep_interval,
            commands,
            answers_tx,
            answers_rx,
            resolvers: Vec::new(),
            udp_socket: None,
            packet_out: None,
            shutdown_rx,
        };
        let handle = DnsServerHandle {
            tx,
            range,
            intercept,
            shutdown_tx,
        };
        Ok((server, handle))
    }

    /// Channel upstream resolvers deliver answers into
    #[must_use]
    pub fn answer_sender(&self) -> mpsc::Sender<Bytes> {
        self.answers_tx.clone()
    }

    /// Register an upstream resolver
    pub fn add_resolver(&mut self, resolver: Arc<dyn UpstreamResolver>) {
        info!(upstream = resolver.tag(), "Registered upstream DNS resolver");
        self.resolvers.push(resolver);
    }

    /// Socket used to answer [`DnsClient::Udp`] clients
    pub fn set_udp_socket(&mut self, socket: Arc<UdpSocket>) {
        self.udp_socket = Some(socket);
    }

    /// Channel receiving synthesized packets for [`DnsClient::Packet`] clients
    pub fn set_packet_output(&mut self, output: mpsc::Sender<Bytes>) {
        self.packet_out = Some(output);
    }

    /// Run until shut down or every handle is dropped
    pub async fn run(mut self) {
        if self.resolvers.is_empty() {
            warn!("DNS server has no upstream resolvers, real answers will never arrive");
        }
        info!(range = %self.interceptor.fake_range(), "DNS server started");

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    debug!("DNS server received shutdown signal");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(answer) = self.answers_rx.recv() => {
                    let action = self.interceptor.handle_answer(&answer, Instant::now());
                    self.perform(action).await;
                }
                _ = sweep.tick() => {
                    self.interceptor.expire(Instant::now());
                }
            }
        }

        let stats = self.interceptor.stats();
        info!(
            queries = stats.queries,
            fake = stats.fake_answers,
            forwarded = stats.forwarded,
            "DNS server stopped"
        );
    }

    async fn handle_command(&mut self, command: DnsCommand) {
        match command {
            DnsCommand::Query { bytes, client } => {
                let action = self.interceptor.handle_query(&bytes, client, Instant::now());
                self.perform(action).await;
            }
            DnsCommand::Lookup { ip, reply } => {
                let _ = reply.send(self.interceptor.lookup_fake_ip(ip));
            }
            DnsCommand::Stats { reply } => {
                let _ = reply.send(self.interceptor.stats());
            }
        }
    }

    async fn perform(&self, action: Option<DnsAction>) {
        match action {
            None => {}
            Some(DnsAction::Forward { query }) => {
                for resolver in &self.resolvers {
                    if let Err(e) = resolver.send(&query).await {
                        warn!(upstream = resolver.tag(), error = %e, "Failed to forward DNS query");
                    }
                }
            }
            Some(DnsAction::Respond { client, response }) => self.reply(client, response).await,
        }
    }

    async fn reply(&self, client: DnsClient, response: Bytes) {
        match client {
            DnsClient::Udp(addr) => {
                let Some(socket) = &self.udp_socket else {
                    debug!(%client, "No UDP socket to answer on");
                    return;
                };
                if let Err(e) = socket.send_to(&response, addr).await {
                    debug!(%client, error = %e, "Failed to send DNS response");
                }
            }
            DnsClient::Packet { client: to, server } => {
                let Some(output) = &self.packet_out else {
                    debug!(%client, "No packet output to answer on");
                    return;
                };
                let packet = build_udp_packet(server, to, &response);
                // The consumer may be the producer of our queries; never block on it
                if output.try_send(packet).is_err() {
                    trace!(%client, "Packet output full, dropping DNS response");
                }
            }
        }
    }
}

impl std::fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServer")
            .field("range", &self.interceptor.fake_range())
            .field("resolvers", &self.resolvers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use async_trait::async_trait;
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use parking_lot::Mutex;

    use super::*;
    use crate::adapter::{AdapterFactory, RejectAdapterFactory};
    use crate::fakedns::processor::first_a_record;
    use crate::ipstack::packet::PacketParser;
    use crate::rules::{NoGeoIp, Rule};

    #[derive(Debug, Default)]
    struct RecordingResolver {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl UpstreamResolver for RecordingResolver {
        fn tag(&self) -> &str {
            "recording"
        }

        async fn send(&self, query: &[u8]) -> DnsResult<()> {
            self.sent.lock().push(query.to_vec());
            Ok(())
        }
    }

    fn server(rules: Vec<Rule>) -> (DnsServer, DnsServerHandle) {
        let config = DnsServerConfig::new().with_fake_range("198.18.0.0/24".parse().unwrap());
        DnsServer::new(config, Arc::new(RuleManager::new(rules, true)), Arc::new(NoGeoIp)).unwrap()
    }

    fn proxy() -> Arc<dyn AdapterFactory> {
        Arc::new(RejectAdapterFactory::new("proxy"))
    }

    fn query(id: u16, name: &str) -> Bytes {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        Bytes::from(msg.to_vec().unwrap())
    }

    #[tokio::test]
    async fn test_packet_client_gets_fake_answer() {
        let (mut server, handle) = server(vec![Rule::all(proxy())]);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        server.set_packet_output(out_tx);
        tokio::spawn(server.run());

        let client = DnsClient::Packet {
            client: "10.0.0.2:5353".parse().unwrap(),
            server: "10.0.0.1:53".parse().unwrap(),
        };
        handle.submit_query(query(1, "example.com."), client).await.unwrap();

        let packet = out_rx.recv().await.unwrap();
        let datagram = PacketParser::parse_udp(&packet).unwrap();
        assert_eq!(datagram.source, "10.0.0.1:53".parse().unwrap());
        assert_eq!(datagram.destination, "10.0.0.2:5353".parse().unwrap());

        let fake = first_a_record(&Message::from_vec(&datagram.payload).unwrap()).unwrap();
        assert!(handle.is_fake_ip(fake));
        let binding = handle.lookup_fake_ip(fake).await.unwrap().unwrap();
        assert_eq!(binding.domain, "example.com");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_real_query_fans_out_to_resolvers() {
        let (mut server, handle) = server(vec![]);
        let first = Arc::new(RecordingResolver::default());
        let second = Arc::new(RecordingResolver::default());
        server.add_resolver(first.clone());
        server.add_resolver(second.clone());
        tokio::spawn(server.run());

        let q = query(7, "plain.test.");
        handle
            .submit_query(q.clone(), DnsClient::Udp("127.0.0.1:1".parse().unwrap()))
            .await
            .unwrap();

        // Stats are answered after the query was processed
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(first.sent.lock().as_slice(), &[q.to_vec()]);
        assert_eq!(second.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_server_reports_error() {
        let (server, handle) = server(vec![]);
        drop(server);
        assert!(matches!(
            handle.lookup_fake_ip(Ipv4Addr::new(198, 18, 0, 1)).await,
            Err(DnsError::ServerStopped)
        ));
        assert!(handle.is_fake_ip(Ipv4Addr::new(198, 18, 0, 1)));
        assert!(!handle.is_fake_ip(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
