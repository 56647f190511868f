//! policy-router: rule-based local proxy with fake-IP DNS
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! policy-router
//!
//! # Run with a custom configuration and debug logging
//! policy-router -c /path/to/config.json --log-level debug
//!
//! # Run with environment overrides
//! POLICY_ROUTER_LOG_LEVEL=debug policy-router
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use policy_router::adapter::AdapterRegistry;
use policy_router::config::{load_config_with_env, Config, GeoIpConfig, ENV_PREFIX};
use policy_router::connection::TunnelManager;
use policy_router::fakedns::{DnsServer, DnsServerHandle, DnsUdpListener, UdpResolver};
use policy_router::proxy::{ProxyKind, ProxyListener};
use policy_router::rules::{CountryTable, GeoIpLookup, NoGeoIp, RuleManager};
use policy_router::session::{SessionContext, SystemResolver};
use policy_router::tunnel::TunnelContext;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Log level overriding the configuration
    log_level: Option<String>,
    /// Force JSON log output
    log_json: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/policy-router/config.json");
        let mut log_level = None;
        let mut log_json = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--log-level" => log_level = args.next(),
                "--log-json" => log_json = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("policy-router v{}", policy_router::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            log_level,
            log_json,
        }
    }
}

fn print_help() {
    println!(
        r"policy-router v{}
Rule-based SOCKS5/HTTP proxy with fake-IP DNS.

USAGE:
    policy-router [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/policy-router/config.json]
    --log-level <LEVEL>     Log level (trace, debug, info, warn, error)
    --log-json              Emit JSON log lines
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    {prefix}SOCKS_LISTEN      Override the SOCKS5 listen address
    {prefix}HTTP_LISTEN       Override the HTTP listen address
    {prefix}DNS_LISTEN        Override the DNS listen address
    {prefix}LOG_LEVEL         Override log level
    {prefix}MAX_CONNECTIONS   Override maximum concurrent tunnels
    RUST_LOG                           Full tracing filter, takes precedence
",
        policy_router::VERSION,
        prefix = ENV_PREFIX,
    );
}

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{},hickory_proto=warn", config.log.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.is_json() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Country table from the configured files
fn build_geoip(config: &GeoIpConfig) -> Result<Arc<dyn GeoIpLookup>> {
    if config.is_empty() {
        info!("No GeoIP data configured, country rules never match");
        return Ok(Arc::new(NoGeoIp));
    }

    let mut builder = CountryTable::builder();
    for file in &config.files {
        builder = builder.load_file(file)?;
    }
    if let Some(dir) = &config.dir {
        builder = builder.load_dir(dir)?;
    }
    let table = builder.build();
    info!(
        "Loaded GeoIP data: {} countries, {} ranges",
        table.country_count(),
        table.cidr_count()
    );
    Ok(Arc::new(table))
}

/// Start the DNS server and its UDP front end
async fn start_dns(
    config: &Config,
    rules: Arc<RuleManager>,
    geoip: Arc<dyn GeoIpLookup>,
) -> Result<(DnsServerHandle, Vec<JoinHandle<()>>)> {
    let (mut server, handle) = DnsServer::new(config.dns.server_config()?, rules, geoip)?;

    for upstream in &config.dns.upstreams {
        let resolver = UdpResolver::connect(*upstream, server.answer_sender())
            .await
            .with_context(|| format!("Failed to connect to upstream DNS {upstream}"))?;
        server.add_resolver(Arc::new(resolver));
    }

    let listener = DnsUdpListener::bind(config.dns.listen, &mut server, handle.clone())
        .await
        .with_context(|| format!("Failed to bind DNS listener on {}", config.dns.listen))?;
    info!(
        "DNS server on {} (fake range {}, {} upstreams)",
        config.dns.listen,
        handle.fake_range(),
        config.dns.upstreams.len()
    );

    let tasks = vec![tokio::spawn(server.run()), tokio::spawn(listener.run())];
    Ok((handle, tasks))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    let mut config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.log_json {
        config.log.format = "json".into();
    }

    init_logging(&config);
    info!("policy-router v{}", policy_router::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let geoip = build_geoip(&config.geoip)?;

    let registry = AdapterRegistry::from_config(&config.adapters, &config.connection)?;
    let rules = Arc::new(registry.build_rules(&config.rules, config.append_direct)?);
    info!("Initialized {} adapters and {} rules", registry.len(), rules.len());

    let mut sessions = SessionContext::new(Arc::clone(&geoip));
    if rules.needs_resolved_ip() {
        sessions = sessions.with_resolver(Arc::new(SystemResolver::new(config.connection.connect_timeout())));
    }

    let mut dns_handle = None;
    let mut dns_tasks = Vec::new();
    if config.dns.enabled {
        let (handle, tasks) = start_dns(&config, Arc::clone(&rules), Arc::clone(&geoip)).await?;
        sessions = sessions.with_dns(handle.clone());
        dns_handle = Some(handle);
        dns_tasks = tasks;
    }

    let ctx = Arc::new(TunnelContext::new(rules, sessions));
    let manager = Arc::new(TunnelManager::new(&config.connection, ctx));

    let (stop_tx, _) = broadcast::channel(1);
    let mut listeners = Vec::new();
    for (addr, kind) in [
        (config.listen.socks5, ProxyKind::Socks5),
        (config.listen.http, ProxyKind::Http),
    ] {
        let Some(addr) = addr else { continue };
        let listener = ProxyListener::bind(addr, kind, Arc::clone(&manager))
            .with_context(|| format!("Failed to bind {kind} listener on {addr}"))?;
        let stop_rx = stop_tx.subscribe();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = listener.run(stop_rx).await {
                error!("{} listener error: {}", kind, e);
            }
        }));
    }

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }

    info!("Shutting down...");
    // Listeners may already have exited
    let _ = stop_tx.send(());
    manager.shutdown().await;
    for result in join_all(listeners).await {
        if let Err(e) = result {
            warn!("Listener task failed: {}", e);
        }
    }

    if let Some(handle) = dns_handle {
        match handle.stats().await {
            Ok(stats) => info!("Final DNS stats: {:?}", stats),
            Err(e) => warn!("DNS stats unavailable: {}", e),
        }
        handle.shutdown();
    }
    for task in dns_tasks {
        task.abort();
    }

    let stats = manager.stats_snapshot();
    info!(
        "Final tunnel stats: {} total, {} completed, {} errored, {} rejected",
        stats.total_accepted, stats.completed, stats.errored, stats.rejected
    );
    info!(
        "Transferred: {} bytes up, {} bytes down",
        stats.bytes_up, stats.bytes_down
    );
    for (adapter, adapter_stats) in manager.adapter_snapshot() {
        info!(
            "Adapter {}: {} tunnels, {} errors, {} bytes up, {} bytes down",
            adapter, adapter_stats.tunnels, adapter_stats.errors, adapter_stats.bytes_up, adapter_stats.bytes_down
        );
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
