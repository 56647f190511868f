//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "POLICY_ROUTER_";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = read_config(path.as_ref())?;
    config.validate()?;
    log_loaded(&config);
    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `POLICY_ROUTER_SOCKS_LISTEN`: Override the SOCKS5 listen address
/// - `POLICY_ROUTER_HTTP_LISTEN`: Override the HTTP listen address
/// - `POLICY_ROUTER_DNS_LISTEN`: Override the DNS listen address
/// - `POLICY_ROUTER_LOG_LEVEL`: Override log level
/// - `POLICY_ROUTER_MAX_CONNECTIONS`: Override max connections
///
/// Validation runs once, after the overrides.
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, an override or validation
/// fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = read_config(path.as_ref())?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    log_loaded(&config);
    Ok(config)
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))
}

fn log_loaded(config: &Config) {
    info!(
        adapters = config.adapters.len(),
        rules = config.rules.len(),
        dns = config.dns.enabled,
        "Configuration loaded"
    );
}

/// Apply overrides read through `lookup`
fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let name = format!("{ENV_PREFIX}{suffix}");
        lookup(&name).map(|value| (name, value))
    };
    let invalid = |name: String, reason: String| ConfigError::EnvError { name, reason };

    if let Some((name, addr)) = var("SOCKS_LISTEN") {
        let parsed = addr
            .parse()
            .map_err(|_| invalid(name, format!("Invalid socket address: {addr}")))?;
        config.listen.socks5 = Some(parsed);
        debug!("SOCKS5 listen address overridden to {}", parsed);
    }

    if let Some((name, addr)) = var("HTTP_LISTEN") {
        let parsed = addr
            .parse()
            .map_err(|_| invalid(name, format!("Invalid socket address: {addr}")))?;
        config.listen.http = Some(parsed);
        debug!("HTTP listen address overridden to {}", parsed);
    }

    if let Some((name, addr)) = var("DNS_LISTEN") {
        config.dns.listen = addr
            .parse()
            .map_err(|_| invalid(name, format!("Invalid socket address: {addr}")))?;
        debug!("DNS listen address overridden to {}", config.dns.listen);
    }

    if let Some((_, level)) = var("LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some((name, max)) = var("MAX_CONNECTIONS") {
        let parsed = max
            .parse()
            .map_err(|_| invalid(name, format!("Invalid number: {max}")))?;
        config.connection.max_connections = Some(parsed);
        debug!("Max connections overridden to {}", parsed);
    }

    Ok(())
}
