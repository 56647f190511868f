//! Configuration module for policy-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use policy_router::config::{load_config, Config};
//!
//! let config = load_config("/etc/policy-router/config.json").unwrap();
//! println!("{} adapters, {} rules", config.adapters.len(), config.rules.len());
//! ```

mod loader;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env, ENV_PREFIX};
pub use types::{
    is_builtin_adapter, parse_ranges, AdapterConfig, Config, ConnectionConfig, DnsConfig, GeoIpConfig,
    ListenConfig, LogConfig, RuleConfig, SpeedCandidateConfig,
};
