//! `GeoIP` lookup
//!
//! Country tagging is a collaborator of the rule engine: rules only ever see a
//! country code. [`GeoIpLookup`] is the seam, [`CountryTable`] the bundled
//! implementation backed by per-country CIDR lists.
//!
//! # Data format
//!
//! One JSON file per country, named after its ISO code:
//!
//! ```json
//! {
//!   "country_code": "cn",
//!   "ipv4_ranges": ["1.0.1.0/24", "1.0.2.0/23"],
//!   "ipv6_ranges": ["2001:250::/35"]
//! }
//! ```

use std::fs;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;

use ipnet::{IpNet, Ipv6Net};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::RuleError;

/// Maps an address to an ISO 3166 country code
pub trait GeoIpLookup: Send + Sync + std::fmt::Debug {
    /// Upper-case country code for `ip`, if known
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Lookup that knows no countries
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Per-country CIDR file contents
#[derive(Debug, Deserialize)]
struct CountryData {
    country_code: String,
    #[serde(default)]
    ipv4_ranges: Vec<String>,
    #[serde(default)]
    ipv6_ranges: Vec<String>,
}

/// CIDR-table `GeoIP` database
///
/// IPv4 ranges are stored as sorted, non-overlapping `[start, end]` intervals
/// and searched with a binary search. IPv6 ranges are scanned linearly.
#[derive(Debug, Default)]
pub struct CountryTable {
    /// (first, last, country index), sorted by `first`
    v4: Vec<(u32, u32, usize)>,
    v6: Vec<(Ipv6Net, usize)>,
    countries: Vec<String>,
}

impl CountryTable {
    /// Create a new builder
    #[must_use]
    pub fn builder() -> CountryTableBuilder {
        CountryTableBuilder::default()
    }

    /// Number of distinct countries
    #[must_use]
    pub fn country_count(&self) -> usize {
        self.countries.len()
    }

    /// Number of CIDR entries
    #[must_use]
    pub fn cidr_count(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    fn lookup_v4(&self, ip: u32) -> Option<&str> {
        let idx = self.v4.partition_point(|(first, _, _)| *first <= ip);
        let (_, last, country) = self.v4.get(idx.checked_sub(1)?)?;
        (ip <= *last).then(|| self.countries[*country].as_str())
    }

    fn lookup_v6(&self, ip: Ipv6Addr) -> Option<&str> {
        self.v6
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, country)| self.countries[*country].as_str())
    }
}

impl GeoIpLookup for CountryTable {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        let code = match ip {
            IpAddr::V4(v4) => self.lookup_v4(u32::from(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.lookup_v4(u32::from(v4)),
                None => self.lookup_v6(v6),
            },
        };
        code.map(str::to_owned)
    }
}

/// Builder for [`CountryTable`]
#[derive(Debug, Default)]
pub struct CountryTableBuilder {
    entries: Vec<(IpNet, String)>,
}

impl CountryTableBuilder {
    /// Add a CIDR for a country
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if the CIDR or the code is invalid.
    pub fn add_cidr(mut self, country: &str, cidr: &str) -> Result<Self, RuleError> {
        let code = validate_code(country)?;
        let net: IpNet = cidr
            .parse()
            .map_err(|_| RuleError::InvalidCidr(cidr.to_string()))?;
        self.entries.push((net.trunc(), code));
        Ok(self)
    }

    /// Load one country file
    ///
    /// Invalid CIDRs inside the file are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::GeoIpLoad` if the file cannot be read or parsed.
    pub fn load_file(mut self, path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let load_err = |reason: String| RuleError::GeoIpLoad {
            path: path.display().to_string(),
            reason,
        };

        let contents = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let data: CountryData = serde_json::from_str(&contents).map_err(|e| load_err(e.to_string()))?;
        let code = validate_code(&data.country_code)?;

        let mut loaded = 0usize;
        for cidr in data.ipv4_ranges.iter().chain(data.ipv6_ranges.iter()) {
            match cidr.parse::<IpNet>() {
                Ok(net) => {
                    self.entries.push((net.trunc(), code.clone()));
                    loaded += 1;
                }
                Err(e) => warn!("Skipping invalid CIDR '{}' in country {}: {}", cidr, code, e),
            }
        }
        debug!(country = %code, cidrs = loaded, "Loaded GeoIP country file");
        Ok(self)
    }

    /// Load every `*.json` file in a directory
    ///
    /// # Errors
    ///
    /// Returns `RuleError::GeoIpLoad` if the directory or a file cannot be read.
    pub fn load_dir(mut self, dir: impl AsRef<Path>) -> Result<Self, RuleError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| RuleError::GeoIpLoad {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            self = self.load_file(path)?;
        }
        Ok(self)
    }

    /// Build the table
    ///
    /// When ranges overlap, the earliest added entry wins.
    #[must_use]
    pub fn build(self) -> CountryTable {
        let mut countries: Vec<String> = Vec::new();
        let mut v4: Vec<(u32, u32, usize)> = Vec::new();
        let mut v6 = Vec::new();

        for (net, code) in self.entries {
            let idx = match countries.iter().position(|c| *c == code) {
                Some(i) => i,
                None => {
                    countries.push(code);
                    countries.len() - 1
                }
            };
            match net {
                IpNet::V4(n) => {
                    v4.push((u32::from(n.network()), u32::from(n.broadcast()), idx));
                }
                IpNet::V6(n) => v6.push((n, idx)),
            }
        }

        // Stable sort keeps insertion order among equal starts; then drop any
        // interval that begins inside the previous one.
        v4.sort_by_key(|(first, _, _)| *first);
        let mut merged: Vec<(u32, u32, usize)> = Vec::with_capacity(v4.len());
        for entry in v4 {
            match merged.last() {
                Some((_, last, _)) if entry.0 <= *last => {}
                _ => merged.push(entry),
            }
        }

        CountryTable {
            v4: merged,
            v6,
            countries,
        }
    }
}

fn validate_code(code: &str) -> Result<String, RuleError> {
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(RuleError::InvalidCountryCode(code.to_string()))
    }
}
