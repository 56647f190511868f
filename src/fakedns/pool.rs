//! Fake IPv4 address pool
//!
//! Addresses are handed out from a half-open range `[start, end)`. Released
//! addresses are reused before the high-water mark grows, so the pool only
//! touches fresh addresses when every previously used one is still held.
//!
//! The pool itself is not synchronized. It is owned by the DNS interceptor,
//! which serializes all access on its own task. Other components that only need
//! the membership test use the `Copy` [`PoolRange`].

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Pool failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every address in the range is currently held
    #[error("fake IP pool exhausted")]
    Exhausted,
    /// The configured range contains no usable address
    #[error("fake IP range {start}..{end} is empty")]
    EmptyRange { start: Ipv4Addr, end: Ipv4Addr },
}

/// Half-open IPv4 range used for fake-address membership tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    start: u32,
    end: u32,
}

impl PoolRange {
    /// Create a range `[start, end)`
    ///
    /// # Errors
    ///
    /// Returns `PoolError::EmptyRange` if `start >= end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, PoolError> {
        let (s, e) = (u32::from(start), u32::from(end));
        if s >= e {
            return Err(PoolError::EmptyRange { start, end });
        }
        Ok(Self { start: s, end: e })
    }

    /// Range covering the usable hosts of `network`
    ///
    /// The network and broadcast addresses are excluded, so `198.18.0.0/15`
    /// yields `198.18.0.1 .. 198.19.255.255`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::EmptyRange` for /31 and /32 networks.
    pub fn from_network(network: Ipv4Net) -> Result<Self, PoolError> {
        let first = u32::from(network.network()).saturating_add(1);
        let broadcast = network.broadcast();
        Self::new(Ipv4Addr::from(first), broadcast)
    }

    /// True iff `ip` lies in `[start, end)`, regardless of allocation state
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        v >= self.start && v < self.end
    }

    /// First address of the range
    #[must_use]
    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    /// One past the last address of the range
    #[must_use]
    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// Number of addresses in the range
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.end - self.start)
    }
}

impl fmt::Display for PoolRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start(), self.end())
    }
}

/// Allocator for fake IPv4 addresses
#[derive(Debug)]
pub struct AddressPool {
    range: PoolRange,
    /// Released addresses available for reuse
    free: BTreeSet<u32>,
    /// Addresses never handed out
    reserved: BTreeSet<u32>,
    /// Next never-used address
    high_water: u32,
}

impl AddressPool {
    /// Create a pool over `range`
    #[must_use]
    pub fn new(range: PoolRange) -> Self {
        Self {
            range,
            free: BTreeSet::new(),
            reserved: BTreeSet::new(),
            high_water: range.start,
        }
    }

    /// Create a pool over the usable hosts of `network`
    ///
    /// # Errors
    ///
    /// Returns `PoolError::EmptyRange` if the network has no usable host.
    pub fn from_network(network: Ipv4Net) -> Result<Self, PoolError> {
        PoolRange::from_network(network).map(Self::new)
    }

    /// Allocate an address
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` if every address is held.
    pub fn acquire(&mut self) -> Result<Ipv4Addr, PoolError> {
        if let Some(ip) = self.free.pop_first() {
            return Ok(Ipv4Addr::from(ip));
        }
        while self.high_water < self.range.end {
            let ip = self.high_water;
            self.high_water += 1;
            if !self.reserved.contains(&ip) {
                return Ok(Ipv4Addr::from(ip));
            }
        }
        Err(PoolError::Exhausted)
    }

    /// Exclude `ip` from allocation
    ///
    /// Only addresses in range that are not currently held can be reserved.
    /// Returns whether the address is now reserved.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> bool {
        if !self.range.contains(ip) || self.is_held(ip) {
            return false;
        }
        let v = u32::from(ip);
        self.free.remove(&v);
        self.reserved.insert(v);
        true
    }

    /// Return an address to the pool
    ///
    /// Releasing an address that is not currently held is a no-op. Returns
    /// whether the address was actually released.
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        if !self.is_held(ip) {
            return false;
        }
        let v = u32::from(ip);
        if v + 1 == self.high_water {
            // Shrink instead of growing the free set, then absorb any free tail.
            self.high_water -= 1;
            while self.high_water > self.range.start {
                let below = self.high_water - 1;
                if !self.free.remove(&below) && !self.reserved.contains(&below) {
                    break;
                }
                self.high_water = below;
            }
        } else {
            self.free.insert(v);
        }
        true
    }

    /// Pure range check, independent of allocation state
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(ip)
    }

    /// Whether `ip` is currently allocated
    #[must_use]
    pub fn is_held(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        self.range.contains(ip) && v < self.high_water && !self.free.contains(&v) && !self.reserved.contains(&v)
    }

    /// Number of addresses currently allocated
    #[must_use]
    pub fn held_count(&self) -> u64 {
        let reserved = self.reserved.range(self.range.start..self.high_water).count();
        u64::from(self.high_water - self.range.start) - self.free.len() as u64 - reserved as u64
    }

    /// The managed range
    #[must_use]
    pub fn range(&self) -> PoolRange {
        self.range
    }
}
