//! Common SOCKS5 protocol constants and utilities (RFC 1928, RFC 1929)
//!
//! Shared by the local SOCKS5 proxy socket and the upstream SOCKS5 adapter.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

// ============================================================================
// Protocol Version
// ============================================================================

/// SOCKS5 protocol version (RFC 1928)
pub const SOCKS5_VERSION: u8 = 0x05;

// ============================================================================
// Authentication Methods (RFC 1928 Section 3)
// ============================================================================

/// No authentication required (0x00)
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication - RFC 1929 (0x02)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// No acceptable methods (0xFF) - server rejects all offered methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password auth sub-negotiation version (RFC 1929)
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

// ============================================================================
// Commands (RFC 1928 Section 4)
// ============================================================================

/// CONNECT command (0x01) - establish TCP connection
pub const CMD_CONNECT: u8 = 0x01;

// ============================================================================
// Address Types (RFC 1928 Section 4)
// ============================================================================

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + N bytes name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

// ============================================================================
// Reply Codes (RFC 1928 Section 6)
// ============================================================================

/// Succeeded (0x00)
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// General SOCKS server failure (0x01)
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Connection not allowed by ruleset (0x02)
pub const REPLY_NOT_ALLOWED: u8 = 0x02;

/// Network unreachable (0x03)
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;

/// Host unreachable (0x04)
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;

/// Connection refused (0x05)
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// TTL expired (0x06)
pub const REPLY_TTL_EXPIRED: u8 = 0x06;

/// Command not supported (0x07)
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Address type not supported (0x08)
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// IPv4 address size in bytes
pub const IPV4_ADDR_SIZE: usize = 4;

/// IPv6 address size in bytes
pub const IPV6_ADDR_SIZE: usize = 16;

/// Port field size (2 bytes, network byte order)
pub const PORT_SIZE: usize = 2;

// ============================================================================
// Utility Functions
// ============================================================================

/// Convert reply code to human-readable message
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}

/// Reply with `code` and an all-zero IPv4 bound address
#[must_use]
pub fn reply(code: u8) -> Bytes {
    Bytes::copy_from_slice(&[SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
}

/// Bytes following ATYP for fixed-size address types (address + port)
#[must_use]
pub const fn fixed_address_len(atyp: u8) -> Option<usize> {
    match atyp {
        ATYP_IPV4 => Some(IPV4_ADDR_SIZE + PORT_SIZE),
        ATYP_IPV6 => Some(IPV6_ADDR_SIZE + PORT_SIZE),
        _ => None,
    }
}

/// Decode an address body (no ATYP byte, no domain length byte) into host and port
#[must_use]
pub fn decode_address(atyp: u8, body: &[u8]) -> Option<(String, u16)> {
    if body.len() < PORT_SIZE {
        return None;
    }
    let (addr, port) = body.split_at(body.len() - PORT_SIZE);
    let port = u16::from_be_bytes([port[0], port[1]]);
    let host = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; IPV4_ADDR_SIZE] = addr.try_into().ok()?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let octets: [u8; IPV6_ADDR_SIZE] = addr.try_into().ok()?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let name = std::str::from_utf8(addr).ok()?;
            if name.is_empty() {
                return None;
            }
            name.to_string()
        }
        _ => return None,
    };
    Some((host, port))
}

/// Encode `host:port` as ATYP + address + port
///
/// Returns `None` for a domain longer than 255 bytes.
#[must_use]
pub fn encode_address(host: &str, port: u16) -> Option<BytesMut> {
    let mut buf = BytesMut::with_capacity(host.len() + 4);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).ok()?;
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(len);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_u16(port);
    Some(buf)
}
