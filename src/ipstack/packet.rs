//! IPv4/UDP packet parsing and building
//!
//! Only what the virtual-interface path needs: peeking at the transport
//! protocol and destination of any IPv4 packet, a full parse of unfragmented
//! UDP datagrams, and a builder for synthesized replies. IPv6 packets are
//! reported as not parseable.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// ICMP protocol number
pub const IPPROTO_ICMP: u8 = 1;
/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;
/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;
/// Largest payload an IPv4 UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN - UDP_HEADER_LEN;

/// Why a packet could not be parsed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {len} < {need}")]
    TooShort { len: usize, need: usize },

    #[error("Not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("Invalid IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("Not a UDP packet (protocol {0})")]
    NotUdp(u8),

    #[error("Fragmented packets are not supported")]
    Fragmented,

    #[error("Invalid UDP length {0}")]
    BadUdpLength(usize),
}

/// A parsed UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: Bytes,
}

/// Stateless IPv4 packet inspection
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketParser;

impl PacketParser {
    /// Transport protocol number of an IPv4 packet
    #[must_use]
    pub fn peek_transport_protocol(packet: &[u8]) -> Option<u8> {
        header_len(packet).ok().map(|_| packet[9])
    }

    /// Destination address of an IPv4 packet
    #[must_use]
    pub fn peek_destination_address(packet: &[u8]) -> Option<Ipv4Addr> {
        header_len(packet).ok().map(|_| address_at(packet, 16))
    }

    /// Destination port of a TCP or UDP packet
    #[must_use]
    pub fn peek_destination_port(packet: &[u8]) -> Option<u16> {
        let header_len = header_len(packet).ok()?;
        if !matches!(packet[9], IPPROTO_TCP | IPPROTO_UDP) || packet.len() < header_len + 4 {
            return None;
        }
        Some(u16::from_be_bytes([packet[header_len + 2], packet[header_len + 3]]))
    }

    /// Destination address and port of a TCP or UDP packet
    #[must_use]
    pub fn peek_destination(packet: &[u8]) -> Option<SocketAddrV4> {
        let ip = Self::peek_destination_address(packet)?;
        let port = Self::peek_destination_port(packet)?;
        Some(SocketAddrV4::new(ip, port))
    }

    /// Parse an unfragmented IPv4 UDP packet
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the packet is not IPv4 UDP, is fragmented
    /// or its lengths are inconsistent.
    pub fn parse_udp(packet: &[u8]) -> Result<UdpDatagram, PacketError> {
        let header_len = header_len(packet)?;

        let protocol = packet[9];
        if protocol != IPPROTO_UDP {
            return Err(PacketError::NotUdp(protocol));
        }

        let flags_fragment = u16::from_be_bytes([packet[6], packet[7]]);
        // MF flag or a non-zero offset
        if flags_fragment & 0x3FFF != 0 {
            return Err(PacketError::Fragmented);
        }

        let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]])).min(packet.len());
        if total_len < header_len + UDP_HEADER_LEN {
            return Err(PacketError::TooShort {
                len: total_len,
                need: header_len + UDP_HEADER_LEN,
            });
        }

        let udp = &packet[header_len..total_len];
        let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
        if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
            return Err(PacketError::BadUdpLength(udp_len));
        }

        let source = SocketAddrV4::new(address_at(packet, 12), u16::from_be_bytes([udp[0], udp[1]]));
        let destination = SocketAddrV4::new(address_at(packet, 16), u16::from_be_bytes([udp[2], udp[3]]));

        Ok(UdpDatagram {
            source,
            destination,
            payload: Bytes::copy_from_slice(&udp[UDP_HEADER_LEN..udp_len]),
        })
    }
}

/// Build an IPv4 UDP packet
///
/// The IPv4 header checksum is computed; the UDP checksum is left zero.
/// Payloads beyond [`MAX_UDP_PAYLOAD`] are truncated.
#[must_use]
pub fn build_udp_packet(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Bytes {
    let payload = &payload[..payload.len().min(MAX_UDP_PAYLOAD)];
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;
    // Both bounded by MAX_UDP_PAYLOAD
    let udp_len = u16::try_from(udp_len).unwrap_or(u16::MAX);
    let total_len_field = u16::try_from(total_len).unwrap_or(u16::MAX);

    let mut packet = BytesMut::with_capacity(total_len);
    packet.put_u8(0x45); // Version 4, IHL 5
    packet.put_u8(0x00); // DSCP/ECN
    packet.put_u16(total_len_field);
    packet.put_u16(0x0000); // Identification
    packet.put_u16(0x4000); // Don't fragment
    packet.put_u8(DEFAULT_TTL);
    packet.put_u8(IPPROTO_UDP);
    packet.put_u16(0x0000); // Checksum, filled below
    packet.put_slice(&source.ip().octets());
    packet.put_slice(&destination.ip().octets());

    let checksum = ipv4_header_checksum(&packet[..IPV4_MIN_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());

    packet.put_u16(source.port());
    packet.put_u16(destination.port());
    packet.put_u16(udp_len);
    packet.put_u16(0x0000); // Optional for IPv4
    packet.put_slice(payload);

    packet.freeze()
}

/// Validated IPv4 header length
fn header_len(packet: &[u8]) -> Result<usize, PacketError> {
    if packet.is_empty() {
        return Err(PacketError::TooShort {
            len: 0,
            need: IPV4_MIN_HEADER_LEN,
        });
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }
    if packet.len() < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::TooShort {
            len: packet.len(),
            need: IPV4_MIN_HEADER_LEN,
        });
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::BadHeaderLength(header_len));
    }
    if packet.len() < header_len {
        return Err(PacketError::TooShort {
            len: packet.len(),
            need: header_len,
        });
    }
    Ok(header_len)
}

fn address_at(packet: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(packet[offset], packet[offset + 1], packet[offset + 2], packet[offset + 3])
}

/// IPv4 header checksum, skipping the checksum field
fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for (i, chunk) in header.chunks(2).enumerate() {
        if i == 5 {
            continue;
        }
        let word = u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)]);
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    // Folded to 16 bits above
    !u16::try_from(sum).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_and_parse_udp() {
        let packet = build_udp_packet(addr("10.0.0.2:5353"), addr("10.0.0.1:53"), b"query");
        assert_eq!(packet.len(), 20 + 8 + 5);

        let datagram = PacketParser::parse_udp(&packet).unwrap();
        assert_eq!(datagram.source, addr("10.0.0.2:5353"));
        assert_eq!(datagram.destination, addr("10.0.0.1:53"));
        assert_eq!(&datagram.payload[..], b"query");
    }

    #[test]
    fn test_header_checksum_verifies() {
        let packet = build_udp_packet(addr("192.168.1.10:1234"), addr("8.8.8.8:53"), b"x");
        // Summing a header including its checksum folds to 0xFFFF
        let mut sum: u32 = packet[..20]
            .chunks(2)
            .map(|c| u32::from(u16::from_be_bytes([c[0], c[1]])))
            .sum();
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum, 0xFFFF);
        // UDP checksum is zero
        assert_eq!(&packet[26..28], &[0, 0]);
    }

    #[test]
    fn test_peek() {
        let packet = build_udp_packet(addr("10.0.0.2:40000"), addr("198.18.0.5:443"), b"");
        assert_eq!(PacketParser::peek_transport_protocol(&packet), Some(IPPROTO_UDP));
        assert_eq!(
            PacketParser::peek_destination_address(&packet),
            Some(Ipv4Addr::new(198, 18, 0, 5))
        );
        assert_eq!(PacketParser::peek_destination_port(&packet), Some(443));
        assert_eq!(PacketParser::peek_destination(&packet), Some(addr("198.18.0.5:443")));
    }

    #[test]
    fn test_peek_tcp_and_icmp() {
        let mut tcp = build_udp_packet(addr("10.0.0.2:40000"), addr("1.2.3.4:80"), b"").to_vec();
        tcp[9] = IPPROTO_TCP;
        assert_eq!(PacketParser::peek_destination(&tcp), Some(addr("1.2.3.4:80")));
        assert!(matches!(PacketParser::parse_udp(&tcp), Err(PacketError::NotUdp(IPPROTO_TCP))));

        let mut icmp = tcp;
        icmp[9] = IPPROTO_ICMP;
        assert_eq!(PacketParser::peek_transport_protocol(&icmp), Some(IPPROTO_ICMP));
        assert_eq!(PacketParser::peek_destination_port(&icmp), None);
    }

    #[test]
    fn test_reject_malformed() {
        assert!(matches!(
            PacketParser::parse_udp(&[]),
            Err(PacketError::TooShort { len: 0, .. })
        ));

        let mut v6 = vec![0u8; 48];
        v6[0] = 0x60;
        assert_eq!(PacketParser::parse_udp(&v6), Err(PacketError::NotIpv4(6)));
        assert_eq!(PacketParser::peek_transport_protocol(&v6), None);

        let packet = build_udp_packet(addr("10.0.0.2:1"), addr("10.0.0.1:2"), b"abc");
        assert!(matches!(
            PacketParser::parse_udp(&packet[..24]),
            Err(PacketError::TooShort { .. })
        ));

        let mut fragment = packet.to_vec();
        fragment[6] = 0x20; // More fragments
        assert_eq!(PacketParser::parse_udp(&fragment), Err(PacketError::Fragmented));

        let mut bad_len = packet.to_vec();
        bad_len[24..26].copy_from_slice(&100u16.to_be_bytes());
        assert_eq!(PacketParser::parse_udp(&bad_len), Err(PacketError::BadUdpLength(100)));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut padded = build_udp_packet(addr("10.0.0.2:1"), addr("10.0.0.1:2"), b"abc").to_vec();
        padded.extend_from_slice(&[0xAA; 6]);
        let datagram = PacketParser::parse_udp(&padded).unwrap();
        assert_eq!(&datagram.payload[..], b"abc");
    }
}
