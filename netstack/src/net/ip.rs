// IPv4 Layer Implementation
use alloc::vec::Vec;
use core::fmt;

use super::checksum;

// IP protocol numbers
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const IPV4_VERSION: u8 = 4;
pub const IPV4_HEADER_MIN_SIZE: usize = 20;
pub const IPV4_TTL_DEFAULT: u8 = 64;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    pub const UNSPECIFIED: Ipv4Address = Ipv4Address([0; 4]);
    pub const BROADCAST: Ipv4Address = Ipv4Address([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address([a, b, c, d])
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Ipv4Address(bytes))
    }

    /// Parses dotted-quad notation.
    pub fn parse(text: &str) -> Option<Self> {
        let mut octets = [0u8; 4];
        let mut parts = text.split('.');
        for octet in octets.iter_mut() {
            *octet = parts.next()?.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Ipv4Address(octets))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_u32(value: u32) -> Self {
        Ipv4Address(value.to_be_bytes())
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        (224..=239).contains(&self.0[0])
    }

    pub fn same_subnet(&self, other: Ipv4Address, mask: Ipv4Address) -> bool {
        self.to_u32() & mask.to_u32() == other.to_u32() & mask.to_u32()
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_length: u16,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: Ipv4Address,
    pub dst_addr: Ipv4Address,
}

impl Ipv4Header {
    /// Validates a received packet and returns the header and the payload
    /// trimmed to the total length (Ethernet padding removed).
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), &'static str> {
        if data.len() < IPV4_HEADER_MIN_SIZE {
            return Err("IP packet too small");
        }
        if data[0] >> 4 != IPV4_VERSION {
            return Err("Not IPv4");
        }
        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_HEADER_MIN_SIZE || header_len > data.len() {
            return Err("Bad IHL");
        }
        let total_length = u16::from_be_bytes([data[2], data[3]]);
        let total = total_length as usize;
        if total < header_len || total > data.len() {
            return Err("Bad total length");
        }
        if !checksum::verify(&data[..header_len]) {
            return Err("Bad IP checksum");
        }
        let flags_fragment = u16::from_be_bytes([data[6], data[7]]);
        if flags_fragment & (FLAG_MORE_FRAGMENTS | FRAGMENT_OFFSET_MASK) != 0 {
            return Err("Fragmented packet");
        }

        let header = Self {
            header_len,
            total_length,
            identification: u16::from_be_bytes([data[4], data[5]]),
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_addr: Ipv4Address([data[12], data[13], data[14], data[15]]),
            dst_addr: Ipv4Address([data[16], data[17], data[18], data[19]]),
        };
        Ok((header, &data[header_len..total]))
    }
}

/// Builds an IPv4 packet with a 20-byte header and computed checksum.
pub fn build_packet(
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    identification: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = IPV4_HEADER_MIN_SIZE + payload.len();
    let mut packet = Vec::with_capacity(total);
    packet.push((IPV4_VERSION << 4) | 5);
    packet.push(0);
    packet.extend_from_slice(&(total as u16).to_be_bytes());
    packet.extend_from_slice(&identification.to_be_bytes());
    packet.extend_from_slice(&FLAG_DONT_FRAGMENT.to_be_bytes());
    // Multicast responders stay on the local link.
    packet.push(if dst.is_multicast() { 1 } else { IPV4_TTL_DEFAULT });
    packet.push(protocol);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(src.as_bytes());
    packet.extend_from_slice(dst.as_bytes());
    let sum = checksum::internet_checksum(&packet);
    checksum::write_u16_be(&mut packet, 10, sum);
    packet.extend_from_slice(payload);
    packet
}
