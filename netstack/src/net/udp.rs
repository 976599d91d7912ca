// UDP (User Datagram Protocol) Implementation
use alloc::vec::Vec;

use super::checksum;
use super::ethernet::MacAddress;
use super::ip::{Ipv4Address, IP_PROTO_UDP};

pub const UDP_HEADER_SIZE: usize = 8;

// Well-known ports
pub const PORT_DNS: u16 = 53;
pub const PORT_DHCP_SERVER: u16 = 67;
pub const PORT_DHCP_CLIENT: u16 = 68;
pub const PORT_NETBIOS_NS: u16 = 137;
pub const PORT_MDNS: u16 = 5353;
pub const PORT_LLMNR: u16 = 5355;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

impl UdpHeader {
    /// Validates length and (when present) checksum, returning the payload.
    pub fn parse<'a>(
        src: Ipv4Address,
        dst: Ipv4Address,
        data: &'a [u8],
    ) -> Result<(Self, &'a [u8]), &'static str> {
        if data.len() < UDP_HEADER_SIZE {
            return Err("UDP datagram too small");
        }
        let header = Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
        };
        let length = header.length as usize;
        if length < UDP_HEADER_SIZE || length > data.len() {
            return Err("Bad UDP length");
        }
        let sum = u16::from_be_bytes([data[6], data[7]]);
        if sum != 0 && checksum::pseudo_header_checksum(src, dst, IP_PROTO_UDP, &data[..length]) != 0 {
            return Err("Bad UDP checksum");
        }
        Ok((header, &data[UDP_HEADER_SIZE..length]))
    }
}

/// Builds a UDP datagram with the pseudo-header checksum filled in.
pub fn build_datagram(
    src: Ipv4Address,
    dst: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (UDP_HEADER_SIZE + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(length as usize);
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&length.to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    let sum = match checksum::pseudo_header_checksum(src, dst, IP_PROTO_UDP, &datagram) {
        // Zero means "no checksum" on the wire.
        0 => 0xFFFF,
        sum => sum,
    };
    checksum::write_u16_be(&mut datagram, 6, sum);
    datagram
}

/// A datagram delivered to UDP listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub remote_mac: MacAddress,
    pub remote_ip: Ipv4Address,
    pub remote_port: u16,
    pub local_ip: Ipv4Address,
    pub local_port: u16,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validates_checksum() {
        let src = Ipv4Address::new(10, 0, 0, 9);
        let dst = Ipv4Address::new(10, 0, 0, 5);
        let mut datagram = build_datagram(src, dst, 40000, 7000, b"ping");

        let (header, payload) = UdpHeader::parse(src, dst, &datagram).unwrap();
        assert_eq!(header.src_port, 40000);
        assert_eq!(header.dst_port, 7000);
        assert_eq!(payload, b"ping");

        datagram[9] ^= 0x20;
        assert_eq!(UdpHeader::parse(src, dst, &datagram), Err("Bad UDP checksum"));

        // Checksum field zero disables verification.
        datagram[6] = 0;
        datagram[7] = 0;
        assert!(UdpHeader::parse(src, dst, &datagram).is_ok());
    }

    #[test]
    fn test_length_beyond_buffer_rejected() {
        let src = Ipv4Address::new(10, 0, 0, 9);
        let dst = Ipv4Address::new(10, 0, 0, 5);
        let datagram = build_datagram(src, dst, 1, 2, b"abc");
        assert_eq!(UdpHeader::parse(src, dst, &datagram[..9]), Err("Bad UDP length"));
    }
}
