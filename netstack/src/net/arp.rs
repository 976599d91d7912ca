// ARP (Address Resolution Protocol) Implementation
//
// The stack keeps a single binding: the gateway's MAC. Every off-host
// destination is reached through it.
use alloc::vec::Vec;

use super::ethernet::{build_frame, MacAddress, ETHERTYPE_ARP};
use super::ip::Ipv4Address;
use crate::config::HostConfig;

// ARP constants
const ARP_HARDWARE_ETHERNET: u16 = 1;
const ARP_PROTOCOL_IPV4: u16 = 0x0800;
pub const ARP_OPERATION_REQUEST: u16 = 1;
pub const ARP_OPERATION_REPLY: u16 = 2;
pub const ARP_PACKET_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Address,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Address,
}

impl ArpPacket {
    pub fn new_request(sender_mac: MacAddress, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self {
            operation: ARP_OPERATION_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    pub fn new_reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Address,
        target_mac: MacAddress,
        target_ip: Ipv4Address,
    ) -> Self {
        Self {
            operation: ARP_OPERATION_REPLY,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// RFC 5227 probe: sender IP all zeros, asking who holds `probed`.
    pub fn probe(sender_mac: MacAddress, probed: Ipv4Address) -> Self {
        Self::new_request(sender_mac, Ipv4Address::UNSPECIFIED, probed)
    }

    /// RFC 5227 announcement: sender and target IP both our own.
    pub fn gratuitous(sender_mac: MacAddress, own_ip: Ipv4Address) -> Self {
        Self::new_request(sender_mac, own_ip, own_ip)
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_SIZE {
            return None;
        }
        let hardware_type = u16::from_be_bytes([data[0], data[1]]);
        let protocol_type = u16::from_be_bytes([data[2], data[3]]);
        if hardware_type != ARP_HARDWARE_ETHERNET
            || protocol_type != ARP_PROTOCOL_IPV4
            || data[4] != 6
            || data[5] != 4
        {
            return None;
        }

        Some(Self {
            operation: u16::from_be_bytes([data[6], data[7]]),
            sender_mac: MacAddress::from_bytes(&data[8..14])?,
            sender_ip: Ipv4Address::from_bytes(&data[14..18])?,
            target_mac: MacAddress::from_bytes(&data[18..24])?,
            target_ip: Ipv4Address::from_bytes(&data[24..28])?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ARP_PACKET_SIZE);
        packet.extend_from_slice(&ARP_HARDWARE_ETHERNET.to_be_bytes());
        packet.extend_from_slice(&ARP_PROTOCOL_IPV4.to_be_bytes());
        packet.push(6);
        packet.push(4);
        packet.extend_from_slice(&self.operation.to_be_bytes());
        packet.extend_from_slice(self.sender_mac.as_bytes());
        packet.extend_from_slice(self.sender_ip.as_bytes());
        packet.extend_from_slice(self.target_mac.as_bytes());
        packet.extend_from_slice(self.target_ip.as_bytes());
        packet
    }

    /// Wraps the packet in an Ethernet frame. Requests are broadcast,
    /// replies go to the target MAC.
    pub fn to_frame(&self) -> Vec<u8> {
        let dest = if self.operation == ARP_OPERATION_REPLY && !self.target_mac.is_zero() {
            self.target_mac
        } else {
            MacAddress::BROADCAST
        };
        build_frame(dest, self.sender_mac, ETHERTYPE_ARP, &self.to_bytes())
    }
}

/// Answers a who-has aimed at us. Targets of broadcast or zero are treated
/// as aimed at us too. Nothing is sent until we have an address.
pub fn handle_request(packet: &ArpPacket, host: &HostConfig) -> Option<ArpPacket> {
    if packet.operation != ARP_OPERATION_REQUEST {
        return None;
    }
    let own_ip = host.ip?;
    let target = packet.target_ip;
    if target != own_ip && !target.is_broadcast() && !target.is_unspecified() {
        return None;
    }
    // Our own announcements come back on some switches.
    if packet.sender_mac == host.mac {
        return None;
    }
    Some(ArpPacket::new_reply(host.mac, own_ip, packet.sender_mac, packet.sender_ip))
}

/// Records the gateway MAC from a reply. Returns true when this is the
/// first binding for the current gateway.
pub fn handle_reply(packet: &ArpPacket, host: &mut HostConfig) -> bool {
    if packet.operation != ARP_OPERATION_REPLY {
        return false;
    }
    match host.gateway() {
        Some(gateway) if gateway == packet.sender_ip => {
            let first = host.gateway_mac.is_none();
            host.gateway_mac = Some(packet.sender_mac);
            first
        }
        _ => false,
    }
}

/// Another station using our address, seen as a request or reply it sent.
pub fn is_conflict(packet: &ArpPacket, host: &HostConfig) -> bool {
    match host.ip {
        Some(own_ip) => packet.sender_ip == own_ip && packet.sender_mac != host.mac,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUR_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 1]);
    const PEER_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 9]);

    fn host() -> HostConfig {
        let mut host = HostConfig::new(OUR_MAC, "quail");
        host.ip = Some(Ipv4Address::new(10, 0, 0, 5));
        host.set_gateway(Some(Ipv4Address::new(10, 0, 0, 1)));
        host
    }

    #[test]
    fn test_probe_and_gratuitous_addresses() {
        let probed = Ipv4Address::new(10, 0, 0, 5);
        let probe = ArpPacket::probe(OUR_MAC, probed);
        assert_eq!(probe.sender_ip, Ipv4Address::UNSPECIFIED);
        assert_eq!(probe.target_ip, probed);
        assert_eq!(probe.operation, ARP_OPERATION_REQUEST);

        let announce = ArpPacket::gratuitous(OUR_MAC, probed);
        assert_eq!(announce.sender_ip, probed);
        assert_eq!(announce.target_ip, probed);

        let frame = announce.to_frame();
        assert_eq!(&frame[0..6], MacAddress::BROADCAST.as_bytes());
        assert_eq!(ArpPacket::from_bytes(&frame[14..]), Some(announce));
    }

    #[test]
    fn test_request_for_us_is_answered() {
        let host = host();
        let request = ArpPacket::new_request(PEER_MAC, Ipv4Address::new(10, 0, 0, 7), Ipv4Address::new(10, 0, 0, 5));
        let reply = handle_request(&request, &host).unwrap();
        assert_eq!(reply.operation, ARP_OPERATION_REPLY);
        assert_eq!(reply.sender_mac, OUR_MAC);
        assert_eq!(reply.target_mac, PEER_MAC);
        assert_eq!(&reply.to_frame()[0..6], PEER_MAC.as_bytes());

        let other = ArpPacket::new_request(PEER_MAC, Ipv4Address::new(10, 0, 0, 7), Ipv4Address::new(10, 0, 0, 8));
        assert!(handle_request(&other, &host).is_none());

        let unconfigured = HostConfig::new(OUR_MAC, "quail");
        assert!(handle_request(&request, &unconfigured).is_none());
    }

    #[test]
    fn test_gateway_reply_binds_once() {
        let mut host = host();
        let reply = ArpPacket::new_reply(PEER_MAC, Ipv4Address::new(10, 0, 0, 1), OUR_MAC, Ipv4Address::new(10, 0, 0, 5));
        assert!(handle_reply(&reply, &mut host));
        assert_eq!(host.gateway_mac, Some(PEER_MAC));
        assert!(!handle_reply(&reply, &mut host));

        let stranger = ArpPacket::new_reply(PEER_MAC, Ipv4Address::new(10, 0, 0, 3), OUR_MAC, Ipv4Address::new(10, 0, 0, 5));
        let mut fresh = self::host();
        assert!(!handle_reply(&stranger, &mut fresh));
        assert_eq!(fresh.gateway_mac, None);
    }

    #[test]
    fn test_conflict_detection() {
        let host = host();
        let claim = ArpPacket::gratuitous(PEER_MAC, Ipv4Address::new(10, 0, 0, 5));
        assert!(is_conflict(&claim, &host));
        let ours = ArpPacket::gratuitous(OUR_MAC, Ipv4Address::new(10, 0, 0, 5));
        assert!(!is_conflict(&ours, &host));
    }
}
