// Frame classification for the receive path
//
// First match wins: ARP, ICMP, DHCP, mDNS, DNS, LLMNR, NetBIOS, listening
// UDP port, then TCP for a listening port or a known connection.
use super::arp::ArpPacket;
use super::ethernet::{EthernetHeader, MacAddress, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use super::icmp::IcmpEcho;
use super::ip::{Ipv4Header, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP};
use super::tcp::{TcpKey, TcpSegment};
use super::udp::{
    UdpHeader, PORT_DHCP_CLIENT, PORT_DHCP_SERVER, PORT_DNS, PORT_LLMNR, PORT_MDNS, PORT_NETBIOS_NS,
};
use crate::config::HostConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInbound<'a> {
    pub src_mac: MacAddress,
    pub ip: Ipv4Header,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Arp(ArpPacket),
    Icmp {
        src_mac: MacAddress,
        ip: Ipv4Header,
        echo: IcmpEcho,
    },
    Dhcp(UdpInbound<'a>),
    Mdns(UdpInbound<'a>),
    Dns(UdpInbound<'a>),
    Llmnr(UdpInbound<'a>),
    NetBios(UdpInbound<'a>),
    Udp(UdpInbound<'a>),
    Tcp {
        src_mac: MacAddress,
        ip: Ipv4Header,
        key: TcpKey,
        segment: TcpSegment,
    },
    /// Well-formed but not for any handler
    Ignore(&'static str),
    /// Failed validation; counts towards a receiver reset
    Malformed(&'static str),
}

pub fn classify<'a, L, C>(frame: &'a [u8], host: &HostConfig, is_listening: L, has_connection: C) -> Route<'a>
where
    L: Fn(u16) -> bool,
    C: Fn(&TcpKey) -> bool,
{
    let (eth, payload) = match EthernetHeader::parse(frame) {
        Ok(parsed) => parsed,
        Err(reason) => return Route::Malformed(reason),
    };
    if eth.dest_mac != host.mac && !eth.dest_mac.is_multicast() {
        return Route::Ignore("not addressed to us");
    }
    if eth.src_mac == host.mac {
        return Route::Ignore("own frame");
    }

    match eth.ethertype {
        ETHERTYPE_ARP => match ArpPacket::from_bytes(payload) {
            Some(packet) => Route::Arp(packet),
            None => Route::Malformed("bad ARP packet"),
        },
        ETHERTYPE_IPV4 => classify_ipv4(eth.src_mac, payload, host, is_listening, has_connection),
        _ => Route::Ignore("unsupported ethertype"),
    }
}

fn classify_ipv4<'a, L, C>(
    src_mac: MacAddress,
    packet: &'a [u8],
    host: &HostConfig,
    is_listening: L,
    has_connection: C,
) -> Route<'a>
where
    L: Fn(u16) -> bool,
    C: Fn(&TcpKey) -> bool,
{
    let (ip, payload) = match Ipv4Header::parse(packet) {
        Ok(parsed) => parsed,
        Err(reason) => return Route::Malformed(reason),
    };
    if !host.accepts(ip.dst_addr) {
        return Route::Ignore("not our address");
    }

    match ip.protocol {
        IP_PROTO_ICMP => match IcmpEcho::from_bytes(payload) {
            Ok(echo) => Route::Icmp { src_mac, ip, echo },
            Err(reason) => Route::Ignore(reason),
        },
        IP_PROTO_UDP => {
            let (udp, data) = match UdpHeader::parse(ip.src_addr, ip.dst_addr, payload) {
                Ok(parsed) => parsed,
                Err(reason) => return Route::Malformed(reason),
            };
            let inbound = UdpInbound {
                src_mac,
                ip,
                src_port: udp.src_port,
                dst_port: udp.dst_port,
                payload: data,
            };
            match udp.dst_port {
                PORT_DHCP_CLIENT | PORT_DHCP_SERVER => Route::Dhcp(inbound),
                PORT_MDNS => Route::Mdns(inbound),
                // Responses to our queries arrive from port 53.
                _ if udp.src_port == PORT_DNS || udp.dst_port == PORT_DNS => Route::Dns(inbound),
                PORT_LLMNR => Route::Llmnr(inbound),
                PORT_NETBIOS_NS => Route::NetBios(inbound),
                port if is_listening(port) => Route::Udp(inbound),
                _ => Route::Ignore("UDP port closed"),
            }
        }
        IP_PROTO_TCP => {
            let segment = match TcpSegment::parse(ip.src_addr, ip.dst_addr, payload) {
                Ok(segment) => segment,
                Err(reason) => return Route::Malformed(reason),
            };
            let key = TcpKey {
                local_port: segment.dst_port,
                remote_ip: ip.src_addr,
                remote_port: segment.src_port,
            };
            if is_listening(segment.dst_port) || has_connection(&key) {
                Route::Tcp { src_mac, ip, key, segment }
            } else {
                Route::Ignore("TCP port closed")
            }
        }
        _ => Route::Ignore("unsupported IP protocol"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ethernet::build_frame;
    use crate::net::ip::{build_packet, Ipv4Address};
    use crate::net::tcp::TcpFlags;
    use crate::net::udp::build_datagram;
    use alloc::vec::Vec;

    const OUR_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 1]);
    const PEER_MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 9]);
    const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 5);
    const PEER_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 9);

    fn host() -> HostConfig {
        let mut host = HostConfig::new(OUR_MAC, "quail");
        host.ip = Some(OUR_IP);
        host.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
        host
    }

    fn udp_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        let datagram = build_datagram(PEER_IP, OUR_IP, src_port, dst_port, b"payload");
        let packet = build_packet(PEER_IP, OUR_IP, IP_PROTO_UDP, 1, &datagram);
        build_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &packet)
    }

    fn tcp_frame(dst_port: u16) -> Vec<u8> {
        let segment = TcpSegment {
            src_port: 50000,
            dst_port,
            seq: 1,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 1024,
            mss: None,
            payload: Vec::new(),
        };
        let packet = build_packet(PEER_IP, OUR_IP, IP_PROTO_TCP, 1, &segment.to_bytes(PEER_IP, OUR_IP));
        build_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &packet)
    }

    fn route_name(frame: &[u8], listening: &[u16]) -> &'static str {
        match classify(frame, &host(), |port| listening.contains(&port), |_| false) {
            Route::Arp(_) => "arp",
            Route::Icmp { .. } => "icmp",
            Route::Dhcp(_) => "dhcp",
            Route::Mdns(_) => "mdns",
            Route::Dns(_) => "dns",
            Route::Llmnr(_) => "llmnr",
            Route::NetBios(_) => "netbios",
            Route::Udp(_) => "udp",
            Route::Tcp { .. } => "tcp",
            Route::Ignore(_) => "ignore",
            Route::Malformed(_) => "malformed",
        }
    }

    #[test]
    fn test_udp_priority() {
        assert_eq!(route_name(&udp_frame(67, 68), &[68]), "dhcp");
        assert_eq!(route_name(&udp_frame(5353, 5353), &[5353]), "mdns");
        assert_eq!(route_name(&udp_frame(53, 40000), &[40000]), "dns");
        assert_eq!(route_name(&udp_frame(40000, 5355), &[]), "llmnr");
        assert_eq!(route_name(&udp_frame(137, 137), &[]), "netbios");
        assert_eq!(route_name(&udp_frame(40000, 7000), &[7000]), "udp");
        assert_eq!(route_name(&udp_frame(40000, 7000), &[]), "ignore");
    }

    #[test]
    fn test_tcp_requires_listener_or_connection() {
        assert_eq!(route_name(&tcp_frame(80), &[80]), "tcp");
        assert_eq!(route_name(&tcp_frame(81), &[80]), "ignore");

        let frame = tcp_frame(81);
        let known = TcpKey { local_port: 81, remote_ip: PEER_IP, remote_port: 50000 };
        let route = classify(&frame, &host(), |_| false, |key| *key == known);
        assert!(matches!(route, Route::Tcp { key, .. } if key == known));
    }

    #[test]
    fn test_arp_and_foreign_frames() {
        let arp = ArpPacket::gratuitous(PEER_MAC, PEER_IP).to_frame();
        assert_eq!(route_name(&arp, &[]), "arp");

        let mut foreign = udp_frame(40000, 7000);
        foreign[0..6].copy_from_slice(&[2, 0, 0, 0, 0, 0x42]);
        assert_eq!(route_name(&foreign, &[7000]), "ignore");

        let mut corrupt = udp_frame(40000, 7000);
        corrupt[14 + 8] ^= 0xff;
        assert_eq!(route_name(&corrupt, &[7000]), "malformed");
        assert_eq!(route_name(&[0u8; 10], &[]), "malformed");
    }
}
