//! Stack configuration and the live host addressing state

use alloc::string::String;

use crate::net::ethernet::MacAddress;
use crate::net::ip::Ipv4Address;

/// Build-time and pre-start settings.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub mac: MacAddress,
    pub host_name: String,
    pub dhcp_enabled: bool,
    pub static_ip: Option<Ipv4Address>,
    pub static_mask: Ipv4Address,
    pub static_gateway: Option<Ipv4Address>,
    pub static_dns: [Option<Ipv4Address>; 2],
    /// Upper bound for `start` to obtain a lease or resolve the gateway
    pub start_timeout_ms: u64,
    pub dns_timeout_secs: u64,
    pub http_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Body bytes per transmitted HTTP response segment
    pub response_chunk: usize,
    pub tcp_idle_ms: u64,
    pub watchdog_stall_ms: u64,
    pub rx_reset_interval_ms: u64,
    pub register_repair_interval_ms: u64,
    pub probe_host: String,
    pub probe_path: String,
    pub probe_interval_ms: u64,
    /// Keep transmitting when another host claims our address
    pub suppress_ip_conflict: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            // Locally administered
            mac: MacAddress::new([0x02, 0x04, 0xa3, 0x28, 0x60, 0x01]),
            host_name: String::from("enc28j60"),
            dhcp_enabled: true,
            static_ip: None,
            static_mask: Ipv4Address::new(255, 255, 255, 0),
            static_gateway: None,
            static_dns: [None, None],
            start_timeout_ms: 20_000,
            dns_timeout_secs: 3,
            http_timeout_ms: 5_000,
            ping_timeout_ms: 2_000,
            response_chunk: 512,
            tcp_idle_ms: 30_000,
            watchdog_stall_ms: 12_000,
            rx_reset_interval_ms: 5_000,
            register_repair_interval_ms: 5_000,
            probe_host: String::from("www.msftncsi.com"),
            probe_path: String::from("/ncsi.txt"),
            probe_interval_ms: 5_000,
            suppress_ip_conflict: false,
        }
    }
}

/// Addressing state shared by every protocol handler.
///
/// DHCP lease events and static configuration are the only writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub mac: MacAddress,
    pub ip: Option<Ipv4Address>,
    pub subnet_mask: Ipv4Address,
    gateway: Option<Ipv4Address>,
    pub gateway_mac: Option<MacAddress>,
    pub dns_preferred: Option<Ipv4Address>,
    pub dns_alternate: Option<Ipv4Address>,
    pub host_name: String,
    pub dhcp_enabled: bool,
}

impl HostConfig {
    pub fn new(mac: MacAddress, host_name: &str) -> Self {
        Self {
            mac,
            ip: None,
            subnet_mask: Ipv4Address::UNSPECIFIED,
            gateway: None,
            gateway_mac: None,
            dns_preferred: None,
            dns_alternate: None,
            host_name: String::from(host_name),
            dhcp_enabled: true,
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        let mut host = Self::new(config.mac, &config.host_name);
        host.dhcp_enabled = config.dhcp_enabled;
        if !config.dhcp_enabled {
            host.ip = config.static_ip;
            host.subnet_mask = config.static_mask;
            host.gateway = config.static_gateway;
            host.dns_preferred = config.static_dns[0];
            host.dns_alternate = config.static_dns[1];
        }
        host
    }

    pub fn gateway(&self) -> Option<Ipv4Address> {
        self.gateway
    }

    /// Changes the gateway, forgetting its MAC if the address moved.
    pub fn set_gateway(&mut self, gateway: Option<Ipv4Address>) {
        if self.gateway != gateway {
            self.gateway_mac = None;
        }
        self.gateway = gateway;
    }

    /// Drops everything learned from a lease.
    pub fn clear_lease(&mut self) {
        self.ip = None;
        self.subnet_mask = Ipv4Address::UNSPECIFIED;
        self.set_gateway(None);
        self.dns_preferred = None;
        self.dns_alternate = None;
    }

    pub fn is_own_ip(&self, ip: Ipv4Address) -> bool {
        self.ip == Some(ip)
    }

    pub fn subnet_broadcast(&self) -> Option<Ipv4Address> {
        self.ip.map(|ip| Ipv4Address::from_u32(ip.to_u32() | !self.subnet_mask.to_u32()))
    }

    /// Whether an inbound IPv4 destination is meant for this host.
    pub fn accepts(&self, dst: Ipv4Address) -> bool {
        match self.ip {
            // Before a lease, DHCP servers may unicast to the offered address.
            None => true,
            Some(ip) => {
                dst == ip
                    || dst.is_broadcast()
                    || dst.is_multicast()
                    || Some(dst) == self.subnet_broadcast()
            }
        }
    }

    pub fn dns_servers(&self) -> impl Iterator<Item = Ipv4Address> {
        self.dns_preferred.into_iter().chain(self.dns_alternate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_change_clears_mac() {
        let mut host = HostConfig::new(MacAddress::ZERO, "quail");
        host.set_gateway(Some(Ipv4Address::new(10, 0, 0, 1)));
        host.gateway_mac = Some(MacAddress::BROADCAST);

        host.set_gateway(Some(Ipv4Address::new(10, 0, 0, 1)));
        assert_eq!(host.gateway_mac, Some(MacAddress::BROADCAST));

        host.set_gateway(Some(Ipv4Address::new(10, 0, 0, 254)));
        assert_eq!(host.gateway_mac, None);
    }

    #[test]
    fn test_accepts() {
        let mut host = HostConfig::new(MacAddress::ZERO, "quail");
        assert!(host.accepts(Ipv4Address::new(10, 0, 0, 5)));

        host.ip = Some(Ipv4Address::new(192, 168, 1, 20));
        host.subnet_mask = Ipv4Address::new(255, 255, 255, 0);
        assert!(host.accepts(Ipv4Address::new(192, 168, 1, 20)));
        assert!(host.accepts(Ipv4Address::new(192, 168, 1, 255)));
        assert!(host.accepts(Ipv4Address::BROADCAST));
        assert!(host.accepts(Ipv4Address::new(224, 0, 0, 251)));
        assert!(!host.accepts(Ipv4Address::new(192, 168, 1, 21)));
    }

    #[test]
    fn test_static_config_copied() {
        let config = StackConfig {
            dhcp_enabled: false,
            static_ip: Some(Ipv4Address::new(10, 1, 1, 9)),
            static_gateway: Some(Ipv4Address::new(10, 1, 1, 1)),
            static_dns: [Some(Ipv4Address::new(1, 1, 1, 1)), None],
            ..StackConfig::default()
        };
        let host = HostConfig::from_config(&config);
        assert!(!host.dhcp_enabled);
        assert_eq!(host.ip, Some(Ipv4Address::new(10, 1, 1, 9)));
        assert_eq!(host.gateway(), Some(Ipv4Address::new(10, 1, 1, 1)));
        assert_eq!(host.dns_servers().count(), 1);
    }
}
