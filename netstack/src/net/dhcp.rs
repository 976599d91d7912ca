// DHCP (Dynamic Host Configuration Protocol) Client Implementation
use alloc::string::String;
use alloc::vec::Vec;

use super::ethernet::MacAddress;
use super::ip::Ipv4Address;
use crate::config::HostConfig;
use crate::timer::SoftTimer;

// DHCP Message Types
pub const DHCP_DISCOVER: u8 = 1;
pub const DHCP_OFFER: u8 = 2;
pub const DHCP_REQUEST: u8 = 3;
pub const DHCP_ACK: u8 = 5;
pub const DHCP_NAK: u8 = 6;
pub const DHCP_RELEASE: u8 = 7;

// DHCP Options
const DHCP_OPT_PAD: u8 = 0;
const DHCP_OPT_SUBNET_MASK: u8 = 1;
const DHCP_OPT_ROUTER: u8 = 3;
const DHCP_OPT_DNS_SERVER: u8 = 6;
const DHCP_OPT_HOSTNAME: u8 = 12;
const DHCP_OPT_REQUESTED_IP: u8 = 50;
const DHCP_OPT_LEASE_TIME: u8 = 51;
const DHCP_OPT_MESSAGE_TYPE: u8 = 53;
const DHCP_OPT_SERVER_ID: u8 = 54;
const DHCP_OPT_PARAM_REQUEST: u8 = 55;
const DHCP_OPT_RENEWAL_TIME: u8 = 58;
const DHCP_OPT_CLIENT_ID: u8 = 61;
const DHCP_OPT_END: u8 = 255;

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

// DHCP Operation Codes
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

const HTYPE_ETHERNET: u8 = 1;
const FLAG_BROADCAST: u16 = 0x8000;

const BOOTP_FIXED_SIZE: usize = 236;
const BOOTP_MIN_SIZE: usize = 300;

// Client timing
const DHCP_RETRY_MS: u64 = 4_000;
const DHCP_REQUEST_ATTEMPTS: u8 = 3;
const DHCP_FALLBACK_RENEWAL_SECS: u32 = 2 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub message_type: Option<u8>,
    pub subnet_mask: Option<Ipv4Address>,
    pub router: Option<Ipv4Address>,
    pub dns_servers: Vec<Ipv4Address>,
    pub host_name: Option<String>,
    pub requested_ip: Option<Ipv4Address>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Address>,
    pub param_request: Vec<u8>,
    pub renewal_time: Option<u32>,
    pub client_id: Option<MacAddress>,
}

impl DhcpOptions {
    fn parse(mut data: &[u8]) -> Self {
        let mut opts = Self::default();
        while let Some(&code) = data.first() {
            if code == DHCP_OPT_END {
                break;
            }
            if code == DHCP_OPT_PAD {
                data = &data[1..];
                continue;
            }
            let len = match data.get(1) {
                Some(&len) => len as usize,
                None => break,
            };
            let value = match data.get(2..2 + len) {
                Some(value) => value,
                None => break,
            };
            match code {
                DHCP_OPT_MESSAGE_TYPE if len == 1 => opts.message_type = Some(value[0]),
                DHCP_OPT_SUBNET_MASK if len == 4 => opts.subnet_mask = Ipv4Address::from_bytes(value),
                DHCP_OPT_ROUTER if len >= 4 => opts.router = Ipv4Address::from_bytes(value),
                DHCP_OPT_DNS_SERVER => {
                    opts.dns_servers = value.chunks_exact(4).filter_map(Ipv4Address::from_bytes).collect();
                }
                DHCP_OPT_HOSTNAME => opts.host_name = Some(String::from_utf8_lossy(value).into_owned()),
                DHCP_OPT_REQUESTED_IP if len == 4 => opts.requested_ip = Ipv4Address::from_bytes(value),
                DHCP_OPT_LEASE_TIME if len == 4 => opts.lease_time = Some(be_u32(value)),
                DHCP_OPT_SERVER_ID if len == 4 => opts.server_id = Ipv4Address::from_bytes(value),
                DHCP_OPT_PARAM_REQUEST => opts.param_request = value.to_vec(),
                DHCP_OPT_RENEWAL_TIME if len == 4 => opts.renewal_time = Some(be_u32(value)),
                DHCP_OPT_CLIENT_ID if len == 7 && value[0] == HTYPE_ETHERNET => {
                    opts.client_id = MacAddress::from_bytes(&value[1..]);
                }
                _ => {}
            }
            data = &data[2 + len..];
        }
        opts
    }

    fn encode(&self, out: &mut Vec<u8>) {
        fn put(out: &mut Vec<u8>, code: u8, value: &[u8]) {
            out.push(code);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }

        if let Some(message_type) = self.message_type {
            put(out, DHCP_OPT_MESSAGE_TYPE, &[message_type]);
        }
        if let Some(mac) = self.client_id {
            let mut id = [0u8; 7];
            id[0] = HTYPE_ETHERNET;
            id[1..].copy_from_slice(mac.as_bytes());
            put(out, DHCP_OPT_CLIENT_ID, &id);
        }
        if let Some(ip) = self.requested_ip {
            put(out, DHCP_OPT_REQUESTED_IP, ip.as_bytes());
        }
        if let Some(ip) = self.server_id {
            put(out, DHCP_OPT_SERVER_ID, ip.as_bytes());
        }
        if let Some(name) = &self.host_name {
            let name = &name.as_bytes()[..name.len().min(255)];
            put(out, DHCP_OPT_HOSTNAME, name);
        }
        if let Some(mask) = self.subnet_mask {
            put(out, DHCP_OPT_SUBNET_MASK, mask.as_bytes());
        }
        if let Some(router) = self.router {
            put(out, DHCP_OPT_ROUTER, router.as_bytes());
        }
        if !self.dns_servers.is_empty() {
            let servers: Vec<u8> = self.dns_servers.iter().flat_map(|ip| ip.octets()).collect();
            put(out, DHCP_OPT_DNS_SERVER, &servers);
        }
        if let Some(lease) = self.lease_time {
            put(out, DHCP_OPT_LEASE_TIME, &lease.to_be_bytes());
        }
        if let Some(t1) = self.renewal_time {
            put(out, DHCP_OPT_RENEWAL_TIME, &t1.to_be_bytes());
        }
        if !self.param_request.is_empty() {
            put(out, DHCP_OPT_PARAM_REQUEST, &self.param_request);
        }
        out.push(DHCP_OPT_END);
    }
}

fn be_u32(value: &[u8]) -> u32 {
    u32::from_be_bytes([value[0], value[1], value[2], value[3]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Address,
    pub yiaddr: Ipv4Address,
    pub siaddr: Ipv4Address,
    pub giaddr: Ipv4Address,
    pub chaddr: MacAddress,
    pub options: DhcpOptions,
}

impl DhcpPacket {
    fn request_base(mac: MacAddress, xid: u32, message_type: u8) -> Self {
        Self {
            op: BOOTREQUEST,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Address::UNSPECIFIED,
            yiaddr: Ipv4Address::UNSPECIFIED,
            siaddr: Ipv4Address::UNSPECIFIED,
            giaddr: Ipv4Address::UNSPECIFIED,
            chaddr: mac,
            options: DhcpOptions {
                message_type: Some(message_type),
                client_id: Some(mac),
                ..DhcpOptions::default()
            },
        }
    }

    pub fn message_type(&self) -> Option<u8> {
        self.options.message_type
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < BOOTP_FIXED_SIZE + DHCP_MAGIC_COOKIE.len() {
            return Err("DHCP message too small");
        }
        if data[BOOTP_FIXED_SIZE..BOOTP_FIXED_SIZE + 4] != DHCP_MAGIC_COOKIE {
            return Err("Missing DHCP magic cookie");
        }
        if data[1] != HTYPE_ETHERNET || data[2] != 6 {
            return Err("Not an Ethernet DHCP message");
        }
        let ip = |offset: usize| Ipv4Address::from_bytes(&data[offset..offset + 4]).unwrap_or_default();

        Ok(Self {
            op: data[0],
            xid: be_u32(&data[4..8]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: ip(12),
            yiaddr: ip(16),
            siaddr: ip(20),
            giaddr: ip(24),
            chaddr: MacAddress::from_bytes(&data[28..34]).unwrap_or_default(),
            options: DhcpOptions::parse(&data[BOOTP_FIXED_SIZE + 4..]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BOOTP_MIN_SIZE + 64);
        bytes.push(self.op);
        bytes.push(HTYPE_ETHERNET);
        bytes.push(6);
        bytes.push(0);
        bytes.extend_from_slice(&self.xid.to_be_bytes());
        bytes.extend_from_slice(&self.secs.to_be_bytes());
        bytes.extend_from_slice(&self.flags.to_be_bytes());
        bytes.extend_from_slice(self.ciaddr.as_bytes());
        bytes.extend_from_slice(self.yiaddr.as_bytes());
        bytes.extend_from_slice(self.siaddr.as_bytes());
        bytes.extend_from_slice(self.giaddr.as_bytes());
        bytes.extend_from_slice(self.chaddr.as_bytes());
        // chaddr padding, sname and file
        bytes.resize(BOOTP_FIXED_SIZE, 0);
        bytes.extend_from_slice(&DHCP_MAGIC_COOKIE);
        self.options.encode(&mut bytes);
        if bytes.len() < BOOTP_MIN_SIZE {
            bytes.resize(BOOTP_MIN_SIZE, 0);
        }
        bytes
    }
}

// DHCP Client State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Idle,
    Discovering,
    /// Offer accepted, first Request sent
    Offered,
    /// Request retransmitted after no answer
    Requesting,
    Bound,
    Renewing,
}

/// What the stack must do after feeding the client a packet or a tick.
#[derive(Debug, Default)]
pub struct DhcpOutcome {
    pub send: Option<DhcpPacket>,
    /// A lease was committed to the host configuration
    pub bound: bool,
    /// The lease was withdrawn (Nak or expiry)
    pub lost_lease: bool,
}

// DHCP Client
pub struct DhcpClient {
    state: DhcpState,
    xid: u32,
    seed: u32,
    offered_ip: Option<Ipv4Address>,
    server_id: Option<Ipv4Address>,
    renewal: SoftTimer,
    expiry: SoftTimer,
    retry: SoftTimer,
    request_attempts: u8,
}

impl DhcpClient {
    pub fn new(seed: u32) -> Self {
        Self {
            state: DhcpState::Idle,
            xid: 0,
            seed,
            offered_ip: None,
            server_id: None,
            renewal: SoftTimer::new(),
            expiry: SoftTimer::new(),
            retry: SoftTimer::new(),
            request_attempts: 0,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn offered_ip(&self) -> Option<Ipv4Address> {
        self.offered_ip
    }

    pub fn renewal_deadline(&self) -> Option<u64> {
        self.renewal.deadline()
    }

    fn next_xid(&mut self, now: u64) {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) ^ (now as u32);
        self.xid = self.seed;
    }

    fn discover(&self, host: &HostConfig) -> DhcpPacket {
        let mut packet = DhcpPacket::request_base(host.mac, self.xid, DHCP_DISCOVER);
        packet.options.host_name = named(host);
        packet.options.param_request = alloc::vec![
            DHCP_OPT_SUBNET_MASK,
            DHCP_OPT_ROUTER,
            DHCP_OPT_DNS_SERVER,
            DHCP_OPT_LEASE_TIME,
            DHCP_OPT_RENEWAL_TIME,
        ];
        packet
    }

    fn request(&self, host: &HostConfig) -> DhcpPacket {
        let mut packet = DhcpPacket::request_base(host.mac, self.xid, DHCP_REQUEST);
        packet.options.host_name = named(host);
        if self.state == DhcpState::Renewing {
            packet.ciaddr = host.ip.unwrap_or_default();
        } else {
            packet.options.requested_ip = self.offered_ip;
            packet.options.server_id = self.server_id;
        }
        packet
    }

    /// Starts a new lease attempt with a fresh transaction id.
    pub fn begin(&mut self, host: &HostConfig, now: u64) -> DhcpPacket {
        self.next_xid(now);
        self.offered_ip = None;
        self.server_id = None;
        self.renewal.cancel();
        self.expiry.cancel();
        self.state = DhcpState::Discovering;
        self.retry.arm(now, DHCP_RETRY_MS);
        log::debug!("DHCP: discover xid {:08x}", self.xid);
        self.discover(host)
    }

    pub fn handle(&mut self, packet: &DhcpPacket, host: &mut HostConfig, now: u64) -> DhcpOutcome {
        let mut outcome = DhcpOutcome::default();
        if packet.op != BOOTREPLY || packet.xid != self.xid || packet.chaddr != host.mac {
            return outcome;
        }

        match (packet.message_type(), self.state) {
            (Some(DHCP_OFFER), DhcpState::Discovering) => {
                log::debug!("DHCP: offer {} from {:?}", packet.yiaddr, packet.options.server_id);
                self.offered_ip = Some(packet.yiaddr);
                self.server_id = packet.options.server_id.or(Some(packet.siaddr));
                adopt(&packet.options, host);
                self.state = DhcpState::Offered;
                self.request_attempts = 1;
                self.retry.arm(now, DHCP_RETRY_MS);
                outcome.send = Some(self.request(host));
            }
            (
                Some(DHCP_ACK),
                DhcpState::Offered | DhcpState::Requesting | DhcpState::Renewing,
            ) => {
                host.ip = Some(packet.yiaddr);
                adopt(&packet.options, host);
                let lease = packet.options.lease_time;
                let t1 = packet
                    .options
                    .renewal_time
                    .or(lease.map(|lease| lease / 2))
                    .unwrap_or(DHCP_FALLBACK_RENEWAL_SECS);
                self.renewal.arm(now, t1 as u64 * 1000);
                match lease {
                    Some(lease) if lease != u32::MAX => self.expiry.arm(now, lease as u64 * 1000),
                    _ => self.expiry.cancel(),
                }
                self.retry.cancel();
                self.offered_ip = None;
                self.state = DhcpState::Bound;
                log::info!("DHCP: bound to {} (renew in {}s)", packet.yiaddr, t1);
                outcome.bound = true;
            }
            (
                Some(DHCP_NAK),
                DhcpState::Offered | DhcpState::Requesting | DhcpState::Bound | DhcpState::Renewing,
            ) => {
                log::warn!("DHCP: NAK received, restarting");
                host.clear_lease();
                outcome.lost_lease = true;
                outcome.send = Some(self.begin(host, now));
            }
            _ => {}
        }
        outcome
    }

    /// Drives renewal, lease expiry and retransmission.
    pub fn poll(&mut self, host: &mut HostConfig, now: u64) -> DhcpOutcome {
        let mut outcome = DhcpOutcome::default();
        if self.state == DhcpState::Idle {
            return outcome;
        }

        if self.expiry.poll(now) {
            log::warn!("DHCP: lease expired");
            host.clear_lease();
            outcome.lost_lease = true;
            outcome.send = Some(self.begin(host, now));
            return outcome;
        }

        if self.renewal.poll(now) && self.state == DhcpState::Bound {
            self.next_xid(now);
            self.state = DhcpState::Renewing;
            self.retry.arm(now, DHCP_RETRY_MS);
            log::debug!("DHCP: renewing {:?}", host.ip);
            outcome.send = Some(self.request(host));
            return outcome;
        }

        if self.retry.poll(now) {
            match self.state {
                DhcpState::Discovering => {
                    self.retry.arm(now, DHCP_RETRY_MS);
                    outcome.send = Some(self.discover(host));
                }
                DhcpState::Offered | DhcpState::Requesting => {
                    if self.request_attempts >= DHCP_REQUEST_ATTEMPTS {
                        outcome.send = Some(self.begin(host, now));
                    } else {
                        self.request_attempts += 1;
                        self.state = DhcpState::Requesting;
                        self.retry.arm(now, DHCP_RETRY_MS);
                        outcome.send = Some(self.request(host));
                    }
                }
                DhcpState::Renewing => {
                    self.retry.arm(now, DHCP_RETRY_MS);
                    outcome.send = Some(self.request(host));
                }
                DhcpState::Idle | DhcpState::Bound => {}
            }
        }
        outcome
    }

    /// Gives the lease back and forgets the session.
    pub fn release(&mut self, host: &mut HostConfig) -> Option<DhcpPacket> {
        let packet = match (self.state, host.ip, self.server_id) {
            (DhcpState::Bound | DhcpState::Renewing, Some(ip), server_id) => {
                let mut packet = DhcpPacket::request_base(host.mac, self.xid, DHCP_RELEASE);
                packet.flags = 0;
                packet.ciaddr = ip;
                packet.options.server_id = server_id;
                Some(packet)
            }
            _ => None,
        };
        self.state = DhcpState::Idle;
        self.offered_ip = None;
        self.server_id = None;
        self.renewal.cancel();
        self.expiry.cancel();
        self.retry.cancel();
        host.clear_lease();
        packet
    }
}

fn named(host: &HostConfig) -> Option<String> {
    if host.host_name.is_empty() {
        None
    } else {
        Some(host.host_name.clone())
    }
}

fn adopt(options: &DhcpOptions, host: &mut HostConfig) {
    if let Some(mask) = options.subnet_mask {
        host.subnet_mask = mask;
    }
    if options.router.is_some() {
        host.set_gateway(options.router);
    }
    let mut servers = options.dns_servers.iter().copied();
    if let Some(dns) = servers.next() {
        host.dns_preferred = Some(dns);
        host.dns_alternate = servers.next();
    }
}
