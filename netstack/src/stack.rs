//! The network stack: owns the controller, the host configuration and the
//! protocol state, and glues frames to handlers and handlers to the wire.
//!
//! Entry points come from three kinds of context:
//! - the receive interrupt ([`NetworkStack::on_interrupt`]) or a polling
//!   loop ([`NetworkStack::poll`]),
//! - the periodic tick ([`NetworkStack::on_tick`]),
//! - worker code calling the blocking API (`start`, DNS lookups, HTTP
//!   requests, ping). Blocking calls service the controller themselves while
//!   they wait, so they also work when the interrupt line is not wired.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::{HostConfig, StackConfig};
use crate::error::{NetError, Result};
use crate::hal::Clock;
use crate::net::arp::{self, ArpPacket};
use crate::net::dhcp::{DhcpClient, DhcpOutcome, DhcpPacket};
use crate::net::dispatch::{self, Route, UdpInbound};
use crate::net::dns::{DnsClient, DnsMessage};
use crate::net::ethernet::{
    build_frame, EthernetController, MacAddress, ResetKind, ServiceReport, ETHERTYPE_IPV4,
};
use crate::net::http::{HttpRequest, HttpResponse};
use crate::net::icmp::IcmpEcho;
use crate::net::ip::{build_packet, Ipv4Address, Ipv4Header, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::net::tcp::{ConnectionTable, OutSegment, TcpKey, TcpPacket, TcpSegment};
use crate::net::udp::{
    build_datagram, UdpDatagram, PORT_DHCP_CLIENT, PORT_DHCP_SERVER, PORT_DNS, PORT_LLMNR, PORT_MDNS,
    PORT_NETBIOS_NS,
};
use crate::net::{llmnr, mdns, netbios, NetworkStats, StatCounters};
use crate::sync::{Listeners, WaitSlot};
use crate::timer::SoftTimer;

/// Consecutive malformed frames before the receiver is reset.
const MALFORMED_RESET_THRESHOLD: u32 = 8;
/// Gateway ARP retransmission while a static start waits.
const ARP_RETRY_MS: u64 = 1_000;
const EPHEMERAL_BASE: u32 = 49_152;
const EPHEMERAL_SPAN: u32 = 16_383;
const PING_IDENTIFIER: u16 = 0x4e53;
const PING_PAYLOAD: &[u8] = b"netstack echo";
const HTTP_PORT: u16 = 80;
/// Service passes run back to back when interrupts were missed.
const MAX_PENDING_PASSES: usize = 4;

/// An HTTP request received on a listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestEvent {
    pub connection: TcpKey,
    pub remote_mac: MacAddress,
    pub request: HttpRequest,
}

/// An ICMP echo seen by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingEvent {
    pub remote_ip: Ipv4Address,
    pub identifier: u16,
    pub sequence: u16,
    /// Echo reply to one of our requests rather than an inbound request
    pub reply: bool,
}

pub struct NetworkStack<N: EthernetController, C: Clock> {
    nic: Mutex<N>,
    clock: C,
    config: StackConfig,
    host: Mutex<HostConfig>,
    ports: Mutex<BTreeSet<u16>>,
    tcp: Mutex<ConnectionTable>,
    dhcp: Mutex<DhcpClient>,
    dns: Mutex<DnsClient>,

    // Serialize workers sharing a wait slot
    resolver: Mutex<()>,
    connector: Mutex<()>,
    http_client: Mutex<()>,
    pinger: Mutex<()>,

    startup: WaitSlot<()>,
    dns_reply: WaitSlot<(Ipv4Address, u32)>,
    ping_reply: WaitSlot<u64>,
    tcp_open: WaitSlot<TcpKey>,
    http_reply: WaitSlot<Vec<u8>>,
    http_pending: Mutex<Option<(TcpKey, Vec<u8>)>>,
    ping_token: AtomicU32,
    ping_target: AtomicU32,

    link_listeners: Listeners<bool>,
    tcp_listeners: Listeners<TcpPacket>,
    udp_listeners: Listeners<UdpDatagram>,
    http_listeners: Listeners<HttpRequestEvent>,
    ping_listeners: Listeners<PingEvent>,

    stats: StatCounters,
    running: AtomicBool,
    halted: AtomicBool,
    link: AtomicBool,
    service_pending: AtomicBool,
    malformed_streak: AtomicU32,
    ip_ident: AtomicU32,
    next_port: AtomicU32,
    ping_sequence: AtomicU32,
    last_probe: Mutex<Option<(u64, bool)>>,
}

impl<N: EthernetController, C: Clock> NetworkStack<N, C> {
    pub fn new(nic: N, clock: C, config: StackConfig) -> Self {
        let mac = config.mac.as_bytes();
        let seed = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]) ^ clock.now_ms() as u32;
        let host = HostConfig::from_config(&config);
        let tcp_idle_ms = config.tcp_idle_ms;

        NetworkStack {
            nic: Mutex::new(nic),
            clock,
            config,
            host: Mutex::new(host),
            ports: Mutex::new(BTreeSet::new()),
            tcp: Mutex::new(ConnectionTable::new(tcp_idle_ms)),
            dhcp: Mutex::new(DhcpClient::new(seed)),
            dns: Mutex::new(DnsClient::new(seed as u16)),
            resolver: Mutex::new(()),
            connector: Mutex::new(()),
            http_client: Mutex::new(()),
            pinger: Mutex::new(()),
            startup: WaitSlot::new(),
            dns_reply: WaitSlot::new(),
            ping_reply: WaitSlot::new(),
            tcp_open: WaitSlot::new(),
            http_reply: WaitSlot::new(),
            http_pending: Mutex::new(None),
            ping_token: AtomicU32::new(u32::MAX),
            ping_target: AtomicU32::new(0),
            link_listeners: Listeners::new(),
            tcp_listeners: Listeners::new(),
            udp_listeners: Listeners::new(),
            http_listeners: Listeners::new(),
            ping_listeners: Listeners::new(),
            stats: StatCounters::new(),
            running: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            link: AtomicBool::new(false),
            service_pending: AtomicBool::new(false),
            malformed_streak: AtomicU32::new(0),
            ip_ident: AtomicU32::new(seed & 0xFFFF),
            next_port: AtomicU32::new(seed % EPHEMERAL_SPAN),
            ping_sequence: AtomicU32::new(0),
            last_probe: Mutex::new(None),
        }
    }

    // ---- lifecycle ----

    /// Replaces the addressing used by the next `start` with static values.
    pub fn configure_static(
        &mut self,
        ip: Ipv4Address,
        mask: Ipv4Address,
        gateway: Option<Ipv4Address>,
        dns: [Option<Ipv4Address>; 2],
    ) -> Result<()> {
        if self.is_running() {
            return Err(NetError::InvalidState);
        }
        self.config.dhcp_enabled = false;
        self.config.static_ip = Some(ip);
        self.config.static_mask = mask;
        self.config.static_gateway = gateway;
        self.config.static_dns = dns;
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mac = self.config.mac;
        let host_name = self.config.host_name.clone();
        self.start_with(mac, &host_name)
    }

    /// Brings up the controller and blocks until addressing is usable: a
    /// DHCP lease, or the static gateway answering ARP.
    pub fn start_with(&self, mac: MacAddress, host_name: &str) -> Result<()> {
        if self.is_running() {
            return Err(NetError::InvalidState);
        }

        let mut host = HostConfig::from_config(&self.config);
        host.mac = mac;
        host.host_name = String::from(host_name);
        if !host.dhcp_enabled && host.ip.is_none() {
            return Err(NetError::NotConfigured);
        }

        self.nic.lock().start(mac, &self.clock).map_err(|err| {
            log::error!("NET: controller start failed: {}", err);
            err
        })?;
        let link = self.nic.lock().link_up();
        self.link.store(link, Ordering::SeqCst);

        let dhcp_enabled = host.dhcp_enabled;
        *self.host.lock() = host;
        self.tcp.lock().clear();
        self.halted.store(false, Ordering::SeqCst);
        self.malformed_streak.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        log::info!("NET: starting as {} ({})", host_name, mac);

        self.startup.arm();
        let ready = if dhcp_enabled {
            self.start_dhcp()
        } else {
            self.start_static()
        };

        match ready {
            Ok(()) => {
                let host = self.host.lock();
                log::info!("NET: up with address {:?}, gateway {:?}", host.ip, host.gateway());
                Ok(())
            }
            Err(err) => {
                log::error!("NET: start failed: {}", err);
                if dhcp_enabled {
                    let mut host = self.host.lock();
                    self.dhcp.lock().release(&mut host);
                }
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn start_dhcp(&self) -> Result<()> {
        let discover = {
            let host = self.host.lock();
            self.dhcp.lock().begin(&host, self.clock.now_ms())
        };
        self.send_dhcp(&discover)?;

        let bound = self.startup.wait(&self.clock, self.config.start_timeout_ms, || {
            self.poll();
            self.drive_dhcp(self.clock.now_ms());
        });
        bound.ok_or(NetError::DhcpTimeout)
    }

    fn start_static(&self) -> Result<()> {
        let (mac, ip, gateway) = {
            let host = self.host.lock();
            (host.mac, host.ip.ok_or(NetError::NotConfigured)?, host.gateway())
        };
        self.send_gratuitous_arp()?;

        let gateway = match gateway {
            Some(gateway) => gateway,
            None => {
                log::warn!("NET: no gateway configured, local link only");
                self.startup.disarm();
                return Ok(());
            }
        };

        let who_has = ArpPacket::new_request(mac, ip, gateway).to_frame();
        self.transmit(&who_has)?;
        let mut retry = SoftTimer::periodic(ARP_RETRY_MS, self.clock.now_ms());
        let resolved = self.startup.wait(&self.clock, self.config.start_timeout_ms, || {
            self.poll();
            if retry.poll(self.clock.now_ms()) {
                let _ = self.transmit(&who_has);
            }
        });
        resolved.ok_or(NetError::ArpTimeout)
    }

    /// Closes open connections, releases the DHCP lease and stops handling
    /// traffic.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let fins: Vec<OutSegment> = {
            let mut tcp = self.tcp.lock();
            let fins: Vec<OutSegment> = tcp.keys().iter().filter_map(|key| tcp.close(key)).collect();
            tcp.clear();
            fins
        };
        for fin in &fins {
            let _ = self.send_segment(fin);
        }

        let release = {
            let mut host = self.host.lock();
            if host.dhcp_enabled {
                self.dhcp.lock().release(&mut host)
            } else {
                None
            }
        };
        if let Some(packet) = release {
            log::info!("DHCP: releasing {}", packet.ciaddr);
            if let Err(err) = self.send_dhcp(&packet) {
                log::warn!("DHCP: release not sent: {}", err);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("NET: stopped");
        Ok(())
    }

    /// Resets the controller and drops all connections.
    pub fn reset(&self, kind: ResetKind) -> Result<()> {
        self.nic.lock().reset(kind, &self.clock)?;
        self.tcp.lock().clear();
        let link = self.nic.lock().link_up();
        self.set_link(link);
        Ok(())
    }

    /// Announces our address: sender and target IP both our own.
    pub fn send_gratuitous_arp(&self) -> Result<()> {
        let (mac, ip) = {
            let host = self.host.lock();
            (host.mac, host.ip.ok_or(NetError::NotConfigured)?)
        };
        self.transmit(&ArpPacket::gratuitous(mac, ip).to_frame())
    }

    /// Asks who holds `ip` without claiming any address.
    pub fn send_arp_probe(&self, ip: Ipv4Address) -> Result<()> {
        let mac = self.host.lock().mac;
        self.transmit(&ArpPacket::probe(mac, ip).to_frame())
    }

    // ---- event entry points ----

    /// Receive interrupt. Never blocks: if a worker holds the controller or
    /// any lock the receive path takes, the pass is deferred to that
    /// worker's next poll or the next tick.
    ///
    /// On a single core an interrupted worker cannot release or take locks
    /// until this returns, so the check below cannot go stale. With several
    /// cores a lock taken after the check only makes this pass spin.
    pub fn on_interrupt(&self) {
        if self.receive_path_busy() {
            self.service_pending.store(true, Ordering::SeqCst);
            return;
        }
        let report = match self.nic.try_lock() {
            Some(mut nic) => nic.service(self.clock.now_ms()),
            None => {
                self.service_pending.store(true, Ordering::SeqCst);
                return;
            }
        };
        self.process_report(report);
    }

    fn receive_path_busy(&self) -> bool {
        self.host.is_locked()
            || self.ports.is_locked()
            || self.tcp.is_locked()
            || self.dhcp.is_locked()
            || self.dns.is_locked()
            || self.http_pending.is_locked()
            || self.startup.is_busy()
            || self.dns_reply.is_busy()
            || self.ping_reply.is_busy()
            || self.tcp_open.is_busy()
            || self.http_reply.is_busy()
            || self.link_listeners.is_busy()
            || self.tcp_listeners.is_busy()
            || self.udp_listeners.is_busy()
            || self.http_listeners.is_busy()
            || self.ping_listeners.is_busy()
    }

    /// Services the controller and handles every received frame.
    pub fn poll(&self) {
        for _ in 0..MAX_PENDING_PASSES {
            self.service_pending.store(false, Ordering::SeqCst);
            let report = self.nic.lock().service(self.clock.now_ms());
            self.process_report(report);
            if !self.service_pending.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    /// Periodic maintenance: controller watchdog and register repair, DHCP
    /// renewal and retransmission, deferred interrupt service.
    pub fn on_tick(&self) {
        if !self.is_running() {
            return;
        }
        let now = self.clock.now_ms();
        let maintenance = self.nic.lock().maintain(now);
        if let Some(up) = maintenance.link_changed {
            self.set_link(up);
        }
        if maintenance.force_service || self.service_pending.load(Ordering::SeqCst) {
            self.poll();
        }
        self.drive_dhcp(now);
    }

    fn process_report(&self, report: Result<ServiceReport>) {
        match report {
            Ok(report) => {
                if let Some(up) = report.link_changed {
                    self.set_link(up);
                }
                for _ in 0..report.dropped {
                    self.stats.dropped();
                }
                for frame in &report.frames {
                    self.handle_frame(frame);
                }
            }
            Err(err) => {
                self.stats.error();
                log::warn!("NET: controller service failed: {}", err);
            }
        }
    }

    fn set_link(&self, up: bool) {
        if self.link.swap(up, Ordering::SeqCst) != up {
            log::info!("NET: link {}", if up { "up" } else { "down" });
            self.link_listeners.notify(&up);
        }
    }

    /// Classifies one received Ethernet frame and runs its handler.
    pub fn handle_frame(&self, frame: &[u8]) {
        if !self.is_running() {
            return;
        }
        self.stats.received(frame.len());

        let route = {
            let host = self.host.lock();
            let ports = self.ports.lock();
            let tcp = self.tcp.lock();
            dispatch::classify(frame, &host, |port| ports.contains(&port), |key| tcp.contains(key))
        };

        if let Route::Malformed(reason) = route {
            self.on_malformed(reason);
            return;
        }
        self.malformed_streak.store(0, Ordering::Relaxed);

        let now = self.clock.now_ms();
        match route {
            Route::Arp(packet) => self.handle_arp(&packet),
            Route::Icmp { src_mac, ip, echo } => self.handle_icmp(src_mac, &ip, &echo),
            Route::Dhcp(inbound) => self.handle_dhcp(&inbound, now),
            Route::Mdns(inbound) => self.handle_mdns(&inbound),
            Route::Dns(inbound) => self.handle_dns(&inbound),
            Route::Llmnr(inbound) => self.handle_llmnr(&inbound),
            Route::NetBios(inbound) => self.handle_netbios(&inbound),
            Route::Udp(inbound) => self.handle_udp(&inbound),
            Route::Tcp { src_mac, ip, key, segment } => self.handle_tcp(src_mac, &ip, key, &segment, now),
            Route::Ignore(reason) => log::trace!("NET: ignored frame: {}", reason),
            Route::Malformed(_) => {}
        }
    }

    fn on_malformed(&self, reason: &str) {
        self.stats.dropped();
        let streak = self.malformed_streak.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("NET: malformed frame ({}), streak {}", reason, streak);
        if streak >= MALFORMED_RESET_THRESHOLD {
            let reset = self.nic.lock().reset_receiver(self.clock.now_ms());
            if reset {
                self.malformed_streak.store(0, Ordering::Relaxed);
            }
        }
    }

    // ---- protocol handlers ----

    fn handle_arp(&self, packet: &ArpPacket) {
        let (reply, bound) = {
            let mut host = self.host.lock();
            if arp::is_conflict(packet, &host) {
                drop(host);
                self.on_ip_conflict(packet);
                return;
            }
            let reply = arp::handle_request(packet, &host);
            let bound = arp::handle_reply(packet, &mut host);
            (reply, bound)
        };

        if let Some(reply) = reply {
            log::trace!("ARP: answering {}", packet.sender_ip);
            let _ = self.transmit(&reply.to_frame());
        }
        if bound {
            log::info!("ARP: gateway {} is at {}", packet.sender_ip, packet.sender_mac);
            self.startup.signal(());
        }
    }

    fn on_ip_conflict(&self, packet: &ArpPacket) {
        if self.config.suppress_ip_conflict {
            log::warn!(
                "ARP: {} also claims {}, conflict suppressed",
                packet.sender_mac,
                packet.sender_ip
            );
            return;
        }
        log::error!(
            "ARP: address {} in use by {}, halting network output",
            packet.sender_ip,
            packet.sender_mac
        );
        self.halted.store(true, Ordering::SeqCst);
    }

    fn handle_icmp(&self, src_mac: MacAddress, ip: &Ipv4Header, echo: &IcmpEcho) {
        let event = PingEvent {
            remote_ip: ip.src_addr,
            identifier: echo.identifier,
            sequence: echo.sequence,
            reply: !echo.is_request(),
        };

        if echo.is_request() {
            let reply = echo.reply_to().to_bytes();
            if let Err(err) = self.send_ip(ip.src_addr, Some(src_mac), IP_PROTO_ICMP, &reply) {
                log::debug!("ICMP: echo reply to {} failed: {}", ip.src_addr, err);
            }
        } else {
            let token = ((echo.identifier as u32) << 16) | echo.sequence as u32;
            if self.ping_token.load(Ordering::SeqCst) == token
                && self.ping_target.load(Ordering::SeqCst) == ip.src_addr.to_u32()
            {
                self.ping_reply.signal(self.clock.now_ms());
            }
        }
        self.ping_listeners.notify(&event);
    }

    fn handle_dhcp(&self, inbound: &UdpInbound<'_>, now: u64) {
        if inbound.dst_port != PORT_DHCP_CLIENT {
            return;
        }
        let packet = match DhcpPacket::from_bytes(inbound.payload) {
            Ok(packet) => packet,
            Err(reason) => {
                log::debug!("DHCP: bad message: {}", reason);
                return;
            }
        };
        let outcome = {
            let mut host = self.host.lock();
            if !host.dhcp_enabled {
                return;
            }
            self.dhcp.lock().handle(&packet, &mut host, now)
        };
        self.apply_dhcp(outcome);
    }

    fn drive_dhcp(&self, now: u64) {
        let outcome = {
            let mut host = self.host.lock();
            if !host.dhcp_enabled {
                return;
            }
            self.dhcp.lock().poll(&mut host, now)
        };
        self.apply_dhcp(outcome);
    }

    fn apply_dhcp(&self, outcome: DhcpOutcome) {
        if let Some(packet) = &outcome.send {
            if let Err(err) = self.send_dhcp(packet) {
                log::warn!("DHCP: send failed: {}", err);
            }
        }
        if outcome.lost_lease {
            self.tcp.lock().clear();
        }
        if outcome.bound {
            let (mac, ip, gateway) = {
                let host = self.host.lock();
                (host.mac, host.ip, host.gateway())
            };
            if let Some(ip) = ip {
                let _ = self.send_gratuitous_arp();
                if let Some(gateway) = gateway {
                    let _ = self.transmit(&ArpPacket::new_request(mac, ip, gateway).to_frame());
                }
            }
            self.startup.signal(());
        }
    }

    fn handle_mdns(&self, inbound: &UdpInbound<'_>) {
        let (host_name, ip) = match self.responder_identity() {
            Some(identity) => identity,
            None => return,
        };
        if let Some(reply) = mdns::answer(inbound.payload, &host_name, ip, inbound.src_port) {
            let sent = if reply.multicast {
                self.send_udp(mdns::MDNS_GROUP, PORT_MDNS, PORT_MDNS, None, &reply.payload)
            } else {
                self.send_udp(inbound.ip.src_addr, inbound.src_port, PORT_MDNS, Some(inbound.src_mac), &reply.payload)
            };
            if let Err(err) = sent {
                log::debug!("mDNS: reply failed: {}", err);
            }
        }
    }

    fn handle_dns(&self, inbound: &UdpInbound<'_>) {
        if inbound.src_port != PORT_DNS {
            return;
        }
        let message = match DnsMessage::from_bytes(inbound.payload) {
            Ok(message) => message,
            Err(reason) => {
                log::debug!("DNS: bad response: {}", reason);
                return;
            }
        };
        let answer = self.dns.lock().accept_response(&message);
        match answer {
            Some((_, ip, ttl)) => {
                self.dns_reply.signal((ip, ttl));
            }
            None => log::trace!("DNS: unsolicited response id {}", message.header.id),
        }
    }

    fn handle_llmnr(&self, inbound: &UdpInbound<'_>) {
        let (host_name, ip) = match self.responder_identity() {
            Some(identity) => identity,
            None => return,
        };
        if let Some(reply) = llmnr::answer(inbound.payload, &host_name, ip) {
            let _ = self.send_udp(inbound.ip.src_addr, inbound.src_port, PORT_LLMNR, Some(inbound.src_mac), &reply);
        }
    }

    fn handle_netbios(&self, inbound: &UdpInbound<'_>) {
        let (host_name, ip) = match self.responder_identity() {
            Some(identity) => identity,
            None => return,
        };
        if let Some(reply) = netbios::answer(inbound.payload, &host_name, ip) {
            let _ = self.send_udp(inbound.ip.src_addr, inbound.src_port, PORT_NETBIOS_NS, Some(inbound.src_mac), &reply);
        }
    }

    fn responder_identity(&self) -> Option<(String, Ipv4Address)> {
        let host = self.host.lock();
        let ip = host.ip?;
        if host.host_name.is_empty() {
            return None;
        }
        Some((host.host_name.clone(), ip))
    }

    fn handle_udp(&self, inbound: &UdpInbound<'_>) {
        let datagram = UdpDatagram {
            remote_mac: inbound.src_mac,
            remote_ip: inbound.ip.src_addr,
            remote_port: inbound.src_port,
            local_ip: inbound.ip.dst_addr,
            local_port: inbound.dst_port,
            payload: inbound.payload.to_vec(),
        };
        self.udp_listeners.notify(&datagram);
    }

    fn handle_tcp(&self, src_mac: MacAddress, ip: &Ipv4Header, key: TcpKey, segment: &TcpSegment, now: u64) {
        let reaction = self.tcp.lock().on_segment(key, src_mac, segment, ip.checksum, now);

        for reply in &reaction.replies {
            if let Err(err) = self.send_segment(reply) {
                log::debug!("TCP: reply to {} failed: {}", reply.key.remote_ip, err);
            }
        }
        if reaction.opened {
            self.tcp_open.signal(key);
        }

        if let Some(data) = reaction.data {
            let client_owned = {
                let mut pending = self.http_pending.lock();
                match pending.as_mut() {
                    Some((pending_key, buffer)) if *pending_key == key => {
                        buffer.extend_from_slice(&data);
                        if HttpResponse::is_complete(buffer) {
                            self.http_reply.signal(buffer.clone());
                        }
                        true
                    }
                    _ => false,
                }
            };
            if !client_owned {
                self.tcp_listeners.notify(&TcpPacket {
                    connection: key,
                    remote_mac: src_mac,
                    payload: data,
                });
            }
        }

        if let Some(raw) = reaction.http_request {
            match HttpRequest::parse(&raw) {
                Ok(request) => self.http_listeners.notify(&HttpRequestEvent {
                    connection: key,
                    remote_mac: src_mac,
                    request,
                }),
                Err(err) => {
                    log::warn!("HTTP: bad request from {}: {}", key.remote_ip, err);
                    self.tcp.lock().set_ready(&key, true);
                }
            }
        }

        if reaction.closed {
            // Responses without Content-Length end with the peer's FIN
            let pending = self.http_pending.lock();
            if let Some((pending_key, buffer)) = pending.as_ref() {
                if *pending_key == key && !buffer.is_empty() {
                    self.http_reply.signal(buffer.clone());
                }
            }
        }
    }

    // ---- transmit path ----

    fn transmit(&self, frame: &[u8]) -> Result<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(NetError::IpConflict);
        }
        if !self.is_running() {
            return Err(NetError::NotStarted);
        }
        let sent = self.nic.lock().send_frame(frame);
        match sent {
            Ok(()) => self.stats.sent(frame.len()),
            Err(_) => self.stats.error(),
        }
        sent
    }

    fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed) as u16
    }

    fn ephemeral_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_SPAN;
        (EPHEMERAL_BASE + offset) as u16
    }

    /// Source address, our MAC and the next-hop MAC for `dst`. Replies
    /// reuse the sender's MAC; everything else goes through the gateway.
    fn route(&self, dst: Ipv4Address, known_mac: Option<MacAddress>) -> Result<(Ipv4Address, MacAddress, MacAddress)> {
        let host = self.host.lock();
        let src = host.ip.ok_or(NetError::NotConfigured)?;
        let next_hop = if dst.is_broadcast() || Some(dst) == host.subnet_broadcast() {
            MacAddress::BROADCAST
        } else if dst.is_multicast() {
            MacAddress::for_multicast(dst)
        } else if let Some(mac) = known_mac {
            mac
        } else {
            host.gateway_mac.ok_or(NetError::NotConfigured)?
        };
        Ok((src, host.mac, next_hop))
    }

    fn send_ip(&self, dst: Ipv4Address, known_mac: Option<MacAddress>, protocol: u8, payload: &[u8]) -> Result<()> {
        let (src, mac, next_hop) = self.route(dst, known_mac)?;
        let packet = build_packet(src, dst, protocol, self.next_ident(), payload);
        self.transmit(&build_frame(next_hop, mac, ETHERTYPE_IPV4, &packet))
    }

    fn send_udp(
        &self,
        dst: Ipv4Address,
        dst_port: u16,
        src_port: u16,
        known_mac: Option<MacAddress>,
        payload: &[u8],
    ) -> Result<()> {
        let (src, mac, next_hop) = self.route(dst, known_mac)?;
        let datagram = build_datagram(src, dst, src_port, dst_port, payload);
        let packet = build_packet(src, dst, IP_PROTO_UDP, self.next_ident(), &datagram);
        self.transmit(&build_frame(next_hop, mac, ETHERTYPE_IPV4, &packet))
    }

    /// DHCP goes out before we have an address, always broadcast.
    fn send_dhcp(&self, packet: &DhcpPacket) -> Result<()> {
        let mac = self.host.lock().mac;
        let src = packet.ciaddr;
        let dst = Ipv4Address::BROADCAST;
        let datagram = build_datagram(src, dst, PORT_DHCP_CLIENT, PORT_DHCP_SERVER, &packet.to_bytes());
        let ip = build_packet(src, dst, IP_PROTO_UDP, self.next_ident(), &datagram);
        self.transmit(&build_frame(MacAddress::BROADCAST, mac, ETHERTYPE_IPV4, &ip))
    }

    fn send_segment(&self, out: &OutSegment) -> Result<()> {
        let (src, mac, next_hop) = self.route(out.key.remote_ip, Some(out.remote_mac))?;
        let bytes = out.segment.to_bytes(src, out.key.remote_ip);
        let packet = build_packet(src, out.key.remote_ip, IP_PROTO_TCP, self.next_ident(), &bytes);
        self.transmit(&build_frame(next_hop, mac, ETHERTYPE_IPV4, &packet))
    }

    // ---- ports ----

    pub fn listen_to_port(&self, port: u16) {
        self.ports.lock().insert(port);
    }

    pub fn stop_listening_to_port(&self, port: u16) {
        self.ports.lock().remove(&port);
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.ports.lock().contains(&port)
    }

    // ---- UDP / TCP / HTTP ----

    /// Fire-and-forget datagram.
    pub fn send_udp_message(&self, dst: Ipv4Address, dst_port: u16, src_port: u16, payload: &[u8]) -> Result<()> {
        self.send_udp(dst, dst_port, src_port, None, payload)
    }

    /// Sends `payload` on the connection `key`, opening it first if needed.
    /// Payloads larger than the peer's MSS go out as several segments.
    pub fn send_tcp(&self, key: TcpKey, payload: &[u8]) -> Result<()> {
        if !self.tcp.lock().contains(&key) {
            self.connect(key)?;
        }
        let mss = self.tcp.lock().mss(&key).ok_or(NetError::ConnectionClosed)? as usize;
        for chunk in payload.chunks(mss.max(1)) {
            let out = self
                .tcp
                .lock()
                .prepare_send(&key, chunk, self.clock.now_ms())
                .ok_or(NetError::ConnectionClosed)?;
            self.send_segment(&out)?;
        }
        Ok(())
    }

    fn connect(&self, key: TcpKey) -> Result<()> {
        let _guard = self.connector.lock();
        let (_, _, next_hop) = self.route(key.remote_ip, None)?;

        self.tcp_open.arm();
        let syn = self.tcp.lock().connect(key, next_hop, self.clock.now_ms());
        self.send_segment(&syn)?;
        match self.tcp_open.wait(&self.clock, self.config.http_timeout_ms, || self.poll()) {
            Some(opened) if opened == key => Ok(()),
            _ => {
                self.tcp.lock().remove(&key);
                log::debug!("TCP: connect to {}:{} timed out", key.remote_ip, key.remote_port);
                Err(NetError::Timeout)
            }
        }
    }

    /// Closes a connection with FIN+ACK.
    pub fn close_connection(&self, key: &TcpKey) -> Result<()> {
        let fin = self.tcp.lock().close(key);
        match fin {
            Some(fin) => self.send_segment(&fin),
            None => Ok(()),
        }
    }

    /// Client request to `request.host` on port 80.
    pub fn send_http_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_http_request_to(request, HTTP_PORT, self.config.http_timeout_ms)
    }

    pub fn send_http_request_to(&self, request: &HttpRequest, port: u16, timeout_ms: u64) -> Result<HttpResponse> {
        let _guard = self.http_client.lock();
        let remote_ip = self.dns().lookup(&request.host)?;
        let key = TcpKey {
            local_port: self.ephemeral_port(),
            remote_ip,
            remote_port: port,
        };

        self.connect(key)?;
        *self.http_pending.lock() = Some((key, Vec::new()));
        self.http_reply.arm();

        let reply = match self.send_tcp(key, &request.to_bytes()) {
            Ok(()) => self.http_reply.wait(&self.clock, timeout_ms, || self.poll()),
            Err(err) => {
                log::warn!("HTTP: request to {} failed: {}", request.host, err);
                None
            }
        };
        self.http_reply.disarm();
        *self.http_pending.lock() = None;
        let _ = self.close_connection(&key);

        match reply {
            Some(bytes) => HttpResponse::parse(&bytes),
            None => Err(NetError::Timeout),
        }
    }

    /// Streams a response on the connection a request arrived on: the header
    /// block, then the body in fixed-size chunks. The connection accepts the
    /// next request afterwards even if sending failed.
    pub fn send_response(&self, connection: &TcpKey, response: &HttpResponse) -> Result<()> {
        let result = self.stream_response(connection, response);
        self.tcp.lock().set_ready(connection, true);
        if let Err(err) = &result {
            log::warn!("HTTP: response to {} failed: {}", connection.remote_ip, err);
        }
        result
    }

    fn stream_response(&self, connection: &TcpKey, response: &HttpResponse) -> Result<()> {
        if !self.tcp.lock().contains(connection) {
            return Err(NetError::ConnectionClosed);
        }
        self.send_tcp(*connection, &response.header_block())?;
        for chunk in response.body_chunks(self.config.response_chunk) {
            self.send_tcp(*connection, chunk)?;
        }
        Ok(())
    }

    pub fn send_not_found(&self, connection: &TcpKey) -> Result<()> {
        self.send_response(connection, &HttpResponse::not_found())
    }

    // ---- DNS / ping / status ----

    pub fn dns(&self) -> Resolver<'_, N, C> {
        Resolver { stack: self }
    }

    /// Sends an echo request and waits for the reply. Returns the round trip
    /// in milliseconds.
    pub fn ping(&self, ip: Ipv4Address, timeout_ms: u64) -> Result<u64> {
        let _guard = self.pinger.lock();
        let sequence = self.ping_sequence.fetch_add(1, Ordering::Relaxed) as u16;
        let token = ((PING_IDENTIFIER as u32) << 16) | sequence as u32;
        self.ping_target.store(ip.to_u32(), Ordering::SeqCst);
        self.ping_token.store(token, Ordering::SeqCst);
        self.ping_reply.arm();

        let sent_at = self.clock.now_ms();
        let request = IcmpEcho::request(PING_IDENTIFIER, sequence, PING_PAYLOAD).to_bytes();
        let result = self.send_ip(ip, None, IP_PROTO_ICMP, &request).and_then(|()| {
            self.ping_reply
                .wait(&self.clock, timeout_ms, || self.poll())
                .map(|received_at| received_at.saturating_sub(sent_at))
                .ok_or(NetError::Timeout)
        });
        self.ping_reply.disarm();
        self.ping_token.store(u32::MAX, Ordering::SeqCst);
        result
    }

    pub fn connected_to_ethernet(&self) -> bool {
        self.is_running() && self.nic.lock().link_up()
    }

    /// Fetches the connectivity probe page. Results are reused for the
    /// probe interval.
    pub fn connected_to_internet(&self) -> bool {
        let now = self.clock.now_ms();
        if let Some((checked_at, online)) = *self.last_probe.lock() {
            if now.saturating_sub(checked_at) < self.config.probe_interval_ms {
                return online;
            }
        }

        let online = self.connected_to_ethernet() && {
            let request = HttpRequest::get(&self.config.probe_host, &self.config.probe_path);
            match self.send_http_request(&request) {
                Ok(response) => response.status == 200,
                Err(err) => {
                    log::debug!("NET: connectivity probe failed: {}", err);
                    false
                }
            }
        };
        *self.last_probe.lock() = Some((self.clock.now_ms(), online));
        online
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Output stopped after another host claimed our address.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn host_config(&self) -> HostConfig {
        self.host.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.tcp.lock().len()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn with_nic<R>(&self, f: impl FnOnce(&mut N) -> R) -> R {
        f(&mut self.nic.lock())
    }

    // ---- listeners ----

    pub fn link_listeners(&self) -> &Listeners<bool> {
        &self.link_listeners
    }

    pub fn tcp_listeners(&self) -> &Listeners<TcpPacket> {
        &self.tcp_listeners
    }

    pub fn udp_listeners(&self) -> &Listeners<UdpDatagram> {
        &self.udp_listeners
    }

    pub fn http_listeners(&self) -> &Listeners<HttpRequestEvent> {
        &self.http_listeners
    }

    pub fn ping_listeners(&self) -> &Listeners<PingEvent> {
        &self.ping_listeners
    }
}

/// Blocking name resolution through the configured DNS servers.
pub struct Resolver<'a, N: EthernetController, C: Clock> {
    stack: &'a NetworkStack<N, C>,
}

impl<'a, N: EthernetController, C: Clock> Resolver<'a, N, C> {
    pub fn lookup(&self, name: &str) -> Result<Ipv4Address> {
        self.lookup_with_timeout(name, self.stack.config.dns_timeout_secs)
    }

    /// Cache first, then the preferred server, then the alternate. When
    /// both stay silent an expired cache entry is better than nothing.
    pub fn lookup_with_timeout(&self, name: &str, timeout_secs: u64) -> Result<Ipv4Address> {
        if let Some(ip) = Ipv4Address::parse(name) {
            return Ok(ip);
        }
        let stack = self.stack;
        if !stack.is_running() {
            return Err(NetError::NotStarted);
        }
        if let Some(ip) = stack.dns.lock().cache().lookup(name, stack.clock.now_ms()) {
            return Ok(ip);
        }

        let _guard = stack.resolver.lock();
        let servers: Vec<Ipv4Address> = stack.host.lock().dns_servers().collect();
        for server in servers {
            if let Some((ip, ttl)) = self.query(server, name, timeout_secs)? {
                stack.dns.lock().cache_mut().insert(name, ip, ttl, stack.clock.now_ms());
                log::debug!("DNS: {} is {} (ttl {}s)", name, ip, ttl);
                return Ok(ip);
            }
            log::warn!("DNS: no answer from {} for {}", server, name);
        }

        stack.dns.lock().cache().lookup_stale(name).ok_or(NetError::ResolutionFailed)
    }

    fn query(&self, server: Ipv4Address, name: &str, timeout_secs: u64) -> Result<Option<(Ipv4Address, u32)>> {
        let stack = self.stack;
        let (_, query) = stack.dns.lock().start_query(name).map_err(NetError::Malformed)?;
        stack.dns_reply.arm();

        let port = stack.ephemeral_port();
        let answer = match stack.send_udp(server, PORT_DNS, port, None, &query) {
            Ok(()) => stack.dns_reply.wait(&stack.clock, timeout_secs.saturating_mul(1000), || stack.poll()),
            Err(err) => {
                log::debug!("DNS: query to {} not sent: {}", server, err);
                None
            }
        };
        stack.dns_reply.disarm();
        stack.dns.lock().finish_query();
        Ok(answer)
    }
}
