// TCP Implementation
//
// Request/response oriented subset: no retransmission, no reassembly of
// out-of-order data, and the receive window is only ever adjusted locally.
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::checksum;
use super::ethernet::MacAddress;
use super::ip::{Ipv4Address, IP_PROTO_TCP};

pub const TCP_HEADER_SIZE: usize = 20;

// TCP options
const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

// TCP constants
pub const TCP_MSS_ETHERNET: u16 = 1460;
pub const TCP_WINDOW_DEFAULT: u16 = 2 * TCP_MSS_ETHERNET;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option, the only option parsed or emitted
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn parse(src: Ipv4Address, dst: Ipv4Address, data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < TCP_HEADER_SIZE {
            return Err("TCP segment too small");
        }
        let header_len = ((data[12] >> 4) as usize) * 4;
        if header_len < TCP_HEADER_SIZE || header_len > data.len() {
            return Err("Bad TCP data offset");
        }
        if checksum::pseudo_header_checksum(src, dst, IP_PROTO_TCP, data) != 0 {
            return Err("Bad TCP checksum");
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_bits_truncate(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            mss: parse_mss(&data[TCP_HEADER_SIZE..header_len]),
            payload: data[header_len..].to_vec(),
        })
    }

    pub fn to_bytes(&self, src: Ipv4Address, dst: Ipv4Address) -> Vec<u8> {
        let options_len = if self.mss.is_some() { 4 } else { 0 };
        let header_len = TCP_HEADER_SIZE + options_len;
        let mut segment = Vec::with_capacity(header_len + self.payload.len());
        segment.extend_from_slice(&self.src_port.to_be_bytes());
        segment.extend_from_slice(&self.dst_port.to_be_bytes());
        segment.extend_from_slice(&self.seq.to_be_bytes());
        segment.extend_from_slice(&self.ack.to_be_bytes());
        segment.push(((header_len / 4) as u8) << 4);
        segment.push(self.flags.bits());
        segment.extend_from_slice(&self.window.to_be_bytes());
        segment.extend_from_slice(&[0, 0, 0, 0]);
        if let Some(mss) = self.mss {
            segment.push(TCP_OPT_MSS);
            segment.push(4);
            segment.extend_from_slice(&mss.to_be_bytes());
        }
        segment.extend_from_slice(&self.payload);
        let sum = checksum::pseudo_header_checksum(src, dst, IP_PROTO_TCP, &segment);
        checksum::write_u16_be(&mut segment, 16, sum);
        segment
    }
}

fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == TCP_OPT_MSS && len == 4 {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

/// Connection 4-tuple; the local address is implicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpKey {
    pub local_port: u16,
    pub remote_ip: Ipv4Address,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Active open, SYN sent
    SynSent,
    /// Passive open, SYN+ACK sent
    SynReceived,
    Established,
    Closing,
}

#[derive(Debug, Clone)]
pub struct TcpConnection {
    pub key: TcpKey,
    pub remote_mac: MacAddress,
    pub state: TcpState,
    /// Next sequence number we send
    pub local_seq: u32,
    /// Next sequence number expected from the peer (our ACK)
    pub remote_seq: u32,
    pub window: u16,
    pub mss: u16,
    pub last_activity: u64,
    pub last_request_checksum: Option<u16>,
    pub ready_for_request: bool,
}

impl TcpConnection {
    fn segment(&self, flags: TcpFlags, payload: &[u8]) -> OutSegment {
        OutSegment {
            key: self.key,
            remote_mac: self.remote_mac,
            segment: TcpSegment {
                src_port: self.key.local_port,
                dst_port: self.key.remote_port,
                seq: self.local_seq,
                ack: if flags.contains(TcpFlags::ACK) { self.remote_seq } else { 0 },
                flags,
                window: self.window,
                mss: None,
                payload: payload.to_vec(),
            },
        }
    }
}

/// A segment to transmit to `key.remote_ip` via `remote_mac`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    pub key: TcpKey,
    pub remote_mac: MacAddress,
    pub segment: TcpSegment,
}

/// What the stack must do after an inbound segment.
#[derive(Debug, Default)]
pub struct TcpReaction {
    pub replies: Vec<OutSegment>,
    /// Application payload for TCP listeners
    pub data: Option<Vec<u8>>,
    /// A new HTTP request on a ready connection
    pub http_request: Option<Vec<u8>>,
    /// Active open completed
    pub opened: bool,
    pub closed: bool,
}

/// A TCP payload delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub connection: TcpKey,
    pub remote_mac: MacAddress,
    pub payload: Vec<u8>,
}

pub fn is_http_request(payload: &[u8]) -> bool {
    payload.starts_with(b"GET ") || payload.starts_with(b"POST ")
}

// TCP connection table
pub struct ConnectionTable {
    connections: BTreeMap<TcpKey, TcpConnection>,
    idle_ms: u64,
    isn_counter: u32,
}

impl ConnectionTable {
    pub fn new(idle_ms: u64) -> Self {
        Self {
            connections: BTreeMap::new(),
            idle_ms,
            isn_counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, key: &TcpKey) -> Option<&TcpConnection> {
        self.connections.get(key)
    }

    pub fn contains(&self, key: &TcpKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn keys(&self) -> Vec<TcpKey> {
        self.connections.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    pub fn remove(&mut self, key: &TcpKey) -> Option<TcpConnection> {
        self.connections.remove(key)
    }

    fn next_isn(&mut self, now: u64) -> u32 {
        self.isn_counter = self.isn_counter.wrapping_add(64_000);
        (now as u32).wrapping_mul(250).wrapping_add(self.isn_counter)
    }

    /// Removes connections idle longer than the threshold, returning a
    /// FIN+ACK for each.
    pub fn sweep_idle(&mut self, now: u64) -> Vec<OutSegment> {
        let idle_ms = self.idle_ms;
        let stale: Vec<TcpKey> = self
            .connections
            .values()
            .filter(|conn| now.saturating_sub(conn.last_activity) > idle_ms)
            .map(|conn| conn.key)
            .collect();

        let mut fins = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(conn) = self.connections.remove(&key) {
                log::debug!("TCP: closing idle connection {}:{}", key.remote_ip, key.remote_port);
                fins.push(conn.segment(TcpFlags::FIN | TcpFlags::ACK, &[]));
            }
        }
        fins
    }

    pub fn on_segment(
        &mut self,
        key: TcpKey,
        remote_mac: MacAddress,
        seg: &TcpSegment,
        ip_checksum: u16,
        now: u64,
    ) -> TcpReaction {
        let mut reaction = TcpReaction::default();
        let flags = seg.flags;

        if flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK) {
            self.accept(key, remote_mac, seg, now, &mut reaction);
            return reaction;
        }

        let conn = match self.connections.get_mut(&key) {
            Some(conn) => conn,
            None => return reaction,
        };
        conn.last_activity = now;

        if flags.contains(TcpFlags::SYN) {
            // SYN+ACK answering our active open
            if conn.state == TcpState::SynSent {
                conn.remote_seq = seg.seq.wrapping_add(1);
                conn.local_seq = seg.ack;
                conn.state = TcpState::Established;
                conn.ready_for_request = true;
                if let Some(mss) = seg.mss {
                    conn.mss = conn.mss.min(mss);
                }
                reaction.replies.push(conn.segment(TcpFlags::ACK, &[]));
                reaction.opened = true;
            }
            return reaction;
        }

        if flags.contains(TcpFlags::RST) {
            if flags.contains(TcpFlags::ACK) {
                self.connections.remove(&key);
                reaction.closed = true;
            } else {
                conn.state = TcpState::Closing;
            }
            return reaction;
        }

        if flags.contains(TcpFlags::FIN) {
            if !seg.payload.is_empty() && seg.seq == conn.remote_seq {
                reaction.data = Some(seg.payload.clone());
            }
            conn.remote_seq = seg
                .seq
                .wrapping_add(seg.payload.len() as u32)
                .wrapping_add(1);
            if flags.contains(TcpFlags::ACK) {
                if conn.state == TcpState::Closing {
                    reaction.replies.push(conn.segment(TcpFlags::ACK, &[]));
                } else {
                    reaction.replies.push(conn.segment(TcpFlags::FIN | TcpFlags::ACK, &[]));
                }
                self.connections.remove(&key);
                reaction.closed = true;
            } else {
                conn.state = TcpState::Closing;
                reaction.replies.push(conn.segment(TcpFlags::ACK, &[]));
            }
            return reaction;
        }

        if conn.state == TcpState::SynReceived && flags.contains(TcpFlags::ACK) {
            conn.state = TcpState::Established;
            conn.ready_for_request = true;
        }

        if seg.payload.is_empty() {
            if conn.state == TcpState::Closing && flags.contains(TcpFlags::ACK) {
                self.connections.remove(&key);
                reaction.closed = true;
            }
            return reaction;
        }

        if seg.seq != conn.remote_seq {
            // Duplicate or out of order; re-acknowledge what we have.
            reaction.replies.push(conn.segment(TcpFlags::ACK, &[]));
            return reaction;
        }

        let len = seg.payload.len();
        conn.remote_seq = conn.remote_seq.wrapping_add(len as u32);
        conn.window = conn.window.saturating_sub(len.min(u16::MAX as usize) as u16);
        if flags.contains(TcpFlags::PSH) {
            // Payload is consumed synchronously below.
            conn.window = TCP_WINDOW_DEFAULT;
            reaction.replies.push(conn.segment(TcpFlags::ACK, &[]));
        }

        // Listeners see every in-order payload; requests also go up to HTTP.
        if is_http_request(&seg.payload) {
            if conn.ready_for_request && conn.last_request_checksum != Some(ip_checksum) {
                conn.last_request_checksum = Some(ip_checksum);
                conn.ready_for_request = false;
                reaction.http_request = Some(seg.payload.clone());
            } else {
                log::trace!("TCP: dropping repeated request from {}", key.remote_ip);
            }
        }
        reaction.data = Some(seg.payload.clone());
        reaction
    }

    fn accept(
        &mut self,
        key: TcpKey,
        remote_mac: MacAddress,
        seg: &TcpSegment,
        now: u64,
        reaction: &mut TcpReaction,
    ) {
        if self.connections.remove(&key).is_some() {
            log::debug!("TCP: SYN replaces connection from {}:{}", key.remote_ip, key.remote_port);
        }
        reaction.replies.extend(self.sweep_idle(now));

        let isn = self.next_isn(now);
        let mss = seg.mss.map_or(TCP_MSS_ETHERNET, |mss| mss.min(TCP_MSS_ETHERNET));
        let mut conn = TcpConnection {
            key,
            remote_mac,
            state: TcpState::SynReceived,
            local_seq: isn,
            remote_seq: seg.seq.wrapping_add(1),
            window: TCP_WINDOW_DEFAULT,
            mss,
            last_activity: now,
            last_request_checksum: None,
            ready_for_request: false,
        };
        let mut syn_ack = conn.segment(TcpFlags::SYN | TcpFlags::ACK, &[]);
        syn_ack.segment.mss = Some(mss);
        reaction.replies.push(syn_ack);
        conn.local_seq = isn.wrapping_add(1);
        self.connections.insert(key, conn);
    }

    /// Starts an active open and returns the SYN to send.
    pub fn connect(&mut self, key: TcpKey, remote_mac: MacAddress, now: u64) -> OutSegment {
        let isn = self.next_isn(now);
        let conn = TcpConnection {
            key,
            remote_mac,
            state: TcpState::SynSent,
            local_seq: isn,
            remote_seq: 0,
            window: TCP_WINDOW_DEFAULT,
            mss: TCP_MSS_ETHERNET,
            last_activity: now,
            last_request_checksum: None,
            ready_for_request: false,
        };
        let mut syn = conn.segment(TcpFlags::SYN, &[]);
        syn.segment.mss = Some(TCP_MSS_ETHERNET);
        self.connections.insert(key, TcpConnection { local_seq: isn.wrapping_add(1), ..conn });
        syn
    }

    /// Builds a PSH+ACK carrying `payload` and advances the send sequence.
    pub fn prepare_send(&mut self, key: &TcpKey, payload: &[u8], now: u64) -> Option<OutSegment> {
        let conn = self.connections.get_mut(key)?;
        if conn.state != TcpState::Established {
            return None;
        }
        let out = conn.segment(TcpFlags::PSH | TcpFlags::ACK, payload);
        conn.local_seq = conn.local_seq.wrapping_add(payload.len() as u32);
        conn.last_activity = now;
        Some(out)
    }

    /// Sends our FIN; the connection lingers as closing until the peer acks.
    pub fn close(&mut self, key: &TcpKey) -> Option<OutSegment> {
        let conn = self.connections.get_mut(key)?;
        if conn.state == TcpState::Closing {
            return None;
        }
        let fin = conn.segment(TcpFlags::FIN | TcpFlags::ACK, &[]);
        conn.local_seq = conn.local_seq.wrapping_add(1);
        conn.state = TcpState::Closing;
        Some(fin)
    }

    pub fn set_ready(&mut self, key: &TcpKey, ready: bool) {
        if let Some(conn) = self.connections.get_mut(key) {
            conn.ready_for_request = ready;
        }
    }

    pub fn mss(&self, key: &TcpKey) -> Option<u16> {
        self.connections.get(key).map(|conn| conn.mss)
    }
}
