// Network Stack Implementation
pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod dispatch;
pub mod dns;
pub mod ethernet;
pub mod http;
pub mod icmp;
pub mod ip;
pub mod llmnr;
pub mod mdns;
pub mod netbios;
pub mod tcp;
pub mod udp;

use core::sync::atomic::{AtomicU32, Ordering};

// Re-export commonly used types
pub use ethernet::MacAddress;
pub use http::{HttpRequest, HttpResponse};
pub use ip::Ipv4Address;
pub use tcp::{TcpKey, TcpPacket};
pub use udp::UdpDatagram;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub bytes_sent: u32,
    pub bytes_received: u32,
    pub errors: u32,
    pub dropped: u32,
}

/// Counters updated from both interrupt and worker contexts.
#[derive(Default)]
pub struct StatCounters {
    packets_sent: AtomicU32,
    packets_received: AtomicU32,
    bytes_sent: AtomicU32,
    bytes_received: AtomicU32,
    errors: AtomicU32,
    dropped: AtomicU32,
}

impl StatCounters {
    pub const fn new() -> Self {
        Self {
            packets_sent: AtomicU32::new(0),
            packets_received: AtomicU32::new(0),
            bytes_sent: AtomicU32::new(0),
            bytes_received: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u32, Ordering::Relaxed);
    }

    pub fn received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u32, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
