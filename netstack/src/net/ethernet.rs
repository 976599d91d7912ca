// Ethernet II framing and the controller abstraction
use alloc::vec::Vec;
use core::fmt;

use crate::error::Result;
use crate::hal::Clock;
use crate::net::ip::Ipv4Address;

// Ethernet constants
pub const ETH_HEADER_SIZE: usize = 14;
pub const ETH_MIN_FRAME_SIZE: usize = 60;
pub const ETH_MAX_FRAME_SIZE: usize = 1518;
pub const ETH_MTU: usize = 1500;

// EtherType values
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddress(bytes))
    }

    /// IPv4 multicast group to its 01:00:5e MAC (RFC 1112).
    pub fn for_multicast(group: Ipv4Address) -> Self {
        let o = group.octets();
        MacAddress([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dest_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Splits a received frame into header and payload.
    pub fn parse(frame: &[u8]) -> core::result::Result<(Self, &[u8]), &'static str> {
        if frame.len() < ETH_HEADER_SIZE {
            return Err("Frame too small");
        }
        let header = Self {
            dest_mac: MacAddress::from_bytes(&frame[0..6]).ok_or("Invalid destination MAC")?,
            src_mac: MacAddress::from_bytes(&frame[6..12]).ok_or("Invalid source MAC")?,
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        };
        Ok((header, &frame[ETH_HEADER_SIZE..]))
    }
}

/// Builds a frame. The controller pads short frames in hardware.
pub fn build_frame(dest: MacAddress, src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HEADER_SIZE + payload.len());
    frame.extend_from_slice(dest.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Controller soft reset command followed by re-initialization
    Soft,
    /// Pulse the reset line, then re-initialize
    Hard,
}

/// Result of one receive service pass.
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub frames: Vec<Vec<u8>>,
    /// Frames discarded by the controller (bad status or ring resync)
    pub dropped: u32,
    /// New link state when it changed during the pass
    pub link_changed: Option<bool>,
}

/// Result of periodic controller maintenance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Maintenance {
    pub link_changed: Option<bool>,
    /// The receive path looks stalled and should be serviced now
    pub force_service: bool,
}

// Ethernet controller interface
pub trait EthernetController: Send {
    fn mac_address(&self) -> MacAddress;
    /// Resets and configures the controller to receive for `mac`.
    fn start(&mut self, mac: MacAddress, clock: &dyn Clock) -> Result<()>;
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
    /// Acknowledges pending interrupt causes and drains received frames.
    fn service(&mut self, now_ms: u64) -> Result<ServiceReport>;
    fn link_up(&mut self) -> bool;
    /// Watchdog and register repair, called from the periodic tick.
    fn maintain(&mut self, now_ms: u64) -> Maintenance;
    /// Restarts only the receive logic. Rate limited; returns whether it ran.
    fn reset_receiver(&mut self, now_ms: u64) -> bool;
    fn reset(&mut self, kind: ResetKind, clock: &dyn Clock) -> Result<()>;
}
