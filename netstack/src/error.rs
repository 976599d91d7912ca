// Network stack errors
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// SPI transfer failed or the chip returned nonsense
    HardwareFault,
    /// Revision register read back as 0x00 or 0xFF after reset
    ChipNotResponding,
    DhcpTimeout,
    ArpTimeout,
    /// Another station answers for our address
    IpConflict,
    LinkDown,
    /// IP address, gateway MAC or DNS server missing
    NotConfigured,
    NotStarted,
    InvalidState,
    ResolutionFailed,
    Timeout,
    ConnectionClosed,
    ResourceExhausted,
    Malformed(&'static str),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::HardwareFault => write!(f, "hardware communication failure"),
            NetError::ChipNotResponding => write!(f, "ethernet controller not responding"),
            NetError::DhcpTimeout => write!(f, "no DHCP lease obtained"),
            NetError::ArpTimeout => write!(f, "gateway did not answer ARP"),
            NetError::IpConflict => write!(f, "IP address in use by another host"),
            NetError::LinkDown => write!(f, "ethernet link is down"),
            NetError::NotConfigured => write!(f, "network not configured"),
            NetError::NotStarted => write!(f, "network stack not started"),
            NetError::InvalidState => write!(f, "operation not valid in current state"),
            NetError::ResolutionFailed => write!(f, "name resolution failed"),
            NetError::Timeout => write!(f, "operation timed out"),
            NetError::ConnectionClosed => write!(f, "connection closed"),
            NetError::ResourceExhausted => write!(f, "out of buffer space"),
            NetError::Malformed(reason) => write!(f, "malformed data: {}", reason),
        }
    }
}

pub type Result<T> = core::result::Result<T, NetError>;
