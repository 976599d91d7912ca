//! Embedded Ethernet/IPv4 stack for the ENC28J60 SPI controller
//!
//! The crate provides:
//! - A register-level ENC28J60 driver with RX ring management and recovery
//! - A link controller with watchdog, register repair and receive filtering
//! - ARP, DHCP, DNS, mDNS, LLMNR, NetBIOS name service, ICMP echo, UDP and
//!   a reduced TCP with a small HTTP layer on top
//!
//! Hardware is reached only through the traits in [`hal`]. The stack is
//! `no_std` and needs a global allocator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod enc28j60;
pub mod error;
pub mod hal;
pub mod link;
pub mod net;
pub mod stack;
pub mod sync;
pub mod timer;

pub use config::{HostConfig, StackConfig};
pub use error::{NetError, Result};
pub use hal::{Clock, InterruptLine, OutputPin, SpiDevice};
pub use link::LinkController;
pub use net::ethernet::{EthernetController, MacAddress, ResetKind};
pub use net::ip::Ipv4Address;
pub use stack::NetworkStack;
