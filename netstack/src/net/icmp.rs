// ICMP echo (ping) Implementation
use alloc::vec::Vec;

use super::checksum;

// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

const ICMP_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub typ: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub data: Vec<u8>,
}

impl IcmpEcho {
    pub fn request(identifier: u16, sequence: u16, data: &[u8]) -> Self {
        Self {
            typ: ICMP_TYPE_ECHO_REQUEST,
            identifier,
            sequence,
            data: data.to_vec(),
        }
    }

    /// Echo reply carrying the same identifier, sequence and payload.
    pub fn reply_to(&self) -> Self {
        Self {
            typ: ICMP_TYPE_ECHO_REPLY,
            identifier: self.identifier,
            sequence: self.sequence,
            data: self.data.clone(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.typ == ICMP_TYPE_ECHO_REQUEST
    }

    /// Parses an echo request or reply; other ICMP types are not handled.
    pub fn from_bytes(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err("ICMP message too small");
        }
        if !checksum::verify(data) {
            return Err("Bad ICMP checksum");
        }
        let typ = data[0];
        if typ != ICMP_TYPE_ECHO_REQUEST && typ != ICMP_TYPE_ECHO_REPLY {
            return Err("Unsupported ICMP type");
        }
        Ok(Self {
            typ,
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            data: data[ICMP_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(ICMP_HEADER_SIZE + self.data.len());
        message.push(self.typ);
        message.push(0);
        message.extend_from_slice(&[0, 0]);
        message.extend_from_slice(&self.identifier.to_be_bytes());
        message.extend_from_slice(&self.sequence.to_be_bytes());
        message.extend_from_slice(&self.data);
        let sum = checksum::internet_checksum(&message);
        checksum::write_u16_be(&mut message, 2, sum);
        message
    }
}
