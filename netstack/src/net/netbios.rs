// NetBIOS name service responder (RFC 1002), positive name query responses
use alloc::string::String;
use alloc::vec::Vec;

use super::ip::Ipv4Address;

const NETBIOS_NAME_LEN: usize = 16;
const ENCODED_NAME_LEN: usize = 32;

const NBNS_RESPONSE: u16 = 0x8000;
const NBNS_OPCODE_MASK: u16 = 0x7800;
const NBNS_AA: u16 = 0x0400;
const NBNS_RD: u16 = 0x0100;

const TYPE_NB: u16 = 0x0020;
const CLASS_IN: u16 = 0x0001;
const NB_TTL: u32 = 300_000;

// Name suffixes we answer for
const SUFFIX_WORKSTATION: u8 = 0x00;
const SUFFIX_SERVER: u8 = 0x20;

/// First-level encoding: 15 uppercase characters padded with spaces, a
/// suffix byte, each nibble mapped onto 'A'..='P'.
pub fn encode_name(name: &str, suffix: u8) -> [u8; ENCODED_NAME_LEN] {
    let mut raw = [b' '; NETBIOS_NAME_LEN];
    for (slot, byte) in raw.iter_mut().zip(name.bytes().take(NETBIOS_NAME_LEN - 1)) {
        *slot = byte.to_ascii_uppercase();
    }
    raw[NETBIOS_NAME_LEN - 1] = suffix;

    let mut encoded = [0u8; ENCODED_NAME_LEN];
    for (i, byte) in raw.iter().enumerate() {
        encoded[2 * i] = b'A' + (byte >> 4);
        encoded[2 * i + 1] = b'A' + (byte & 0x0F);
    }
    encoded
}

/// Reverses [`encode_name`], returning the trimmed name and suffix.
pub fn decode_name(encoded: &[u8]) -> Option<(String, u8)> {
    if encoded.len() != ENCODED_NAME_LEN {
        return None;
    }
    let mut raw = [0u8; NETBIOS_NAME_LEN];
    for (i, pair) in encoded.chunks_exact(2).enumerate() {
        let hi = pair[0].checked_sub(b'A').filter(|n| *n < 16)?;
        let lo = pair[1].checked_sub(b'A').filter(|n| *n < 16)?;
        raw[i] = (hi << 4) | lo;
    }
    let name = core::str::from_utf8(&raw[..NETBIOS_NAME_LEN - 1]).ok()?;
    Some((String::from(name.trim_end_matches(' ')), raw[NETBIOS_NAME_LEN - 1]))
}

/// NetBIOS names carry at most 15 characters, so longer host names are
/// matched on the prefix the encoder writes.
fn matches_host(name: &str, host_name: &str) -> bool {
    let host = host_name.as_bytes();
    let host = &host[..host.len().min(NETBIOS_NAME_LEN - 1)];
    name.as_bytes().eq_ignore_ascii_case(host)
}

pub fn answer(query: &[u8], host_name: &str, ip: Ipv4Address) -> Option<Vec<u8>> {
    // header, length byte, encoded name, scope terminator, type, class
    if query.len() < 12 + 1 + ENCODED_NAME_LEN + 1 + 4 {
        return None;
    }
    let id = u16::from_be_bytes([query[0], query[1]]);
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if flags & (NBNS_RESPONSE | NBNS_OPCODE_MASK) != 0 || questions != 1 {
        return None;
    }
    if query[12] as usize != ENCODED_NAME_LEN || query[13 + ENCODED_NAME_LEN] != 0 {
        return None;
    }
    let tail = 14 + ENCODED_NAME_LEN;
    let qtype = u16::from_be_bytes([query[tail], query[tail + 1]]);
    if qtype != TYPE_NB {
        return None;
    }

    let (name, suffix) = decode_name(&query[13..13 + ENCODED_NAME_LEN])?;
    if !matches_host(&name, host_name) || (suffix != SUFFIX_WORKSTATION && suffix != SUFFIX_SERVER) {
        return None;
    }

    let mut reply = Vec::with_capacity(62);
    reply.extend_from_slice(&id.to_be_bytes());
    reply.extend_from_slice(&(NBNS_RESPONSE | NBNS_AA | NBNS_RD).to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
    reply.extend_from_slice(&query[12..14 + ENCODED_NAME_LEN]);
    reply.extend_from_slice(&TYPE_NB.to_be_bytes());
    reply.extend_from_slice(&CLASS_IN.to_be_bytes());
    reply.extend_from_slice(&NB_TTL.to_be_bytes());
    reply.extend_from_slice(&6u16.to_be_bytes());
    // NB flags: unique name, B-node
    reply.extend_from_slice(&[0, 0]);
    reply.extend_from_slice(ip.as_bytes());

    log::debug!("NetBIOS: answering {} with {}", name, ip);
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(name: &str, suffix: u8) -> Vec<u8> {
        let mut out = alloc::vec![0x80, 0x01, 0x01, 0x10, 0, 1, 0, 0, 0, 0, 0, 0];
        out.push(ENCODED_NAME_LEN as u8);
        out.extend_from_slice(&encode_name(name, suffix));
        out.push(0);
        out.extend_from_slice(&TYPE_NB.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out
    }

    #[test]
    fn test_first_level_encoding() {
        // "FRED" from RFC 1001 section 14.1, padded with spaces
        let encoded = encode_name("fred", SUFFIX_WORKSTATION);
        assert_eq!(&encoded[..8], b"EGFCEFEE");
        assert_eq!(&encoded[8..10], b"CA");
        assert_eq!(&encoded[30..], b"AA");
        assert_eq!(decode_name(&encoded), Some((String::from("FRED"), 0)));
    }

    #[test]
    fn test_answers_own_name() {
        let ip = Ipv4Address::new(10, 0, 0, 5);
        let reply = answer(&query("QUAIL", 0x00), "quail", ip).unwrap();
        assert_eq!(&reply[0..2], &[0x80, 0x01]);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]) & NBNS_RESPONSE, NBNS_RESPONSE);
        assert_eq!(&reply[reply.len() - 4..], ip.as_bytes());
        assert_eq!(reply.len(), 12 + 34 + 10 + 6);
    }

    #[test]
    fn test_other_names_and_suffixes_ignored() {
        let ip = Ipv4Address::new(10, 0, 0, 5);
        assert!(answer(&query("ROBIN", 0x00), "quail", ip).is_none());
        assert!(answer(&query("QUAIL", 0x1B), "quail", ip).is_none());
        assert!(answer(&query("QUAIL", 0x20), "quail", ip).is_some());
    }

    #[test]
    fn test_long_host_name_answered_on_truncated_name() {
        let ip = Ipv4Address::new(10, 0, 0, 5);
        let reply = answer(&query("quailsensornode01", 0x00), "quailsensornode01", ip);
        assert!(reply.is_some());
        assert!(answer(&query("QUAILSENSORNODE", 0x20), "quailsensornode01", ip).is_some());
        assert!(answer(&query("QUAILSENSORNOD", 0x00), "quailsensornode01", ip).is_none());
    }
}
