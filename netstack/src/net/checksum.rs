// Internet checksum (RFC 1071) and big-endian field helpers
use crate::net::ip::Ipv4Address;

/// Adds `data` as big-endian 16-bit words onto `sum` without folding.
pub fn checksum_partial(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Folds carries and returns the ones' complement.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(checksum_partial(data, 0))
}

/// Checksum of a TCP or UDP segment including the IPv4 pseudo-header.
pub fn pseudo_header_checksum(
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut sum = checksum_partial(src.as_bytes(), 0);
    sum = checksum_partial(dst.as_bytes(), sum);
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    fold(checksum_partial(segment, sum))
}

/// A buffer that already carries its checksum sums to zero.
pub fn verify(data: &[u8]) -> bool {
    internet_checksum(data) == 0
}

pub fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_u64_be(data: &[u8], offset: usize) -> Option<u64> {
    let hi = read_u32_be(data, offset)? as u64;
    let lo = read_u32_be(data, offset + 4)? as u64;
    Some((hi << 32) | lo)
}

/// Writes `value` at `offset`. Returns false if it does not fit.
pub fn write_u16_be(data: &mut [u8], offset: usize, value: u16) -> bool {
    match data.get_mut(offset..offset + 2) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

pub fn write_u32_be(data: &mut [u8], offset: usize, value: u32) -> bool {
    match data.get_mut(offset..offset + 4) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

pub fn write_u64_be(data: &mut [u8], offset: usize, value: u64) -> bool {
    match data.get_mut(offset..offset + 8) {
        Some(slot) => {
            slot.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
