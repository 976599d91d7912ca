// DNS (Domain Name System) Client Implementation
use alloc::string::String;
use alloc::vec::Vec;

use super::ip::Ipv4Address;

// DNS header flags
pub const QR_RESPONSE: u16 = 0x8000;
pub const AA_FLAG: u16 = 0x0400;
pub const TC_FLAG: u16 = 0x0200;
pub const RD_FLAG: u16 = 0x0100;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_MASK: u16 = 0x000F;

// DNS record types
pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_ANY: u16 = 255;

// DNS classes
pub const CLASS_IN: u16 = 1;
/// mDNS cache-flush bit on answers, unicast-response bit on questions
pub const CLASS_MDNS_FLAG: u16 = 0x8000;

pub const DNS_HEADER_SIZE: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 5;

pub const DNS_CACHE_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl DnsHeader {
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < DNS_HEADER_SIZE {
            return Err("DNS message too small");
        }
        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Ok(Self {
            id: word(0),
            flags: word(2),
            question_count: word(4),
            answer_count: word(6),
            authority_count: word(8),
            additional_count: word(10),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.question_count,
            self.answer_count,
            self.authority_count,
            self.additional_count,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & QR_RESPONSE != 0
    }

    pub fn opcode(&self) -> u16 {
        (self.flags & OPCODE_MASK) >> 11
    }

    pub fn response_code(&self) -> u16 {
        self.flags & RCODE_MASK
    }
}

/// Encodes a dotted name as length-prefixed labels.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<(), &'static str> {
    let name = name.trim_end_matches('.');
    if name.len() > MAX_NAME_LEN {
        return Err("DNS name too long");
    }
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err("Invalid DNS label");
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

/// Decodes a possibly compressed name at `offset`. Returns the name and the
/// offset just past it in the original position.
pub fn parse_domain_name(data: &[u8], mut offset: usize) -> Result<(String, usize), &'static str> {
    let mut name = String::new();
    let mut resume_at = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(offset).ok_or("DNS name out of bounds")? as usize;
        if len == 0 {
            offset += 1;
            break;
        } else if len & 0xC0 == 0xC0 {
            let low = *data.get(offset + 1).ok_or("DNS compression pointer truncated")? as usize;
            if resume_at.is_none() {
                resume_at = Some(offset + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err("DNS compression loop detected");
            }
            offset = ((len & 0x3F) << 8) | low;
        } else if len & 0xC0 != 0 {
            return Err("Invalid DNS label length");
        } else {
            let label = data.get(offset + 1..offset + 1 + len).ok_or("DNS label truncated")?;
            if !name.is_empty() {
                name.push('.');
            }
            name.extend(label.iter().map(|&b| b as char));
            if name.len() > MAX_NAME_LEN {
                return Err("DNS name too long");
            }
            offset += len + 1;
        }
    }

    Ok((name, resume_at.unwrap_or(offset)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: &str, qtype: u16) -> Self {
        Self {
            name: String::from(name),
            qtype,
            qclass: CLASS_IN,
        }
    }

    fn parse(data: &[u8], offset: usize) -> Result<(Self, usize), &'static str> {
        let (name, offset) = parse_domain_name(data, offset)?;
        let fixed = data.get(offset..offset + 4).ok_or("DNS question truncated")?;
        Ok((
            Self {
                name,
                qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
                qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
            },
            offset + 4,
        ))
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), &'static str> {
        encode_name(&self.name, out)?;
        out.extend_from_slice(&self.qtype.to_be_bytes());
        out.extend_from_slice(&self.qclass.to_be_bytes());
        Ok(())
    }

    /// Whether this asks for an A record of `name`, ignoring case.
    pub fn asks_a_for(&self, name: &str) -> bool {
        (self.qtype == TYPE_A || self.qtype == TYPE_ANY)
            && self.name.trim_end_matches('.').eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl DnsRecord {
    pub fn parse_a_record(&self) -> Option<Ipv4Address> {
        if self.rtype == TYPE_A && self.data.len() == 4 {
            Ipv4Address::from_bytes(&self.data)
        } else {
            None
        }
    }

    fn parse(data: &[u8], offset: usize) -> Result<(Self, usize), &'static str> {
        let (name, offset) = parse_domain_name(data, offset)?;
        let fixed = data.get(offset..offset + 10).ok_or("DNS record header truncated")?;
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let start = offset + 10;
        let rdata = data.get(start..start + rdlength).ok_or("DNS record data truncated")?;
        Ok((
            Self {
                name,
                rtype: u16::from_be_bytes([fixed[0], fixed[1]]),
                rclass: u16::from_be_bytes([fixed[2], fixed[3]]),
                ttl: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
                data: rdata.to_vec(),
            },
            start + rdlength,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn from_bytes(data: &[u8]) -> Result<Self, &'static str> {
        let header = DnsHeader::parse(data)?;
        let mut offset = DNS_HEADER_SIZE;

        let mut questions = Vec::new();
        for _ in 0..header.question_count {
            let (question, next) = DnsQuestion::parse(data, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut answers = Vec::new();
        for _ in 0..header.answer_count {
            let (record, next) = DnsRecord::parse(data, offset)?;
            answers.push(record);
            offset = next;
        }

        Ok(Self { header, questions, answers })
    }

    /// First A record in the answer section. Recursive servers place the
    /// CNAME target's address after the CNAME, so chains need no walking.
    pub fn first_a_record(&self) -> Option<(Ipv4Address, u32)> {
        self.answers
            .iter()
            .find_map(|record| record.parse_a_record().map(|ip| (ip, record.ttl)))
    }
}

/// A recursive query for the A record of `name`.
pub fn build_query(id: u16, name: &str) -> Result<Vec<u8>, &'static str> {
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE + name.len() + 6);
    DnsHeader {
        id,
        flags: RD_FLAG,
        question_count: 1,
        ..DnsHeader::default()
    }
    .write(&mut out);
    DnsQuestion::new(name, TYPE_A).write(&mut out)?;
    Ok(out)
}

/// A single-answer A record response, optionally echoing the question.
pub fn build_a_response(
    id: u16,
    flags: u16,
    question: Option<&DnsQuestion>,
    name: &str,
    class: u16,
    ip: Ipv4Address,
    ttl: u32,
) -> Result<Vec<u8>, &'static str> {
    let mut out = Vec::with_capacity(64);
    DnsHeader {
        id,
        flags,
        question_count: question.is_some() as u16,
        answer_count: 1,
        ..DnsHeader::default()
    }
    .write(&mut out);
    if let Some(question) = question {
        question.write(&mut out)?;
    }
    encode_name(name, &mut out)?;
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&ttl.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(ip.as_bytes());
    Ok(out)
}

// DNS Cache Entry
#[derive(Debug, Clone)]
struct DnsCacheEntry {
    name: String,
    ip_address: Ipv4Address,
    expires_at: u64,
    inserted_at: u64,
}

/// Bounded answer cache. Names compare case-insensitively.
pub struct DnsCache {
    entries: Vec<DnsCacheEntry>,
    capacity: usize,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, name: &str) -> Option<&DnsCacheEntry> {
        self.entries.iter().find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// An unexpired answer.
    pub fn lookup(&self, name: &str, now: u64) -> Option<Ipv4Address> {
        self.find(name)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.ip_address)
    }

    /// Any answer, expired or not.
    pub fn lookup_stale(&self, name: &str) -> Option<Ipv4Address> {
        self.find(name).map(|entry| entry.ip_address)
    }

    pub fn insert(&mut self, name: &str, ip: Ipv4Address, ttl_secs: u32, now: u64) {
        let expires_at = now.saturating_add(ttl_secs as u64 * 1000);
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
        {
            entry.ip_address = ip;
            entry.expires_at = expires_at;
            entry.inserted_at = now;
            return;
        }

        while self.entries.len() >= self.capacity && !self.entries.is_empty() {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.expires_at <= now)
                .min_by_key(|(_, entry)| entry.inserted_at)
                .or_else(|| {
                    self.entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, entry)| entry.inserted_at)
                })
                .map(|(index, _)| index);
            match victim {
                Some(index) => {
                    self.entries.remove(index);
                }
                None => break,
            }
        }

        if self.capacity > 0 {
            self.entries.push(DnsCacheEntry {
                name: name.to_ascii_lowercase(),
                ip_address: ip,
                expires_at,
                inserted_at: now,
            });
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Query bookkeeping for the blocking resolver.
pub struct DnsClient {
    cache: DnsCache,
    pending: Option<(u16, String)>,
    next_id: u16,
}

impl DnsClient {
    pub fn new(seed: u16) -> Self {
        Self {
            cache: DnsCache::new(DNS_CACHE_CAPACITY),
            pending: None,
            next_id: seed | 1,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut DnsCache {
        &mut self.cache
    }

    /// Registers a new outstanding query and returns its wire form.
    pub fn start_query(&mut self, name: &str) -> Result<(u16, Vec<u8>), &'static str> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let query = build_query(id, name)?;
        self.pending = Some((id, String::from(name)));
        Ok((id, query))
    }

    pub fn finish_query(&mut self) {
        self.pending = None;
    }

    /// Matches a response to the outstanding query.
    pub fn accept_response(&self, message: &DnsMessage) -> Option<(u16, Ipv4Address, u32)> {
        let (id, name) = self.pending.as_ref()?;
        if !message.header.is_response() || message.header.id != *id || message.header.response_code() != 0 {
            return None;
        }
        if let Some(question) = message.questions.first() {
            if !question.name.eq_ignore_ascii_case(name) {
                return None;
            }
        }
        let (ip, ttl) = message.first_a_record()?;
        Some((*id, ip, ttl))
    }
}
