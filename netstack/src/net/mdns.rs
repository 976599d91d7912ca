// Multicast DNS responder (RFC 6762), A records for "<host>.local" only
use alloc::format;
use alloc::vec::Vec;

use super::dns::{self, DnsMessage, AA_FLAG, CLASS_IN, CLASS_MDNS_FLAG, QR_RESPONSE};
use super::ip::Ipv4Address;
use super::udp::PORT_MDNS;

pub const MDNS_GROUP: Ipv4Address = Ipv4Address::new(224, 0, 0, 251);
const MDNS_TTL: u32 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsReply {
    pub payload: Vec<u8>,
    /// Send to the mDNS group; otherwise unicast back to the querier
    pub multicast: bool,
}

pub fn answer(query: &[u8], host_name: &str, ip: Ipv4Address, src_port: u16) -> Option<MdnsReply> {
    let message = DnsMessage::from_bytes(query).ok()?;
    if message.header.is_response() || message.header.opcode() != 0 {
        return None;
    }
    let fqdn = format!("{}.local", host_name);
    let question = message.questions.iter().find(|q| q.asks_a_for(&fqdn))?;

    // One-shot legacy resolvers query from an ephemeral port and expect a
    // conventional unicast DNS reply.
    let legacy = src_port != PORT_MDNS;
    let payload = if legacy {
        dns::build_a_response(
            message.header.id,
            QR_RESPONSE | AA_FLAG,
            Some(question),
            &question.name,
            CLASS_IN,
            ip,
            MDNS_TTL,
        )
    } else {
        dns::build_a_response(0, QR_RESPONSE | AA_FLAG, None, &fqdn, CLASS_IN | CLASS_MDNS_FLAG, ip, MDNS_TTL)
    }
    .ok()?;

    log::debug!("mDNS: answering {} with {}", fqdn, ip);
    Some(MdnsReply { payload, multicast: !legacy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dns::{DnsHeader, DnsQuestion, TYPE_A};

    const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 5);

    fn query(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        DnsHeader { question_count: 1, ..DnsHeader::default() }.write(&mut out);
        DnsQuestion::new(name, TYPE_A).write(&mut out).unwrap();
        out
    }

    #[test]
    fn test_answers_own_name() {
        let reply = answer(&query("quail.local"), "quail", OUR_IP, PORT_MDNS).unwrap();
        assert!(reply.multicast);
        let message = DnsMessage::from_bytes(&reply.payload).unwrap();
        assert!(message.header.is_response());
        assert_eq!(message.header.id, 0);
        assert_eq!(message.answers[0].name, "quail.local");
        assert_eq!(message.answers[0].rclass, CLASS_IN | CLASS_MDNS_FLAG);
        assert_eq!(message.first_a_record(), Some((OUR_IP, MDNS_TTL)));
    }

    #[test]
    fn test_name_match_ignores_case() {
        assert!(answer(&query("QUAIL.Local"), "quail", OUR_IP, PORT_MDNS).is_some());
    }

    #[test]
    fn test_other_names_ignored() {
        assert!(answer(&query("robin.local"), "quail", OUR_IP, PORT_MDNS).is_none());
        assert!(answer(&query("quail"), "quail", OUR_IP, PORT_MDNS).is_none());
    }

    #[test]
    fn test_legacy_query_gets_unicast_reply() {
        let mut q = query("quail.local");
        q[0] = 0x12;
        q[1] = 0x34;
        let reply = answer(&q, "quail", OUR_IP, 40000).unwrap();
        assert!(!reply.multicast);
        let message = DnsMessage::from_bytes(&reply.payload).unwrap();
        assert_eq!(message.header.id, 0x1234);
        assert_eq!(message.questions.len(), 1);
    }
}
