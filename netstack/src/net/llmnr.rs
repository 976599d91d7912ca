// LLMNR responder (RFC 4795)
use alloc::vec::Vec;

use super::dns::{self, DnsMessage, CLASS_IN, QR_RESPONSE};
use super::ip::Ipv4Address;

pub const LLMNR_GROUP: Ipv4Address = Ipv4Address::new(224, 0, 0, 252);
const LLMNR_TTL: u32 = 30;

/// Unicast reply for a query naming this host, echoing id and question.
pub fn answer(query: &[u8], host_name: &str, ip: Ipv4Address) -> Option<Vec<u8>> {
    let message = DnsMessage::from_bytes(query).ok()?;
    if message.header.is_response() || message.header.opcode() != 0 || message.questions.len() != 1 {
        return None;
    }
    let question = &message.questions[0];
    if !question.asks_a_for(host_name) {
        return None;
    }
    log::debug!("LLMNR: answering {} with {}", question.name, ip);
    dns::build_a_response(
        message.header.id,
        QR_RESPONSE,
        Some(question),
        &question.name,
        CLASS_IN,
        ip,
        LLMNR_TTL,
    )
    .ok()
}
