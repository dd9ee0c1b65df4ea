//! Minimal DNS wire codec for the responder.
//!
//! Parses just enough of a query to dispatch it (header plus every question,
//! with the byte offset of each QNAME so answers can use pointer compression)
//! and synthesizes authoritative loopback replies and SERVFAIL responses.
//! Forwarded queries are relayed verbatim and never pass through this codec.

use std::net::Ipv4Addr;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_ANY: u16 = 255;
pub const QCLASS_IN: u16 = 1;

/// TTL for synthesized loopback answers.
pub const ANSWER_TTL: u32 = 60;

/// The reserved top-level label the daemon is authoritative for.
pub const RESERVED_LABEL: &str = "test";

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_SERVFAIL: u16 = 2;

/// One parsed question.
#[derive(Debug, Clone)]
pub struct Question {
    /// Dotted name without the trailing root dot, e.g. `app.test`.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Byte offset of this question's QNAME within the message, for
    /// compression pointers in the answer section.
    pub name_offset: usize,
}

/// Parsed query header and question section.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    /// End of the question section within the original message.
    pub question_end: usize,
}

/// Parse a DNS query. Returns `None` for responses, truncated packets, or
/// anything else the responder should not try to answer.
pub fn parse_query(data: &[u8]) -> Option<Query> {
    if data.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);

    // QR must be 0 (query).
    if flags & FLAG_QR != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut questions = Vec::with_capacity(qdcount as usize);

    for _ in 0..qdcount {
        let name_offset = pos;
        let mut labels: Vec<&str> = Vec::new();

        loop {
            let len = *data.get(pos)? as usize;
            if len == 0 {
                pos += 1;
                break;
            }
            // Compression pointers do not appear in well-formed queries.
            if len & 0xC0 == 0xC0 {
                return None;
            }
            pos += 1;
            let label = data.get(pos..pos + len)?;
            labels.push(std::str::from_utf8(label).ok()?);
            pos += len;
        }

        if labels.is_empty() {
            return None;
        }

        let qtype = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]);
        let qclass = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]);
        pos += 4;

        questions.push(Question {
            name: labels.join("."),
            qtype,
            qclass,
            name_offset,
        });
    }

    Some(Query {
        id,
        flags,
        questions,
        question_end: pos,
    })
}

/// Whether a question name falls under the reserved label.
pub fn is_reserved(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.rsplit('.')
        .next()
        .is_some_and(|label| label.eq_ignore_ascii_case(RESERVED_LABEL))
}

/// Build the authoritative reply for a reserved-label query: one loopback A
/// record per `A`/`ANY` question, nothing for other types (NOERROR, NODATA).
pub fn build_loopback_reply(query: &[u8], parsed: &Query, addr: Ipv4Addr) -> Vec<u8> {
    let answered: Vec<&Question> = parsed
        .questions
        .iter()
        .filter(|q| q.qtype == QTYPE_A || q.qtype == QTYPE_ANY)
        .collect();

    let question_section = &query[12..parsed.question_end];
    // Each answer: name pointer (2) + type (2) + class (2) + ttl (4) + rdlen (2) + rdata (4).
    let mut resp = Vec::with_capacity(12 + question_section.len() + answered.len() * 16);

    let flags =
        FLAG_QR | FLAG_AA | FLAG_RA | (parsed.flags & (OPCODE_MASK | FLAG_RD));

    resp.extend_from_slice(&parsed.id.to_be_bytes());
    resp.extend_from_slice(&flags.to_be_bytes());
    resp.extend_from_slice(&(parsed.questions.len() as u16).to_be_bytes());
    resp.extend_from_slice(&(answered.len() as u16).to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    resp.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    resp.extend_from_slice(question_section);

    for q in answered {
        let pointer = 0xC000u16 | (q.name_offset as u16);
        resp.extend_from_slice(&pointer.to_be_bytes());
        resp.extend_from_slice(&QTYPE_A.to_be_bytes());
        resp.extend_from_slice(&QCLASS_IN.to_be_bytes());
        resp.extend_from_slice(&ANSWER_TTL.to_be_bytes());
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&addr.octets());
    }

    resp
}

/// Build a SERVFAIL response echoing the query's ID and question section
/// where it parses, or a bare header otherwise.
pub fn build_servfail(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([query[0], query[1]]);
    let qflags = u16::from_be_bytes([query[2], query[3]]);
    let flags =
        FLAG_QR | FLAG_RA | (qflags & (OPCODE_MASK | FLAG_RD)) | RCODE_SERVFAIL;

    let (qdcount, question_section): (u16, &[u8]) = match parse_query(query) {
        Some(parsed) => (
            parsed.questions.len() as u16,
            &query[12..parsed.question_end],
        ),
        None => (0, &[]),
    };

    let mut resp = Vec::with_capacity(12 + question_section.len());
    resp.extend_from_slice(&id.to_be_bytes());
    resp.extend_from_slice(&flags.to_be_bytes());
    resp.extend_from_slice(&qdcount.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes());
    resp.extend_from_slice(question_section);
    Some(resp)
}
