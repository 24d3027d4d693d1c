pub mod header;
pub mod name;
pub mod types;

pub use header::{DnsHeader, HEADER_LEN};
pub use name::{canonicalize, read_name, skip_name, write_name};
pub use types::{CLASS_IN, QueryType, rcode};

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{GateError, Result};

/// Largest payload a plain-UDP client can take; larger responses are
/// delivered truncated with TC set.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// A decoded query: exactly one question, canonical qname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub opcode: u8,
    pub recursion_desired: bool,
    pub qname: String,
    pub qtype: QueryType,
}

/// One decoded answer record's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerData {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Opaque(String),
}

/// A decoded response, enough for cache policy and telemetry. Forwarding
/// always uses the raw bytes; this is a side view, never re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub min_ttl: u32,
    pub qname: String,
    pub qtype: QueryType,
    pub answers: Vec<AnswerData>,
}

fn fmt_err(msg: &str) -> GateError {
    GateError::PacketFormat(msg.to_string())
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| fmt_err("message truncated"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| fmt_err("message truncated"))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode a client query. Rejects responses (QR=1) and anything that does
/// not carry exactly one question.
pub fn decode_query(buf: &[u8]) -> Result<Query> {
    let header = DnsHeader::parse(buf)?;
    if header.qr {
        return Err(fmt_err("QR set on a query"));
    }
    if header.qdcount != 1 {
        return Err(fmt_err("query must carry exactly one question"));
    }

    let (qname, pos) = read_name(buf, HEADER_LEN)?;
    let qtype = QueryType::from(read_u16(buf, pos)?);
    let _qclass = read_u16(buf, pos + 2)?;

    Ok(Query {
        id: header.id,
        opcode: header.opcode,
        recursion_desired: header.rd,
        qname,
        qtype,
    })
}

/// Decode an upstream response. A/AAAA RDATA become addresses; names in
/// CNAME/NS/PTR RDATA are resolved through compression; everything else is
/// recorded as an opaque string for policy checks.
pub fn decode_response(buf: &[u8]) -> Result<Response> {
    let header = DnsHeader::parse(buf)?;
    if !header.qr {
        return Err(fmt_err("QR clear on a response"));
    }

    let mut pos = HEADER_LEN;
    let mut qname = String::new();
    let mut qtype = QueryType::Other(0);
    for i in 0..header.qdcount {
        if i == 0 {
            let (name, end) = read_name(buf, pos)?;
            qname = name;
            qtype = QueryType::from(read_u16(buf, end)?);
            pos = end + 4;
        } else {
            let end = skip_name(buf, pos)?;
            pos = end + 4;
        }
    }

    let mut answers = Vec::with_capacity(header.ancount as usize);
    let mut min_ttl: Option<u32> = None;
    for _ in 0..header.ancount {
        let end = skip_name(buf, pos)?;
        let rrtype = read_u16(buf, end)?;
        let ttl = read_u32(buf, end + 4)?;
        let rdlen = read_u16(buf, end + 8)? as usize;
        let rdata_pos = end + 10;
        let rdata = buf
            .get(rdata_pos..rdata_pos + rdlen)
            .ok_or_else(|| fmt_err("RDATA truncated"))?;

        min_ttl = Some(min_ttl.map_or(ttl, |cur| cur.min(ttl)));

        let answer = match QueryType::from(rrtype) {
            QueryType::A if rdlen == 4 => {
                AnswerData::Ipv4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            QueryType::Aaaa if rdlen == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                AnswerData::Ipv6(Ipv6Addr::from(octets))
            }
            QueryType::Cname | QueryType::Ns | QueryType::Ptr => {
                let (target, _) = read_name(buf, rdata_pos)?;
                AnswerData::Opaque(target)
            }
            other => {
                let mut text = format!("{}:", other);
                for byte in rdata.iter().take(32) {
                    text.push_str(&format!("{:02x}", byte));
                }
                AnswerData::Opaque(text)
            }
        };
        answers.push(answer);
        pos = rdata_pos + rdlen;
    }

    Ok(Response {
        id: header.id,
        rcode: header.rcode,
        min_ttl: min_ttl.unwrap_or(0),
        qname,
        qtype,
        answers,
    })
}

/// Zero-allocation transaction-id extraction.
pub fn extract_transaction_id(buf: &[u8]) -> Result<[u8; 2]> {
    match buf {
        [first, second, ..] => Ok([*first, *second]),
        _ => Err(fmt_err("message shorter than a transaction id")),
    }
}

/// Overwrite the transaction id in place. No-op on a sub-2-byte buffer.
pub fn splice_transaction_id(buf: &mut [u8], id: [u8; 2]) {
    if buf.len() >= 2 {
        buf[0] = id[0];
        buf[1] = id[1];
    }
}

fn reply_header(query: &Query, rcode: u8, ancount: u16) -> DnsHeader {
    DnsHeader {
        id: query.id,
        qr: true,
        opcode: query.opcode,
        aa: false,
        tc: false,
        rd: query.recursion_desired,
        ra: true,
        z: 0,
        rcode,
        qdcount: 1,
        ancount,
        nscount: 0,
        arcount: 0,
    }
}

fn write_question(out: &mut Vec<u8>, query: &Query) -> Result<()> {
    write_name(out, &query.qname)?;
    out.extend_from_slice(&u16::from(query.qtype).to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(())
}

/// Block response for an A query: NOERROR with a single `127.0.0.1` answer,
/// TTL 0 so clients re-ask once the rule set changes.
pub fn synthesize_block_a(query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    reply_header(query, rcode::NOERROR, 1)
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    write_question(&mut out, query).expect("canonical qname re-encodes");
    write_name(&mut out, &query.qname).expect("canonical qname re-encodes");
    out.extend_from_slice(&u16::from(QueryType::A).to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // TTL 0
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
    out
}

/// Block response for an AAAA query: NOERROR with an empty answer section.
pub fn synthesize_block_aaaa(query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    reply_header(query, rcode::NOERROR, 0)
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    write_question(&mut out, query).expect("canonical qname re-encodes");
    out
}

pub fn synthesize_nxdomain(query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    reply_header(query, rcode::NXDOMAIN, 0)
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    write_question(&mut out, query).expect("canonical qname re-encodes");
    out
}

pub fn synthesize_servfail(query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    reply_header(query, rcode::SERVFAIL, 0)
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    write_question(&mut out, query).expect("canonical qname re-encodes");
    out
}

/// Minimal FORMERR reply for a message we could not decode. Echoes the id
/// bytes when at least two are present.
pub fn synthesize_format_error(raw: &[u8]) -> Vec<u8> {
    let id = extract_transaction_id(raw).unwrap_or([0, 0]);
    let header = DnsHeader {
        id: u16::from_be_bytes(id),
        qr: true,
        rcode: rcode::FORMERR,
        ..DnsHeader::default()
    };
    let mut out = Vec::with_capacity(HEADER_LEN);
    header
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    out
}

/// Truncated rendition of an oversized response: header with TC set,
/// answer/authority/additional cleared, question kept when it parses.
pub fn synthesize_truncated_from(response: &[u8]) -> Vec<u8> {
    let Ok(mut header) = DnsHeader::parse(response) else {
        return synthesize_format_error(response);
    };

    header.tc = true;
    header.ancount = 0;
    header.nscount = 0;
    header.arcount = 0;

    let mut question = &response[0..0];
    let mut pos = HEADER_LEN;
    let mut intact = true;
    for _ in 0..header.qdcount {
        match skip_name(response, pos) {
            Ok(end) if response.len() >= end + 4 => pos = end + 4,
            _ => {
                intact = false;
                break;
            }
        }
    }
    if intact {
        question = &response[HEADER_LEN..pos];
    } else {
        header.qdcount = 0;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + question.len());
    header
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    out.extend_from_slice(question);
    out
}

/// Rewrite the TTL of every resource record (answer, authority, additional)
/// in place, returning the modified message.
pub fn rewrite_ttl(response: &[u8], new_ttl: u32) -> Result<Vec<u8>> {
    let header = DnsHeader::parse(response)?;
    let mut out = response.to_vec();

    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        let end = skip_name(&out, pos)?;
        pos = end + 4;
    }

    let total = header.ancount as usize + header.nscount as usize + header.arcount as usize;
    for _ in 0..total {
        let end = skip_name(&out, pos)?;
        let ttl_pos = end + 4;
        let rdlen = read_u16(&out, end + 8)? as usize;
        out.get(ttl_pos..ttl_pos + 4)
            .ok_or_else(|| fmt_err("message truncated"))?;
        out[ttl_pos..ttl_pos + 4].copy_from_slice(&new_ttl.to_be_bytes());
        let rdata_end = end + 10 + rdlen;
        if out.len() < rdata_end {
            return Err(fmt_err("RDATA truncated"));
        }
        pos = rdata_end;
    }

    Ok(out)
}

/// Encode a query in wire form. Used by tests and the upstream health probe.
pub fn encode_query(query: &Query) -> Vec<u8> {
    let header = DnsHeader {
        id: query.id,
        qr: false,
        opcode: query.opcode,
        rd: query.recursion_desired,
        qdcount: 1,
        ..DnsHeader::default()
    };
    let mut out = Vec::with_capacity(48);
    header
        .encode(&mut out)
        .expect("header encode into Vec cannot fail");
    write_question(&mut out, query).expect("canonical qname re-encodes");
    out
}
