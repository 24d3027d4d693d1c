mod common;

use dnsgate::dns::{
    self, AnswerData, DnsHeader, HEADER_LEN, QueryType, rcode,
};

use common::query;

#[test]
fn block_a_round_trip() {
    let q = query(0x1234, "ads.example.com", QueryType::A);
    let decoded = dns::decode_response(&dns::synthesize_block_a(&q)).unwrap();
    assert_eq!(decoded.rcode, rcode::NOERROR);
    assert_eq!(decoded.qname, "ads.example.com");
    assert_eq!(
        decoded.answers,
        vec![AnswerData::Ipv4("127.0.0.1".parse().unwrap())]
    );
}

#[test]
fn nxdomain_round_trip() {
    let q = query(0x0001, "missing.example", QueryType::A);
    let decoded = dns::decode_response(&dns::synthesize_nxdomain(&q)).unwrap();
    assert_eq!(decoded.rcode, rcode::NXDOMAIN);
    assert!(decoded.answers.is_empty());
}

#[test]
fn rewrite_ttl_applies_to_every_record() {
    // A response with two answers at different TTLs.
    let q = query(0x0007, "multi.example", QueryType::A);
    let mut wire = Vec::new();
    DnsHeader {
        id: q.id,
        qr: true,
        qdcount: 1,
        ancount: 2,
        ..DnsHeader::default()
    }
    .encode(&mut wire)
    .unwrap();
    dns::write_name(&mut wire, &q.qname).unwrap();
    wire.extend_from_slice(&1u16.to_be_bytes());
    wire.extend_from_slice(&dns::CLASS_IN.to_be_bytes());
    for (ttl, last_octet) in [(300u32, 1u8), (60, 2)] {
        dns::write_name(&mut wire, &q.qname).unwrap();
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&dns::CLASS_IN.to_be_bytes());
        wire.extend_from_slice(&ttl.to_be_bytes());
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[203, 0, 113, last_octet]);
    }

    let rewritten = dns::rewrite_ttl(&wire, 42).unwrap();
    let decoded = dns::decode_response(&rewritten).unwrap();
    assert_eq!(decoded.min_ttl, 42);
    // Both records carry the new TTL: the minimum alone cannot prove the
    // second one changed, so decode again after a second rewrite.
    let rewritten = dns::rewrite_ttl(&rewritten, 7).unwrap();
    assert_eq!(dns::decode_response(&rewritten).unwrap().min_ttl, 7);
    assert_eq!(decoded.answers.len(), 2);
}

#[test]
fn decodes_compressed_response_from_wire() {
    // Classic compressed answer: the name in the answer section points back
    // at the question (0xC00C).
    let wire = hex::decode(concat!(
        "12348180",
        "0001000100000000",
        "076578616d706c6503636f6d00",
        "00010001",
        "c00c",
        "00010001",
        "0000003c",
        "0004",
        "01020304",
    ))
    .unwrap();

    let decoded = dns::decode_response(&wire).unwrap();
    assert_eq!(decoded.id, 0x1234);
    assert_eq!(decoded.qname, "example.com");
    assert_eq!(decoded.min_ttl, 60);
    assert_eq!(
        decoded.answers,
        vec![AnswerData::Ipv4("1.2.3.4".parse().unwrap())]
    );
}

#[test]
fn compression_loop_is_rejected() {
    // Header claims one question whose name is a pointer pointing at
    // another pointer pointing back.
    let mut wire = Vec::new();
    DnsHeader {
        id: 1,
        qdcount: 1,
        ..DnsHeader::default()
    }
    .encode(&mut wire)
    .unwrap();
    wire.extend_from_slice(&[0xC0, 0x0E, 0xC0, 0x0C]); // 12→14→12→...
    wire.extend_from_slice(&[0, 1, 0, 1]);

    assert!(dns::decode_query(&wire).is_err());
}

#[test]
fn query_validation() {
    // QDCOUNT must be exactly one.
    let q = query(9, "example.com", QueryType::A);
    let mut wire = dns::encode_query(&q);
    wire[5] = 2; // qdcount low byte
    assert!(dns::decode_query(&wire).is_err());

    // Truncated question section.
    let wire = dns::encode_query(&q);
    assert!(dns::decode_query(&wire[..wire.len() - 3]).is_err());
}

#[test]
fn canonicalization_during_decode() {
    let q = query(2, "MiXeD.ExAmPlE.CoM", QueryType::A);
    // encode_query writes the name verbatim; decode must canonicalize.
    let decoded = dns::decode_query(&dns::encode_query(&q)).unwrap();
    assert_eq!(decoded.qname, "mixed.example.com");
}

#[test]
fn truncated_rendition_keeps_header_and_question() {
    let q = query(0x00AA, "big.example", QueryType::Txt);
    let original = dns::synthesize_block_a(&query(0x00AA, "big.example", QueryType::A));
    let truncated = dns::synthesize_truncated_from(&original);

    let header = DnsHeader::parse(&truncated).unwrap();
    assert!(header.tc);
    assert_eq!(header.id, q.id);
    assert_eq!(header.ancount, 0);
    assert_eq!(header.nscount, 0);
    assert_eq!(header.arcount, 0);
    assert!(truncated.len() >= HEADER_LEN);
}

#[test]
fn transaction_id_fast_path() {
    assert_eq!(
        dns::extract_transaction_id(&[0xDE, 0xAD, 0x00]).unwrap(),
        [0xDE, 0xAD]
    );
    assert!(dns::extract_transaction_id(&[0x01]).is_err());
}
