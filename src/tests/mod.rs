mod servers;
pub mod test_harness;

use std::str::FromStr;

use crate::config::{ConfigFile, ExtraListener};
use crate::enums::{
    DNS_RCODE_BADVERS, OpCode, PacketType, Rcode, RecordClass, RecordType, StubListenerMode,
};
use crate::resourcerecord::{DomainName, ResourceRecord, RrKey};
use crate::tests::test_harness::*;
use crate::utils::{name_as_bytes, parse_name};
use crate::{Header, Question};
use packed_struct::prelude::*;

#[test]
fn test_name_to_bytes() {
    assert_eq!(
        name_as_bytes("cheese.world", None, None).unwrap(),
        [6, 99, 104, 101, 101, 115, 101, 5, 119, 111, 114, 108, 100, 0]
    );
}

#[test]
fn test_short_name_to_bytes() {
    assert_eq!(
        name_as_bytes("cheese", None, None).unwrap(),
        [6, 99, 104, 101, 101, 115, 101, 0]
    );
}

#[test]
fn test_root_name_to_bytes() {
    assert_eq!(name_as_bytes("", None, None).unwrap(), [0]);
    assert_eq!(name_as_bytes(".", None, None).unwrap(), [0]);
}

#[test]
fn test_name_to_bytes_compressed() {
    // shares the "hello.world" suffix with the reference at offset 12, so the
    // tail becomes a pointer to offset 12 + len("zing")+1
    assert_eq!(
        name_as_bytes("cheese.hello.world", Some(12u16), Some("zing.hello.world")).unwrap(),
        [6, 99, 104, 101, 101, 115, 101, 192, 17]
    );
}

#[test]
fn test_name_to_bytes_fully_compressed() {
    assert_eq!(
        name_as_bytes("example.com", Some(12u16), Some("example.com")).unwrap(),
        [192, 12]
    );
}

#[test]
fn test_name_too_long_label() {
    let label = "a".repeat(64);
    assert!(name_as_bytes(&label, None, None).is_err());
}

#[test]
fn test_parse_name_roundtrip() {
    let bytes = name_as_bytes("foo.example.com", None, None).unwrap();
    let (name, next) = parse_name(&bytes, 0).unwrap();
    assert_eq!(name, "foo.example.com");
    assert_eq!(next, bytes.len());
}

#[test]
fn test_parse_name_with_pointer() {
    // "example.com" at offset 0, then "www" + pointer back to it
    let mut buf = name_as_bytes("example.com", None, None).unwrap();
    let www_offset = buf.len();
    buf.extend([3, b'w', b'w', b'w', 0xC0, 0x00]);
    let (name, next) = parse_name(&buf, www_offset).unwrap();
    assert_eq!(name, "www.example.com");
    assert_eq!(next, buf.len());
}

#[test]
fn test_parse_name_rejects_forward_pointer() {
    let buf = [0xC0u8, 0x04, 0, 0, 3, b'f', b'o', b'o', 0];
    assert!(parse_name(&buf, 0).is_err());
}

#[test]
fn test_header_pack() {
    let header = Header {
        id: 41840,
        qr: PacketType::Answer,
        opcode: OpCode::Query,
        authoritative: false,
        truncated: false,
        recursion_desired: true,
        recursion_available: true,
        z: false,
        ad: false,
        cd: false,
        rcode: Rcode::NoError,
        qdcount: 1,
        ancount: 1,
        nscount: 0,
        arcount: 0,
    };
    assert_eq!(
        header.pack().unwrap(),
        [0xa3, 0x70, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn test_header_unpack_roundtrip() {
    let header = Header {
        id: 0x1234,
        qr: PacketType::Query,
        opcode: OpCode::Query,
        authoritative: false,
        truncated: false,
        recursion_desired: true,
        recursion_available: false,
        z: false,
        ad: true,
        cd: true,
        rcode: Rcode::NoError,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    let packed = header.pack().unwrap();
    assert_eq!(Header::unpack(&packed).unwrap(), header);
}

#[test]
fn test_question_wire_roundtrip() {
    let q = question("www.example.com", RecordType::AAAA);
    let mut buf = vec![0u8; 12];
    buf.extend(q.to_bytes().unwrap());
    let (parsed, next) = Question::from_wire(&buf, 12).unwrap();
    assert_eq!(parsed, q);
    assert_eq!(next, buf.len());
}

#[test]
fn test_record_type_values_roundtrip() {
    for value in [1u16, 5, 28, 41, 46, 252, 9999] {
        assert_eq!(RecordType::from(value).value(), value);
    }
    assert_eq!(RecordType::Unknown(9999).to_string(), "TYPE9999");
}

#[test]
fn test_record_type_predicates() {
    assert!(RecordType::RRSIG.is_dnssec());
    assert!(RecordType::NSEC3.is_dnssec());
    assert!(!RecordType::A.is_dnssec());
    assert!(RecordType::MD.is_obsolete());
    assert!(RecordType::MF.is_obsolete());
    assert!(!RecordType::MX.is_obsolete());
    assert!(RecordType::AXFR.is_zone_transfer());
    assert!(RecordType::IXFR.is_zone_transfer());
    assert!(!RecordType::ANY.is_zone_transfer());
}

#[test]
fn test_extended_rcode_split() {
    assert_eq!(Rcode::from_extended(DNS_RCODE_BADVERS), Rcode::NoError);
    assert_eq!(Rcode::extended_high_bits(DNS_RCODE_BADVERS), 1);
    assert_eq!(Rcode::from_extended(2), Rcode::ServFail);
    assert_eq!(Rcode::extended_high_bits(2), 0);
}

#[test]
fn test_wildcard_key_matching() {
    let rr = a_record("*.example.com", [1, 2, 3, 4]);
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "foo.example.com");
    assert!(key.matches_rr(&rr));

    // the wildcard owner itself is not covered
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "example.com");
    assert!(!key.matches_rr(&rr));

    // name matching ignores case
    let rr = a_record("Foo.Example.COM", [1, 2, 3, 4]);
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "foo.example.com");
    assert!(key.matches_rr(&rr));

    let key = RrKey::new(RecordClass::Internet, RecordType::AAAA, "foo.example.com");
    assert!(!key.matches_rr(&rr));
}

#[test]
fn test_cname_target_extraction() {
    let rr = cname_record("www.example.com", "example.com");
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "www.example.com");
    let target = rr.cname_target(&key).unwrap();
    assert_eq!(target.canonical(), "example.com");

    // owner mismatch yields nothing
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "other.example.com");
    assert!(rr.cname_target(&key).is_none());
}

#[test]
fn test_dname_target_extraction() {
    let rr = ResourceRecord {
        name: DomainName::from("example.com"),
        rrtype: RecordType::DNAME,
        class: RecordClass::Internet,
        ttl: 300,
        rdata: name_as_bytes("example.net", None, None).unwrap(),
    };
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "a.b.example.com");
    let target = rr.cname_target(&key).unwrap();
    assert_eq!(target.canonical(), "a.b.example.net");

    // a DNAME doesn't cover its own owner name
    let key = RrKey::new(RecordClass::Internet, RecordType::A, "example.com");
    assert!(rr.cname_target(&key).is_none());
}

#[test]
fn test_rr_equality_ignores_ttl() {
    let mut a = a_record("example.com", [1, 2, 3, 4]);
    let mut b = a_record("EXAMPLE.com", [1, 2, 3, 4]);
    a.ttl = 300;
    b.ttl = 5;
    assert_eq!(a, b);

    let c = a_record("example.com", [1, 2, 3, 5]);
    assert_ne!(a, c);
}

#[test]
fn test_dedup_key_semantics() {
    let q = TestQuery::new(0x4242, question("example.com", RecordType::A));
    let first = q.packet();
    let second = q.packet();
    assert_eq!(first.dedup_key(), second.dedup_key());

    // a different id is a different key
    let other = TestQuery::new(0x4243, question("example.com", RecordType::A));
    assert_ne!(first.dedup_key(), other.packet().dedup_key());
}

#[test]
fn test_listener_mode_tokens() {
    for (token, mode) in [
        ("no", StubListenerMode::No),
        ("udp", StubListenerMode::Udp),
        ("tcp", StubListenerMode::Tcp),
        ("yes", StubListenerMode::Yes),
    ] {
        assert_eq!(StubListenerMode::from_str(token).unwrap(), mode);
        assert_eq!(mode.to_string(), token);
    }
    assert!(StubListenerMode::from_str("both").is_err());
    assert!(StubListenerMode::Yes.udp_enabled());
    assert!(StubListenerMode::Yes.tcp_enabled());
    assert!(!StubListenerMode::Udp.tcp_enabled());
}

#[test]
fn test_extra_listener_parsing() {
    let l = ExtraListener::from_str("udp:192.168.1.1:5300").unwrap();
    assert_eq!(l.mode, StubListenerMode::Udp);
    assert_eq!(l.address.to_string(), "192.168.1.1");
    assert_eq!(l.port, 5300);

    let l = ExtraListener::from_str("[::1]:8053").unwrap();
    assert_eq!(l.mode, StubListenerMode::Yes);
    assert_eq!(l.address.to_string(), "::1");
    assert_eq!(l.port, 8053);

    let l = ExtraListener::from_str("10.0.0.1").unwrap();
    assert_eq!(l.mode, StubListenerMode::Yes);
    assert_eq!(l.port, 0);

    assert!(ExtraListener::from_str("tcp:not-an-address").is_err());
}

#[test]
fn test_config_from_json() {
    let config = ConfigFile::from_str(
        r#"{
            "stub_listener": "udp",
            "stub_address": "127.0.0.53",
            "stub_port": 5353,
            "extra_listeners": ["udp:10.0.0.1:53", "[::1]:8053"],
            "upstream": "192.0.2.1:53",
            "log_level": "debug"
        }"#,
    )
    .unwrap();
    assert_eq!(config.stub_listener, StubListenerMode::Udp);
    assert_eq!(config.stub_port, 5353);
    assert_eq!(config.extra_listeners.len(), 2);
    assert_eq!(
        config.upstream_address().unwrap().unwrap().to_string(),
        "192.0.2.1:53"
    );
    assert_eq!(
        config.stub_listener_address().unwrap().to_string(),
        "127.0.0.53:5353"
    );
}

#[test]
fn test_config_defaults() {
    let config = ConfigFile::default();
    assert_eq!(config.stub_listener, StubListenerMode::Yes);
    assert_eq!(
        config.stub_listener_address().unwrap().to_string(),
        "127.0.0.53:53"
    );
    assert!(config.upstream_address().unwrap().is_none());
    assert!(config.extra_listeners.is_empty());
}
