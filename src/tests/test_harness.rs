//! Shared pieces for the listener tests: wire-level query builders, canned
//! resource records, and a scripted resolver.

use async_trait::async_trait;
use packed_struct::prelude::*;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::answer::{AnswerFlags, AnswerItem, DnsAnswer};
use crate::enums::{
    DnsProtocol, IpProtocol, OpCode, PacketType, Rcode, RecordClass, RecordType, TransactionState,
};
use crate::error::StubNsError;
use crate::packet::DnsPacket;
use crate::resolver::{CnameResult, QueryCompletion, Resolver, ResolverQuery};
use crate::resourcerecord::{DomainName, ResourceRecord};
use crate::utils::name_as_bytes;
use crate::{HEADER_BYTES, Header, Question};

pub fn question(name: &str, qtype: RecordType) -> Question {
    Question::new(name, qtype, RecordClass::Internet)
}

pub fn a_record(name: &str, address: [u8; 4]) -> ResourceRecord {
    ResourceRecord {
        name: DomainName::from(name),
        rrtype: RecordType::A,
        class: RecordClass::Internet,
        ttl: 300,
        rdata: address.to_vec(),
    }
}

pub fn cname_record(name: &str, target: &str) -> ResourceRecord {
    ResourceRecord {
        name: DomainName::from(name),
        rrtype: RecordType::CNAME,
        class: RecordClass::Internet,
        ttl: 300,
        rdata: name_as_bytes(target, None, None).expect("failed to encode CNAME target"),
    }
}

pub fn ns_record(name: &str, target: &str) -> ResourceRecord {
    ResourceRecord {
        name: DomainName::from(name),
        rrtype: RecordType::NS,
        class: RecordClass::Internet,
        ttl: 300,
        rdata: name_as_bytes(target, None, None).expect("failed to encode NS target"),
    }
}

/// A plausible-enough RRSIG: type covered, fixed timing fields, signer, blob
pub fn rrsig_record(name: &str, type_covered: RecordType) -> ResourceRecord {
    let mut rdata = type_covered.value().to_be_bytes().to_vec();
    rdata.extend([8u8, 2u8]); // algorithm, labels
    rdata.extend(300u32.to_be_bytes()); // original ttl
    rdata.extend(1700003600u32.to_be_bytes()); // expiration
    rdata.extend(1700000000u32.to_be_bytes()); // inception
    rdata.extend(12345u16.to_be_bytes()); // key tag
    rdata.extend(name_as_bytes("example.com", None, None).expect("failed to encode signer"));
    rdata.extend([0u8; 16]); // signature
    ResourceRecord {
        name: DomainName::from(name),
        rrtype: RecordType::RRSIG,
        class: RecordClass::Internet,
        ttl: 300,
        rdata,
    }
}

pub fn item(rr: ResourceRecord, flags: AnswerFlags) -> AnswerItem {
    AnswerItem {
        rr,
        ifindex: 0,
        flags,
        rrsig: None,
    }
}

#[derive(Clone)]
pub struct QueryOpt {
    pub payload_size: u16,
    pub version: u8,
    pub dnssec_ok: bool,
    pub nsid: bool,
}

impl Default for QueryOpt {
    fn default() -> Self {
        QueryOpt {
            payload_size: 4096,
            version: 0,
            dnssec_ok: false,
            nsid: false,
        }
    }
}

/// A client query as raw wire bytes or as an admitted (extracted) packet
#[derive(Clone)]
pub struct TestQuery {
    pub id: u16,
    pub question: Question,
    pub rd: bool,
    pub ad: bool,
    pub cd: bool,
    pub opt: Option<QueryOpt>,
}

impl TestQuery {
    pub fn new(id: u16, question: Question) -> Self {
        TestQuery {
            id,
            question,
            rd: true,
            ad: false,
            cd: false,
            opt: None,
        }
    }

    pub fn with_opt(mut self, opt: QueryOpt) -> Self {
        self.opt = Some(opt);
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        let header = Header {
            id: self.id,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: self.rd,
            recursion_available: false,
            z: false,
            ad: self.ad,
            cd: self.cd,
            rcode: Rcode::NoError,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: if self.opt.is_some() { 1 } else { 0 },
        };
        let mut buf = header.pack().expect("failed to pack header").to_vec();
        buf.extend(self.question.to_bytes().expect("failed to encode question"));
        if let Some(opt) = &self.opt {
            buf.push(0); // root owner
            buf.extend(RecordType::OPT.value().to_be_bytes());
            buf.extend(opt.payload_size.to_be_bytes());
            let mut ttl: u32 = (opt.version as u32) << 16;
            if opt.dnssec_ok {
                ttl |= 0x8000;
            }
            buf.extend(ttl.to_be_bytes());
            let mut options: Vec<u8> = vec![];
            if opt.nsid {
                options.extend(3u16.to_be_bytes());
                options.extend(0u16.to_be_bytes());
            }
            buf.extend((options.len() as u16).to_be_bytes());
            buf.extend(options);
        }
        buf
    }

    /// The query as an already-admitted request packet
    pub fn packet(&self) -> DnsPacket {
        let sender: SocketAddr = "127.0.0.1:53531".parse().expect("bad sender address");
        let mut packet = DnsPacket::from_wire(
            self.bytes(),
            DnsProtocol::Dns,
            IpProtocol::Udp,
            sender,
            "127.0.0.1".parse().expect("bad destination address"),
            0,
        )
        .expect("failed to parse test query");
        packet.extract().expect("failed to extract test query");
        packet
    }
}

/// Raw bytes of an upstream-style reply, for the bypass and forwarder tests
pub fn upstream_reply_bytes(
    id: u16,
    question: &Question,
    answers: &[ResourceRecord],
    opt_payload_size: Option<u16>,
) -> Vec<u8> {
    let header = Header {
        id,
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
        ancount: answers.len() as u16,
        nscount: 0,
        arcount: if opt_payload_size.is_some() { 1 } else { 0 },
    };
    let mut buf = header.pack().expect("failed to pack header").to_vec();
    buf.extend(question.to_bytes().expect("failed to encode question"));
    for rr in answers {
        buf.extend(
            rr.as_bytes(Some(HEADER_BYTES as u16), Some(question.qname().as_str()))
                .expect("failed to encode RR"),
        );
    }
    if let Some(size) = opt_payload_size {
        buf.push(0);
        buf.extend(RecordType::OPT.value().to_be_bytes());
        buf.extend(size.to_be_bytes());
        buf.extend(0u32.to_be_bytes());
        buf.extend(0u16.to_be_bytes());
    }
    buf
}

/// Parse reply bytes back into an extracted packet for assertions
pub fn decode_reply(bytes: Vec<u8>) -> DnsPacket {
    let sender: SocketAddr = "127.0.0.1:53".parse().expect("bad sender address");
    let mut packet = DnsPacket::from_wire(
        bytes,
        DnsProtocol::Dns,
        IpProtocol::Udp,
        sender,
        "127.0.0.1".parse().expect("bad destination address"),
        0,
    )
    .expect("reply did not parse");
    packet.extract().expect("reply did not extract");
    packet
}

pub fn success_completion(question: Question, items: Vec<AnswerItem>) -> QueryCompletion {
    let mut answer = DnsAnswer::new();
    for i in items {
        answer.add(i);
    }
    QueryCompletion {
        state: TransactionState::Success,
        question,
        answer,
        answer_rcode: 0,
        answer_dnssec_result: None,
        answer_full_packet: None,
        fully_authenticated: false,
        fully_synthetic: false,
    }
}

pub fn failed_completion(
    question: Question,
    state: TransactionState,
    rcode: u16,
) -> QueryCompletion {
    QueryCompletion {
        state,
        question,
        answer: DnsAnswer::new(),
        answer_rcode: rcode,
        answer_dnssec_result: None,
        answer_full_packet: None,
        fully_authenticated: false,
        fully_synthetic: false,
    }
}

/// A resolver that plays back scripted completions. `Restarted` CNAME results
/// swap the next scripted completion in, like a restarted transaction would.
pub struct MockResolver {
    completions: Mutex<VecDeque<QueryCompletion>>,
    cname_results: Mutex<VecDeque<CnameResult>>,
    resolve_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockResolver {
    pub fn new(completions: Vec<QueryCompletion>) -> Self {
        MockResolver {
            completions: Mutex::new(completions.into()),
            cname_results: Mutex::new(VecDeque::new()),
            resolve_calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_cname_results(mut self, results: Vec<CnameResult>) -> Self {
        self.cname_results = Mutex::new(results.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, _query: ResolverQuery) -> Result<QueryCompletion, StubNsError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completions
            .lock()
            .expect("mock completions poisoned")
            .pop_front()
            .ok_or_else(|| StubNsError::Resolver("mock resolver ran out of completions".to_string()))
    }

    async fn process_cname(
        &self,
        completion: &mut QueryCompletion,
    ) -> Result<CnameResult, StubNsError> {
        let result = self
            .cname_results
            .lock()
            .expect("mock cname results poisoned")
            .pop_front()
            .unwrap_or(CnameResult::Ok);
        if result == CnameResult::Restarted {
            let next = self
                .completions
                .lock()
                .expect("mock completions poisoned")
                .pop_front()
                .ok_or_else(|| {
                    StubNsError::Resolver("mock resolver ran out of completions".to_string())
                })?;
            *completion = next;
        }
        Ok(result)
    }
}
