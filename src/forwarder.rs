//! A deliberately small [Resolver]: one upstream server, UDP, no caching, no
//! server selection, no validation. It exists so the binary has an engine to
//! dispatch into; anything smarter plugs in behind the same trait.

use async_trait::async_trait;
use packed_struct::prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::answer::{AnswerItem, DnsAnswer};
use crate::enums::{DnsProtocol, IpProtocol, OpCode, PacketType, Rcode, TransactionState};
use crate::error::StubNsError;
use crate::packet::DnsPacket;
use crate::resolver::{CnameResult, QueryCompletion, Resolver, ResolverQuery};
use crate::{Header, Question, UDP_BUFFER_SIZE};

static TRANSACTION_ID: AtomicU16 = AtomicU16::new(1);

pub struct ForwardResolver {
    upstream: SocketAddr,
    reply_timeout: Duration,
}

impl ForwardResolver {
    pub fn new(upstream: SocketAddr) -> Self {
        ForwardResolver {
            upstream,
            reply_timeout: Duration::from_secs(5),
        }
    }

    fn completion(&self, question: Question, state: TransactionState) -> QueryCompletion {
        QueryCompletion {
            state,
            question,
            answer: DnsAnswer::new(),
            answer_rcode: 0,
            answer_dnssec_result: None,
            answer_full_packet: None,
            fully_authenticated: false,
            fully_synthetic: false,
        }
    }
}

fn build_query_packet(id: u16, question: &Question) -> Result<Vec<u8>, StubNsError> {
    let header = Header {
        id,
        qr: PacketType::Query,
        opcode: OpCode::Query,
        authoritative: false,
        truncated: false,
        recursion_desired: true,
        recursion_available: false,
        z: false,
        ad: false,
        cd: false,
        rcode: Rcode::NoError,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    let mut buf = header.pack()?.to_vec();
    buf.extend(question.to_bytes()?);
    Ok(buf)
}

#[async_trait]
impl Resolver for ForwardResolver {
    async fn resolve(&self, query: ResolverQuery) -> Result<QueryCompletion, StubNsError> {
        let (payload, question) = match (&query.bypass_packet, &query.question) {
            // bypass: the client's packet goes out as-is, OPT and all
            (Some(packet), _) => {
                let question = packet.question().cloned().ok_or_else(|| {
                    StubNsError::Resolver("bypass packet carries no question".to_string())
                })?;
                (packet.bytes().to_vec(), question)
            }
            (None, Some(question)) => {
                let id = TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
                (build_query_packet(id, question)?, question.clone())
            }
            (None, None) => {
                return Err(StubNsError::Resolver(
                    "query carries neither a question nor a packet".to_string(),
                ));
            }
        };

        let bind_address = match self.upstream {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_address).await?;
        socket.connect(self.upstream).await?;
        socket.send(&payload).await?;

        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let len = match timeout(self.reply_timeout, socket.recv(&mut buf)).await {
            Err(_) => {
                debug!("Upstream server {} timed out", self.upstream);
                return Ok(self.completion(question, TransactionState::Timeout));
            }
            Ok(Err(error)) => {
                debug!("Failed to receive from upstream {}: {error:?}", self.upstream);
                return Ok(self.completion(question, TransactionState::Errno));
            }
            Ok(Ok(len)) => len,
        };

        let local_ip = socket.local_addr()?.ip();
        let mut packet = match DnsPacket::from_wire(
            buf[0..len].to_vec(),
            DnsProtocol::Dns,
            IpProtocol::Udp,
            self.upstream,
            local_ip,
            0,
        ) {
            Ok(packet) => packet,
            Err(error) => {
                debug!("Unparseable reply from upstream {}: {error:?}", self.upstream);
                return Ok(self.completion(question, TransactionState::InvalidReply));
            }
        };
        if let Err(error) = packet.extract() {
            debug!("Failed to extract upstream reply: {error:?}");
            return Ok(self.completion(question, TransactionState::InvalidReply));
        }

        let mut answer = DnsAnswer::new();
        for (rr, section) in packet.section_records() {
            answer.add(AnswerItem {
                rr: rr.clone(),
                ifindex: 0,
                flags: *section,
                rrsig: None,
            });
        }

        let mut rcode = packet.header().rcode.to_primitive() as u16;
        if let Some(opt) = packet.opt() {
            rcode |= (opt.extended_rcode as u16) << 4;
        }

        let state = match rcode {
            0 => TransactionState::Success,
            _ => TransactionState::RcodeFailure,
        };

        Ok(QueryCompletion {
            state,
            question,
            answer,
            answer_rcode: rcode,
            answer_dnssec_result: None,
            answer_full_packet: Some(packet),
            fully_authenticated: false,
            fully_synthetic: false,
        })
    }

    async fn process_cname(
        &self,
        _completion: &mut QueryCompletion,
    ) -> Result<CnameResult, StubNsError> {
        // a recursive upstream already delivers whole CNAME chains in one
        // reply, so there is never anything left for us to restart
        Ok(CnameResult::Ok)
    }
}
