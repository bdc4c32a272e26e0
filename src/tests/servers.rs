use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::answer::AnswerFlags;
use crate::enums::{Rcode, RecordType, TransactionState};
use crate::packet::DnsPacket;
use crate::resolver::{CnameResult, Resolver};
use crate::servers::{StubContext, StubEndpoint, tcp_server, udp_server};
use crate::tests::test_harness::*;
use crate::{ADVERTISE_DATAGRAM_SIZE_MAX, UDP_BUFFER_SIZE};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_udp_stub(
    resolver: Arc<dyn Resolver>,
) -> (SocketAddr, JoinHandle<std::io::Result<()>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = socket.local_addr().expect("no local addr");
    let socket = Arc::new(socket);
    let endpoint = StubEndpoint::primary();
    endpoint.set_udp(socket.clone());
    let handle = tokio::spawn(udp_server(StubContext { resolver }, endpoint, socket));
    (addr, handle)
}

async fn start_tcp_stub(
    resolver: Arc<dyn Resolver>,
) -> (SocketAddr, JoinHandle<std::io::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let endpoint = StubEndpoint::primary();
    let handle = tokio::spawn(tcp_server(StubContext { resolver }, endpoint, listener));
    (addr, handle)
}

async fn udp_roundtrip(server: SocketAddr, query: &[u8]) -> DnsPacket {
    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed");
    client.send_to(query, server).await.expect("send failed");
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("recv failed");
    decode_reply(buf[0..len].to_vec())
}

#[tokio::test]
async fn test_udp_simple_query() {
    let q = question("example.com", RecordType::A);
    let resolver = Arc::new(MockResolver::new(vec![success_completion(
        q.clone(),
        vec![item(
            a_record("example.com", [93, 184, 216, 34]),
            AnswerFlags::SECTION_ANSWER,
        )],
    )]));
    let (server, handle) = start_udp_stub(resolver).await;

    let reply = udp_roundtrip(server, &TestQuery::new(0x1234, q).bytes()).await;
    assert_eq!(reply.id(), 0x1234);
    assert_eq!(reply.header().rcode, Rcode::NoError);
    assert_eq!(reply.header().ancount, 1);
    assert!(reply.header().recursion_available);

    handle.abort();
}

#[tokio::test]
async fn test_udp_axfr_refused() {
    let resolver = Arc::new(MockResolver::new(vec![]));
    let (server, handle) = start_udp_stub(resolver.clone()).await;

    let q = question("example.com", RecordType::AXFR);
    let reply = udp_roundtrip(server, &TestQuery::new(0x2345, q).bytes()).await;
    assert_eq!(reply.header().rcode, Rcode::Refused);
    assert_eq!(reply.header().ancount, 0);
    assert_eq!(reply.header().nscount, 0);
    assert_eq!(reply.header().arcount, 0);
    // never even reached the resolver
    assert_eq!(resolver.resolve_calls(), 0);

    handle.abort();
}

#[tokio::test]
async fn test_udp_obsolete_type_refused() {
    let resolver = Arc::new(MockResolver::new(vec![]));
    let (server, handle) = start_udp_stub(resolver.clone()).await;

    let q = question("example.com", RecordType::MD);
    let reply = udp_roundtrip(server, &TestQuery::new(0x2346, q).bytes()).await;
    assert_eq!(reply.header().rcode, Rcode::Refused);
    assert_eq!(resolver.resolve_calls(), 0);

    handle.abort();
}

#[tokio::test]
async fn test_udp_recursion_unset_refused() {
    let resolver = Arc::new(MockResolver::new(vec![]));
    let (server, handle) = start_udp_stub(resolver.clone()).await;

    let mut query = TestQuery::new(0x2347, question("example.com", RecordType::A));
    query.rd = false;
    let reply = udp_roundtrip(server, &query.bytes()).await;
    assert_eq!(reply.header().rcode, Rcode::Refused);
    assert_eq!(resolver.resolve_calls(), 0);

    handle.abort();
}

#[tokio::test]
async fn test_udp_bad_edns_version() {
    let resolver = Arc::new(MockResolver::new(vec![]));
    let (server, handle) = start_udp_stub(resolver.clone()).await;

    let query = TestQuery::new(0x2348, question("example.com", RecordType::A)).with_opt(QueryOpt {
        version: 1,
        ..Default::default()
    });
    let reply = udp_roundtrip(server, &query.bytes()).await;
    // BADVERS is 16: rcode 0 in the header, 1 in the OPT
    assert_eq!(reply.header().rcode, Rcode::NoError);
    assert_eq!(reply.opt().expect("no OPT in reply").extended_rcode, 1);
    assert_eq!(resolver.resolve_calls(), 0);

    handle.abort();
}

#[tokio::test]
async fn test_udp_servfail_on_resolver_failure() {
    let q = question("example.com", RecordType::A);
    let resolver = Arc::new(MockResolver::new(vec![failed_completion(
        q.clone(),
        TransactionState::NoServers,
        0,
    )]));
    let (server, handle) = start_udp_stub(resolver).await;

    let reply = udp_roundtrip(server, &TestQuery::new(0x2349, q).bytes()).await;
    assert_eq!(reply.header().rcode, Rcode::ServFail);

    handle.abort();
}

#[tokio::test]
async fn test_udp_timeout_means_silence() {
    let q = question("example.com", RecordType::A);
    let resolver = Arc::new(MockResolver::new(vec![failed_completion(
        q.clone(),
        TransactionState::Timeout,
        0,
    )]));
    let (server, handle) = start_udp_stub(resolver).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed");
    client
        .send_to(&TestQuery::new(0x2350, q).bytes(), server)
        .await
        .expect("send failed");
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let result = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "timeout state must not produce a reply");

    handle.abort();
}

#[tokio::test]
async fn test_udp_retransmit_suppressed() {
    let q = question("example.com", RecordType::A);
    let resolver = Arc::new(
        MockResolver::new(vec![success_completion(
            q.clone(),
            vec![item(
                a_record("example.com", [1, 2, 3, 4]),
                AnswerFlags::SECTION_ANSWER,
            )],
        )])
        .with_delay(Duration::from_millis(300)),
    );
    let (server, handle) = start_udp_stub(resolver.clone()).await;

    let bytes = TestQuery::new(0x4242, q).bytes();
    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed");
    client.send_to(&bytes, server).await.expect("send failed");
    // the retransmit lands while the first query is still in flight
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_to(&bytes, server).await.expect("send failed");

    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("recv failed");
    let reply = decode_reply(buf[0..len].to_vec());
    assert_eq!(reply.id(), 0x4242);

    // exactly one query went to the resolver, and exactly one reply came back
    assert_eq!(resolver.resolve_calls(), 1);
    let second = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(second.is_err(), "the retransmit must not get its own reply");

    handle.abort();
}

#[tokio::test]
async fn test_udp_cname_restart_accumulates() {
    let q = question("www.example.com", RecordType::A);
    let target = question("example.com", RecordType::A);
    let resolver = Arc::new(
        MockResolver::new(vec![
            success_completion(
                q.clone(),
                vec![item(
                    cname_record("www.example.com", "example.com"),
                    AnswerFlags::SECTION_ANSWER,
                )],
            ),
            success_completion(
                target,
                vec![item(
                    a_record("example.com", [1, 2, 3, 4]),
                    AnswerFlags::SECTION_ANSWER,
                )],
            ),
        ])
        .with_cname_results(vec![CnameResult::Restarted, CnameResult::Ok]),
    );
    let (server, handle) = start_udp_stub(resolver).await;

    let reply = udp_roundtrip(server, &TestQuery::new(0x5151, q).bytes()).await;
    assert_eq!(reply.header().ancount, 2);
    let types: Vec<RecordType> = reply
        .section_records()
        .iter()
        .map(|(rr, _)| rr.rrtype)
        .collect();
    assert_eq!(types, vec![RecordType::CNAME, RecordType::A]);

    handle.abort();
}

#[tokio::test]
async fn test_udp_bypass_propagates_upstream_packet() {
    let q = question("example.com", RecordType::A);
    let upstream = decode_reply(upstream_reply_bytes(
        0x7777,
        &q,
        &[a_record("example.com", [192, 0, 2, 1])],
        Some(1232),
    ));
    let mut completion = success_completion(q.clone(), vec![]);
    completion.answer_full_packet = Some(upstream);
    let resolver = Arc::new(MockResolver::new(vec![completion]));
    let (server, handle) = start_udp_stub(resolver).await;

    let mut query = TestQuery::new(0x6161, q).with_opt(QueryOpt {
        payload_size: 4096,
        dnssec_ok: true,
        ..Default::default()
    });
    query.cd = true;

    let reply = udp_roundtrip(server, &query.bytes()).await;
    // the upstream packet came through, with our id and our advertised size
    assert_eq!(reply.id(), 0x6161);
    assert_eq!(
        reply.opt().expect("no OPT in reply").payload_size,
        ADVERTISE_DATAGRAM_SIZE_MAX
    );
    assert_eq!(reply.header().ancount, 1);

    handle.abort();
}

#[tokio::test]
async fn test_tcp_query_roundtrip() {
    let q = question("example.com", RecordType::A);
    let resolver = Arc::new(MockResolver::new(vec![success_completion(
        q.clone(),
        vec![item(
            a_record("example.com", [93, 184, 216, 34]),
            AnswerFlags::SECTION_ANSWER,
        )],
    )]));
    let (server, handle) = start_tcp_stub(resolver).await;

    let mut stream = TcpStream::connect(server).await.expect("connect failed");
    let query = TestQuery::new(0x3434, q).bytes();
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .expect("write failed");
    stream.write_all(&query).await.expect("write failed");

    let reply_len = timeout(RECV_TIMEOUT, stream.read_u16())
        .await
        .expect("timed out waiting for reply")
        .expect("read failed") as usize;
    let mut buf = vec![0u8; reply_len];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading reply body")
        .expect("read failed");

    let reply = decode_reply(buf);
    assert_eq!(reply.id(), 0x3434);
    assert_eq!(reply.header().ancount, 1);

    handle.abort();
}
